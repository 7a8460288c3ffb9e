use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
};

use flume::{Receiver, Sender};

/// Implemented by queued items that must stay ordered relative to each other.
///
/// Items sharing an affinity key always land on the same worker, so they are
/// handled in the order they were posted.
pub trait Affinity {
    fn affinity(&self) -> Option<usize>;
}

/// Sending side of a [`WorkerPool`]. Cheap to clone, never blocks.
pub struct Dispatcher<T> {
    lanes: Arc<[Sender<T>]>,
    next: Arc<AtomicUsize>,
}

impl<T> Clone for Dispatcher<T> {
    fn clone(&self) -> Self {
        Self {
            lanes: self.lanes.clone(),
            next: self.next.clone(),
        }
    }
}

impl<T: Affinity> Dispatcher<T> {
    /// Queue `item` for a worker. Returns `false` when every worker is gone.
    pub fn post(&self, item: T) -> bool {
        let lane = match item.affinity() {
            Some(key) => key % self.lanes.len(),
            None => self.next.fetch_add(1, Ordering::Relaxed) % self.lanes.len(),
        };
        self.lanes[lane].send(item).is_ok()
    }
}

/// Single-lane dispatcher over a plain channel, used when the caller drains
/// the queue itself.
impl<T> From<Sender<T>> for Dispatcher<T> {
    fn from(sender: Sender<T>) -> Self {
        Self {
            lanes: Arc::from(vec![sender]),
            next: Arc::new(AtomicUsize::new(0)),
        }
    }
}

/// Fixed set of threads draining posted items through one handler.
///
/// Workers exit once every [`Dispatcher`] has been dropped.
pub struct WorkerPool {
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn<T, F>(name: &str, workers: usize, handler: F) -> std::io::Result<(Self, Dispatcher<T>)>
    where
        T: Send + 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        let workers = workers.max(1);
        let handler = Arc::new(handler);
        let mut lanes = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);

        for index in 0..workers {
            let (tx, rx): (Sender<T>, Receiver<T>) = flume::unbounded();
            let handler = handler.clone();
            let handle = thread::Builder::new()
                .name(format!("{name}-{index}"))
                .spawn(move || {
                    while let Ok(item) = rx.recv() {
                        handler(item);
                    }
                })?;
            lanes.push(tx);
            handles.push(handle);
        }

        let dispatcher = Dispatcher {
            lanes: Arc::from(lanes),
            next: Arc::new(AtomicUsize::new(0)),
        };
        Ok((Self { workers: handles }, dispatcher))
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Wait for the workers to drain their queues and exit.
    ///
    /// Only returns once every dispatcher clone has been dropped.
    pub fn join(self) {
        for handle in self.workers {
            if handle.join().is_err() {
                log::warn!("dispatch worker panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Debug)]
    struct Item {
        key: Option<usize>,
        seq: usize,
    }

    impl Affinity for Item {
        fn affinity(&self) -> Option<usize> {
            self.key
        }
    }

    #[test]
    fn test_items_with_same_key_stay_ordered() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let (pool, dispatcher) = WorkerPool::spawn("test", 3, move |item: Item| {
            sink.lock().push((item.key, item.seq));
        })
        .unwrap();
        assert_eq!(pool.len(), 3);

        for seq in 0..50 {
            assert!(dispatcher.post(Item {
                key: Some(seq % 2),
                seq,
            }));
            dispatcher.post(Item { key: None, seq });
        }
        drop(dispatcher);
        pool.join();

        let seen = seen.lock();
        assert_eq!(seen.len(), 100);
        for key in 0..2 {
            let order: Vec<usize> = seen
                .iter()
                .filter(|(k, _)| *k == Some(key))
                .map(|(_, seq)| *seq)
                .collect();
            let mut sorted = order.clone();
            sorted.sort_unstable();
            assert_eq!(order, sorted);
        }
    }

    #[test]
    fn test_plain_channel_dispatcher() {
        let (tx, rx) = flume::unbounded();
        let dispatcher = Dispatcher::from(tx);
        dispatcher.post(Item { key: Some(7), seq: 1 });
        assert_eq!(rx.recv().unwrap().seq, 1);
        drop(rx);
        assert!(!dispatcher.post(Item { key: None, seq: 2 }));
    }
}
