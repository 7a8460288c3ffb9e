use std::{io, sync::Arc, time::Duration};

use bytes::Bytes;
use parking_lot::Mutex;

use atlink::{
    core::{bus::EngineEvent, task_manager::Dispatcher},
    protocol::{demux::DemuxState, EngineOptions, LinkWriter, ProtocolEngine},
};

#[derive(Clone, Default)]
struct NullWriter {
    written: Arc<Mutex<Vec<u8>>>,
}

impl LinkWriter for NullWriter {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.written.lock().extend_from_slice(bytes);
        Ok(())
    }

    fn clear_input(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn engine() -> (ProtocolEngine, flume::Receiver<EngineEvent>) {
    let (tx, rx) = flume::unbounded();
    let engine = ProtocolEngine::new(
        Box::new(NullWriter::default()),
        Dispatcher::from(tx),
        EngineOptions::default(),
    )
    .unwrap();
    (engine, rx)
}

const TRAFFIC: &[u8] = b"5,CONNECT\r\n+IPD,2,4:ABCDOK\r\n";

#[test]
fn test_every_chunking_yields_the_same_result() {
    for first in 0..=TRAFFIC.len() {
        for second in first..=TRAFFIC.len() {
            let (engine, events) = engine();
            engine.feed(&TRAFFIC[..first]);
            engine.feed(&TRAFFIC[first..second]);
            engine.feed(&TRAFFIC[second..]);

            let replies: Vec<String> =
                std::iter::from_fn(|| engine.next_reply(Duration::ZERO).ok()).collect();
            assert_eq!(replies, vec!["5,CONNECT", "OK"], "split at {first}/{second}");

            let events: Vec<EngineEvent> = events.try_iter().collect();
            assert_eq!(
                events,
                vec![EngineEvent::Payload {
                    channel: 2,
                    data: Bytes::from_static(b"ABCD"),
                }],
                "split at {first}/{second}"
            );
            assert_eq!(engine.demux_state(), DemuxState::ParsingLines);
        }
    }
}

#[test]
fn test_claimed_connect_is_not_a_reply() {
    let (engine, events) = engine();
    engine.set_connect_hook(Box::new(|channel| channel == 5));
    engine.feed(TRAFFIC);

    assert_eq!(engine.next_reply(Duration::ZERO).unwrap(), "OK");
    assert!(engine.next_reply(Duration::ZERO).is_err());
    assert_eq!(events.try_iter().count(), 1);
}

#[test]
fn test_payload_bytes_are_never_lines() {
    let (engine, events) = engine();
    engine.feed(b"+IPD,0,14:OK\r\n1,CLOSED\r\n");
    engine.feed(b"0,CLOSED\r\n");

    assert!(engine.next_reply(Duration::ZERO).is_err());
    assert_eq!(
        events.try_iter().collect::<Vec<_>>(),
        vec![
            EngineEvent::Payload {
                channel: 0,
                data: Bytes::from_static(b"OK\r\n1,CLOSED\r\n"),
            },
            EngineEvent::ChannelClosed(0),
        ]
    );
}
