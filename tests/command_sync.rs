use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use atlink::{
    core::task_manager::Dispatcher,
    error::AtError,
    protocol::{spawn_reader, EngineOptions, ProtocolEngine, ReaderHandle, SimulatedModule},
};

fn engine_on(module: &SimulatedModule) -> (Arc<ProtocolEngine>, ReaderHandle) {
    let (reader, writer) = module.link(Duration::from_millis(5));
    let (tx, _rx) = flume::unbounded();
    let engine = Arc::new(
        ProtocolEngine::new(
            Box::new(writer),
            Dispatcher::from(tx),
            EngineOptions {
                discard_wait: Duration::from_millis(50),
                trace_bytes: false,
            },
        )
        .unwrap(),
    );
    let handle = spawn_reader(engine.clone(), Box::new(reader)).unwrap();
    (engine, handle)
}

#[test]
fn test_silent_command_times_out_and_link_recovers() {
    let module = SimulatedModule::esp8266("1.3.0.0");
    module.silence("AT+CWLAP");
    let (engine, _reader) = engine_on(&module);

    let started = Instant::now();
    let err = engine
        .send_and_expect("AT+CWLAP", "OK", Duration::from_millis(100))
        .unwrap_err();
    assert!(matches!(err, AtError::CommandTimeout { .. }), "{err:?}");
    assert!(started.elapsed() >= Duration::from_millis(100));

    engine
        .send_and_expect("AT", "OK", Duration::from_secs(1))
        .unwrap();
    assert_eq!(module.commands(), vec!["AT+CWLAP", "AT"]);
}

#[test]
fn test_late_reply_is_discarded_by_next_command() {
    let module = SimulatedModule::esp8266("1.3.0.0");
    module.silence("AT+GMR");
    let (engine, _reader) = engine_on(&module);
    engine
        .send_and_expect("ATE0", "OK", Duration::from_secs(1))
        .unwrap();

    assert!(engine
        .send_and_read_until(Some("AT+GMR"), "OK", &[], Duration::from_millis(50))
        .is_err());
    module.inject(b"AT version:late\r\nOK\r\n");
    std::thread::sleep(Duration::from_millis(30));

    let reply = engine
        .send_command_and_read_reply("AT+CWMODE?", Duration::from_secs(1))
        .unwrap();
    assert_eq!(reply, "+CWMODE:1");
}

#[test]
fn test_send_and_read_until_collects_reply_lines() {
    let module = SimulatedModule::esp8266("1.3.0.0");
    let (engine, _reader) = engine_on(&module);

    let lines = engine
        .send_and_read_until(Some("AT+GMR"), "OK", &["ERROR"], Duration::from_secs(1))
        .unwrap();
    assert_eq!(lines.len(), 3);
    assert!(lines[0].starts_with("AT version:1.3.0.0"));
}
