use std::{
    net::Ipv4Addr,
    sync::Arc,
    time::{Duration, Instant},
};

use atlink::{
    protocol::{PowerLine, SimulatedModule},
    AtError, ChannelSocket, DeviceBuilder, DeviceController, DeviceEvent, Dialect, Ecn,
    OperatingMode, Timings, Transport,
};

fn start(module: &SimulatedModule) -> Arc<DeviceController> {
    start_with(module, DeviceBuilder::new())
}

fn start_with(module: &SimulatedModule, builder: DeviceBuilder) -> Arc<DeviceController> {
    let (reader, writer) = module.link(Duration::from_millis(5));
    let lines = Arc::new(module.clone());
    let device = builder
        .with_power_line(lines.clone())
        .with_reset_line(lines)
        .build_with_link(Box::new(reader), Box::new(writer))
        .unwrap();
    device.wait_ready(Duration::from_secs(5)).unwrap();
    device
}

fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

fn info_events(device: &DeviceController) -> Vec<(String, usize)> {
    device
        .events()
        .drain()
        .filter_map(|event| match event {
            DeviceEvent::Info { message, index } => Some((message, index)),
            _ => None,
        })
        .collect()
}

#[test]
fn test_bring_up_on_extended_firmware() {
    let module = SimulatedModule::esp8266("1.3.0.0");
    let device = start(&module);

    assert_eq!(device.dialect(), Dialect::Extended);
    let commands = module.commands();
    assert_eq!(&commands[..4], &["AT", "ATE0", "AT+CIPMUX=1", "AT+GMR"]);

    let version = device.firmware_version().unwrap();
    assert_eq!(version.at_version(), Some("1.3.0.0(Jul 19 2016 18:44:44)"));
    assert_eq!(version.sdk_version(), Some("2.0.0(656edbf)"));

    device.set_operating_mode(OperatingMode::Station, false).unwrap();
    device.set_operating_mode(OperatingMode::Both, true).unwrap();
    assert_eq!(device.operating_mode().unwrap(), OperatingMode::Station);
    assert_eq!(module.count("AT+CWMODE_CUR=1"), 1);
    assert_eq!(module.count("AT+CWMODE_DEF=3"), 1);
    assert_eq!(module.count("AT+CWMODE_CUR?"), 1);
}

#[test]
fn test_legacy_firmware_uses_plain_commands() {
    let module = SimulatedModule::esp8266("0.40.0.0");
    let device = start(&module);

    assert_eq!(device.dialect(), Dialect::Legacy);
    device.set_operating_mode(OperatingMode::AccessPoint, true).unwrap();
    device.join_access_point("home-net", "secret", false).unwrap();

    assert_eq!(module.count("AT+CWMODE=2"), 1);
    assert_eq!(module.count("AT+CWJAP=\"home-net\",\"secret\""), 1);
    assert_eq!(module.count("AT+CWMODE_"), 0);
    assert_eq!(module.count("AT+CWJAP_"), 0);
    assert!(matches!(device.restore(), Err(AtError::ProtocolFault(_))));
}

fn quick_bring_up() -> DeviceBuilder {
    DeviceBuilder::new().with_timings(Timings {
        ping_attempts: 3,
        ping_timeout_ms: 50,
        ping_backoff_ms: 10,
        power_settle_ms: 10,
        ..Default::default()
    })
}

#[test]
fn test_silent_module_is_power_cycled() {
    let module = SimulatedModule::esp8266("1.3.0.0");
    module.respond_sequence("AT", &[&[], &[], &[], &["OK"]]);
    let device = start_with(&module, quick_bring_up());

    assert!(device.is_ready());
    assert_eq!(module.power_offs(), 1);
    assert!(module.is_on());
    let pings = module.commands().iter().filter(|c| *c == "AT").count();
    assert!(pings >= 4, "{pings} pings");
    assert_eq!(device.dialect(), Dialect::Extended);
}

#[test]
fn test_configuration_failure_restarts_bring_up() {
    let module = SimulatedModule::esp8266("1.3.0.0");
    module.respond_sequence("AT+CIPMUX=", &[&["ERROR"], &["OK"]]);
    let device = start_with(&module, quick_bring_up());

    assert!(device.is_ready());
    assert_eq!(module.count("AT+CIPMUX=1"), 2);
    assert_eq!(module.count("ATE0"), 2);
    assert_eq!(module.count("AT+GMR"), 1);
    assert_eq!(module.power_offs(), 0);
}

#[test]
fn test_join_reports_status_lines() {
    let module = SimulatedModule::esp8266("1.3.0.0");
    let device = start(&module);

    device.join_access_point("home-net", "secret", true).unwrap();
    assert_eq!(module.count("AT+CWJAP_DEF=\"home-net\",\"secret\""), 1);
    assert_eq!(
        info_events(&device),
        vec![
            ("WIFI CONNECTED".to_string(), 0),
            ("WIFI GOT IP".to_string(), 2)
        ]
    );
}

#[test]
fn test_join_failure() {
    let module = SimulatedModule::esp8266("1.3.0.0");
    module.respond("AT+CWJAP", &["WIFI DISCONNECT", "+CWJAP:3", "", "FAIL"]);
    let device = start(&module);

    match device.join_access_point("home-net", "wrong", false) {
        Err(AtError::JoinFailed { ssid }) => assert_eq!(ssid, "home-net"),
        other => panic!("unexpected result {other:?}"),
    }

    module.respond("AT+CWJAP", &["ERROR"]);
    match device.join_access_point("home-net", "wrong", false) {
        Err(AtError::DeviceError { command }) => assert!(!command.contains("wrong")),
        other => panic!("unexpected result {other:?}"),
    }
}

#[test]
fn test_addresses_and_scans() {
    let module = SimulatedModule::esp8266("1.3.0.0");
    let device = start(&module);

    assert_eq!(
        device.station_address().unwrap(),
        Some(Ipv4Addr::new(192, 168, 1, 20))
    );
    let cached = device.cached_addresses();
    assert_eq!(cached.station_gateway, Some(Ipv4Addr::new(192, 168, 1, 1)));
    assert_eq!(cached.station_netmask, Some(Ipv4Addr::new(255, 255, 255, 0)));

    let info = device.address_information().unwrap();
    assert_eq!(info.ap_address, Some(Ipv4Addr::new(192, 168, 4, 1)));
    assert_eq!(info.station_mac.as_deref(), Some("5c:cf:7f:0a:0b:0c"));
    assert_eq!(info.ap_mac.as_deref(), Some("5e:cf:7f:0a:0b:0c"));

    let access_points = device.access_points(true).unwrap();
    assert_eq!(module.count("AT+CWLAPOPT=1,31"), 1);
    assert_eq!(access_points.len(), 2);
    assert_eq!(access_points[0].ssid, "home-net");
    assert_eq!(access_points[0].ecn, Ecn::Wpa2Psk);
    assert_eq!(access_points[0].rssi, -52);
    assert_eq!(access_points[1].ssid, "cafe guest");
    assert_eq!(access_points[1].ecn, Ecn::Open);

    let clients = device.connected_clients().unwrap();
    assert_eq!(clients.len(), 1);
    assert_eq!(clients[0].address, Ipv4Addr::new(192, 168, 4, 2));
}

#[test]
fn test_open_send_and_dispose() {
    let module = SimulatedModule::esp8266("1.3.0.0");
    let device = start(&module);

    let socket = device.open_socket("example.com", 80, Transport::Tcp).unwrap();
    assert_eq!(socket.id(), 0);
    assert!(socket.is_connected());
    assert_eq!(module.count("AT+CIPSTART=0,\"TCP\",\"example.com\",80"), 1);

    socket.send_str("GET / HTTP/1.0\r\n\r\n").unwrap();
    socket.send(b"").unwrap();
    assert_eq!(module.payloads(), vec![b"GET / HTTP/1.0\r\n\r\n".to_vec()]);
    assert_eq!(module.count("AT+CIPSEND="), 1);

    socket.dispose();
    assert!(socket.is_disposed());
    assert_eq!(module.count("AT+CIPCLOSE=0"), 1);
    assert_eq!(device.channels_in_use(), 0);
    assert!(matches!(socket.send_str("late"), Err(AtError::SocketDisposed)));
}

#[test]
fn test_dns_failures_are_retried_with_backoff() {
    let module = SimulatedModule::esp8266("1.3.0.0");
    module.respond_sequence(
        "AT+CIPSTART=",
        &[&["DNS Fail"], &["DNS Fail"], &["{channel},CONNECT", "", "OK"]],
    );
    let device = start(&module);

    let started = Instant::now();
    let socket = device.open_socket("example.com", 80, Transport::Udp).unwrap();
    assert!(started.elapsed() >= Duration::from_millis(1000));
    assert!(socket.is_connected());
    assert_eq!(module.count("AT+CIPSTART="), 3);
    assert!(info_events(&device).contains(&("DNS Fail".to_string(), 6)));
}

#[test]
fn test_dns_failure_exhausts_attempts_and_frees_channel() {
    let module = SimulatedModule::esp8266("1.3.0.0");
    module.respond("AT+CIPSTART=", &["DNS Fail", "", "ERROR"]);
    let device = start(&module);

    match device.open_socket("nowhere.invalid", 80, Transport::Tcp) {
        Err(AtError::DnsLookupFailed { host }) => assert_eq!(host, "nowhere.invalid"),
        other => panic!("unexpected result {other:?}"),
    }
    assert_eq!(module.count("AT+CIPSTART="), 3);
    assert_eq!(device.channels_in_use(), 0);
}

#[test]
fn test_error_reply_is_not_retried() {
    let module = SimulatedModule::esp8266("1.3.0.0");
    module.respond("AT+CIPSTART=", &["ERROR"]);
    let device = start(&module);

    assert!(matches!(
        device.open_socket("example.com", 80, Transport::Tcp),
        Err(AtError::DeviceError { .. })
    ));
    assert_eq!(module.count("AT+CIPSTART="), 1);
    assert_eq!(device.channels_in_use(), 0);
}

#[test]
fn test_confirmation_for_another_channel_is_a_fault() {
    let module = SimulatedModule::esp8266("1.3.0.0");
    module.respond("AT+CIPSTART=", &["1,CONNECT", "", "OK"]);
    let device = start(&module);

    assert!(matches!(
        device.open_socket("example.com", 80, Transport::Tcp),
        Err(AtError::ProtocolFault(_))
    ));
    assert_eq!(module.count("AT+CIPSTART=0,"), 1);
    assert_eq!(device.channels_in_use(), 0);
}

#[test]
fn test_confirmation_without_channel_is_a_fault() {
    for reply in [&["ALREADY CONNECTED", "", "ERROR"][..], &["CONNECT", "", "OK"][..]] {
        let module = SimulatedModule::esp8266("1.3.0.0");
        module.respond("AT+CIPSTART=", reply);
        let device = start(&module);

        match device.open_socket("example.com", 80, Transport::Tcp) {
            Err(AtError::ProtocolFault(_)) => {}
            other => panic!("{reply:?} gave {other:?}"),
        }
        assert_eq!(module.count("AT+CIPSTART="), 1);
        assert_eq!(device.channels_in_use(), 0);

        module.respond("AT+CIPSTART=", &["{channel},CONNECT", "", "OK"]);
        let socket = device.open_socket("example.com", 80, Transport::Tcp).unwrap();
        assert!(socket.is_connected());
    }
}

#[test]
fn test_allocation_passes_over_last_freed_channel() {
    let module = SimulatedModule::esp8266("1.3.0.0");
    let device = start_with(&module, DeviceBuilder::new().with_channel_count(3));

    let sockets: Vec<ChannelSocket> = (0..3)
        .map(|_| device.open_socket("example.com", 80, Transport::Tcp).unwrap())
        .collect();
    assert_eq!(
        sockets.iter().map(ChannelSocket::id).collect::<Vec<_>>(),
        vec![0, 1, 2]
    );
    assert!(matches!(
        device.open_socket("example.com", 80, Transport::Tcp),
        Err(AtError::ChannelExhausted)
    ));

    sockets[1].dispose();
    sockets[0].dispose();
    std::thread::sleep(Duration::from_millis(50));

    let next = device.open_socket("example.com", 80, Transport::Tcp).unwrap();
    assert_eq!(next.id(), 1);
}

#[test]
fn test_peer_close_fires_callback_and_frees_channel() {
    let module = SimulatedModule::esp8266("1.3.0.0");
    let device = start(&module);
    let socket = device.open_socket("example.com", 80, Transport::Tcp).unwrap();

    let (closed_tx, closed_rx) = flume::unbounded();
    socket.on_closed(move |socket| {
        let _ = closed_tx.send(socket.id());
    });
    let (data_tx, data_rx) = flume::unbounded();
    socket.on_data(move |_, data| {
        let _ = data_tx.send(data);
    });

    module.inject(b"+IPD,0,5:hello");
    module.inject(b"0,CLOSED\r\n");

    let data = data_rx.recv_timeout(Duration::from_secs(1)).unwrap();
    assert_eq!(&data[..], b"hello");
    assert_eq!(closed_rx.recv_timeout(Duration::from_secs(1)).unwrap(), 0);
    assert!(!socket.is_connected());
    assert!(wait_for(Duration::from_secs(1), || device.channels_in_use() == 0));
    assert_eq!(module.count("AT+CIPCLOSE="), 0);
}

#[test]
fn test_local_close_does_not_fire_callback() {
    let module = SimulatedModule::esp8266("1.3.0.0");
    let device = start(&module);
    let socket = device.open_socket("example.com", 80, Transport::Tcp).unwrap();

    let (closed_tx, closed_rx) = flume::unbounded();
    socket.on_closed(move |socket| {
        let _ = closed_tx.send(socket.id());
    });
    socket.close().unwrap();

    assert!(closed_rx.recv_timeout(Duration::from_millis(200)).is_err());
    assert!(!socket.is_connected());
    assert_eq!(device.socket(0).map(|held| held.ptr_eq(&socket)), Some(true));

    socket.open().unwrap();
    assert!(socket.is_connected());
    assert_eq!(module.count("AT+CIPSTART=0,"), 2);
}

#[test]
fn test_server_hands_over_inbound_connections() {
    let module = SimulatedModule::esp8266("1.3.0.0");
    let device = start(&module);

    let (accepted_tx, accepted_rx) = flume::unbounded();
    let (data_tx, data_rx) = flume::unbounded();
    device
        .create_server(8080, move |socket: ChannelSocket| {
            let data_tx = data_tx.clone();
            socket.on_data(move |_, data| {
                let _ = data_tx.send(data);
            });
            let _ = accepted_tx.send(socket);
        })
        .unwrap();
    assert_eq!(module.count("AT+CIPSERVER=1,8080"), 1);

    module.inject(b"1,CONNECT\r\n+IPD,1,3:abc");

    let socket = accepted_rx.recv_timeout(Duration::from_secs(1)).unwrap();
    assert_eq!(socket.id(), 1);
    assert_eq!(socket.host(), None);
    assert_eq!(socket.port(), 8080);
    assert!(socket.is_connected());
    assert_eq!(&data_rx.recv_timeout(Duration::from_secs(1)).unwrap()[..], b"abc");
    assert!(matches!(socket.open(), Err(AtError::InvalidArgument(_))));

    let outbound = device.open_socket("example.com", 80, Transport::Tcp).unwrap();
    assert_ne!(outbound.id(), 1);
}

#[test]
fn test_unexpected_reboot_is_reported() {
    let module = SimulatedModule::esp8266("1.3.0.0");
    let device = start(&module);
    let events = device.events();

    module.inject(b"\r\nets Jan  8 2013,rst cause:2, boot mode:(3,6)\r\n");

    let deadline = Instant::now() + Duration::from_secs(1);
    let mut seen = None;
    while let Ok(event) = events.recv_deadline(deadline) {
        if let DeviceEvent::HardwareFault { cause } = event {
            seen = Some(cause);
            break;
        }
    }
    assert_eq!(seen, Some(Some(2)));
}

#[test]
fn test_reset_runs_bring_up_again() {
    let module = SimulatedModule::esp8266("1.3.0.0");
    let device = start(&module);
    let socket = device.open_socket("example.com", 80, Transport::Tcp).unwrap();

    device.reset(false).unwrap();
    assert!(device.is_ready());
    assert_eq!(module.count("AT+RST"), 1);
    assert_eq!(module.count("ATE0"), 2);
    assert!(!socket.is_connected());
    assert_eq!(device.channels_in_use(), 0);
}

#[test]
fn test_sleep_wake_and_shutdown() {
    let module = SimulatedModule::esp8266("1.3.0.0");
    let device = start(&module);

    device.deep_sleep(1500).unwrap();
    assert_eq!(module.count("AT+GSLP=1500"), 1);
    device.wake().unwrap();
    assert_eq!(module.reset_pulses(), 1);
    assert!(device.is_alive());

    device.shutdown();
    assert!(matches!(device.operating_mode(), Err(AtError::ShuttingDown)));
    assert!(matches!(
        device.open_socket("example.com", 80, Transport::Tcp),
        Err(AtError::ShuttingDown)
    ));
}
