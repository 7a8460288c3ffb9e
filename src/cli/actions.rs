use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use clap::ArgMatches;
use flume::Receiver;

use crate::{
    api::{ChannelSocket, DeviceBuilder, DeviceController, DriverConfig, Transport},
    core::helpers::{parse_hex_payload, printable},
    protocol::SimulatedModule,
};

/// Bring-up of a freshly powered module can take a few ping rounds.
const READY_TIMEOUT: Duration = Duration::from_secs(30);
const SIMULATED_FIRMWARE: &str = "1.3.0.0";
const SIMULATED_POLL: Duration = Duration::from_millis(20);

/// Run the subcommand selected in `matches`.
pub fn run(matches: &ArgMatches) -> Result<()> {
    let device = connect(matches)?;
    device
        .wait_ready(READY_TIMEOUT)
        .context("module did not come up")?;

    match matches.subcommand() {
        Some(("info", _)) => handle_info(&device),
        Some(("scan", sub)) => handle_scan(&device, sub),
        Some(("join", sub)) => handle_join(&device, sub),
        Some(("leave", _)) => {
            device.leave_access_point()?;
            println!("left access point");
            Ok(())
        }
        Some(("address", _)) => handle_address(&device),
        Some(("send", sub)) => handle_send(&device, sub),
        Some((other, _)) => Err(anyhow!("unknown subcommand '{other}'")),
        None => Err(anyhow!("no subcommand given")),
    }
}

fn load_config(matches: &ArgMatches) -> Result<DriverConfig> {
    let mut config = match matches.get_one::<String>("config") {
        Some(path) => DriverConfig::load(path)?,
        None => DriverConfig::default(),
    };
    if let Some(port) = matches.get_one::<String>("port") {
        config.port_name = Some(port.clone());
    }
    if let Some(baud) = matches.get_one::<u32>("baud") {
        config.baud_rate = *baud;
    }
    Ok(config)
}

fn connect(matches: &ArgMatches) -> Result<Arc<DeviceController>> {
    let config = load_config(matches)?;
    let builder = DeviceBuilder::from_config(config);

    if matches.get_flag("simulate") {
        log::info!("using simulated module (AT {SIMULATED_FIRMWARE})");
        let module = SimulatedModule::esp8266(SIMULATED_FIRMWARE);
        let (reader, writer) = module.link(SIMULATED_POLL);
        let line = Arc::new(module);
        return builder
            .with_power_line(line.clone())
            .with_reset_line(line)
            .build_with_link(Box::new(reader), Box::new(writer));
    }

    builder.build()
}

fn handle_info(device: &DeviceController) -> Result<()> {
    let version = device.firmware_version()?;
    println!("command set: {}", device.dialect());
    println!(
        "AT version:  {}",
        version.at_version().unwrap_or("unknown")
    );
    println!(
        "SDK version: {}",
        version.sdk_version().unwrap_or("unknown")
    );
    if let Some(compiled) = version.compile_time() {
        println!("compiled:    {compiled}");
    }
    Ok(())
}

fn handle_scan(device: &DeviceController, matches: &ArgMatches) -> Result<()> {
    let access_points = device.access_points(true)?;

    if matches.get_flag("json") {
        let json = serde_json::to_string(&access_points)?;
        println!("{json}");
    } else if access_points.is_empty() {
        println!("No access points found");
    } else {
        for ap in &access_points {
            println!(
                "{:>4} dBm  {:<12}  {}  {}",
                ap.rssi,
                format!("{:?}", ap.ecn),
                ap.mac_address,
                ap.ssid
            );
        }
    }
    Ok(())
}

fn handle_join(device: &DeviceController, matches: &ArgMatches) -> Result<()> {
    let ssid = matches
        .get_one::<String>("ssid")
        .ok_or_else(|| anyhow!("--ssid is required"))?;
    let password = matches
        .get_one::<String>("password")
        .map(String::as_str)
        .unwrap_or("");
    let persist = matches.get_flag("persist");

    device.join_access_point(ssid, password, persist)?;
    for event in device.events().drain() {
        log::debug!("event: {event:?}");
    }
    println!("joined '{ssid}'");
    Ok(())
}

fn handle_address(device: &DeviceController) -> Result<()> {
    let info = device.address_information()?;
    let json = serde_json::to_string_pretty(&info)?;
    println!("{json}");
    Ok(())
}

fn handle_send(device: &Arc<DeviceController>, matches: &ArgMatches) -> Result<()> {
    let host = matches
        .get_one::<String>("host")
        .ok_or_else(|| anyhow!("--host is required"))?;
    let port = *matches
        .get_one::<u16>("remote-port")
        .ok_or_else(|| anyhow!("--remote-port is required"))?;
    let data = matches
        .get_one::<String>("data")
        .ok_or_else(|| anyhow!("--data is required"))?;
    let payload = if matches.get_flag("hex") {
        parse_hex_payload(data)
    } else {
        expand_escapes(data).into_bytes()
    };
    let wait = Duration::from_millis(*matches.get_one::<u64>("wait-ms").unwrap_or(&2000));
    let transport = if matches.get_flag("udp") {
        Transport::Udp
    } else {
        Transport::Tcp
    };

    let socket = device
        .open_socket(host, port, transport)
        .with_context(|| format!("failed to open {transport} {host}:{port}"))?;
    let received = collect_received(&socket);
    socket.send(&payload)?;
    log::info!("sent {} bytes on channel {}", payload.len(), socket.id());

    let deadline = Instant::now() + wait;
    while let Ok(chunk) = received.recv_deadline(deadline) {
        println!("{}", printable(&chunk));
    }

    if socket.is_connected() {
        socket.close()?;
    }
    socket.dispose();
    Ok(())
}

/// Forward everything received on `socket` to a channel.
fn collect_received(socket: &ChannelSocket) -> Receiver<Bytes> {
    let (tx, rx) = flume::unbounded();
    socket.on_data(move |_, data| {
        let _ = tx.send(data);
    });
    rx
}

/// Expand `\r`, `\n`, `\t` and `\\` in command line text.
fn expand_escapes(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}
