pub mod actions;

use clap::{Arg, ArgAction, ArgMatches, Command};

/// Describe the command line of the `atlink` binary.
pub fn build_command() -> Command {
    Command::new("atlink")
        .about("Drive an AT-command Wi-Fi module over a serial port")
        .subcommand_required(true)
        .arg(
            Arg::new("port")
                .long("port")
                .short('p')
                .help("Serial port the module is attached to")
                .value_name("PORT")
                .global(true),
        )
        .arg(
            Arg::new("baud")
                .long("baud")
                .short('b')
                .help("Serial port baud rate")
                .value_name("BAUD")
                .value_parser(clap::value_parser!(u32))
                .global(true),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .help("Driver configuration file (.toml or .json)")
                .value_name("FILE")
                .global(true),
        )
        .arg(
            Arg::new("log-file")
                .long("log-file")
                .help("Append debug logs to this file as well as stderr")
                .value_name("FILE")
                .global(true),
        )
        .arg(
            Arg::new("simulate")
                .long("simulate")
                .help("Talk to a built-in simulated module instead of a serial port")
                .action(ArgAction::SetTrue)
                .global(true),
        )
        .subcommand(Command::new("info").about("Bring the module up and print its firmware version"))
        .subcommand(
            Command::new("scan")
                .about("List visible access points")
                .arg(
                    Arg::new("json")
                        .long("json")
                        .short('j')
                        .help("Output results in JSON format")
                        .action(ArgAction::SetTrue),
                ),
        )
        .subcommand(
            Command::new("join")
                .about("Join an access point")
                .arg(Arg::new("ssid").long("ssid").value_name("SSID").required(true))
                .arg(
                    Arg::new("password")
                        .long("password")
                        .value_name("PASSWORD")
                        .default_value(""),
                )
                .arg(
                    Arg::new("persist")
                        .long("persist")
                        .help("Store the credentials on the module")
                        .action(ArgAction::SetTrue),
                ),
        )
        .subcommand(Command::new("leave").about("Leave the current access point"))
        .subcommand(Command::new("address").about("Print station and access point addresses"))
        .subcommand(
            Command::new("send")
                .about("Open a socket, send data and print what comes back")
                .arg(Arg::new("host").long("host").value_name("HOST").required(true))
                .arg(
                    Arg::new("remote-port")
                        .long("remote-port")
                        .value_name("PORT")
                        .value_parser(clap::value_parser!(u16))
                        .required(true),
                )
                .arg(
                    Arg::new("udp")
                        .long("udp")
                        .help("Use UDP instead of TCP")
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    Arg::new("data")
                        .long("data")
                        .value_name("TEXT")
                        .help("Payload; C-style \\r and \\n escapes are expanded")
                        .required(true),
                )
                .arg(
                    Arg::new("hex")
                        .long("hex")
                        .help("Treat --data as hex bytes")
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    Arg::new("wait-ms")
                        .long("wait-ms")
                        .value_name("MS")
                        .help("How long to collect the response")
                        .value_parser(clap::value_parser!(u64))
                        .default_value("2000"),
                ),
        )
}

/// Parse command line arguments and return ArgMatches.
pub fn parse_args() -> ArgMatches {
    build_command().get_matches()
}
