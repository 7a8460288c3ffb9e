use std::process::ExitCode;

use atlink::{boot, cli};

fn main() -> ExitCode {
    let matches = cli::parse_args();

    let log_file = matches.get_one::<String>("log-file").map(String::as_str);
    if let Err(err) = boot::init_logger(log_file) {
        eprintln!("failed to initialise logging: {err}");
        return ExitCode::FAILURE;
    }

    match cli::actions::run(&matches) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{err:#}");
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}
