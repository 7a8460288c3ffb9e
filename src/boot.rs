use chrono::Local;
use env_logger::{Builder, Target};
use log::LevelFilter;
use std::io::{self, Write};

/// Multi-writer for logging to both file and stderr
struct DualWriter {
    file: std::fs::File,
    stderr: io::Stderr,
}

impl Write for DualWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write_all(buf)?;
        self.stderr.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()?;
        self.stderr.flush()?;
        Ok(())
    }
}

/// Initialize logging for the command line tool.
///
/// Without a log file, records go to stderr at `warn` and above. With one,
/// every record from `debug` up is appended to the file and mirrored to
/// stderr. `RUST_LOG` overrides both levels.
pub fn init_logger(log_file: Option<&str>) -> io::Result<()> {
    let mut builder = Builder::new();
    builder.format(|buf, record| {
        writeln!(
            buf,
            "{} [{}] {} - {}",
            Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
            record.level(),
            record.target(),
            record.args()
        )
    });

    match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            builder
                .target(Target::Pipe(Box::new(DualWriter {
                    file,
                    stderr: io::stderr(),
                })))
                .filter_level(LevelFilter::Debug);
        }
        None => {
            builder.target(Target::Stderr).filter_level(LevelFilter::Warn);
        }
    }

    builder.parse_default_env().init();
    if let Some(path) = log_file {
        log::info!("Logging to {path}");
    }
    Ok(())
}
