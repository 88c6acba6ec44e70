use anyhow::{Context, Result};
use chrono::Local;
use log::LevelFilter;
use std::{
    io::{self, Write},
    path::Path,
    sync::Arc,
};

use env_logger::{Builder, Target};

use crate::{
    cli::Settings,
    dte::Dte,
    modem::{serial_pump, supervisor, watchers, Modem, Peripherals, Timing},
};
use dialtone_hal::{LogDisplay, NullTone};
use dialtone_protocol::{Phonebook, StoredProfiles};

/// RFC 3164 facility `daemon`.
#[cfg(unix)]
const SYSLOG_FACILITY: u8 = 3;

/// Pick the log sink from the command line. Falls back to stderr when the
/// chosen sink cannot be opened.
pub fn init_logger(settings: &Settings) {
    if settings.syslog {
        match init_syslog_logger() {
            Ok(()) => return,
            Err(err) => eprintln!("Failed to open syslog, logging to stderr: {err}"),
        }
    } else if let Some(path) = &settings.logfile {
        match init_file_logger(path) {
            Ok(()) => return,
            Err(err) => eprintln!("Failed to initialize file logger at {path:?}: {err}"),
        }
    }

    Builder::new()
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .init();
}

fn init_file_logger(path: &Path) -> io::Result<()> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;

    let mut builder = Builder::new();
    builder
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] {} - {}",
                Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .target(Target::Pipe(Box::new(file)))
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .init();

    log::info!("File logger initialized at {path:?}");

    Ok(())
}

/// One datagram per record on the local syslog socket.
#[cfg(unix)]
struct SyslogWriter {
    socket: std::os::unix::net::UnixDatagram,
}

#[cfg(unix)]
impl Write for SyslogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let line = buf.strip_suffix(b"\n").unwrap_or(buf);
        self.socket.send(line)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// `<priority>timestamp name[pid]: ` in front of each message.
#[cfg(unix)]
fn syslog_header(level: log::Level, pid: u32) -> String {
    format!(
        "<{}>{} {}[{pid}]: ",
        SYSLOG_FACILITY * 8 + severity(level),
        Local::now().format("%b %e %H:%M:%S"),
        env!("CARGO_PKG_NAME"),
    )
}

#[cfg(unix)]
fn severity(level: log::Level) -> u8 {
    match level {
        log::Level::Error => 3,
        log::Level::Warn => 4,
        log::Level::Info => 6,
        log::Level::Debug | log::Level::Trace => 7,
    }
}

#[cfg(unix)]
fn init_syslog_logger() -> io::Result<()> {
    let socket = std::os::unix::net::UnixDatagram::unbound()?;
    socket.connect("/dev/log")?;
    let pid = std::process::id();

    let mut builder = Builder::new();
    builder
        .format(move |buf, record| {
            writeln!(buf, "{}{}", syslog_header(record.level(), pid), record.args())
        })
        .target(Target::Pipe(Box::new(SyslogWriter { socket })))
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .init();

    log::info!("Logging to syslog");
    Ok(())
}

#[cfg(not(unix))]
fn init_syslog_logger() -> io::Result<()> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "no syslog on this platform"))
}

/// Load persisted state, falling back to empty or factory state when the
/// files cannot be read.
fn load_persisted(settings: &Settings) -> (StoredProfiles, Phonebook) {
    let profiles = StoredProfiles::load(&settings.profiles).unwrap_or_else(|err| {
        log::error!("Stored profiles unusable, using factory profiles: {err:#}");
        StoredProfiles::factory(Some(settings.profiles.clone()))
    });
    let phonebook = Phonebook::open(&settings.addressbook).unwrap_or_else(|err| {
        log::error!("Phonebook unusable, starting empty: {err:#}");
        Phonebook::empty_at(&settings.addressbook)
    });
    (profiles, phonebook)
}

/// Bring the modem up and serve until the terminal goes away or a signal
/// arrives.
pub async fn start(settings: Settings) -> Result<()> {
    let (dte, lines) = match &settings.serial {
        Some(device) => {
            let (dte, lines) = Dte::serial(device, settings.speed)?;
            (dte, Some(lines))
        }
        None => (Dte::stdio()?, None),
    };
    let hardware = dialtone_hal::pins::open(lines).context("Failed to open control lines")?;
    let (profiles, phonebook) = load_persisted(&settings);

    let peripherals = Peripherals {
        hardware,
        tone: Box::new(NullTone),
        display: Box::new(LogDisplay::default()),
    };
    let (modem, calls) = Modem::new(profiles, phonebook, peripherals, dte.output, Timing::default());

    let telnet = (!settings.no_telnet).then_some(settings.telnet_port);
    let ssh = (!settings.no_ssh).then_some((settings.ssh_port, settings.keyfile.as_path()));
    let listening = supervisor::listen(&modem, telnet, ssh).await;
    log::info!("Listening: {listening:?}");

    tokio::spawn(supervisor::run(modem.clone(), calls));
    tokio::spawn(watchers::ring_decay(modem.clone()));
    tokio::spawn(watchers::pin_watcher(modem.clone()));
    tokio::spawn(watchers::dtr_monitor(modem.clone()));

    serve(modem, dte.input).await
}

async fn serve(modem: Arc<Modem>, input: crate::dte::DteInput) -> Result<()> {
    let result = tokio::select! {
        _ = serial_pump::run(modem.clone(), input) => Ok(()),
        signal = watchers::signals(modem.clone()) => signal,
    };
    watchers::shutdown(&modem);
    log::info!("{} stopped", env!("CARGO_PKG_NAME"));
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn syslog_header_carries_priority_and_tag() {
        let error = syslog_header(log::Level::Error, 42);
        assert!(error.starts_with("<27>"));
        assert!(error.ends_with(" dialtone[42]: "));
        assert!(syslog_header(log::Level::Info, 42).starts_with("<30>"));
        assert!(syslog_header(log::Level::Trace, 42).starts_with("<31>"));
    }

    #[cfg(unix)]
    #[test]
    fn syslog_writer_sends_one_datagram_per_line() {
        let (socket, daemon) = std::os::unix::net::UnixDatagram::pair().unwrap();
        let mut writer = SyslogWriter { socket };
        writer.write_all(b"<30>first\n").unwrap();
        writer.write_all(b"second").unwrap();
        writer.flush().unwrap();

        let mut buf = [0u8; 64];
        let n = daemon.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"<30>first");
        let n = daemon.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"second");
    }

    #[test]
    fn unreadable_files_fall_back() {
        let dir = std::env::temp_dir().join(format!("dialtone_boot_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let addressbook = dir.join("phonebook.json");
        let profiles = dir.join("profiles.json");
        std::fs::write(&addressbook, "not json").unwrap();
        std::fs::write(&profiles, "{").unwrap();

        let settings = Settings {
            addressbook,
            profiles: profiles.clone(),
            ..crate::cli::Settings::from_matches(
                &crate::cli::command().try_get_matches_from(["dialtone"]).unwrap(),
            )
        };
        let (loaded, book) = load_persisted(&settings);
        assert!(book.is_empty());
        assert_eq!(loaded.path(), Some(profiles.as_path()));
        assert_eq!(loaded.power_up_config, 0);
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
