use clap::{Arg, ArgAction, ArgMatches, Command};
use std::path::PathBuf;

/// Runtime settings from the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub syslog: bool,
    pub logfile: Option<PathBuf>,
    /// Serial device of the terminal; stdin/stdout when absent.
    pub serial: Option<String>,
    pub speed: u32,
    pub addressbook: PathBuf,
    pub profiles: PathBuf,
    pub telnet_port: u16,
    pub ssh_port: u16,
    pub keyfile: PathBuf,
    pub no_telnet: bool,
    pub no_ssh: bool,
}

pub fn command() -> Command {
    Command::new(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .arg(
            Arg::new("syslog")
                .long("syslog")
                .help("Log to the local syslog daemon")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("logfile")
                .long("logfile")
                .help("Log to a file instead of stderr")
                .value_name("PATH")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("serial")
                .long("serial")
                .help("Serial device the terminal is attached to (default: stdin/stdout)")
                .value_name("DEVICE"),
        )
        .arg(
            Arg::new("speed")
                .long("speed")
                .help("Serial line speed in bps")
                .value_name("BPS")
                .default_value("115200")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new("addressbook")
                .long("addressbook")
                .help("Phonebook file")
                .value_name("FILE")
                .default_value("./phonebook.json")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("profiles")
                .long("profiles")
                .help("Stored profiles file")
                .value_name("FILE")
                .default_value("./profiles.json")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("telnetport")
                .long("telnetport")
                .help("Port to accept telnet calls on")
                .value_name("PORT")
                .default_value("20000")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new("sshport")
                .long("sshport")
                .help("Port to accept SSH calls on")
                .value_name("PORT")
                .default_value("22000")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new("keyfile")
                .long("keyfile")
                .help("SSH host key (PEM)")
                .value_name("FILE")
                .default_value("./id_rsa")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("notelnet")
                .long("notelnet")
                .help("Do not accept telnet calls")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("nossh")
                .long("nossh")
                .help("Do not accept SSH calls")
                .action(ArgAction::SetTrue),
        )
}

impl Settings {
    pub fn from_matches(matches: &ArgMatches) -> Self {
        let path = |id: &str| matches.get_one::<PathBuf>(id).cloned().unwrap_or_default();
        Self {
            syslog: matches.get_flag("syslog"),
            logfile: matches.get_one::<PathBuf>("logfile").cloned(),
            serial: matches.get_one::<String>("serial").cloned(),
            speed: matches.get_one::<u32>("speed").copied().unwrap_or(115_200),
            addressbook: path("addressbook"),
            profiles: path("profiles"),
            telnet_port: matches.get_one::<u16>("telnetport").copied().unwrap_or(20_000),
            ssh_port: matches.get_one::<u16>("sshport").copied().unwrap_or(22_000),
            keyfile: path("keyfile"),
            no_telnet: matches.get_flag("notelnet"),
            no_ssh: matches.get_flag("nossh"),
        }
    }
}

/// Parse the process arguments.
pub fn parse_args() -> Settings {
    Settings::from_matches(&command().get_matches())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn defaults() {
        let matches = command().try_get_matches_from(["dialtone"]).unwrap();
        let settings = Settings::from_matches(&matches);
        assert_eq!(
            settings,
            Settings {
                syslog: false,
                logfile: None,
                serial: None,
                speed: 115_200,
                addressbook: "./phonebook.json".into(),
                profiles: "./profiles.json".into(),
                telnet_port: 20_000,
                ssh_port: 22_000,
                keyfile: "./id_rsa".into(),
                no_telnet: false,
                no_ssh: false,
            }
        );
    }

    #[test]
    fn overrides() {
        let matches = assert_ok!(command().try_get_matches_from([
            "dialtone",
            "--serial",
            "/dev/ttyUSB0",
            "--speed",
            "9600",
            "--nossh",
            "--telnetport",
            "2323",
            "--logfile",
            "/tmp/modem.log",
        ]));
        let settings = Settings::from_matches(&matches);
        assert_eq!(settings.serial.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(settings.speed, 9600);
        assert_eq!(settings.telnet_port, 2323);
        assert!(settings.no_ssh && !settings.no_telnet);
        assert_eq!(settings.logfile, Some(PathBuf::from("/tmp/modem.log")));

        assert_err!(command().try_get_matches_from(["dialtone", "--sshport", "70000"]));
    }
}
