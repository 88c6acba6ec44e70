use num_enum::{IntoPrimitive, TryFromPrimitive};
use strum::EnumIter;

use crate::config::Config;

/// Hayes result codes.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive, EnumIter)]
pub enum ResultCode {
    Ok = 0,
    Connect = 1,
    Ring = 2,
    NoCarrier = 3,
    Error = 4,
    Connect1200 = 5,
    NoDialtone = 6,
    Busy = 7,
    NoAnswer = 8,
    Connect2400 = 10,
    Connect4800 = 11,
    Connect9600 = 12,
    Connect14400 = 13,
    Connect19200 = 14,
    Connect57600 = 18,
    Connect7200 = 24,
    Connect12000 = 25,
    Connect38400 = 28,
    Connect300 = 40,
    Connect115200 = 87,
}

impl ResultCode {
    pub fn text(self) -> &'static str {
        match self {
            ResultCode::Ok => "OK",
            ResultCode::Connect => "CONNECT",
            ResultCode::Ring => "RING",
            ResultCode::NoCarrier => "NO CARRIER",
            ResultCode::Error => "ERROR",
            ResultCode::Connect1200 => "CONNECT 1200",
            ResultCode::NoDialtone => "NO DIALTONE",
            ResultCode::Busy => "BUSY",
            ResultCode::NoAnswer => "NO ANSWER",
            ResultCode::Connect2400 => "CONNECT 2400",
            ResultCode::Connect4800 => "CONNECT 4800",
            ResultCode::Connect9600 => "CONNECT 9600",
            ResultCode::Connect14400 => "CONNECT 14400",
            ResultCode::Connect19200 => "CONNECT 19200",
            ResultCode::Connect57600 => "CONNECT 57600",
            ResultCode::Connect7200 => "CONNECT 7200",
            ResultCode::Connect12000 => "CONNECT 12000",
            ResultCode::Connect38400 => "CONNECT 38400",
            ResultCode::Connect300 => "CONNECT 300",
            ResultCode::Connect115200 => "CONNECT 115200",
        }
    }

    pub fn number(self) -> u8 {
        self.into()
    }

    /// The speed-specific CONNECT code for a line rate, if there is one.
    pub fn connect_at(speed: u32) -> Option<ResultCode> {
        Some(match speed {
            300 => ResultCode::Connect300,
            1200 => ResultCode::Connect1200,
            2400 => ResultCode::Connect2400,
            4800 => ResultCode::Connect4800,
            7200 => ResultCode::Connect7200,
            9600 => ResultCode::Connect9600,
            12000 => ResultCode::Connect12000,
            14400 => ResultCode::Connect14400,
            19200 => ResultCode::Connect19200,
            38400 => ResultCode::Connect38400,
            57600 => ResultCode::Connect57600,
            115200 => ResultCode::Connect115200,
            _ => return None,
        })
    }

    /// Success codes keep the command line for `A/`.
    pub fn is_success(self) -> bool {
        matches!(self, ResultCode::Ok) || self.is_connect()
    }

    pub fn is_connect(self) -> bool {
        matches!(
            self,
            ResultCode::Connect
                | ResultCode::Connect300
                | ResultCode::Connect1200
                | ResultCode::Connect2400
                | ResultCode::Connect4800
                | ResultCode::Connect7200
                | ResultCode::Connect9600
                | ResultCode::Connect12000
                | ResultCode::Connect14400
                | ResultCode::Connect19200
                | ResultCode::Connect38400
                | ResultCode::Connect57600
                | ResultCode::Connect115200
        )
    }
}

/// Apply the reporting filters and format a result code for the DTE.
///
/// Returns `None` when the code is suppressed (`ATQ1`). The line is always
/// terminated with CR/LF.
pub fn render(code: ResultCode, config: &Config, connect_speed: u32) -> Option<String> {
    if config.quiet {
        return None;
    }

    let code = match code {
        ResultCode::Connect if config.connect_msg_speed => {
            ResultCode::connect_at(connect_speed).unwrap_or(ResultCode::Connect)
        }
        ResultCode::Busy if !config.busy_detect => ResultCode::Ok,
        ResultCode::NoDialtone | ResultCode::NoAnswer if !config.extended_result_codes => {
            ResultCode::Ok
        }
        other => other,
    };

    Some(if config.verbose {
        format!("{}\r\n", code.text())
    } else {
        format!("{}\r\n", code.number())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn numbers_round_trip() {
        for code in ResultCode::iter() {
            assert_eq!(ResultCode::try_from(code.number()).ok(), Some(code));
        }
        assert!(ResultCode::try_from(9u8).is_err());
    }

    #[test]
    fn connect_speed_substitution() {
        let cfg = Config::default();
        assert_eq!(
            render(ResultCode::Connect, &cfg, 38400).as_deref(),
            Some("CONNECT 38400\r\n")
        );
        assert_eq!(
            render(ResultCode::Connect, &cfg, 31337).as_deref(),
            Some("CONNECT\r\n")
        );

        let mut cfg = cfg;
        cfg.connect_msg_speed = false;
        assert_eq!(
            render(ResultCode::Connect, &cfg, 38400).as_deref(),
            Some("CONNECT\r\n")
        );
    }

    #[test]
    fn numeric_form_uses_substituted_code() {
        let cfg = Config {
            verbose: false,
            ..Config::default()
        };
        assert_eq!(render(ResultCode::Ok, &cfg, 0).as_deref(), Some("0\r\n"));
        assert_eq!(render(ResultCode::Connect, &cfg, 38400).as_deref(), Some("28\r\n"));
    }

    #[test]
    fn filters() {
        let quiet = Config {
            quiet: true,
            ..Config::default()
        };
        assert_eq!(render(ResultCode::Ok, &quiet, 0), None);

        let no_busy = Config {
            busy_detect: false,
            ..Config::default()
        };
        assert_eq!(render(ResultCode::Busy, &no_busy, 0).as_deref(), Some("OK\r\n"));

        let basic = Config {
            extended_result_codes: false,
            ..Config::default()
        };
        assert_eq!(render(ResultCode::NoAnswer, &basic, 0).as_deref(), Some("OK\r\n"));
        assert_eq!(render(ResultCode::NoDialtone, &basic, 0).as_deref(), Some("OK\r\n"));
        assert_eq!(
            render(ResultCode::NoCarrier, &basic, 0).as_deref(),
            Some("NO CARRIER\r\n")
        );
    }
}
