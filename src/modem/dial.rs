//! Outbound calls: target resolution, dialling and user abort.

use std::{sync::Arc, time::Duration};

use super::{Modem, Online, Outcome, CONNECT_SPEED};
use crate::{
    dte::DteInput,
    net::{ssh, telnet, Connection},
};
use dialtone_hal::Tone;
use dialtone_protocol::{
    command::{self, Command, Dial, DialTarget},
    phonebook::{sanitize_phone, split_host_port},
    registers, Entry, ModemError, Protocol, ResultCode,
};

/// A resolved destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Telnet {
        host: String,
        port: u16,
    },
    Ssh {
        host: String,
        port: u16,
        username: String,
        password: String,
    },
}

impl Route {
    fn from_entry(entry: &Entry) -> Result<Self, ModemError> {
        let (host, port) = entry
            .address()
            .map_err(|err| ModemError::unsupported(format!("{err:#}")))?;
        Ok(match entry.protocol {
            Protocol::Telnet => Route::Telnet { host, port },
            Protocol::Ssh => Route::Ssh {
                host,
                port,
                username: entry.username.clone(),
                password: entry.password.clone(),
            },
        })
    }

    async fn connect(self, timeout: Duration) -> Result<Arc<Connection>, ModemError> {
        match self {
            Route::Telnet { host, port } => telnet::dial(&host, port, timeout).await,
            Route::Ssh {
                host,
                port,
                username,
                password,
            } => ssh::dial(&host, port, &username, &password, timeout).await,
        }
    }
}

/// Resolve a dial target to a route. `DL` is expanded from `last_dialed`,
/// once.
pub fn resolve(modem: &Modem, target: &DialTarget) -> Result<Route, ModemError> {
    match target {
        DialTarget::Number { digits, .. } => {
            let digits = sanitize_phone(digits);
            let entry = modem
                .phonebook()
                .lookup(&digits)
                .ok_or_else(|| ModemError::unsupported(format!("{digits} is not in the phonebook")))?;
            Route::from_entry(&entry)
        }
        DialTarget::Stored(slot) => {
            let entry = modem
                .phonebook()
                .slot(*slot)
                .ok_or_else(|| ModemError::unsupported(format!("phonebook slot {slot} is empty")))?;
            Route::from_entry(&entry)
        }
        DialTarget::Host(target) => {
            let (host, port) = split_host_port(target, telnet::DEFAULT_PORT)
                .map_err(|err| ModemError::unsupported(format!("{err:#}")))?;
            Ok(Route::Telnet { host, port })
        }
        DialTarget::Ssh {
            host,
            username,
            password,
        } => {
            let (host, port) = split_host_port(host, ssh::DEFAULT_PORT)
                .map_err(|err| ModemError::unsupported(format!("{err:#}")))?;
            Ok(Route::Ssh {
                host,
                port,
                username: username.clone(),
                password: password.clone(),
            })
        }
        DialTarget::Last => {
            let last = modem.read_state(|s| s.last_dialed.clone());
            if last.is_empty() {
                return Err(ModemError::state("nothing dialled yet"));
            }
            match command::parse(&format!("AT{last}"))?.as_slice() {
                [Command::Dial(Dial { target, .. })] if *target != DialTarget::Last => {
                    resolve(modem, target)
                }
                _ => Err(ModemError::state(format!("cannot redial '{last}'"))),
            }
        }
    }
}

/// Canonical dial token remembered for `DL`.
fn dial_token(target: &DialTarget) -> String {
    Command::Dial(Dial {
        target: target.clone(),
        stay_in_command: false,
    })
    .to_string()
}

/// `ATD...`
///
/// Any byte from the terminal while the call is placed abandons it. The
/// connection attempt is cancelled and a result that still arrives is
/// closed.
pub async fn dial(modem: &Arc<Modem>, request: Dial, input: &DteInput) -> Result<Outcome, ModemError> {
    if modem.dcd() || modem.ringing().is_some() {
        return Err(ModemError::state("line in use"));
    }
    let route = resolve(modem, &request.target)?;
    if request.target != DialTarget::Last {
        modem.write_state(|s| s.last_dialed = dial_token(&request.target));
    }
    log::info!("Dialling {route:?}");

    modem.go_off_hook();
    modem.write_state(|s| s.line_busy = true);
    play_dial_tones(modem, &request.target);

    let mut attempt = tokio::spawn(route.connect(modem.timing().dial_timeout));
    let result = tokio::select! {
        joined = &mut attempt => joined.map_err(|err| ModemError::dial_failed(err.to_string()))?,
        key = input.recv() => {
            log::info!("Dial abandoned by the terminal ({key:?})");
            attempt.abort();
            tokio::spawn(async move {
                if let Ok(Ok(conn)) = attempt.await {
                    log::debug!("Closing late call {}", conn.summary());
                    conn.close();
                }
            });
            modem.hangup();
            return Ok(Outcome::ok());
        }
    };

    match result {
        Ok(conn) => {
            modem.carrier_up(&conn, CONNECT_SPEED);
            if speaker_on(modem) {
                modem.tone().play(Tone::Carrier);
            }
            let code = if request.stay_in_command {
                ResultCode::Ok
            } else {
                ResultCode::Connect
            };
            Ok(Outcome {
                code,
                online: Some(Online {
                    stay_in_command: request.stay_in_command,
                    handoff: Some(conn),
                }),
                silent: false,
            })
        }
        Err(err) => {
            log::warn!("Dial failed: {err}");
            if matches!(err, ModemError::DialFailed { .. }) && speaker_on(modem) {
                modem.tone().play(Tone::Busy);
            }
            modem.hangup();
            Err(err)
        }
    }
}

fn speaker_on(modem: &Modem) -> bool {
    modem.config().speaker_on_while_dialing()
}

fn play_dial_tones(modem: &Modem, target: &DialTarget) {
    if !speaker_on(modem) {
        return;
    }
    let tone = modem.tone();
    tone.play(Tone::DialTone);
    if let DialTarget::Number { digits, .. } = target {
        let per_digit = Duration::from_millis(u64::from(modem.register(registers::DTMF_MS)));
        tone.dtmf(digits, per_digit);
    }
    tone.play(Tone::RingBack);
}
