//! Command execution.
//!
//! A line is parsed in full first; a parse failure runs nothing. Tokens then
//! run left to right and the first result other than OK ends the line.

use std::{sync::Arc, time::Duration};

use super::{dial, Modem, Mode, Timing};
use crate::{dte::DteInput, net::Connection};
use dialtone_hal::{Led, Pin};
use dialtone_protocol::{
    command::{self, Command},
    registers,
    DtrAction, Entry, LinePolicy, ModemError, ResultCode,
};

/// Debug register numbers at or above this address LEDs.
const DEBUG_LED_BASE: u8 = 16;

/// Hand-over into an established call, applied after the result code is shown.
#[derive(Debug)]
pub struct Online {
    pub stay_in_command: bool,
    /// A freshly dialled call for the supervisor.
    pub handoff: Option<Arc<Connection>>,
}

#[derive(Debug)]
pub struct Outcome {
    pub code: ResultCode,
    pub online: Option<Online>,
    /// The printed register value stands in for the result code.
    pub silent: bool,
}

impl Outcome {
    pub fn code(code: ResultCode) -> Self {
        Self {
            code,
            online: None,
            silent: false,
        }
    }

    pub fn ok() -> Self {
        Self::code(ResultCode::Ok)
    }

    fn connect() -> Self {
        Self {
            code: ResultCode::Connect,
            online: Some(Online {
                stay_in_command: false,
                handoff: None,
            }),
            silent: false,
        }
    }
}

/// Run one command line from the terminal.
pub async fn execute_line(modem: &Arc<Modem>, line: &str, input: &DteInput) -> Outcome {
    let commands = match command::parse(line) {
        Ok(commands) => commands,
        Err(err) => {
            log::warn!("Rejected {line:?}: {err}");
            return Outcome::code(err.result_code());
        }
    };
    log::debug!("Executing {}", command::render(&commands));

    let mut code = ResultCode::Ok;
    let mut online = None;
    let mut ends_with_query = false;
    for command in commands {
        ends_with_query = matches!(command, Command::RegisterCurrent | Command::RegisterRead(_));
        let outcome = match execute(modem, command, input).await {
            Ok(outcome) => outcome,
            Err(err) => {
                log::warn!("{line:?} failed: {err}");
                Outcome::code(err.result_code())
            }
        };
        code = outcome.code;
        // A call dialled with `;` stays up whatever the rest of the line does.
        if outcome.online.is_some() {
            online = outcome.online;
        }
        if code != ResultCode::Ok {
            break;
        }
    }

    if code.is_success() {
        modem.write_state(|s| s.last_cmd = line.to_string());
    }
    Outcome {
        code,
        online,
        silent: code == ResultCode::Ok && ends_with_query,
    }
}

async fn execute(modem: &Arc<Modem>, command: Command, input: &DteInput) -> Result<Outcome, ModemError> {
    match command {
        Command::Answer => return answer_command(modem).await,
        Command::Hook(false) => {
            return Ok(Outcome::code(if modem.hangup() {
                ResultCode::NoCarrier
            } else {
                ResultCode::Ok
            }));
        }
        Command::Hook(true) => {
            modem.go_off_hook();
            modem.write_state(|s| s.line_busy = true);
        }
        Command::Online => {
            return match modem.connection() {
                Some(conn) if modem.dcd() && !conn.is_closed() => Ok(Outcome::connect()),
                _ => Err(ModemError::state("no call to return to")),
            };
        }
        Command::Dial(request) => return dial::dial(modem, request, input).await,
        Command::Reset(slot) => {
            modem
                .soft_reset(usize::from(slot))
                .map_err(|err| ModemError::unsupported(format!("{err:#}")))?;
        }
        Command::FactoryReset => modem.factory_reset(),
        Command::StoreProfile(slot) => {
            modem
                .store_profile(usize::from(slot))
                .map_err(persist_error)?;
        }
        Command::PowerUpProfile(slot) => {
            modem
                .set_power_up_profile(usize::from(slot))
                .map_err(persist_error)?;
        }

        Command::RegisterCurrent => {
            let value = modem.with_registers(|r| r.read(r.current()));
            modem.println(&value.to_string());
        }
        Command::RegisterSelect(index) => modem.with_registers(|r| r.select(index)),
        Command::RegisterRead(index) => {
            let value = modem.with_registers(|r| {
                r.select(index);
                r.read(index)
            });
            modem.println(&value.to_string());
        }
        Command::RegisterWrite(index, value) => {
            modem.with_registers(|r| r.write(index, value))?;
            if index == registers::ESC_GUARD_20MS {
                modem.restart_guard_timer();
            }
        }

        Command::Info(n) => info(modem, n),
        Command::ViewConfig => view_config(modem),
        Command::Debug => {
            for line in modem.dump_state() {
                log::info!("{line}");
                modem.println(&line);
            }
        }
        Command::DebugHelp => {
            modem.println("*n? reads, *n=v drives: 0 DCD 1 DSR 2 RI 3 CTS 4 DTR 5 RTS");
            modem.println("16 AA 17 CD 18 OH 19 RD 20 SD 21 TR 22 HS 23 MR");
        }
        Command::DebugRead(n) => {
            let level = match debug_target(n)? {
                DebugTarget::Pin(pin) => modem.hardware().read(pin),
                DebugTarget::Led(led) => modem.hardware().led(led),
            };
            modem.println(&u8::from(level).to_string());
        }
        Command::DebugWrite(n, value) => {
            let level = match value {
                0 => false,
                1 => true,
                _ => return Err(ModemError::unsupported(format!("*{n}={value}"))),
            };
            match debug_target(n)? {
                DebugTarget::Pin(pin) => modem.hardware().set(pin, level),
                DebugTarget::Led(led) => modem.hardware().set_led(led, level),
            }
        }

        Command::PhonebookSet { slot, record } => {
            let entry = Entry::from_record(&record)
                .map_err(|err| ModemError::unsupported(format!("{err:#}")))?;
            modem
                .phonebook()
                .add(slot, entry)
                .map_err(|err| ModemError::unsupported(format!("{err:#}")))?;
        }
        Command::PhonebookDelete(slot) => {
            let removed = modem.phonebook().delete(slot).map_err(persist_error)?;
            log::debug!("Phonebook slot {slot} delete, existed: {removed}");
        }
        Command::PhonebookShow(slot) => {
            let entry = modem
                .phonebook()
                .slot(slot)
                .ok_or_else(|| ModemError::unsupported(format!("phonebook slot {slot} is empty")))?;
            modem.println(&format_entry(slot, &entry));
        }

        Command::DcdPolicy(flag) => {
            modem.with_config(|c| c.dcd_policy = LinePolicy::from_flag(flag));
            modem.apply_line_policies();
        }
        Command::DsrPolicy(flag) => {
            modem.with_config(|c| c.dsr_policy = LinePolicy::from_flag(flag));
            modem.apply_line_policies();
        }
        Command::DtrAction(flag) => {
            let action = DtrAction::from_flag(flag)
                .ok_or_else(|| ModemError::unsupported(format!("&D{flag}")))?;
            modem.with_config(|c| c.dtr_action = action);
        }

        // Plain config flags.
        Command::Echo(v) => modem.with_config(|c| c.echo_in_cmd_mode = v),
        Command::Quiet(v) => modem.with_config(|c| c.quiet = v),
        Command::Verbose(v) => modem.with_config(|c| c.verbose = v),
        Command::SpeakerMode(n) => modem.with_config(|c| c.speaker_mode = n),
        Command::SpeakerVolume(n) => modem.with_config(|c| c.speaker_volume = n),
        Command::NegotiationReport(n) => modem.with_config(|c| c.negotiation_report = n),
        Command::ResultLevel(n) => modem.with_config(|c| c.set_result_level(n)),
        Command::LongSpaceDisconnect(v) => modem.with_config(|c| c.long_space_disconnect = v),
        Command::CarrierEnabled(v) => modem.with_config(|c| c.carrier_enabled = v),
        Command::AutoMode(n) => modem.with_config(|c| c.auto_mode = n),
        Command::ProtocolMode(n) => modem.with_config(|c| c.protocol_mode = n),
    }
    Ok(Outcome::ok())
}

fn persist_error(err: anyhow::Error) -> ModemError {
    log::error!("{err:#}");
    ModemError::ConfigPersist {
        reason: format!("{err:#}"),
    }
}

/// `ATA`
async fn answer_command(modem: &Arc<Modem>) -> Result<Outcome, ModemError> {
    if modem.is_off_hook() {
        return Err(ModemError::state("already off hook"));
    }
    match modem.ringing() {
        Some(conn) if answer(modem, &conn).await => Ok(Outcome::connect()),
        Some(_) => Ok(Outcome::code(ResultCode::NoCarrier)),
        None => {
            // Nobody there: listen for a carrier that never comes.
            modem.go_off_hook();
            if let Some(wait) = carrier_detect_delay(modem) {
                tokio::time::sleep(wait).await;
            }
            modem.hangup();
            Ok(Outcome::code(ResultCode::NoCarrier))
        }
    }
}

/// Pick up a ringing call and bring the carrier up. Shared by `ATA` and
/// auto-answer; the caller reports CONNECT and enters data mode.
///
/// Returns false when the call did not survive the S9 wait: the caller left,
/// or the line was hung up meanwhile. The modem is back on hook then and
/// the caller reports NO CARRIER.
pub async fn answer(modem: &Modem, conn: &Arc<Connection>) -> bool {
    log::info!("Answering {}", conn.summary());
    modem.write_state(|s| s.answering = true);
    modem.go_off_hook();
    if let Some(wait) = carrier_detect_delay(modem) {
        tokio::time::sleep(wait).await;
    }

    let live = !conn.is_closed() && modem.is_off_hook() && modem.connection().is_none();
    if live {
        modem.carrier_up(conn, super::CONNECT_SPEED);
        conn.set_mode(Mode::Command);
    } else {
        log::info!("Call gone before carrier: {}", conn.summary());
        modem.hangup();
    }
    modem.write_state(|s| s.answering = false);
    live
}

fn carrier_detect_delay(modem: &Modem) -> Option<Duration> {
    Timing::scaled(
        modem.timing().carrier_unit,
        modem.register(registers::CARRIER_DETECT_RESP_100MS),
    )
}

enum DebugTarget {
    Pin(Pin),
    Led(Led),
}

fn debug_target(n: u8) -> Result<DebugTarget, ModemError> {
    if let Ok(pin) = Pin::try_from(n) {
        return Ok(DebugTarget::Pin(pin));
    }
    n.checked_sub(DEBUG_LED_BASE)
        .and_then(|index| Led::try_from(index).ok())
        .map(DebugTarget::Led)
        .ok_or_else(|| ModemError::unsupported(format!("no debug line {n}")))
}

fn format_entry(slot: u32, entry: &Entry) -> String {
    let password = if entry.password.is_empty() { "" } else { "****" };
    format!(
        "{slot}: {}|{}|{}|{}|{password}",
        entry.phone, entry.host, entry.protocol, entry.username
    )
}

/// `ATIn`
fn info(modem: &Modem, n: u8) {
    let line = match n {
        0 => format!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
        1 => format!("{:03}", rom_checksum()),
        2 => "OK".to_string(),
        3 => format!("{} v{}", env!("CARGO_PKG_DESCRIPTION"), env!("CARGO_PKG_VERSION")),
        4 => "TELNET SSH".to_string(),
        _ => format!("{} phonebook entries", modem.phonebook().len()),
    };
    modem.println(&line);
}

/// Stand-in for the ROM checksum: a digest of the version string.
fn rom_checksum() -> u8 {
    env!("CARGO_PKG_VERSION")
        .bytes()
        .fold(0u8, |sum, b| sum.wrapping_add(b))
}

/// `AT&V0`
fn view_config(modem: &Modem) {
    modem.println("ACTIVE PROFILE:");
    modem.println(&modem.config().summary());
    modem.println(&modem.with_registers(|r| registers_line(r)));

    let profiles = modem.profiles();
    for (slot, profile) in profiles.profiles.iter().enumerate() {
        modem.println("");
        modem.println(&format!("STORED PROFILE {slot}:"));
        modem.println(&profile.config.summary());
        modem.println(&registers_line(&profile.registers));
    }
    modem.println("");
    modem.println(&format!("POWER UP PROFILE: {}", profiles.power_up_config));
}

fn registers_line(regs: &dialtone_protocol::Registers) -> String {
    [
        registers::AUTO_ANSWER,
        registers::RING_COUNT,
        registers::ESC_CH,
        registers::CR_CH,
        registers::LF_CH,
        registers::BS_CH,
        registers::BLIND_DIAL_WAIT_S,
        registers::CARRIER_WAIT_S,
        registers::COMMA_PAUSE_S,
        registers::CARRIER_DETECT_RESP_100MS,
        registers::CARRIER_LOSS_HANGUP_100MS,
        registers::DTMF_MS,
        registers::ESC_GUARD_20MS,
        registers::DTR_DETECT_10MS,
        registers::RTS_TO_CTS_10MS,
        registers::INACTIVITY_TIMER_10S,
    ]
    .iter()
    .map(|&index| format!("S{index:02}:{:03}", regs.read(index)))
    .collect::<Vec<_>>()
    .join(" ")
}
