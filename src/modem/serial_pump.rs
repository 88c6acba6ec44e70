//! The terminal side loop: command-line editor in command mode, forwarder
//! in data mode, and the guard-time ticker for `+++`.

use std::sync::Arc;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

use super::{dispatch, escape::EscapeDetector, CallEvent, Mode, Modem, Online, Timing};
use crate::dte::DteInput;
use dialtone_hal::Led;
use dialtone_protocol::{registers, ResultCode};

/// Longest command line kept; further characters are dropped.
const MAX_LINE: usize = 256;

/// Ticker for the current S12, `None` when escape detection is off.
fn guard_ticker(modem: &Modem) -> Option<Interval> {
    let period = Timing::scaled(modem.timing().guard_unit, modem.register(registers::ESC_GUARD_20MS))?;
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    Some(ticker)
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Serve the terminal until it goes away.
pub async fn run(modem: Arc<Modem>, input: DteInput) {
    let mut line = String::new();
    let mut detector = EscapeDetector::default();
    let mut ticker = guard_ticker(&modem);

    loop {
        tokio::select! {
            byte = input.recv() => {
                let Some(byte) = byte else {
                    log::info!("Terminal closed, serial pump stopping");
                    return;
                };
                match modem.mode() {
                    Mode::Command => command_byte(&modem, &input, &mut line, byte).await,
                    Mode::Data => {
                        detector.on_byte(byte);
                        forward(&modem, byte);
                    }
                }
            }
            _ = tick(&mut ticker) => {
                let escape = modem.register(registers::ESC_CH);
                if detector.on_tick(escape) && modem.mode() == Mode::Data {
                    log::info!("Escape sequence, entering online command mode");
                    modem.set_mode(Mode::Command);
                    line.clear();
                    modem.report(ResultCode::Ok);
                }
            }
            _ = modem.guard_timer_changed() => {
                ticker = guard_ticker(&modem);
                detector.reset();
                log::debug!("Guard timer now {:?}", ticker.as_ref().map(|t| t.period()));
            }
        }
    }
}

/// Data mode: straight to the call, if there is one.
fn forward(modem: &Modem, byte: u8) {
    let Some(conn) = modem.connection().filter(|_| modem.is_off_hook()) else {
        return;
    };
    match conn.write(&[byte]) {
        Ok(()) => modem.hardware().led_on(Led::Sd),
        Err(err) => log::debug!("Dropped terminal byte: {err}"),
    }
}

/// Command mode line editor.
async fn command_byte(modem: &Arc<Modem>, input: &DteInput, line: &mut String, byte: u8) {
    let (cr, lf, bs) = modem.with_registers(|r| {
        (
            r.read(registers::CR_CH),
            r.read(registers::LF_CH),
            r.read(registers::BS_CH),
        )
    });
    if modem.config().echo_in_cmd_mode {
        modem.dte().write(&[byte]);
    }

    if byte == cr {
        if !line.is_empty() {
            let command = std::mem::take(line);
            run_line(modem, &command, input).await;
        }
    } else if byte == bs {
        line.pop();
    } else if byte == lf {
        // Terminals sending CR LF.
    } else if line.len() < MAX_LINE {
        line.push(char::from(byte));
        if line.eq_ignore_ascii_case("A/") {
            line.clear();
            let last = modem.last_cmd();
            log::debug!("Repeating {last:?}");
            run_line(modem, &last, input).await;
        }
    }
}

async fn run_line(modem: &Arc<Modem>, line: &str, input: &DteInput) {
    let outcome = dispatch::execute_line(modem, line, input).await;
    if !outcome.silent {
        modem.report(outcome.code);
    }
    if let Some(online) = outcome.online {
        go_online(modem, online);
    }
}

/// After the CONNECT (or OK) is on the terminal: enter data mode and give a
/// dialled call to the supervisor.
fn go_online(modem: &Modem, online: Online) {
    if !online.stay_in_command {
        modem.set_mode(Mode::Data);
    }
    if let Some(conn) = online.handoff {
        modem.deliver_call(CallEvent::Outbound(conn));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        modem::{tests::rig, CONNECT_SPEED},
        net::{Connection, Transport},
    };
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(3);

    #[tokio::test]
    async fn line_editing() {
        let rig = rig();
        tokio::spawn(run(rig.modem.clone(), rig.input));

        rig.term.type_str("ATS0=4\r");
        let seen = rig.term.read_until("OK\r\n", WAIT).await.unwrap();
        assert_eq!(seen, "ATS0=4\rOK\r\n");

        rig.term.type_str("\rATX\x08S0=5\r\n");
        rig.term.read_until("OK\r\n", WAIT).await.unwrap();
        assert_eq!(rig.modem.register(registers::AUTO_ANSWER), 5);

        rig.term.type_str("ATE0\r");
        rig.term.read_until("OK\r\n", WAIT).await.unwrap();
        rig.term.type_str("ATS0=6\r");
        assert_eq!(rig.term.read_until("OK\r\n", WAIT).await.unwrap(), "OK\r\n");

        rig.modem.with_registers(|r| r.set(registers::AUTO_ANSWER, 0));
        rig.term.type_str("a/");
        rig.term.read_until("OK\r\n", WAIT).await.unwrap();
        assert_eq!(rig.modem.register(registers::AUTO_ANSWER), 6);

        rig.term.type_str("ATFOO\r");
        assert_eq!(rig.term.read_until("\r\n", WAIT).await.unwrap(), "ERROR\r\n");
    }

    #[tokio::test]
    async fn escape_needs_guard_time() {
        let rig = rig();
        rig.modem.with_registers(|r| r.set(registers::ESC_GUARD_20MS, 5));
        let (conn, endpoint) = Connection::new(Transport::TelnetIn, "peer", "test");
        rig.modem.carrier_up(&conn, CONNECT_SPEED);
        rig.modem.set_mode(Mode::Data);
        tokio::spawn(run(rig.modem.clone(), rig.input));

        // Inside a data stream: forwarded, no mode change.
        rig.term.type_str("abc+++def");
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(rig.modem.mode(), Mode::Data);

        tokio::time::sleep(Duration::from_millis(200)).await;
        rig.term.type_str("+++");
        assert_eq!(rig.term.read_until("OK\r\n", WAIT).await.unwrap(), "OK\r\n");
        assert_eq!(rig.modem.mode(), Mode::Command);
        assert_eq!(conn.mode(), Mode::Command);
        assert!(!conn.is_closed());

        let mut sent = Vec::new();
        while let Ok(chunk) = endpoint.outgoing.try_recv() {
            sent.extend(chunk);
        }
        assert_eq!(sent, b"abc+++def+++");
    }

    #[tokio::test]
    async fn escape_without_silence_before_or_after_is_data() {
        let rig = rig();
        rig.modem.with_registers(|r| r.set(registers::ESC_GUARD_20MS, 5));
        let (conn, endpoint) = Connection::new(Transport::TelnetIn, "peer", "test");
        rig.modem.carrier_up(&conn, CONNECT_SPEED);
        rig.modem.set_mode(Mode::Data);
        tokio::spawn(run(rig.modem.clone(), rig.input));

        // Quiet line, then a byte right before the pluses.
        tokio::time::sleep(Duration::from_millis(200)).await;
        rig.term.type_str("a+++");
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(rig.modem.mode(), Mode::Data);

        // Quiet before, but a byte follows inside the guard time.
        rig.term.type_str("+++");
        tokio::time::sleep(Duration::from_millis(10)).await;
        rig.term.type_str("x");
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(rig.modem.mode(), Mode::Data);
        assert_eq!(conn.mode(), Mode::Data);
        assert_eq!(rig.term.drain(), "");

        let mut sent = Vec::new();
        while let Ok(chunk) = endpoint.outgoing.try_recv() {
            sent.extend(chunk);
        }
        assert_eq!(sent, b"a++++++x");
    }

    #[tokio::test]
    async fn zero_guard_disables_escape() {
        let rig = rig();
        rig.modem.with_registers(|r| r.set(registers::ESC_GUARD_20MS, 0));
        rig.modem.restart_guard_timer();
        let (conn, _endpoint) = Connection::new(Transport::TelnetIn, "peer", "test");
        rig.modem.carrier_up(&conn, CONNECT_SPEED);
        rig.modem.set_mode(Mode::Data);
        tokio::spawn(run(rig.modem.clone(), rig.input));

        tokio::time::sleep(Duration::from_millis(100)).await;
        rig.term.type_str("+++");
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(rig.modem.mode(), Mode::Data);
        assert_eq!(rig.term.drain(), "");
    }
}
