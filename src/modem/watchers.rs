//! Background loops around the modem: ring counter decay, LEDs and status
//! lines, the DTR monitor and process signals.

use anyhow::Result;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::time::{interval, MissedTickBehavior};

use super::{Hook, Mode, Modem, Timing, CONNECT_SPEED};
use dialtone_hal::{Led, Pin};
use dialtone_protocol::{registers, DtrAction, ResultCode};

/// Clear `RING_COUNT` once no ring has been seen for the decay window.
pub async fn ring_decay(modem: Arc<Modem>) {
    let window = modem.timing().ring_decay;
    let mut ticker = interval(window / 8);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        decay_rings(&modem, window);
    }
}

fn decay_rings(modem: &Modem, window: Duration) -> bool {
    let stale = modem.read_state(|s| s.last_ring.map_or(true, |at| at.elapsed() >= window));
    if !stale || modem.register(registers::RING_COUNT) == 0 {
        return false;
    }
    modem.with_registers(|r| r.set(registers::RING_COUNT, 0));
    log::debug!("Ring counter cleared");
    true
}

/// Keep the LEDs and the status lines in step with the modem state.
pub async fn pin_watcher(modem: Arc<Modem>) {
    let mut ticker = interval(modem.timing().pin_watch);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        refresh_pins(&modem);
    }
}

fn refresh_pins(modem: &Modem) {
    let hw = modem.hardware();
    let (off_hook, dcd) = modem.read_state(|s| (s.hook == Hook::Off, s.dcd));

    hw.set_led(Led::Oh, off_hook);
    hw.set_led(Led::Cd, dcd);
    hw.set_led(Led::Hs, dcd && modem.connect_speed() >= CONNECT_SPEED);
    hw.set_led(Led::Aa, modem.auto_answer_rings() > 0);
    hw.set_led(Led::Tr, hw.read(Pin::Dtr));
    hw.led_on(Led::Mr);
    // Activity LEDs blink for one period.
    hw.led_off(Led::Rd);
    hw.led_off(Led::Sd);

    hw.set(Pin::Cts, hw.read(Pin::Rts));
    modem.apply_line_policies();
}

/// Apply `&D` when DTR drops for longer than S25.
pub async fn dtr_monitor(modem: Arc<Modem>) {
    let poll = modem.timing().dtr_poll;
    let mut low_since: Option<Instant> = None;
    let mut handled = false;
    loop {
        tokio::time::sleep(poll).await;
        if modem.hardware().read(Pin::Dtr) {
            low_since = None;
            handled = false;
            continue;
        }
        let since = *low_since.get_or_insert_with(Instant::now);
        let debounce = Timing::scaled(
            modem.timing().dtr_unit,
            modem.register(registers::DTR_DETECT_10MS),
        )
        .unwrap_or(Duration::ZERO);
        if handled || since.elapsed() < debounce {
            continue;
        }
        handled = true;
        on_dtr_drop(&modem);
    }
}

fn on_dtr_drop(modem: &Modem) {
    let action = modem.config().dtr_action;
    log::info!("DTR dropped, action {action:?}");
    match action {
        DtrAction::Ignore => {}
        DtrAction::CommandMode => {
            if modem.dcd() && modem.mode() == Mode::Data {
                modem.set_mode(Mode::Command);
                modem.report(ResultCode::Ok);
            }
        }
        DtrAction::Hangup => {
            if modem.hangup() {
                modem.report(ResultCode::NoCarrier);
            }
        }
        DtrAction::Reset => {
            if modem.hangup() {
                modem.report(ResultCode::NoCarrier);
            }
            let slot = modem.read_state(|s| s.current_config);
            if let Err(err) = modem.soft_reset(slot) {
                log::error!("Reset on DTR drop failed: {err:#}");
            }
        }
    }
}

/// Wait for an interrupt or terminate signal, dumping state on quit.
pub async fn signals(modem: Arc<Modem>) -> Result<()> {
    cfg_if::cfg_if! {
        if #[cfg(unix)] {
            use tokio::signal::unix::{signal, SignalKind};
            let mut interrupt = signal(SignalKind::interrupt())?;
            let mut terminate = signal(SignalKind::terminate())?;
            let mut quit = signal(SignalKind::quit())?;
            loop {
                tokio::select! {
                    _ = interrupt.recv() => break,
                    _ = terminate.recv() => break,
                    _ = quit.recv() => {
                        for line in modem.dump_state() {
                            log::info!("{line}");
                        }
                    }
                }
            }
        } else {
            tokio::signal::ctrl_c().await?;
        }
    }
    log::info!("Signal received, shutting down");
    Ok(())
}

/// Drop the call, clear every line and LED and run the registered cleanups.
pub fn shutdown(modem: &Modem) {
    modem.hangup();
    modem.hardware().clear_all();
    crate::cleanup::run_cleanups();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        modem::tests::rig,
        net::{Connection, Transport},
    };

    #[test]
    fn ring_count_decays() {
        let rig = rig();
        let window = Duration::from_millis(50);
        rig.modem.with_registers(|r| r.set(registers::RING_COUNT, 2));
        rig.modem.write_state(|s| s.last_ring = Some(Instant::now()));
        assert!(!decay_rings(&rig.modem, window));

        std::thread::sleep(window);
        assert!(decay_rings(&rig.modem, window));
        assert_eq!(rig.modem.register(registers::RING_COUNT), 0);
        assert!(!decay_rings(&rig.modem, window));
    }

    #[test]
    fn leds_follow_state() {
        let rig = rig();
        let (conn, _endpoint) = Connection::new(Transport::TelnetIn, "peer", "test");
        rig.modem.carrier_up(&conn, CONNECT_SPEED);
        rig.modem.hardware().led_on(Led::Rd);
        rig.modem.hardware().lower(Pin::Rts);
        refresh_pins(&rig.modem);

        let hw = rig.modem.hardware();
        assert!(hw.led(Led::Oh) && hw.led(Led::Cd) && hw.led(Led::Hs) && hw.led(Led::Tr));
        assert!(!hw.led(Led::Rd) && !hw.led(Led::Aa));
        assert!(!hw.read(Pin::Cts));
        assert!(hw.read(Pin::Dcd));
    }

    #[tokio::test]
    async fn dtr_drop_hangs_up() {
        let rig = rig();
        rig.modem.with_config(|c| c.dtr_action = DtrAction::Hangup);
        rig.modem.with_registers(|r| r.set(registers::DTR_DETECT_10MS, 25));
        let (conn, _endpoint) = Connection::new(Transport::TelnetIn, "peer", "test");
        rig.modem.carrier_up(&conn, CONNECT_SPEED);
        tokio::spawn(dtr_monitor(rig.modem.clone()));

        // A blip shorter than S25 is ignored.
        rig.modem.hardware().lower(Pin::Dtr);
        tokio::time::sleep(Duration::from_millis(3)).await;
        rig.modem.hardware().raise(Pin::Dtr);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rig.modem.dcd());

        rig.modem.hardware().lower(Pin::Dtr);
        rig.term
            .read_until("NO CARRIER\r\n", Duration::from_secs(2))
            .await
            .unwrap();
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn dtr_drop_to_command_mode() {
        let rig = rig();
        rig.modem.with_config(|c| c.dtr_action = DtrAction::CommandMode);
        let (conn, _endpoint) = Connection::new(Transport::TelnetIn, "peer", "test");
        rig.modem.carrier_up(&conn, CONNECT_SPEED);
        rig.modem.set_mode(Mode::Data);
        tokio::spawn(dtr_monitor(rig.modem.clone()));

        rig.modem.hardware().lower(Pin::Dtr);
        rig.term.read_until("OK\r\n", Duration::from_secs(2)).await.unwrap();
        assert_eq!(rig.modem.mode(), Mode::Command);
        assert!(rig.modem.dcd());
    }
}
