//! The call supervisor.
//!
//! Owns every call from the moment it exists: rings inbound callers, waits
//! for the answer, then moves the far end's bytes to the terminal until the
//! call ends. Calls are handled one at a time in arrival order.

use std::{
    collections::VecDeque,
    net::SocketAddr,
    path::Path,
    sync::Arc,
    time::{Duration, Instant},
};

use super::{dispatch, Mode, Modem, Timing, MAX_RINGS};
use crate::net::{ssh, telnet, Connection, LinkError, Switchboard};
use dialtone_hal::{Led, Pin};
use dialtone_protocol::{registers, ResultCode};

#[derive(Debug)]
pub enum CallEvent {
    /// A caller from one of the listeners.
    Inbound(Arc<Connection>),
    /// A call placed by `ATD`, already connected.
    Outbound(Arc<Connection>),
}

/// How the ringing phase ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ring {
    Answered,
    NoAnswer,
    /// Picked up, but the caller was gone by the time the carrier came up.
    /// Already reported.
    Dropped,
}

pub async fn run(modem: Arc<Modem>, calls: flume::Receiver<CallEvent>) {
    while let Ok(event) = calls.recv_async().await {
        match event {
            CallEvent::Inbound(conn) => inbound(&modem, conn).await,
            CallEvent::Outbound(conn) => pump(&modem, conn).await,
        }
    }
    log::info!("Call supervisor stopped");
}

async fn inbound(modem: &Arc<Modem>, conn: Arc<Connection>) {
    if modem.line_busy() || modem.is_off_hook() {
        log::info!("Line busy, turning away {}", conn.remote());
        let _ = conn.write(b"BUSY\r\n");
        conn.close();
        return;
    }
    conn.set_mode(Mode::Command);
    modem.write_state(|s| {
        s.line_busy = true;
        s.ringing = Some(Arc::downgrade(&conn));
    });

    let ring = ring(modem, &conn).await;
    modem.write_state(|s| s.ringing = None);
    modem.hardware().lower(Pin::Ri);

    match ring {
        Ring::Answered => {
            let _ = conn.write(b"Answered\r\n");
            modem.with_registers(|r| r.set(registers::RING_COUNT, 0));
            if wait_for_carrier(modem, &conn).await {
                pump(modem, conn).await;
            } else {
                log::info!("No carrier for {}", conn.summary());
                conn.close();
                if modem.is_off_hook() {
                    modem.hangup();
                    modem.report(ResultCode::NoCarrier);
                }
            }
        }
        Ring::Dropped => conn.close(),
        Ring::NoAnswer => {
            log::info!("Unanswered call from {}", conn.remote());
            modem.report(ResultCode::NoAnswer);
            conn.close();
            modem.write_state(|s| s.line_busy = false);
            modem.refresh_display();
        }
    }
}

/// POTS ringing: ring on, `RING`, ring off, up to [`MAX_RINGS`] times.
async fn ring(modem: &Arc<Modem>, conn: &Arc<Connection>) -> Ring {
    let timing = *modem.timing();
    log::info!("Ringing for {}", conn.summary());
    for _ in 0..MAX_RINGS {
        // Doubles as a check that the caller is still there.
        if conn.write(b"Ringing...\r\n").is_err() {
            return Ring::NoAnswer;
        }

        modem.hardware().raise(Pin::Ri);
        if let Some(ring) = watch_line(modem, conn, timing.ring_on).await {
            return ring;
        }
        modem.hardware().lower(Pin::Ri);
        modem.report(ResultCode::Ring);

        let rings = modem.with_registers(|r| r.increment(registers::RING_COUNT));
        modem.write_state(|s| s.last_ring = Some(Instant::now()));
        modem.show_status(&format!("RING {rings}"), conn.remote());

        let threshold = modem.auto_answer_rings();
        if threshold > 0 && rings >= threshold {
            log::info!("Auto-answer on ring {rings}");
            if !dispatch::answer(modem, conn).await {
                modem.report(ResultCode::NoCarrier);
                return Ring::Dropped;
            }
            modem.report(ResultCode::Connect);
            modem.set_mode(Mode::Data);
            return Ring::Answered;
        }

        if let Some(ring) = watch_line(modem, conn, timing.ring_off).await {
            return ring;
        }
    }
    Ring::NoAnswer
}

/// Sleep `total` in slices, watching for the terminal picking up and for
/// the caller giving up.
async fn watch_line(modem: &Modem, conn: &Connection, total: Duration) -> Option<Ring> {
    let slice = modem.timing().slice;
    let start = Instant::now();
    while start.elapsed() < total {
        if modem.is_off_hook() {
            return Some(Ring::Answered);
        }
        if conn.is_closed() {
            return Some(Ring::NoAnswer);
        }
        tokio::time::sleep(slice).await;
    }
    None
}

/// After the pick-up, give the carrier S7 to come up. A pick-up still in
/// its S9 wait decides for itself.
async fn wait_for_carrier(modem: &Modem, conn: &Connection) -> bool {
    let slice = modem.timing().slice;
    let limit = Timing::scaled(
        modem.timing().carrier_wait_unit,
        modem.register(registers::CARRIER_WAIT_S),
    )
    .unwrap_or(Duration::ZERO);
    let start = Instant::now();
    loop {
        if modem.dcd() {
            return true;
        }
        if modem.read_state(|s| s.answering) {
            tokio::time::sleep(slice).await;
            continue;
        }
        if !modem.is_off_hook() || conn.is_closed() || start.elapsed() >= limit {
            return false;
        }
        tokio::time::sleep(slice).await;
    }
}

/// Carry the far end's bytes to the terminal until the call ends.
///
/// While the modem is in online command mode the bytes are held back and
/// delivered once data mode resumes.
async fn pump(modem: &Arc<Modem>, conn: Arc<Connection>) {
    log::info!("Call up: {}", conn.summary());
    let slice = modem.timing().slice;
    let mut held = VecDeque::new();
    let mut idle_since = Instant::now();
    // A transient fault gets one retry; another before any data ends the call.
    let mut retried = false;

    let reason = loop {
        if !modem.dcd() || !modem.is_off_hook() {
            break "carrier lost".to_string();
        }
        let in_data = modem.mode() == Mode::Data;
        if in_data && !held.is_empty() {
            let bytes: Vec<u8> = held.drain(..).collect();
            modem.dte().write(&bytes);
            modem.hardware().led_on(Led::Rd);
        }
        if !in_data {
            idle_since = Instant::now();
        }

        match conn.read_byte(Some(slice)).await {
            Ok(byte) => {
                idle_since = Instant::now();
                retried = false;
                if modem.mode() == Mode::Data {
                    modem.dte().write(&[byte]);
                    modem.hardware().led_on(Led::Rd);
                } else {
                    held.push_back(byte);
                }
            }
            Err(LinkError::Timeout) => {
                let limit = Timing::scaled(
                    modem.timing().inactivity_unit,
                    modem.register(registers::INACTIVITY_TIMER_10S),
                );
                if let Some(limit) = limit.filter(|l| idle_since.elapsed() >= *l) {
                    break format!("inactive for {limit:?}");
                }
            }
            Err(LinkError::Transient(err)) if !retried => {
                log::warn!("Retrying read after {err}");
                retried = true;
            }
            Err(LinkError::Transient(err)) => break format!("{err} again after a retry"),
            Err(err) => break err.to_string(),
        }
    };

    log::info!("Call ending ({reason}): {}", conn.summary());
    conn.close();
    let ours = modem
        .connection()
        .is_some_and(|current| Arc::ptr_eq(&current, &conn));
    if ours && modem.hangup() {
        modem.report(ResultCode::NoCarrier);
    }
    log::info!(
        "Call totals: sent={} recv={} duration={:.1}s",
        conn.sent(),
        conn.recv(),
        conn.elapsed().as_secs_f32()
    );
}

/// Addresses the listeners ended up on.
#[derive(Debug, Default, Clone, Copy)]
pub struct Listening {
    pub telnet: Option<SocketAddr>,
    pub ssh: Option<SocketAddr>,
}

/// Start the Telnet and SSH listeners. A listener that cannot start is
/// skipped with an error; the modem keeps serving the terminal.
pub async fn listen(modem: &Arc<Modem>, telnet_port: Option<u16>, ssh: Option<(u16, &Path)>) -> Listening {
    let board: Arc<dyn Switchboard> = modem.clone();
    let mut listening = Listening::default();

    if let Some(port) = telnet_port {
        match telnet::bind(port).await {
            Ok(listener) => {
                listening.telnet = listener.local_addr().ok();
                tokio::spawn(telnet::serve(listener, board.clone()));
            }
            Err(err) => log::error!("Telnet listener disabled: {err:#}"),
        }
    }

    if let Some((port, keyfile)) = ssh {
        let bound = match ssh::load_host_key(keyfile) {
            Ok(key) => ssh::bind(port).await.map(|listener| (key, listener)),
            Err(err) => Err(err),
        };
        match bound {
            Ok((key, listener)) => {
                listening.ssh = listener.local_addr().ok();
                tokio::spawn(ssh::serve(listener, key, board));
            }
            Err(err) => log::error!("SSH listener disabled: {err:#}"),
        }
    }
    listening
}
