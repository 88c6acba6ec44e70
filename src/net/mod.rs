//! Network side of a call.
//!
//! Telnet and SSH sessions, inbound and outbound, all present the same
//! [`Connection`]. The transport runs its own reader and writer tasks and
//! talks to the connection through an [`Endpoint`]; the call supervisor only
//! ever sees bytes.

pub mod ssh;
pub mod telnet;

use derive_more::Display;
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    fmt, io,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
    time::{Duration, Instant},
};
use tokio::sync::watch;

use crate::modem::Mode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Transport {
    #[display("telnet-in")]
    TelnetIn,
    #[display("telnet-out")]
    TelnetOut,
    #[display("ssh-in")]
    SshIn,
    #[display("ssh-out")]
    SshOut,
}

impl Transport {
    pub fn direction(self) -> Direction {
        match self {
            Transport::TelnetIn | Transport::SshIn => Direction::Inbound,
            Transport::TelnetOut | Transport::SshOut => Direction::Outbound,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Direction {
    #[display("inbound")]
    Inbound,
    #[display("outbound")]
    Outbound,
}

/// Pause after a failed accept before taking the next caller.
pub const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Unwrap an accept result. A failure is logged and followed by
/// [`ACCEPT_BACKOFF`] so a listener can keep going.
pub(crate) async fn settle_accept<T>(accepted: io::Result<T>, listener: &str) -> Option<T> {
    match accepted {
        Ok(accepted) => Some(accepted),
        Err(err) => {
            log::warn!("{listener} accept failed: {err}");
            tokio::time::sleep(ACCEPT_BACKOFF).await;
            None
        }
    }
}

/// Why a read or write did not complete.
#[derive(Debug, Clone, PartialEq, Eq, Display)]
pub enum LinkError {
    #[display("read deadline expired")]
    Timeout,
    #[display("connection closed")]
    Closed,
    #[display("transient: {_0}")]
    Transient(String),
    #[display("fatal: {_0}")]
    Fatal(String),
}

impl std::error::Error for LinkError {}

/// One network session carrying a call.
pub struct Connection {
    transport: Transport,
    remote: String,
    info: String,
    started: Instant,
    mode: Mutex<Mode>,
    sent: AtomicU64,
    recv: AtomicU64,
    pending: Mutex<VecDeque<u8>>,
    fault: Mutex<Option<LinkError>>,
    incoming: flume::Receiver<Vec<u8>>,
    outgoing: flume::Sender<Vec<u8>>,
    closed: watch::Sender<bool>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("transport", &self.transport)
            .field("remote", &self.remote)
            .field("sent", &self.sent())
            .field("recv", &self.recv())
            .finish_non_exhaustive()
    }
}

/// Where listeners hand over inbound sessions.
pub trait Switchboard: Send + Sync + 'static {
    /// A call is being rung or is up.
    fn line_busy(&self) -> bool;

    fn deliver(&self, conn: Arc<Connection>);
}

/// Transport half of a connection.
#[derive(Clone)]
pub struct Endpoint {
    /// Payload read from the network, for the connection's reader.
    pub incoming: flume::Sender<Vec<u8>>,
    /// Payload written by the modem, for the transport's writer.
    pub outgoing: flume::Receiver<Vec<u8>>,
    closed: watch::Receiver<bool>,
    conn: Weak<Connection>,
}

impl Endpoint {
    /// Resolves once the connection is closed from either side.
    pub async fn closed(&self) {
        let mut closed = self.closed.clone();
        // An error means the connection itself was dropped.
        let _ = closed.wait_for(|closed| *closed).await;
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Report end of stream or a hard error from the transport.
    pub fn shutdown(&self, reason: &str) {
        if let Some(conn) = self.conn.upgrade() {
            if !conn.is_closed() {
                log::info!("{} {} closed: {reason}", conn.transport, conn.remote);
            }
            conn.close();
        }
    }

    /// Report an I/O error from the transport. Interrupted and timed-out
    /// operations surface once as transient; anything else closes the call.
    pub fn fail(&self, err: &io::Error) {
        let Some(conn) = self.conn.upgrade() else {
            return;
        };
        match err.kind() {
            io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
                *conn.fault.lock() = Some(LinkError::Transient(err.to_string()));
            }
            _ => {
                log::warn!("{} {} failed: {err}", conn.transport, conn.remote);
                *conn.fault.lock() = Some(LinkError::Fatal(err.to_string()));
                conn.close();
            }
        }
    }
}

impl Connection {
    pub fn new(
        transport: Transport,
        remote: impl Into<String>,
        info: impl Into<String>,
    ) -> (Arc<Self>, Endpoint) {
        let (incoming_tx, incoming_rx) = flume::unbounded();
        let (outgoing_tx, outgoing_rx) = flume::unbounded();
        let (closed_tx, closed_rx) = watch::channel(false);

        let conn = Arc::new(Self {
            transport,
            remote: remote.into(),
            info: info.into(),
            started: Instant::now(),
            mode: Mutex::new(Mode::Data),
            sent: AtomicU64::new(0),
            recv: AtomicU64::new(0),
            pending: Mutex::new(VecDeque::new()),
            fault: Mutex::new(None),
            incoming: incoming_rx,
            outgoing: outgoing_tx,
            closed: closed_tx,
        });
        let endpoint = Endpoint {
            incoming: incoming_tx,
            outgoing: outgoing_rx,
            closed: closed_rx,
            conn: Arc::downgrade(&conn),
        };
        (conn, endpoint)
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn direction(&self) -> Direction {
        self.transport.direction()
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn info(&self) -> &str {
        &self.info
    }

    pub fn mode(&self) -> Mode {
        *self.mode.lock()
    }

    pub fn set_mode(&self, mode: Mode) {
        *self.mode.lock() = mode;
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn recv(&self) -> u64 {
        self.recv.load(Ordering::Relaxed)
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Read one payload byte. `None` waits forever.
    pub async fn read_byte(&self, deadline: Option<Duration>) -> Result<u8, LinkError> {
        let mut closed = self.closed.subscribe();
        loop {
            if let Some(byte) = self.pending.lock().pop_front() {
                self.recv.fetch_add(1, Ordering::Relaxed);
                return Ok(byte);
            }
            if let Some(fault) = self.take_fault() {
                return Err(fault);
            }
            if *closed.borrow_and_update() {
                return Err(LinkError::Closed);
            }

            let chunk = async {
                tokio::select! {
                    chunk = self.incoming.recv_async() => chunk.map_err(|_| LinkError::Closed),
                    _ = closed.changed() => Err(LinkError::Closed),
                }
            };
            let chunk = match deadline {
                Some(deadline) => tokio::time::timeout(deadline, chunk)
                    .await
                    .map_err(|_| LinkError::Timeout)??,
                None => chunk.await?,
            };
            self.pending.lock().extend(chunk);
        }
    }

    /// Transient faults are reported once, fatal ones on every read.
    fn take_fault(&self) -> Option<LinkError> {
        let mut fault = self.fault.lock();
        if matches!(*fault, Some(LinkError::Transient(_))) {
            return fault.take();
        }
        fault.clone()
    }

    pub fn write(&self, bytes: &[u8]) -> Result<(), LinkError> {
        if self.is_closed() {
            return Err(LinkError::Closed);
        }
        self.outgoing
            .send(bytes.to_vec())
            .map_err(|_| LinkError::Closed)?;
        self.sent.fetch_add(bytes.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Idempotent.
    pub fn close(&self) {
        self.closed.send_if_modified(|closed| !std::mem::replace(closed, true));
    }

    pub fn summary(&self) -> String {
        format!(
            "{} {} ({}) sent={} recv={} up={:.1}s",
            self.transport,
            self.remote,
            self.info,
            self.sent(),
            self.recv(),
            self.elapsed().as_secs_f32()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bytes_flow_and_are_counted() {
        let (conn, endpoint) = Connection::new(Transport::TelnetIn, "peer", "test");
        endpoint.incoming.send(b"hi".to_vec()).unwrap();
        assert_eq!(conn.read_byte(None).await, Ok(b'h'));
        assert_eq!(conn.read_byte(None).await, Ok(b'i'));
        assert_eq!(conn.recv(), 2);

        conn.write(b"abc").unwrap();
        assert_eq!(endpoint.outgoing.recv_async().await.unwrap(), b"abc".to_vec());
        assert_eq!(conn.sent(), 3);
    }

    #[tokio::test]
    async fn failed_accept_backs_off() {
        let started = Instant::now();
        let aborted = io::Error::from(io::ErrorKind::ConnectionAborted);
        assert_eq!(settle_accept::<u8>(Err(aborted), "Telnet").await, None);
        assert!(started.elapsed() >= ACCEPT_BACKOFF);
        assert_eq!(settle_accept(Ok(7u8), "Telnet").await, Some(7));
    }

    #[tokio::test]
    async fn deadline_and_close() {
        let (conn, endpoint) = Connection::new(Transport::SshOut, "peer", "test");
        assert_eq!(
            conn.read_byte(Some(Duration::from_millis(20))).await,
            Err(LinkError::Timeout)
        );

        let reader = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.read_byte(None).await })
        };
        endpoint.shutdown("eof");
        assert_eq!(reader.await.unwrap(), Err(LinkError::Closed));
        endpoint.closed().await;
        assert!(endpoint.is_closed());
        assert_eq!(conn.write(b"x"), Err(LinkError::Closed));

        conn.close();
        assert!(conn.is_closed());
        assert_eq!(conn.direction(), Direction::Outbound);
    }

    #[tokio::test]
    async fn transient_faults_surface_once() {
        let (conn, endpoint) = Connection::new(Transport::TelnetOut, "peer", "test");
        endpoint.fail(&io::Error::from(io::ErrorKind::Interrupted));
        assert!(matches!(
            conn.read_byte(Some(Duration::from_millis(10))).await,
            Err(LinkError::Transient(_))
        ));
        assert_eq!(
            conn.read_byte(Some(Duration::from_millis(10))).await,
            Err(LinkError::Timeout)
        );

        endpoint.fail(&io::Error::from(io::ErrorKind::ConnectionReset));
        assert!(matches!(conn.read_byte(None).await, Err(LinkError::Fatal(_))));
        assert!(conn.is_closed());
    }
}
