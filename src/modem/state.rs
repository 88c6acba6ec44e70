use derive_more::Display;
use std::{
    sync::{Arc, Weak},
    time::Instant,
};

use crate::net::Connection;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Mode {
    #[display("COMMAND")]
    Command,
    #[display("DATA")]
    Data,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Hook {
    #[display("ON")]
    On,
    #[display("OFF")]
    Off,
}

/// Line speed reported for every established call.
pub const CONNECT_SPEED: u32 = 38400;

/// Live modem state, guarded by one lock inside [`super::Modem`].
#[derive(Debug)]
pub struct ModemState {
    pub mode: Mode,
    pub hook: Hook,
    /// Logical carrier.
    pub dcd: bool,
    pub line_busy: bool,
    pub connect_speed: u32,
    pub last_cmd: String,
    pub last_dialed: String,
    pub current_config: usize,
    /// The call in progress. Owned by the call supervisor.
    pub conn: Option<Weak<Connection>>,
    /// An inbound call that is ringing and not yet answered.
    pub ringing: Option<Weak<Connection>>,
    /// A pick-up is waiting out S9; whoever answers reports the outcome.
    pub answering: bool,
    pub last_ring: Option<Instant>,
}

impl Default for ModemState {
    fn default() -> Self {
        Self {
            mode: Mode::Command,
            hook: Hook::On,
            dcd: false,
            line_busy: false,
            connect_speed: 0,
            last_cmd: String::new(),
            last_dialed: String::new(),
            current_config: 0,
            conn: None,
            ringing: None,
            answering: false,
            last_ring: None,
        }
    }
}

impl ModemState {
    pub fn reset(&mut self) {
        let current_config = self.current_config;
        *self = Self {
            current_config,
            ..Self::default()
        };
    }

    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.conn.as_ref().and_then(Weak::upgrade)
    }

    pub fn ringing(&self) -> Option<Arc<Connection>> {
        self.ringing.as_ref().and_then(Weak::upgrade)
    }

    /// Record an established call.
    pub fn carrier_up(&mut self, conn: &Arc<Connection>, speed: u32) {
        self.hook = Hook::Off;
        self.dcd = true;
        self.line_busy = true;
        self.connect_speed = speed;
        self.conn = Some(Arc::downgrade(conn));
    }

    /// Back on hook. Returns the call that was up, if any.
    pub fn on_hook(&mut self) -> Option<Arc<Connection>> {
        let conn = self.conn.take().and_then(|c| c.upgrade());
        self.hook = Hook::On;
        self.dcd = false;
        self.line_busy = false;
        self.connect_speed = 0;
        self.mode = Mode::Command;
        conn
    }

    /// `dcd` implies a live call at a speed; on-hook implies neither.
    pub fn is_consistent(&self) -> bool {
        let carrier_ok = !self.dcd || (self.connect_speed > 0 && self.conn.is_some());
        let hook_ok = self.hook == Hook::Off || (!self.dcd && self.conn.is_none());
        carrier_ok && hook_ok
    }

    pub fn describe(&self) -> String {
        format!(
            "mode={} hook={} dcd={} line_busy={} speed={} profile={} last_cmd={:?} last_dialed={:?} ringing={}",
            self.mode,
            self.hook,
            self.dcd,
            self.line_busy,
            self.connect_speed,
            self.current_config,
            self.last_cmd,
            self.last_dialed,
            self.ringing().is_some(),
        )
    }
}
