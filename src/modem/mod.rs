//! The modem: live state plus everything it drives.
//!
//! One [`Modem`] value is shared by the serial pump, the call supervisor and
//! the watchers. State, config and registers each sit behind their own lock
//! and are reached through short accessors; no lock is held across an await.

pub mod dial;
pub mod dispatch;
pub mod escape;
pub mod serial_pump;
pub mod state;
pub mod supervisor;
pub mod timing;
pub mod watchers;

pub use dispatch::{Online, Outcome};
pub use state::{Hook, ModemState, Mode, CONNECT_SPEED};
pub use supervisor::CallEvent;
pub use timing::{Timing, MAX_RINGS};

use anyhow::Result;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::sync::Notify;

use crate::{
    dte::DteOutput,
    net::{Connection, Switchboard},
};
use dialtone_hal::{Hardware, Led, NullDisplay, NullTone, Pin, StatusDisplay, ToneGenerator};
use dialtone_protocol::{
    registers::{self, register_name},
    result_code, Config, Phonebook, Registers, ResultCode, StoredProfiles,
};

/// Side-effect backends the modem drives.
pub struct Peripherals {
    pub hardware: Box<dyn Hardware>,
    pub tone: Box<dyn ToneGenerator>,
    pub display: Box<dyn StatusDisplay>,
}

impl Peripherals {
    /// Headless: in-memory pins, no speaker, no display.
    pub fn headless() -> Self {
        Self {
            hardware: Box::new(dialtone_hal::StubHardware::default()),
            tone: Box::new(NullTone),
            display: Box::new(NullDisplay),
        }
    }
}

pub struct Modem {
    state: RwLock<ModemState>,
    config: RwLock<Config>,
    registers: RwLock<Registers>,
    profiles: Mutex<StoredProfiles>,
    phonebook: Phonebook,
    hw: Box<dyn Hardware>,
    tone: Box<dyn ToneGenerator>,
    display: Box<dyn StatusDisplay>,
    dte: DteOutput,
    calls: flume::Sender<CallEvent>,
    /// Wakes the serial pump to rebuild its guard ticker.
    guard_reset: Notify,
    timing: Timing,
}

impl Modem {
    /// Power on: load the power-up profile into the live settings and bring
    /// the lines to their idle levels.
    pub fn new(
        profiles: StoredProfiles,
        phonebook: Phonebook,
        peripherals: Peripherals,
        dte: DteOutput,
        timing: Timing,
    ) -> (Arc<Self>, flume::Receiver<CallEvent>) {
        let (calls, call_rx) = flume::unbounded();
        let slot = profiles.power_up_config;
        let (config, registers) = match profiles.get(slot) {
            Ok(profile) => (profile.config.clone(), profile.registers.clone()),
            Err(err) => {
                log::warn!("Power-up profile unavailable, using factory settings: {err:#}");
                (Config::default(), Registers::default())
            }
        };

        let modem = Arc::new(Self {
            state: RwLock::new(ModemState {
                current_config: slot,
                ..ModemState::default()
            }),
            config: RwLock::new(config),
            registers: RwLock::new(registers),
            profiles: Mutex::new(profiles),
            phonebook,
            hw: peripherals.hardware,
            tone: peripherals.tone,
            display: peripherals.display,
            dte,
            calls,
            guard_reset: Notify::new(),
            timing,
        });
        modem.idle_lines();
        log::info!("Modem powered on with profile {slot}");
        (modem, call_rx)
    }

    pub fn timing(&self) -> &Timing {
        &self.timing
    }

    pub fn hardware(&self) -> &dyn Hardware {
        self.hw.as_ref()
    }

    pub fn tone(&self) -> &dyn ToneGenerator {
        self.tone.as_ref()
    }

    pub fn phonebook(&self) -> &Phonebook {
        &self.phonebook
    }

    pub fn dte(&self) -> &DteOutput {
        &self.dte
    }

    pub fn read_state<R>(&self, f: impl FnOnce(&ModemState) -> R) -> R {
        f(&self.state.read())
    }

    pub fn write_state<R>(&self, f: impl FnOnce(&mut ModemState) -> R) -> R {
        f(&mut self.state.write())
    }

    pub fn mode(&self) -> Mode {
        self.state.read().mode
    }

    /// Switch between command and data mode, keeping the call's own mode in
    /// step.
    pub fn set_mode(&self, mode: Mode) {
        let conn = self.write_state(|s| {
            s.mode = mode;
            s.connection()
        });
        if let Some(conn) = conn {
            conn.set_mode(mode);
        }
    }

    pub fn is_off_hook(&self) -> bool {
        self.state.read().hook == Hook::Off
    }

    pub fn dcd(&self) -> bool {
        self.state.read().dcd
    }

    pub fn line_busy(&self) -> bool {
        self.state.read().line_busy
    }

    pub fn connect_speed(&self) -> u32 {
        self.state.read().connect_speed
    }

    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.state.read().connection()
    }

    pub fn ringing(&self) -> Option<Arc<Connection>> {
        self.state.read().ringing()
    }

    pub fn last_cmd(&self) -> String {
        self.state.read().last_cmd.clone()
    }

    pub fn config(&self) -> Config {
        self.config.read().clone()
    }

    pub fn with_config<R>(&self, f: impl FnOnce(&mut Config) -> R) -> R {
        f(&mut self.config.write())
    }

    pub fn register(&self, index: u8) -> u8 {
        self.registers.read().read(index)
    }

    pub fn with_registers<R>(&self, f: impl FnOnce(&mut Registers) -> R) -> R {
        f(&mut self.registers.write())
    }

    /// Have the serial pump pick up a new S12.
    pub fn restart_guard_timer(&self) {
        self.guard_reset.notify_one();
    }

    pub async fn guard_timer_changed(&self) {
        self.guard_reset.notified().await
    }

    pub fn print(&self, text: &str) {
        self.dte.print(text)
    }

    /// Print one line, CR/LF terminated.
    pub fn println(&self, text: &str) {
        self.dte.print(&format!("{text}\r\n"))
    }

    /// Show a result code, subject to Q/V/X.
    pub fn report(&self, code: ResultCode) {
        let speed = self.connect_speed();
        let rendered = {
            let config = self.config.read();
            result_code::render(code, &config, speed)
        };
        log::debug!("Result {code:?} -> {rendered:?}");
        if let Some(text) = rendered {
            self.dte.print(&text);
        }
    }

    /// Lift the receiver.
    pub fn go_off_hook(&self) {
        self.write_state(|s| s.hook = Hook::Off);
        self.hw.led_on(Led::Oh);
        self.refresh_display();
    }

    /// Mark a call as up and raise the carrier lines.
    pub fn carrier_up(&self, conn: &Arc<Connection>, speed: u32) {
        self.write_state(|s| s.carrier_up(conn, speed));
        self.apply_line_policies();
        self.hw.led_on(Led::Oh);
        self.hw.led_on(Led::Cd);
        self.refresh_display();
        log::info!("Carrier up: {} at {speed}", conn.summary());
    }

    /// Drop the call and go on hook. Idempotent; returns whether a call was
    /// actually dropped so only one party reports NO CARRIER.
    pub fn hangup(&self) -> bool {
        let (conn, had_carrier) = self.write_state(|s| {
            let had_carrier = s.dcd;
            (s.on_hook(), had_carrier)
        });
        self.apply_line_policies();
        self.hw.led_off(Led::Oh);
        self.hw.led_off(Led::Cd);
        self.hw.led_off(Led::Hs);

        let dropped = match conn {
            Some(conn) => {
                let live = !conn.is_closed();
                conn.close();
                log::info!("Hung up {}", conn.summary());
                live || had_carrier
            }
            None => had_carrier,
        };
        self.refresh_display();
        dropped
    }

    /// Drive DCD and DSR from the carrier and the `&C`/`&S` policies.
    pub fn apply_line_policies(&self) {
        let dcd = self.dcd();
        let (dcd_policy, dsr_policy) = {
            let config = self.config.read();
            (config.dcd_policy, config.dsr_policy)
        };
        self.hw.set(Pin::Dcd, dcd_policy.level(dcd));
        self.hw.set(Pin::Dsr, dsr_policy.level(dcd));
    }

    /// Lines and LEDs of an idle modem.
    fn idle_lines(&self) {
        self.hw.lower(Pin::Ri);
        self.hw.raise(Pin::Cts);
        self.apply_line_policies();
        self.hw.led_on(Led::Mr);
        self.refresh_display();
    }

    /// Hang up, clear the lines and reload the phonebook. Shared by `Z` and
    /// `&F`.
    fn reset_side_effects(&self) {
        self.hangup();
        self.write_state(|s| s.reset());
        self.hw.lower(Pin::Dsr);
        self.hw.lower(Pin::Cts);
        self.hw.lower(Pin::Ri);
        if let Err(err) = self.phonebook.reload() {
            log::error!("Phonebook reload failed, continuing with an empty book: {err:#}");
        }
        self.idle_lines();
        self.restart_guard_timer();
    }

    /// `AT&F0`
    pub fn factory_reset(&self) {
        self.config.write().reset();
        self.registers.write().reset();
        self.reset_side_effects();
        log::info!("Factory reset");
    }

    /// `ATZn`: load stored profile `slot` into the live settings.
    pub fn soft_reset(&self, slot: usize) -> Result<()> {
        let profile = self.profiles.lock().get(slot)?.clone();
        *self.config.write() = profile.config;
        self.registers.write().load_values(&profile.registers);
        self.write_state(|s| s.current_config = slot);
        self.reset_side_effects();
        log::info!("Soft reset into profile {slot}");
        Ok(())
    }

    /// `AT&Wn`
    pub fn store_profile(&self, slot: usize) -> Result<()> {
        let config = self.config();
        let registers = self.registers.read().clone();
        self.profiles.lock().store(slot, &config, &registers)
    }

    /// `AT&Yn`
    pub fn set_power_up_profile(&self, slot: usize) -> Result<()> {
        self.profiles.lock().set_power_up(slot)
    }

    pub fn profiles(&self) -> StoredProfiles {
        self.profiles.lock().clone()
    }

    /// Push state and peer to the status display.
    pub fn refresh_display(&self) {
        let (top, bottom) = self.read_state(|s| {
            let top = if s.dcd {
                format!("CONNECT {}", s.connect_speed)
            } else if s.ringing().is_some() {
                "RINGING".to_string()
            } else if s.hook == Hook::Off {
                "OFF HOOK".to_string()
            } else {
                "READY".to_string()
            };
            let peer = s
                .connection()
                .or_else(|| s.ringing())
                .map(|c| c.remote().to_string())
                .unwrap_or_default();
            (top, peer)
        });
        self.display.show(&top, &bottom);
    }

    pub fn show_status(&self, top: &str, bottom: &str) {
        self.display.show(top, bottom);
    }

    /// Everything about the modem, one item per line. Used by `AT*` and
    /// SIGQUIT.
    pub fn dump_state(&self) -> Vec<String> {
        let mut lines = vec![
            format!("STATE {}", self.read_state(|s| s.describe())),
            format!("CONFIG {}", self.config().summary()),
        ];
        let registers = self.registers.read().clone();
        let regs = registers
            .non_zero()
            .map(|(index, value)| match register_name(index) {
                Some(name) => format!("S{index}({name})={value}"),
                None => format!("S{index}={value}"),
            })
            .collect::<Vec<_>>();
        lines.push(format!("REGS {}", regs.join(" ")));
        lines.push(format!("PINS {}", self.hw.describe()));
        if let Some(conn) = self.connection() {
            lines.push(format!("CALL {}", conn.summary()));
        }
        lines.push(format!("PHONEBOOK {} entries", self.phonebook.len()));
        lines
    }

    /// Auto-answer ring threshold, zero when disabled.
    pub fn auto_answer_rings(&self) -> u8 {
        self.register(registers::AUTO_ANSWER)
    }

    pub(crate) fn deliver_call(&self, event: CallEvent) {
        if self.calls.send(event).is_err() {
            log::error!("Call supervisor is gone");
        }
    }
}

impl Switchboard for Modem {
    fn line_busy(&self) -> bool {
        Modem::line_busy(self)
    }

    fn deliver(&self, conn: Arc<Connection>) {
        self.deliver_call(CallEvent::Inbound(conn));
    }
}
