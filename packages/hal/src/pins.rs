use anyhow::Result;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use parking_lot::Mutex;
use serialport::SerialPort;
use std::fmt;
use strum::{EnumIter, IntoEnumIterator};

/// RS-232 control lines, seen from the modem (DCE) side.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive, EnumIter)]
pub enum Pin {
    Dcd = 0,
    Dsr = 1,
    Ri = 2,
    Cts = 3,
    Dtr = 4,
    Rts = 5,
}

impl Pin {
    /// Lines the modem drives. DTR and RTS are driven by the terminal.
    pub fn is_output(self) -> bool {
        !matches!(self, Pin::Dtr | Pin::Rts)
    }
}

impl fmt::Display for Pin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Pin::Dcd => "DCD",
            Pin::Dsr => "DSR",
            Pin::Ri => "RI",
            Pin::Cts => "CTS",
            Pin::Dtr => "DTR",
            Pin::Rts => "RTS",
        };
        write!(f, "{name}")
    }
}

/// Front panel LEDs.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive, EnumIter)]
pub enum Led {
    /// Auto answer armed.
    Aa = 0,
    /// Carrier detect.
    Cd = 1,
    /// Off hook.
    Oh = 2,
    /// Receive data.
    Rd = 3,
    /// Send data.
    Sd = 4,
    /// Terminal ready.
    Tr = 5,
    /// High speed.
    Hs = 6,
    /// Modem ready.
    Mr = 7,
}

impl fmt::Display for Led {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Led::Aa => "AA",
            Led::Cd => "CD",
            Led::Oh => "OH",
            Led::Rd => "RD",
            Led::Sd => "SD",
            Led::Tr => "TR",
            Led::Hs => "HS",
            Led::Mr => "MR",
        };
        write!(f, "{name}")
    }
}

const PIN_COUNT: usize = 6;
const LED_COUNT: usize = 8;

/// Pin and LED capability shared by every backend.
pub trait Hardware: Send + Sync {
    fn name(&self) -> &'static str;

    fn raise(&self, pin: Pin);
    fn lower(&self, pin: Pin);
    fn read(&self, pin: Pin) -> bool;

    fn led_on(&self, led: Led);
    fn led_off(&self, led: Led);
    fn led(&self, led: Led) -> bool;

    fn set(&self, pin: Pin, level: bool) {
        if level {
            self.raise(pin)
        } else {
            self.lower(pin)
        }
    }

    fn set_led(&self, led: Led, on: bool) {
        if on {
            self.led_on(led)
        } else {
            self.led_off(led)
        }
    }

    /// Drop every line the modem drives and switch all LEDs off.
    fn clear_all(&self) {
        for pin in Pin::iter().filter(|p| p.is_output()) {
            self.lower(pin);
        }
        for led in Led::iter() {
            self.led_off(led);
        }
    }

    /// One-line listing for the state dump.
    fn describe(&self) -> String {
        let pins = Pin::iter()
            .map(|p| format!("{p}={}", u8::from(self.read(p))))
            .collect::<Vec<_>>()
            .join(" ");
        let leds = Led::iter()
            .map(|l| format!("{l}={}", u8::from(self.led(l))))
            .collect::<Vec<_>>()
            .join(" ");
        format!("[{}] {pins} | {leds}", self.name())
    }
}

#[derive(Debug, Default)]
struct Levels {
    pins: [bool; PIN_COUNT],
    leds: [bool; LED_COUNT],
}

/// In-memory pins and LEDs for hosts without GPIO.
///
/// The terminal-driven lines start high, as if a terminal were attached.
#[derive(Debug)]
pub struct StubHardware {
    levels: Mutex<Levels>,
}

impl Default for StubHardware {
    fn default() -> Self {
        let mut levels = Levels::default();
        levels.pins[u8::from(Pin::Dtr) as usize] = true;
        levels.pins[u8::from(Pin::Rts) as usize] = true;
        Self {
            levels: Mutex::new(levels),
        }
    }
}

impl Hardware for StubHardware {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn raise(&self, pin: Pin) {
        self.levels.lock().pins[u8::from(pin) as usize] = true;
    }

    fn lower(&self, pin: Pin) {
        self.levels.lock().pins[u8::from(pin) as usize] = false;
    }

    fn read(&self, pin: Pin) -> bool {
        self.levels.lock().pins[u8::from(pin) as usize]
    }

    fn led_on(&self, led: Led) {
        self.levels.lock().leds[u8::from(led) as usize] = true;
    }

    fn led_off(&self, led: Led) {
        self.levels.lock().leds[u8::from(led) as usize] = false;
    }

    fn led(&self, led: Led) -> bool {
        self.levels.lock().leds[u8::from(led) as usize]
    }
}

/// Control lines carried over the DTE serial device itself.
///
/// The host port is wired as a null modem to the terminal, so our outputs
/// land on their inputs: DCD and DSR share our DTR, CTS is our RTS. Their
/// DTR arrives on our DSR and their RTS on our CTS. RI has no wire and the
/// LEDs have no device; both are kept in memory.
pub struct SerialLineHardware {
    port: Mutex<Box<dyn SerialPort>>,
    levels: Mutex<Levels>,
}

impl SerialLineHardware {
    pub fn new(port: Box<dyn SerialPort>) -> Self {
        Self {
            port: Mutex::new(port),
            levels: Mutex::new(Levels::default()),
        }
    }

    fn drive(&self, pin: Pin, level: bool) {
        let (dtr, rts) = {
            let mut levels = self.levels.lock();
            levels.pins[u8::from(pin) as usize] = level;
            (
                levels.pins[u8::from(Pin::Dcd) as usize] || levels.pins[u8::from(Pin::Dsr) as usize],
                levels.pins[u8::from(Pin::Cts) as usize],
            )
        };

        let mut port = self.port.lock();
        let result = match pin {
            Pin::Dcd | Pin::Dsr => port.write_data_terminal_ready(dtr),
            Pin::Cts => port.write_request_to_send(rts),
            Pin::Ri | Pin::Dtr | Pin::Rts => Ok(()),
        };
        if let Err(err) = result {
            log::warn!("Failed to drive {pin} on serial line: {err}");
        }
    }
}

impl Hardware for SerialLineHardware {
    fn name(&self) -> &'static str {
        "serial-line"
    }

    fn raise(&self, pin: Pin) {
        self.drive(pin, true)
    }

    fn lower(&self, pin: Pin) {
        self.drive(pin, false)
    }

    fn read(&self, pin: Pin) -> bool {
        let sampled = match pin {
            Pin::Dtr => Some(self.port.lock().read_data_set_ready()),
            Pin::Rts => Some(self.port.lock().read_clear_to_send()),
            _ => None,
        };
        match sampled {
            Some(Ok(level)) => {
                self.levels.lock().pins[u8::from(pin) as usize] = level;
                level
            }
            Some(Err(err)) => {
                log::warn!("Failed to sample {pin} on serial line: {err}");
                self.levels.lock().pins[u8::from(pin) as usize]
            }
            None => self.levels.lock().pins[u8::from(pin) as usize],
        }
    }

    fn led_on(&self, led: Led) {
        self.levels.lock().leds[u8::from(led) as usize] = true;
    }

    fn led_off(&self, led: Led) {
        self.levels.lock().leds[u8::from(led) as usize] = false;
    }

    fn led(&self, led: Led) -> bool {
        self.levels.lock().leds[u8::from(led) as usize]
    }
}

/// Pick the backend at runtime: the serial line when the DTE is a serial
/// device, the in-memory stub otherwise.
pub fn open(port: Option<Box<dyn SerialPort>>) -> Result<Box<dyn Hardware>> {
    Ok(match port {
        Some(port) => {
            log::info!(
                "Driving control lines on serial device {}",
                port.name().unwrap_or_else(|| "<unnamed>".to_string())
            );
            Box::new(SerialLineHardware::new(port))
        }
        None => {
            log::info!("No control-line hardware, using in-memory pins");
            Box::new(StubHardware::default())
        }
    })
}
