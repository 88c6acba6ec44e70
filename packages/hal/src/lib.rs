//! Side-effect surface of the modem: control lines and LEDs, the speaker and
//! the status display. Every capability has a backend that needs no hardware.

pub mod display;
pub mod pins;
pub mod tone;

pub use display::{LogDisplay, NullDisplay, StatusDisplay};
pub use pins::{Hardware, Led, Pin, SerialLineHardware, StubHardware};
pub use tone::{NullTone, RecordingTone, Tone, ToneGenerator};
