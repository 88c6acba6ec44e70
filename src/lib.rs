//! Dialtone: a Hayes-compatible modem emulator.
//!
//! A terminal on a serial line (or stdin/stdout) talks AT commands to the
//! [`modem::Modem`]; dialling opens a Telnet or SSH session and incoming
//! Telnet/SSH connections ring the terminal like phone calls. The pure modem
//! model lives in `dialtone_protocol`, the pins, speaker and display in
//! `dialtone_hal`.

#[doc(hidden)]
pub mod boot;
pub mod cleanup;
pub mod cli;
pub mod dte;
pub mod modem;
pub mod net;
