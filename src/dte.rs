//! The terminal side of the modem.
//!
//! Whatever the backend, the DTE is a byte receiver for the serial pump and a
//! chunk sender for everything that prints. Blocking devices are driven by
//! plain threads bridged through flume.

use anyhow::{Context, Result};
use serialport::SerialPort;
use std::{
    io::{self, IsTerminal, Read, Write},
    thread,
    time::Duration,
};

/// Bytes typed by the terminal.
pub struct DteInput {
    rx: flume::Receiver<u8>,
}

impl DteInput {
    /// Next byte, or `None` once the terminal is gone.
    pub async fn recv(&self) -> Option<u8> {
        self.rx.recv_async().await.ok()
    }

    pub fn try_recv(&self) -> Option<u8> {
        self.rx.try_recv().ok()
    }
}

/// Sink for everything shown on the terminal.
#[derive(Clone)]
pub struct DteOutput {
    tx: flume::Sender<Vec<u8>>,
}

impl DteOutput {
    pub fn write(&self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        if self.tx.send(bytes.to_vec()).is_err() {
            log::debug!("DTE output closed, dropped {} bytes", bytes.len());
        }
    }

    pub fn print(&self, text: &str) {
        self.write(text.as_bytes())
    }
}

pub struct Dte {
    pub input: DteInput,
    pub output: DteOutput,
}

/// Far end of an in-memory DTE, playing the terminal.
pub struct Terminal {
    pub keys: flume::Sender<u8>,
    pub screen: flume::Receiver<Vec<u8>>,
}

impl Terminal {
    pub fn type_str(&self, text: &str) {
        for byte in text.bytes() {
            let _ = self.keys.send(byte);
        }
    }

    /// Everything printed so far, without waiting.
    pub fn drain(&self) -> String {
        let mut out = Vec::new();
        while let Ok(chunk) = self.screen.try_recv() {
            out.extend(chunk);
        }
        String::from_utf8_lossy(&out).into_owned()
    }

    /// Read the screen until `needle` shows up. Returns everything read.
    pub async fn read_until(&self, needle: &str, within: Duration) -> Result<String> {
        let deadline = tokio::time::Instant::now() + within;
        let mut seen = String::new();
        while !seen.contains(needle) {
            let chunk = tokio::time::timeout_at(deadline, self.screen.recv_async())
                .await
                .with_context(|| format!("Timed out waiting for {needle:?}, saw {seen:?}"))?
                .context("DTE output closed")?;
            seen.push_str(&String::from_utf8_lossy(&chunk));
        }
        Ok(seen)
    }
}

impl Dte {
    /// Wired to a [`Terminal`] instead of a device.
    pub fn memory() -> (Self, Terminal) {
        let (keys, rx) = flume::unbounded();
        let (tx, screen) = flume::unbounded();
        (
            Self {
                input: DteInput { rx },
                output: DteOutput { tx },
            },
            Terminal { keys, screen },
        )
    }

    /// Standard input and output of the process. When stdin is a terminal
    /// it is switched to raw mode until [`restore_terminal`] runs.
    pub fn stdio() -> Result<Self> {
        if io::stdin().is_terminal() {
            crossterm::terminal::enable_raw_mode().context("Failed to enable raw mode")?;
            crate::cleanup::register_cleanup(restore_terminal);
            log::info!("Terminal switched to raw mode");
        }

        let (key_tx, rx) = flume::unbounded();
        let (tx, out_rx) = flume::unbounded::<Vec<u8>>();

        thread::Builder::new()
            .name("dte-stdin".into())
            .spawn(move || {
                let mut stdin = io::stdin().lock();
                let mut buf = [0u8; 256];
                loop {
                    match stdin.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            if buf[..n].iter().any(|b| key_tx.send(*b).is_err()) {
                                break;
                            }
                        }
                        Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                        Err(err) => {
                            log::error!("stdin read failed: {err}");
                            break;
                        }
                    }
                }
                log::info!("stdin closed");
            })
            .context("Failed to spawn stdin reader")?;

        thread::Builder::new()
            .name("dte-stdout".into())
            .spawn(move || {
                let mut stdout = io::stdout().lock();
                while let Ok(chunk) = out_rx.recv() {
                    if stdout.write_all(&chunk).and_then(|_| stdout.flush()).is_err() {
                        break;
                    }
                }
            })
            .context("Failed to spawn stdout writer")?;

        Ok(Self {
            input: DteInput { rx },
            output: DteOutput { tx },
        })
    }

    /// A serial device at 8N1. Returns a third handle on the port for the
    /// control lines.
    pub fn serial(path: &str, speed: u32) -> Result<(Self, Box<dyn SerialPort>)> {
        let port = serialport::new(path, speed)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(Duration::from_millis(200))
            .open()
            .with_context(|| format!("Failed to open serial device {path} at {speed} bps"))?;
        let mut reader = port
            .try_clone()
            .with_context(|| format!("Failed to clone handle for {path}"))?;
        let lines = port
            .try_clone()
            .with_context(|| format!("Failed to clone handle for {path}"))?;
        let mut writer = port;

        let (key_tx, rx) = flume::unbounded();
        let (tx, out_rx) = flume::unbounded::<Vec<u8>>();
        let name = path.to_string();

        thread::Builder::new()
            .name("dte-serial-rx".into())
            .spawn(move || {
                let mut buf = [0u8; 256];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) => {}
                        Ok(n) => {
                            if buf[..n].iter().any(|b| key_tx.send(*b).is_err()) {
                                break;
                            }
                        }
                        Err(err) if err.kind() == io::ErrorKind::TimedOut => {}
                        Err(err) => {
                            log::error!("Read error on {name}: {err}");
                            break;
                        }
                    }
                }
            })
            .context("Failed to spawn serial reader")?;

        thread::Builder::new()
            .name("dte-serial-tx".into())
            .spawn(move || {
                while let Ok(chunk) = out_rx.recv() {
                    if let Err(err) = writer.write_all(&chunk).and_then(|_| writer.flush()) {
                        log::error!("Write error on serial DTE: {err}");
                        break;
                    }
                }
            })
            .context("Failed to spawn serial writer")?;

        log::info!("DTE on {path} at {speed} bps");
        Ok((
            Self {
                input: DteInput { rx },
                output: DteOutput { tx },
            },
            lines,
        ))
    }
}

pub fn restore_terminal() {
    if let Err(err) = crossterm::terminal::disable_raw_mode() {
        log::warn!("Failed to restore terminal mode: {err}");
    }
}
