//! End-to-end runs: an in-memory terminal on one side, loopback TCP on the
//! other, with the compressed timing profile.

use anyhow::{Context, Result};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};

use dialtone::{
    dte::{Dte, Terminal},
    modem::{serial_pump, supervisor, watchers, Mode, Modem, Peripherals, Timing},
};
use dialtone_protocol::{registers, Entry, Phonebook, StoredProfiles};

const WAIT: Duration = Duration::from_secs(5);

struct Harness {
    modem: Arc<Modem>,
    term: Terminal,
    telnet: Option<SocketAddr>,
}

impl Harness {
    async fn start(telnet: bool) -> Self {
        let (dte, term) = Dte::memory();
        let (modem, calls) = Modem::new(
            StoredProfiles::factory(None),
            Phonebook::in_memory(),
            Peripherals::headless(),
            dte.output,
            Timing::compressed(),
        );
        let listening = supervisor::listen(&modem, telnet.then_some(0), None).await;
        tokio::spawn(supervisor::run(modem.clone(), calls));
        tokio::spawn(serial_pump::run(modem.clone(), dte.input));
        tokio::spawn(watchers::ring_decay(modem.clone()));
        Self {
            modem,
            term,
            telnet: listening.telnet,
        }
    }

    /// Type a line and wait for `reply`.
    async fn command(&self, line: &str, reply: &str) -> Result<String> {
        self.term.type_str(line);
        self.term.read_until(reply, WAIT).await
    }

    fn telnet_port(&self) -> Result<u16> {
        self.telnet.map(|a| a.port()).context("telnet listener not running")
    }
}

/// Read from a socket until `needle` has been seen.
async fn read_until(stream: &mut TcpStream, needle: &[u8]) -> Result<Vec<u8>> {
    let mut seen = Vec::new();
    let mut buf = [0u8; 256];
    tokio::time::timeout(WAIT, async {
        while !seen.windows(needle.len()).any(|w| w == needle) {
            let n = stream.read(&mut buf).await?;
            anyhow::ensure!(n > 0, "stream closed after {seen:?}");
            seen.extend_from_slice(&buf[..n]);
        }
        Ok(())
    })
    .await
    .context("timed out")??;
    Ok(seen)
}

#[tokio::test]
async fn echo_off_numeric_codes() -> Result<()> {
    let h = Harness::start(false).await;
    let seen = h.command("ATE0Q0V0\r", "0\r\n").await?;
    assert_eq!(seen, "ATE0Q0V0\r0\r\n");
    assert_eq!(h.command("AT\r", "\r\n").await?, "0\r\n");
    assert_eq!(h.command("ATE1V1\r", "\r\n").await?, "OK\r\n");
    Ok(())
}

#[tokio::test]
async fn register_write_and_read() -> Result<()> {
    let h = Harness::start(false).await;
    h.command("ATE0\r", "OK\r\n").await?;
    assert_eq!(h.command("ATS0=3\r", "\r\n").await?, "OK\r\n");
    assert_eq!(h.command("ATS0?\r", "\r\n").await?, "3\r\n");
    assert_eq!(h.command("ATS0=999\r", "\r\n").await?, "ERROR\r\n");
    assert_eq!(h.modem.register(registers::AUTO_ANSWER), 3);
    Ok(())
}

#[tokio::test]
async fn dial_by_phonebook_then_escape_and_hang_up() -> Result<()> {
    let far = TcpListener::bind("127.0.0.1:0").await?;
    let port = far.local_addr()?.port();
    let h = Harness::start(true).await;
    h.modem
        .phonebook()
        .add(2, Entry::from_record(&format!("5551212|127.0.0.1:{port}|TELNET"))?)?;

    h.command("ATE0S12=5\r", "OK\r\n").await?;
    h.term.type_str("ATDT5551212\r");
    let (mut remote, _) = tokio::time::timeout(WAIT, far.accept()).await??;
    assert_eq!(h.term.read_until("\r\n", WAIT).await?, "CONNECT 38400\r\n");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.modem.mode(), Mode::Data);
    assert!(h.modem.dcd());

    // Both directions.
    remote.write_all(b"welcome").await?;
    h.term.read_until("welcome", WAIT).await?;
    h.term.type_str("abc+++def");
    read_until(&mut remote, b"abc+++def").await?;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(h.modem.mode(), Mode::Data);

    // Someone else calls in while the line is up.
    let mut intruder = TcpStream::connect(("127.0.0.1", h.telnet_port()?)).await?;
    read_until(&mut intruder, b"BUSY\r\n").await?;

    h.term.type_str("+++");
    assert_eq!(h.term.read_until("OK\r\n", WAIT).await?, "OK\r\n");
    assert_eq!(h.modem.mode(), Mode::Command);
    assert!(h.modem.dcd());

    assert_eq!(h.command("ATH\r", "\r\n").await?, "NO CARRIER\r\n");
    let mut rest = Vec::new();
    tokio::time::timeout(WAIT, remote.read_to_end(&mut rest)).await??;
    assert_eq!(rest, b"+++");
    assert!(!h.modem.dcd());
    assert!(!h.modem.line_busy());

    // Nothing more is reported for the same call.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.term.drain(), "");
    Ok(())
}

#[tokio::test]
async fn inbound_call_auto_answers_on_second_ring() -> Result<()> {
    let h = Harness::start(true).await;
    h.command("ATE0S0=2\r", "OK\r\n").await?;

    let mut caller = TcpStream::connect(("127.0.0.1", h.telnet_port()?)).await?;
    let screen = h.term.read_until("CONNECT 38400\r\n", WAIT).await?;
    assert_eq!(screen, "RING\r\nRING\r\nCONNECT 38400\r\n");

    let greeting = read_until(&mut caller, b"Answered\r\n").await?;
    assert!(greeting.starts_with(&[255, 253, 34, 255, 254, 1, 255, 251, 1]));
    let text = String::from_utf8_lossy(&greeting[9..]).into_owned();
    assert_eq!(text, "Ringing...\r\nRinging...\r\nAnswered\r\n");

    caller.write_all(b"hello").await?;
    h.term.read_until("hello", WAIT).await?;
    h.term.type_str("hi there");
    read_until(&mut caller, b"hi there").await?;

    // Caller hangs up.
    drop(caller);
    assert_eq!(h.term.read_until("\r\n", WAIT).await?, "NO CARRIER\r\n");
    assert_eq!(h.modem.mode(), Mode::Command);

    // The ring counter was cleared on answer and stays clear.
    assert_eq!(h.modem.register(registers::RING_COUNT), 0);
    Ok(())
}

#[tokio::test]
async fn answer_by_hand() -> Result<()> {
    let h = Harness::start(true).await;
    h.command("ATE0\r", "OK\r\n").await?;

    let mut caller = TcpStream::connect(("127.0.0.1", h.telnet_port()?)).await?;
    h.term.read_until("RING\r\n", WAIT).await?;
    assert_eq!(h.command("ATA\r", "\r\n").await?, "CONNECT 38400\r\n");
    read_until(&mut caller, b"Answered\r\n").await?;

    caller.write_all(b"ping").await?;
    h.term.read_until("ping", WAIT).await?;
    Ok(())
}

#[tokio::test]
async fn ring_count_decays_after_caller_gives_up() -> Result<()> {
    let h = Harness::start(true).await;
    h.command("ATE0\r", "OK\r\n").await?;

    let caller = TcpStream::connect(("127.0.0.1", h.telnet_port()?)).await?;
    h.term.read_until("RING\r\n", WAIT).await?;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(h.modem.register(registers::RING_COUNT), 1);
    drop(caller);
    h.term.read_until("NO ANSWER\r\n", WAIT).await?;

    // Compressed decay window is 600 ms.
    tokio::time::sleep(Duration::from_millis(900)).await;
    assert_eq!(h.modem.register(registers::RING_COUNT), 0);
    assert!(!h.modem.line_busy());
    Ok(())
}

#[tokio::test]
async fn any_key_abandons_a_dial() -> Result<()> {
    // Accepts TCP but never speaks SSH, so the dial hangs.
    let silent = TcpListener::bind("127.0.0.1:0").await?;
    let port = silent.local_addr()?.port();
    let _held = tokio::spawn(async move {
        let mut open = Vec::new();
        while let Ok((stream, _)) = silent.accept().await {
            open.push(stream);
        }
    });

    let h = Harness::start(false).await;
    h.command("ATE0\r", "OK\r\n").await?;
    h.term.type_str(&format!("ATDE127.0.0.1:{port}|user|secret\r"));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(h.modem.is_off_hook());

    h.term.type_str("x");
    assert_eq!(h.term.read_until("\r\n", WAIT).await?, "OK\r\n");
    assert!(!h.modem.is_off_hook());
    assert!(!h.modem.dcd());
    assert!(h.modem.connection().is_none());
    Ok(())
}

#[tokio::test]
async fn redial_uses_last_number() -> Result<()> {
    let far = TcpListener::bind("127.0.0.1:0").await?;
    let port = far.local_addr()?.port();
    let h = Harness::start(false).await;
    h.command("ATE0\r", "OK\r\n").await?;

    assert_eq!(h.command("ATDL\r", "\r\n").await?, "ERROR\r\n");
    assert_eq!(
        h.command(&format!("ATDH127.0.0.1:{port};\r"), "\r\n").await?,
        "OK\r\n"
    );
    let (_first, _) = tokio::time::timeout(WAIT, far.accept()).await??;
    assert_eq!(h.modem.mode(), Mode::Command);
    assert_eq!(h.command("ATO\r", "\r\n").await?, "CONNECT 38400\r\n");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.modem.mode(), Mode::Data);

    h.modem.set_mode(Mode::Command);
    assert_eq!(h.command("ATH0\r", "\r\n").await?, "NO CARRIER\r\n");

    assert_eq!(h.command("ATDL\r", "\r\n").await?, "CONNECT 38400\r\n");
    let (_second, _) = tokio::time::timeout(WAIT, far.accept()).await??;
    assert!(h.modem.dcd());
    Ok(())
}
