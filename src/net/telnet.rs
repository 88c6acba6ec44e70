//! Telnet transport.
//!
//! The modem is a dumb pipe: it offers character-at-a-time mode on inbound
//! calls and refuses every option the far end asks for.

use anyhow::{Context, Result};
use std::{sync::Arc, time::Duration};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream,
    },
};

use super::{settle_accept, Connection, Endpoint, Switchboard, Transport};
use dialtone_protocol::ModemError;

pub const IAC: u8 = 255;
pub const DONT: u8 = 254;
pub const DO: u8 = 253;
pub const WONT: u8 = 252;
pub const WILL: u8 = 251;
pub const SB: u8 = 250;
pub const SE: u8 = 240;

pub const OPT_ECHO: u8 = 1;
pub const OPT_LINEMODE: u8 = 34;

pub const DEFAULT_PORT: u16 = 23;

/// Sent to every inbound caller right after accept.
pub const INBOUND_NEGOTIATION: [u8; 9] = [
    IAC, DO, OPT_LINEMODE, IAC, DONT, OPT_ECHO, IAC, WILL, OPT_ECHO,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum State {
    #[default]
    Data,
    Iac,
    Option(u8),
    Sub,
    SubIac,
}

/// Result of feeding one network chunk to the decoder.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Decoded {
    pub payload: Vec<u8>,
    pub replies: Vec<u8>,
}

/// Incremental IAC parser. State survives across chunks, so commands may be
/// split anywhere by TCP.
#[derive(Debug, Default)]
pub struct Decoder {
    state: State,
}

impl Decoder {
    pub fn decode(&mut self, input: &[u8]) -> Decoded {
        let mut out = Decoded::default();
        for &byte in input {
            self.state = match (self.state, byte) {
                (State::Data, IAC) => State::Iac,
                (State::Data, _) => {
                    out.payload.push(byte);
                    State::Data
                }
                (State::Iac, IAC) => {
                    out.payload.push(IAC);
                    State::Data
                }
                (State::Iac, WILL | WONT | DO | DONT) => State::Option(byte),
                (State::Iac, SB) => State::Sub,
                // NOP, AYT, GA and friends.
                (State::Iac, _) => State::Data,
                (State::Option(verb), option) => {
                    match verb {
                        WILL => out.replies.extend_from_slice(&[IAC, DONT, option]),
                        DO | DONT => out.replies.extend_from_slice(&[IAC, WONT, option]),
                        _ => {}
                    }
                    State::Data
                }
                (State::Sub, IAC) => State::SubIac,
                (State::Sub, _) => State::Sub,
                (State::SubIac, SE) => State::Data,
                (State::SubIac, _) => State::Sub,
            };
        }
        out
    }
}

/// Double every IAC in outgoing payload.
pub fn escape(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    for &byte in data {
        out.push(byte);
        if byte == IAC {
            out.push(IAC);
        }
    }
    out
}

/// Wrap an established TCP stream. Inbound streams get the opening
/// negotiation before any payload.
pub fn attach(stream: TcpStream, transport: Transport, info: impl Into<String>) -> Arc<Connection> {
    let remote = stream
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    if let Err(err) = stream.set_nodelay(true) {
        log::debug!("set_nodelay on {remote}: {err}");
    }

    let (conn, endpoint) = Connection::new(transport, remote, info);
    let (reader, writer) = stream.into_split();
    let (reply_tx, reply_rx) = flume::unbounded();
    if transport == Transport::TelnetIn {
        let _ = reply_tx.send(INBOUND_NEGOTIATION.to_vec());
    }

    tokio::spawn(read_loop(reader, endpoint.clone(), reply_tx));
    tokio::spawn(write_loop(writer, endpoint, reply_rx));
    conn
}

async fn read_loop(mut reader: OwnedReadHalf, endpoint: Endpoint, replies: flume::Sender<Vec<u8>>) {
    let mut decoder = Decoder::default();
    let mut buf = [0u8; 1024];
    loop {
        let read = tokio::select! {
            _ = endpoint.closed() => break,
            read = reader.read(&mut buf) => read,
        };
        let n = match read {
            Ok(0) => {
                endpoint.shutdown("end of stream");
                break;
            }
            Ok(n) => n,
            Err(err) => {
                endpoint.fail(&err);
                if endpoint.is_closed() {
                    break;
                }
                continue;
            }
        };

        let decoded = decoder.decode(&buf[..n]);
        if !decoded.replies.is_empty() {
            let _ = replies.send(decoded.replies);
        }
        if !decoded.payload.is_empty() && endpoint.incoming.send(decoded.payload).is_err() {
            break;
        }
    }
}

async fn write_loop(mut writer: OwnedWriteHalf, endpoint: Endpoint, replies: flume::Receiver<Vec<u8>>) {
    loop {
        let bytes = tokio::select! {
            biased;
            reply = replies.recv_async() => match reply {
                Ok(reply) => reply,
                Err(_) => break,
            },
            data = endpoint.outgoing.recv_async() => match data {
                Ok(data) => escape(&data),
                Err(_) => break,
            },
            _ = endpoint.closed() => {
                let mut tail = Vec::new();
                while let Ok(data) = endpoint.outgoing.try_recv() {
                    tail.extend(escape(&data));
                }
                if !tail.is_empty() {
                    let _ = writer.write_all(&tail).await;
                }
                break;
            }
        };
        if let Err(err) = writer.write_all(&bytes).await {
            endpoint.fail(&err);
            if endpoint.is_closed() {
                break;
            }
        }
    }
    let _ = writer.shutdown().await;
}

/// Place an outbound call.
pub async fn dial(host: &str, port: u16, timeout: Duration) -> Result<Arc<Connection>, ModemError> {
    let target = format!("{host}:{port}");
    log::info!("Dialling telnet {target}");
    let stream = match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
        Err(_) => return Err(ModemError::DialTimeout { target }),
        Ok(Err(err)) => return Err(ModemError::dial_failed(format!("{target}: {err}"))),
        Ok(Ok(stream)) => stream,
    };
    Ok(attach(stream, Transport::TelnetOut, format!("telnet {target}")))
}

pub async fn bind(port: u16) -> Result<TcpListener> {
    TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("Failed to bind telnet listener on port {port}"))
}

/// Accept callers for as long as the task runs.
pub async fn serve(listener: TcpListener, board: Arc<dyn Switchboard>) {
    let port = listener.local_addr().map(|a| a.port()).unwrap_or_default();
    log::info!("Telnet listener on port {port}");
    loop {
        let Some((mut stream, peer)) = settle_accept(listener.accept().await, "Telnet").await else {
            continue;
        };
        if board.line_busy() {
            log::info!("Telnet caller {peer} rejected, line busy");
            tokio::spawn(async move {
                let _ = stream.write_all(b"BUSY\r\n").await;
                let _ = stream.shutdown().await;
            });
            continue;
        }
        log::info!("Telnet call from {peer}");
        board.deliver(attach(stream, Transport::TelnetIn, format!("telnet from {peer}")));
    }
}
