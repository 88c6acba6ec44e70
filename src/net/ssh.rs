//! SSH transport.
//!
//! Inbound: any user gets in without credentials and the first session
//! channel becomes the call as soon as it opens. Outbound: password auth, a pty with echo off,
//! then a shell.

use anyhow::{Context, Result};
use async_trait::async_trait;
use russh::{
    client,
    server::{self, Auth, Msg, Session},
    Channel, ChannelId, ChannelMsg, Disconnect, MethodSet, Pty,
};
use russh_keys::key::{KeyPair, PublicKey};
use std::{net::SocketAddr, path::Path, sync::Arc, time::Duration};
use tokio::net::TcpListener;

use super::{settle_accept, Connection, Endpoint, Switchboard, Transport};
use dialtone_protocol::ModemError;

pub const DEFAULT_PORT: u16 = 22;

const PTY_COLUMNS: u32 = 80;
const PTY_ROWS: u32 = 40;

pub fn load_host_key(path: &Path) -> Result<KeyPair> {
    russh_keys::load_secret_key(path, None)
        .with_context(|| format!("Failed to load SSH host key from {path:?}"))
}

/// Move bytes between a session channel and the connection until either
/// side closes.
async fn pump<S>(mut channel: Channel<S>, endpoint: Endpoint)
where
    S: From<(ChannelId, ChannelMsg)> + Send + Sync + 'static,
{
    loop {
        tokio::select! {
            msg = channel.wait() => match msg {
                Some(ChannelMsg::Data { data }) | Some(ChannelMsg::ExtendedData { data, .. }) => {
                    if endpoint.incoming.send(data.to_vec()).is_err() {
                        break;
                    }
                }
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                    endpoint.shutdown("channel closed by peer");
                    break;
                }
                Some(_) => {}
            },
            out = endpoint.outgoing.recv_async() => match out {
                Ok(bytes) => {
                    if let Err(err) = channel.data(&bytes[..]).await {
                        endpoint.shutdown(&format!("channel write failed: {err}"));
                        break;
                    }
                }
                Err(_) => break,
            },
            _ = endpoint.closed() => {
                while let Ok(bytes) = endpoint.outgoing.try_recv() {
                    if channel.data(&bytes[..]).await.is_err() {
                        break;
                    }
                }
                let _ = channel.eof().await;
                let _ = channel.close().await;
                break;
            }
        }
    }
}

struct Inbound {
    peer: SocketAddr,
    board: Arc<dyn Switchboard>,
    answered: bool,
}

impl Inbound {
    fn new(peer: SocketAddr, board: Arc<dyn Switchboard>) -> Self {
        Self {
            peer,
            board,
            answered: false,
        }
    }
}

#[async_trait]
impl server::Handler for Inbound {
    type Error = russh::Error;

    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        log::debug!("SSH {} authenticated as '{user}' without credentials", self.peer);
        Ok(Auth::Accept)
    }

    async fn auth_password(&mut self, user: &str, _password: &str) -> Result<Auth, Self::Error> {
        log::debug!("SSH {} authenticated as '{user}' (password ignored)", self.peer);
        Ok(Auth::Accept)
    }

    /// The first session channel is the call, whether or not the client
    /// goes on to ask for a shell.
    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if self.answered {
            log::info!("SSH {} refused an extra session channel", self.peer);
            return Ok(false);
        }
        self.answered = true;

        let info = format!("ssh from {}", self.peer);
        let (conn, endpoint) = Connection::new(Transport::SshIn, self.peer.to_string(), info);
        tokio::spawn(pump(channel, endpoint));
        if self.board.line_busy() {
            log::info!("SSH caller {} rejected, line busy", self.peer);
            let _ = conn.write(b"BUSY\r\n");
            conn.close();
            return Ok(true);
        }

        log::info!("SSH call from {}", self.peer);
        self.board.deliver(conn);
        Ok(true)
    }

    #[allow(clippy::too_many_arguments)]
    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        log::debug!("SSH {} pty {term} {col_width}x{row_height}", self.peer);
        session.channel_success(channel);
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.channel_success(channel);
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        log::debug!(
            "SSH {} exec '{}' ignored",
            self.peer,
            String::from_utf8_lossy(data)
        );
        session.channel_success(channel);
        Ok(())
    }
}

pub async fn bind(port: u16) -> Result<TcpListener> {
    TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("Failed to bind SSH listener on port {port}"))
}

/// Accept SSH callers for as long as the task runs.
pub async fn serve(listener: TcpListener, key: KeyPair, board: Arc<dyn Switchboard>) {
    let config = Arc::new(server::Config {
        keys: vec![key],
        methods: MethodSet::NONE | MethodSet::PASSWORD,
        auth_rejection_time: Duration::from_millis(250),
        ..Default::default()
    });
    let port = listener.local_addr().map(|a| a.port()).unwrap_or_default();
    log::info!("SSH listener on port {port}");

    loop {
        let Some((socket, peer)) = settle_accept(listener.accept().await, "SSH").await else {
            continue;
        };
        let config = Arc::clone(&config);
        let handler = Inbound::new(peer, Arc::clone(&board));
        tokio::spawn(async move {
            if let Err(err) = server::run_stream(config, socket, handler).await {
                log::warn!("SSH session with {peer} ended: {err}");
            }
        });
    }
}

struct Outbound {
    target: String,
}

#[async_trait]
impl client::Handler for Outbound {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        log::info!(
            "SSH {} host key {}",
            self.target,
            server_public_key.fingerprint()
        );
        Ok(true)
    }
}

/// Place an outbound SSH call.
pub async fn dial(
    host: &str,
    port: u16,
    username: &str,
    password: &str,
    timeout: Duration,
) -> Result<Arc<Connection>, ModemError> {
    let target = format!("{host}:{port}");
    log::info!("Dialling ssh {username}@{target}");

    let failed = |err: russh::Error| ModemError::dial_failed(format!("{target}: {err}"));
    let attempt = async {
        let config = Arc::new(client::Config::default());
        let handler = Outbound {
            target: target.clone(),
        };
        let mut handle = client::connect(config, (host, port), handler)
            .await
            .map_err(failed)?;
        if !handle
            .authenticate_password(username, password)
            .await
            .map_err(failed)?
        {
            return Err(ModemError::dial_failed(format!(
                "{target}: password rejected for '{username}'"
            )));
        }
        let mut channel = handle.channel_open_session().await.map_err(failed)?;
        channel
            .request_pty(false, "xterm", PTY_COLUMNS, PTY_ROWS, 0, 0, &[(Pty::ECHO, 0)])
            .await
            .map_err(failed)?;
        channel.request_shell(true).await.map_err(failed)?;
        Ok((handle, channel))
    };

    let outcome = tokio::time::timeout(timeout, attempt).await;
    let (handle, channel) = match outcome {
        Err(_) => return Err(ModemError::DialTimeout { target }),
        Ok(result) => result?,
    };

    let info = format!("ssh {username}@{target}");
    let (conn, endpoint) = Connection::new(Transport::SshOut, target, info);
    tokio::spawn(async move {
        pump(channel, endpoint).await;
        let _ = handle
            .disconnect(Disconnect::ByApplication, "hangup", "en")
            .await;
    });
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_secs(5);

    struct Catcher {
        busy: bool,
        calls: flume::Sender<Arc<Connection>>,
    }

    impl Switchboard for Catcher {
        fn line_busy(&self) -> bool {
            self.busy
        }

        fn deliver(&self, conn: Arc<Connection>) {
            let _ = self.calls.send(conn);
        }
    }

    /// Start a listener on loopback and open a bare session channel on it.
    async fn open_session(busy: bool) -> (Channel<client::Msg>, flume::Receiver<Arc<Connection>>) {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (calls, delivered) = flume::unbounded();
        let key = KeyPair::generate_ed25519().unwrap();
        tokio::spawn(serve(listener, key, Arc::new(Catcher { busy, calls })));

        let handler = Outbound {
            target: addr.to_string(),
        };
        let mut handle = client::connect(Arc::new(client::Config::default()), addr, handler)
            .await
            .unwrap();
        assert!(handle.authenticate_password("anyone", "x").await.unwrap());
        let channel = handle.channel_open_session().await.unwrap();
        // The session lives as long as the handle.
        tokio::spawn(async move {
            tokio::time::sleep(WAIT).await;
            drop(handle);
        });
        (channel, delivered)
    }

    async fn read_data(channel: &mut Channel<client::Msg>, len: usize) -> Vec<u8> {
        let mut got = Vec::new();
        while got.len() < len {
            match tokio::time::timeout(WAIT, channel.wait()).await.unwrap() {
                Some(ChannelMsg::Data { data }) => got.extend_from_slice(&data),
                Some(_) => {}
                None => break,
            }
        }
        got
    }

    #[tokio::test]
    async fn session_channel_is_the_call_without_a_shell() {
        let (mut channel, delivered) = open_session(false).await;
        let conn = tokio::time::timeout(WAIT, delivered.recv_async())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(conn.transport(), Transport::SshIn);

        conn.write(b"hello").unwrap();
        assert_eq!(read_data(&mut channel, 5).await, b"hello".to_vec());

        channel.data(&b"back"[..]).await.unwrap();
        for expected in *b"back" {
            assert_eq!(conn.read_byte(Some(WAIT)).await, Ok(expected));
        }
    }

    #[tokio::test]
    async fn busy_line_answers_the_channel_with_busy() {
        let (mut channel, delivered) = open_session(true).await;
        assert_eq!(read_data(&mut channel, 6).await, b"BUSY\r\n".to_vec());
        assert!(delivered.try_recv().is_err());
    }
}
