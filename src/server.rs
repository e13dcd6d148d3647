//! The daemon's listeners. The handoff socket takes hibernating sessions
//! from IMAP workers (one tab-escaped record whose first byte carries the
//! client descriptor, plus any notification descriptors); the admin socket
//! speaks a one-line `KICK` protocol.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, ensure, Context, Result};
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Interest};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tokio::time::{self, Duration, Instant};

use crate::core::Core;
use crate::escape::{tabescape, tabunescape};
use crate::fdpass;
use crate::retry;
use crate::session::state::ClientState;
use crate::session::Session;

const MAX_HANDOFF_LINE: usize = 64 * 1024;
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Server {
    core: Arc<Core>,
}

impl Server {
    pub fn new(core: Arc<Core>) -> Self {
        Self { core }
    }

    pub async fn run(self, mut must_exit: watch::Receiver<bool>) -> Result<()> {
        let listen_path = self.core.config.listen_path();
        let admin_path = self.core.config.admin_path();
        let listener = bind_unix(&listen_path)?;
        let admin = bind_unix(&admin_path)?;
        tracing::info!(
            listen = %listen_path.display(),
            admin = %admin_path.display(),
            "imap-hibernate listening"
        );

        let scheduler = tokio::spawn(retry::run_scheduler(
            self.core.retry.clone(),
            must_exit.clone(),
        ));

        let mut connections = FuturesUnordered::new();
        while !*must_exit.borrow() {
            let wait_conn_finished = async {
                if connections.is_empty() {
                    futures::future::pending().await
                } else {
                    connections.next().await
                }
            };
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, _) = accepted?;
                    connections.push(tokio::spawn(handle_handoff(self.core.clone(), stream)));
                }
                accepted = admin.accept() => {
                    let (stream, _) = accepted?;
                    connections.push(tokio::spawn(handle_admin(self.core.clone(), stream)));
                }
                _ = wait_conn_finished => continue,
                _ = must_exit.changed() => continue,
            }
        }
        drop(listener);
        drop(admin);
        let _ = std::fs::remove_file(&listen_path);
        let _ = std::fs::remove_file(&admin_path);

        tracing::info!(
            sessions = self.core.registry.len(),
            "shutting down, kicking hibernated sessions"
        );
        self.core.registry.kick_all().await;
        let drain_deadline = Instant::now() + SHUTDOWN_DRAIN_TIMEOUT;
        while !self.core.registry.is_empty() && Instant::now() < drain_deadline {
            time::sleep(Duration::from_millis(10)).await;
        }
        while connections.next().await.is_some() {}
        let _ = scheduler.await;
        Ok(())
    }
}

fn bind_unix(path: &Path) -> Result<UnixListener> {
    // a stale socket file from a previous run would make bind fail
    if path.exists() {
        let _ = std::fs::remove_file(path);
    }
    UnixListener::bind(path).with_context(|| format!("bind({})", path.display()))
}

async fn handle_handoff(core: Arc<Core>, stream: UnixStream) {
    let mut fds: Vec<OwnedFd> = Vec::new();
    let outcome = match read_handoff(&stream, &mut fds).await {
        Ok(line) => accept_session(core, &line, fds).await,
        Err(err) => Err(err),
    };
    match outcome {
        Ok(username) => {
            tracing::debug!(user = %username, "hibernation handoff accepted");
            let _ = reply(&stream, "+\n").await;
        }
        Err(err) => {
            tracing::warn!(error = %err, "hibernation handoff refused");
            let _ = reply(&stream, &format!("-{}\n", err)).await;
        }
    }
}

/// Read the single handoff record, collecting any SCM_RIGHTS descriptors
/// that arrive with it.
async fn read_handoff(stream: &UnixStream, fds: &mut Vec<OwnedFd>) -> Result<String> {
    let mut buf: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        stream.readable().await?;
        match stream.try_io(Interest::READABLE, || {
            fdpass::recv_with_fds(stream.as_raw_fd(), &mut chunk, fds)
        }) {
            Ok(0) => bail!("connection closed before a full handoff record"),
            Ok(n) => {
                buf.extend_from_slice(&chunk[..n]);
                if buf.contains(&b'\n') {
                    break;
                }
                ensure!(buf.len() <= MAX_HANDOFF_LINE, "handoff record too long");
            }
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => continue,
            Err(err) => return Err(err.into()),
        }
    }
    let end = buf.iter().position(|b| *b == b'\n').unwrap_or(buf.len());
    String::from_utf8(buf[..end].to_vec()).context("handoff record is not valid UTF-8")
}

async fn accept_session(core: Arc<Core>, line: &str, mut fds: Vec<OwnedFd>) -> Result<String> {
    let state = ClientState::parse_handoff(line)?;
    ensure!(
        !fds.is_empty(),
        "no client descriptor attached to the handoff record"
    );
    let client_fd = fds.remove(0);
    let username = state.username.clone();
    Session::spawn(core, client_fd, state, fds).await?;
    Ok(username)
}

async fn reply(stream: &UnixStream, text: &str) -> io::Result<()> {
    let mut data = text.as_bytes();
    while !data.is_empty() {
        stream.writable().await?;
        match stream.try_write(data) {
            Ok(n) => data = &data[n..],
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

async fn handle_admin(core: Arc<Core>, stream: UnixStream) {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    if let Err(err) = reader.read_line(&mut line).await {
        tracing::debug!(error = %err, "admin connection read failed");
        return;
    }
    let response = match admin_command(&core, line.trim_end()).await {
        Ok(count) => format!("+{}\n", count),
        Err(err) => format!("-{}\n", err),
    };
    let mut stream = reader.into_inner();
    if let Err(err) = stream.write_all(response.as_bytes()).await {
        tracing::debug!(error = %err, "admin connection write failed");
    }
}

async fn admin_command(core: &Arc<Core>, line: &str) -> Result<usize> {
    let mut fields = line.split('\t');
    match fields.next() {
        Some("KICK") => {
            let user = tabunescape(fields.next().context("KICK needs a username")?);
            let conn_guid = fields.next().unwrap_or("");
            let count = core.registry.kick_user(&user, conn_guid).await;
            tracing::info!(user = %user, count, "kicked sessions");
            Ok(count)
        }
        _ => bail!("unknown command"),
    }
}

/// Thin client for the admin socket, used by the `kick` subcommand.
pub async fn kick_request(admin_path: &Path, user: &str, conn_guid: Option<&str>) -> Result<usize> {
    let mut stream = UnixStream::connect(admin_path)
        .await
        .with_context(|| format!("connect({})", admin_path.display()))?;
    let mut line = format!("KICK\t{}", tabescape(user));
    if let Some(guid) = conn_guid {
        line.push('\t');
        line.push_str(guid);
    }
    line.push('\n');
    stream.write_all(line.as_bytes()).await?;

    let mut reader = BufReader::new(stream);
    let mut answer = String::new();
    reader.read_line(&mut answer).await?;
    let answer = answer.trim_end();
    match answer.strip_prefix('+') {
        Some(count) => count.parse().context("malformed kick reply"),
        None => bail!(
            "kick refused: {}",
            answer.strip_prefix('-').unwrap_or(answer)
        ),
    }
}
