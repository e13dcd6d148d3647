//! Client for the connection-accounting collaborator ("anvil"). Every
//! hibernated session is registered there so per-user connection counts
//! stay correct while the real worker process is gone. Accounting is
//! fire-and-forget: failures are logged and never affect the session.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio::sync::Mutex;

use crate::escape::tabescape;

/// Service name reported to the accounting collaborator. The hibernated
/// sessions still count against the imap service family.
pub const SERVICE_NAME: &str = "imap-hibernate";

#[async_trait]
pub trait Accounting: Send + Sync {
    /// Register a connection. Returns whether the registration was sent;
    /// a matching `disconnect` must only happen if it was.
    async fn connect(
        &self,
        username: &str,
        service: &str,
        remote_ip: Option<IpAddr>,
        conn_guid: &str,
    ) -> bool;

    async fn disconnect(
        &self,
        username: &str,
        service: &str,
        remote_ip: Option<IpAddr>,
        conn_guid: &str,
    );
}

pub type ArcAccounting = Arc<dyn Accounting>;

/// Accounting over the local anvil socket, one persistent connection,
/// reconnected lazily after errors.
pub struct AnvilClient {
    path: PathBuf,
    conn: Mutex<Option<UnixStream>>,
}

impl AnvilClient {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            conn: Mutex::new(None),
        }
    }

    async fn send_line(&self, line: &str) -> bool {
        let mut guard = self.conn.lock().await;
        for _attempt in 0..2 {
            if guard.is_none() {
                match UnixStream::connect(&self.path).await {
                    Ok(stream) => *guard = Some(stream),
                    Err(err) => {
                        tracing::debug!(path = %self.path.display(), error = %err,
                            "cannot reach anvil");
                        return false;
                    }
                }
            }
            if let Some(stream) = guard.as_mut() {
                match stream.write_all(line.as_bytes()).await {
                    Ok(()) => return true,
                    Err(err) => {
                        tracing::debug!(error = %err, "anvil write failed, reconnecting");
                        *guard = None;
                    }
                }
            }
        }
        false
    }
}

fn ip_field(remote_ip: Option<IpAddr>) -> String {
    remote_ip.map(|ip| ip.to_string()).unwrap_or_default()
}

#[async_trait]
impl Accounting for AnvilClient {
    async fn connect(
        &self,
        username: &str,
        service: &str,
        remote_ip: Option<IpAddr>,
        conn_guid: &str,
    ) -> bool {
        let line = format!(
            "CONNECT\t{}\t{}\t{}\t{}\t{}\n",
            conn_guid,
            std::process::id(),
            service,
            tabescape(username),
            ip_field(remote_ip),
        );
        self.send_line(&line).await
    }

    async fn disconnect(
        &self,
        username: &str,
        service: &str,
        remote_ip: Option<IpAddr>,
        conn_guid: &str,
    ) {
        let line = format!(
            "DISCONNECT\t{}\t{}\t{}\t{}\t{}\n",
            conn_guid,
            std::process::id(),
            service,
            tabescape(username),
            ip_field(remote_ip),
        );
        self.send_line(&line).await;
    }
}
