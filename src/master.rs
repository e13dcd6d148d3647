//! The unhibernation broker: a short-lived control connection to the
//! imap-master socket. The handoff record's first byte travels together
//! with the client's descriptor (SCM_RIGHTS); the rest of the record is
//! ordinary stream data. One reply line comes back: `+` means the worker
//! now owns the descriptor, anything else is a refusal.

use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::path::Path;

use tokio::io::{AsyncReadExt, AsyncWriteExt, Interest};
use tokio::net::UnixStream;

use crate::fdpass;

pub const MASTER_SOCKET_NAME: &str = "imap-master";

const MAX_REPLY_LINE: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum MasterError {
    /// The master socket cannot take the session right now; retry later.
    #[error("imap-master busy: {0}")]
    Busy(#[source] io::Error),
    /// The handoff is lost for good.
    #[error("{0}")]
    Permanent(String),
}

pub struct MasterConnection {
    name: String,
    stream: UnixStream,
}

impl MasterConnection {
    pub async fn connect(path: &Path) -> Result<Self, MasterError> {
        match UnixStream::connect(path).await {
            Ok(stream) => Ok(Self {
                name: path.display().to_string(),
                stream,
            }),
            Err(err) if is_transient(&err) => Err(MasterError::Busy(err)),
            Err(err) => Err(MasterError::Permanent(format!(
                "connect({}) failed: {}",
                path.display(),
                err
            ))),
        }
    }

    /// Send the first record byte with the client descriptor attached.
    pub async fn send_fd(&mut self, record: &[u8], client_fd: RawFd) -> Result<(), MasterError> {
        loop {
            self.stream
                .writable()
                .await
                .map_err(|err| self.permanent("wait for writable", &err))?;
            match self.stream.try_io(Interest::WRITABLE, || {
                fdpass::send_with_fd(self.stream.as_raw_fd(), &record[..1], client_fd)
            }) {
                Ok(n) if n >= 1 => return Ok(()),
                Ok(_) => {
                    return Err(MasterError::Permanent(format!(
                        "fd_send({}) sent nothing",
                        self.name
                    )))
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
                Err(err) => return Err(self.permanent("fd_send", &err)),
            }
        }
    }

    /// Send the rest of the record after the fd-carrying byte.
    pub async fn send_rest(&mut self, record: &[u8]) -> Result<(), MasterError> {
        self.stream
            .write_all(&record[1..])
            .await
            .map_err(|err| self.permanent("write", &err))
    }

    /// Read the single reply line, without the trailing newline.
    pub async fn read_reply(&mut self) -> Result<String, MasterError> {
        let mut line: Vec<u8> = Vec::new();
        let mut chunk = [0u8; 256];
        loop {
            let n = self
                .stream
                .read(&mut chunk)
                .await
                .map_err(|err| self.permanent("read", &err))?;
            if n == 0 {
                return Err(MasterError::Permanent(format!(
                    "{} closed the connection before replying",
                    self.name
                )));
            }
            line.extend_from_slice(&chunk[..n]);
            if let Some(pos) = line.iter().position(|b| *b == b'\n') {
                line.truncate(pos);
                return Ok(String::from_utf8_lossy(&line).into_owned());
            }
            if line.len() > MAX_REPLY_LINE {
                return Err(MasterError::Permanent(format!(
                    "{} reply line too long",
                    self.name
                )));
            }
        }
    }

    fn permanent(&self, what: &str, err: &io::Error) -> MasterError {
        MasterError::Permanent(format!("{}({}) failed: {}", what, self.name, err))
    }
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::NotFound
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
            | io::ErrorKind::Interrupted
    )
}
