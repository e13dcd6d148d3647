//! A hibernated IMAP session: the client's socket, the few bytes of
//! protocol we still understand, and the machinery to wake a real worker
//! back up when the client stops being idle.

pub mod parser;
pub mod state;

use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::time::SystemTime;

use tokio::io::unix::AsyncFd;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Duration, Instant};
use tracing::Instrument;

use crate::anvil;
use crate::core::Core;
use crate::fdpass;
use crate::keepalive;
use crate::logprefix;
use crate::master::{MasterConnection, MasterError};
use crate::registry::{self, SessionHandle, SessionId};
use crate::retry;
use crate::session::parser::Classified;
use crate::session::state::{ClientState, HandoffFlag};

/// Enough input buffer for `DONE\r\n<tag> IDLE\r\n` with a 128-byte tag.
pub const MAX_INBUF: usize = 12 + 1 + 128;
/// Enough output buffer for a keepalive plus an idle-completed echo.
pub const MAX_OUTBUF: usize = 1024;

const STILL_HERE_TEXT: &[u8] = b"* OK Still here\r\n";
const CLIENT_BUFFER_FULL_ERROR: &str = "Client output buffer is full";
const CLIENT_UNHIBERNATE_ERROR: &str = "Failed to unhibernate client";
const SHUTTING_DOWN_MSG: &str = "Shutting down";
const USER_KICKED_MSG: &str = "Kicked";

/// Commands other tasks may send a session.
#[derive(Debug)]
pub enum SessionCmd {
    Kick { shutdown: bool },
    TryUnhibernate { done: oneshot::Sender<RetryOutcome> },
}

/// What a retried session tells the scheduler about its attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Handed off or destroyed; drop it from the queue.
    Finished,
    /// Master still busy; it stays queued.
    Deferred,
}

/// How a session's task ends.
enum Ending {
    /// The worker owns the descriptor now; deregister quietly.
    Handoff,
    /// Destroyed for a reason worth a log line; our descriptor handle is
    /// dropped (and half-shutdown first if it was already passed on).
    Closed(String),
}

enum MoveBack {
    Finished(Ending),
    Deferred,
}

enum Action {
    Wait,
    Bad,
    Done(usize),
    Refresh(String),
}

enum OutputError {
    Io(io::Error),
    Full,
}

struct NotifyFd {
    fd: AsyncFd<OwnedFd>,
    /// Cleared after the first readable edge; a notification only needs
    /// to fire once and is never read here.
    armed: bool,
}

pub struct Session {
    id: SessionId,
    core: Arc<Core>,
    state: ClientState,
    conn_guid: String,
    socket: AsyncFd<OwnedFd>,
    notify_fds: Vec<NotifyFd>,
    cmd_tx: mpsc::Sender<SessionCmd>,
    cmd_rx: mpsc::Receiver<SessionCmd>,

    input: Vec<u8>,
    output: Vec<u8>,
    next_read_threshold: usize,

    created_wall: SystemTime,
    created: Instant,
    keepalive_interval: Duration,
    keepalive_at: Option<Instant>,

    move_back_start: Option<Instant>,
    input_pending: bool,
    idle_done: bool,
    bad_done: bool,
    shutdown_fd_on_destroy: bool,
    watch_client: bool,
    anvil_sent: bool,

    bytes_in: u64,
    bytes_out: u64,
}

impl Session {
    /// Register a freshly handed-over client and start its task. The
    /// first descriptor is the client socket; the rest are notification
    /// descriptors whose readability must wake the session up.
    pub async fn spawn(
        core: Arc<Core>,
        client_fd: OwnedFd,
        state: ClientState,
        notify_fds: Vec<OwnedFd>,
    ) -> anyhow::Result<SessionId> {
        fdpass::set_nonblocking(&client_fd)?;
        for fd in &notify_fds {
            fdpass::set_nonblocking(fd)?;
        }
        let socket = AsyncFd::new(client_fd)?;
        let notify_fds = notify_fds
            .into_iter()
            .map(|fd| AsyncFd::new(fd).map(|fd| NotifyFd { fd, armed: true }))
            .collect::<io::Result<Vec<_>>>()?;

        let id = core.registry.allocate_id();
        let conn_guid = registry::generate_conn_guid();
        let log_prefix = logprefix::expand(&core.config.mail_log_prefix, &state);
        let anvil_sent = core
            .accounting
            .connect(&state.username, anvil::SERVICE_NAME, state.remote_ip, &conn_guid)
            .await;

        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        core.registry.insert(
            id,
            SessionHandle {
                username: state.username.clone(),
                conn_guid: conn_guid.clone(),
                tx: cmd_tx.clone(),
            },
        );

        let keepalive_interval = state
            .idle_notify_interval
            .unwrap_or_else(|| core.config.idle_notify_interval());
        let mut session = Session {
            id,
            core,
            state,
            conn_guid,
            socket,
            notify_fds,
            cmd_tx,
            cmd_rx,
            input: Vec::with_capacity(MAX_INBUF),
            output: Vec::with_capacity(MAX_OUTBUF),
            next_read_threshold: 0,
            created_wall: SystemTime::now(),
            created: Instant::now(),
            keepalive_interval,
            keepalive_at: None,
            move_back_start: None,
            input_pending: false,
            idle_done: false,
            bad_done: false,
            shutdown_fd_on_destroy: false,
            watch_client: true,
            anvil_sent,

            bytes_in: 0,
            bytes_out: 0,
        };
        session.arm_keepalive();

        let span = tracing::info_span!("client", prefix = %log_prefix);
        tokio::spawn(session.run().instrument(span));
        Ok(id)
    }

    async fn run(mut self) {
        tracing::debug!(
            user = %self.state.username,
            idle = self.state.idle_cmd,
            notify_fds = self.notify_fds.len(),
            "client hibernated"
        );
        let ending = self.hibernate().await;
        self.finish(ending).await;
    }

    /// The event loop of one hibernated session. Runs until the session
    /// is handed off or destroyed.
    async fn hibernate(&mut self) -> Ending {
        loop {
            let mut rbuf = [0u8; MAX_INBUF];
            let room = MAX_INBUF - self.input.len();
            tokio::select! {
                maybe_cmd = self.cmd_rx.recv() => {
                    match maybe_cmd {
                        Some(SessionCmd::Kick { shutdown }) => return self.kicked(shutdown),
                        Some(SessionCmd::TryUnhibernate { done }) => {
                            match self.try_move_back().await {
                                MoveBack::Finished(ending) => {
                                    let _ = done.send(RetryOutcome::Finished);
                                    return ending;
                                }
                                MoveBack::Deferred => {
                                    let _ = done.send(RetryOutcome::Deferred);
                                }
                            }
                        }
                        None => continue,
                    }
                }
                result = Self::read_ready(&self.socket, &mut rbuf[..room.max(1)]),
                        if self.watch_client => {
                    match result {
                        Err(err) => return self.disconnected(&err),
                        Ok(0) => return Ending::Closed("Connection closed".to_string()),
                        Ok(n) => {
                            if room == 0 {
                                return Ending::Closed(
                                    "Connection closed: read buffer full".to_string(),
                                );
                            }
                            self.input.extend_from_slice(&rbuf[..n]);
                            self.bytes_in += n as u64;
                            if let Some(ending) = self.handle_client_input().await {
                                return ending;
                            }
                        }
                    }
                }
                i = Self::notify_ready(&self.notify_fds) => {
                    self.notify_fds[i].armed = false;
                    tracing::debug!("change notification, waking the session up");
                    if let Some(ending) = self.move_back().await {
                        return ending;
                    }
                }
                _ = sleep_opt(self.keepalive_at) => {
                    if let Some(ending) = self.keepalive_fire() {
                        return ending;
                    }
                }
                result = Self::flush_ready(&self.socket, &mut self.output),
                        if !self.output.is_empty() => {
                    if let Err(err) = result {
                        return self.disconnected(&err);
                    }
                }
            }
        }
    }

    async fn handle_client_input(&mut self) -> Option<Ending> {
        if !self.state.idle_cmd {
            // not inside IDLE: whatever this is, a worker has to parse it
            self.input_pending = true;
            return self.move_back().await;
        }
        if self.input.len() <= self.next_read_threshold {
            return None;
        }
        self.next_read_threshold = 0;

        let action = match parser::classify(&self.input) {
            Classified::NeedMore => Action::Wait,
            Classified::Bad => Action::Bad,
            Classified::DoneLf => Action::Done(5),
            Classified::DoneCrlf => Action::Done(6),
            Classified::DoneIdle { tag } => {
                Action::Refresh(String::from_utf8_lossy(tag).into_owned())
            }
        };
        match action {
            Action::Wait => {
                self.next_read_threshold = self.input.len();
                None
            }
            Action::Bad => {
                // hand the invalid input to the worker for the error reply
                self.bad_done = true;
                self.idle_done = true;
                self.input_pending = true;
                self.move_back().await
            }
            Action::Done(skip) => {
                self.input.drain(..skip);
                self.idle_done = true;
                self.input_pending = true;
                self.move_back().await
            }
            Action::Refresh(new_tag) => {
                // DONE plus a fresh IDLE: answer directly and stay
                // hibernated, which spares a worker round-trip
                let old_tag = self.state.tag.replace(new_tag).unwrap_or_default();
                let reply = format!("{} OK Idle completed.\r\n+ idling\r\n", old_tag);
                if let Err(err) = self.flush_output() {
                    return Some(self.disconnected(&err));
                }
                if !self.output.is_empty() {
                    return Some(Ending::Closed(CLIENT_BUFFER_FULL_ERROR.to_string()));
                }
                match self.queue_output(reply.as_bytes()) {
                    Ok(()) => (),
                    Err(OutputError::Io(err)) => return Some(self.disconnected(&err)),
                    Err(OutputError::Full) => {
                        return Some(Ending::Closed(CLIENT_BUFFER_FULL_ERROR.to_string()))
                    }
                }
                self.input.clear();
                self.arm_keepalive();
                None
            }
        }
    }

    /// Try to hand the session back to a worker, queueing a retry when the
    /// master socket is busy.
    async fn move_back(&mut self) -> Option<Ending> {
        match self.try_move_back().await {
            MoveBack::Finished(ending) => Some(ending),
            MoveBack::Deferred => {
                let start = match self.move_back_start {
                    Some(start) => start,
                    None => {
                        let now = Instant::now();
                        self.move_back_start = Some(now);
                        now
                    }
                };
                let deadline = retry::move_back_deadline(start, self.input_pending);
                self.core
                    .retry
                    .enqueue(self.id, deadline, self.cmd_tx.clone());
                if self.input_pending {
                    // the pending bytes would wake us over and over; the
                    // retry tick drives us from here on
                    self.watch_client = false;
                }
                None
            }
        }
    }

    async fn try_move_back(&mut self) -> MoveBack {
        if !self.output.is_empty() {
            // cannot hand over a client with writes still in flight
            return MoveBack::Finished(Ending::Closed(CLIENT_BUFFER_FULL_ERROR.to_string()));
        }
        let path = self.core.config.master_socket_path();
        let mut conn = match MasterConnection::connect(&path).await {
            Ok(conn) => conn,
            Err(MasterError::Busy(err)) => {
                if self.move_back_deadline_reached() {
                    return MoveBack::Finished(self.unhibernate_failed(&format!(
                        "connect({}) failed: {}",
                        path.display(),
                        err
                    )));
                }
                tracing::debug!(error = %err, "unhibernation failed, retrying");
                return MoveBack::Deferred;
            }
            Err(MasterError::Permanent(msg)) => {
                return MoveBack::Finished(self.unhibernate_failed(&msg))
            }
        };

        let record = self.state.build_master_record(
            self.created_wall,
            &self.input,
            self.handoff_flag(),
            self.bytes_in,
            self.bytes_out,
        );
        if let Err(err) = conn.send_fd(record.as_bytes(), self.raw_fd()).await {
            return MoveBack::Finished(self.unhibernate_failed(&err.to_string()));
        }
        // From here on a worker may hold the descriptor: if this still
        // fails, the fd must be half-closed on destroy so the worker sees
        // a dead connection instead of finishing the handoff in silence.
        self.shutdown_fd_on_destroy = true;
        if let Err(err) = conn.send_rest(record.as_bytes()).await {
            return MoveBack::Finished(self.unhibernate_failed(&err.to_string()));
        }

        self.core.retry.remove(self.id);
        self.keepalive_at = None;
        self.await_reply(&mut conn).await
    }

    async fn await_reply(&mut self, conn: &mut MasterConnection) -> MoveBack {
        let deadline = self.move_back_start.unwrap_or_else(Instant::now)
            + retry::move_back_timeout(self.input_pending);
        loop {
            tokio::select! {
                reply = conn.read_reply() => {
                    return match reply {
                        Ok(line) if line.starts_with('+') => {
                            self.shutdown_fd_on_destroy = false;
                            MoveBack::Finished(Ending::Handoff)
                        }
                        Ok(line) => {
                            let error = line.get(1..).unwrap_or("").trim();
                            MoveBack::Finished(self.unhibernate_failed(error))
                        }
                        Err(err) => MoveBack::Finished(self.unhibernate_failed(&err.to_string())),
                    };
                }
                maybe_cmd = self.cmd_rx.recv() => {
                    match maybe_cmd {
                        Some(SessionCmd::Kick { shutdown }) => {
                            return MoveBack::Finished(self.kicked(shutdown));
                        }
                        Some(SessionCmd::TryUnhibernate { done }) => {
                            let _ = done.send(RetryOutcome::Deferred);
                        }
                        None => (),
                    }
                }
                _ = time::sleep_until(deadline) => {
                    return MoveBack::Finished(
                        self.unhibernate_failed("timed out waiting for imap-master reply"),
                    );
                }
            }
        }
    }

    fn handoff_flag(&self) -> HandoffFlag {
        if self.idle_done {
            if self.bad_done {
                HandoffFlag::BadDone
            } else {
                HandoffFlag::None
            }
        } else if self.state.idle_cmd {
            HandoffFlag::IdleContinue
        } else {
            HandoffFlag::None
        }
    }

    fn move_back_deadline_reached(&self) -> bool {
        match self.move_back_start {
            Some(start) => start.elapsed() > retry::move_back_timeout(self.input_pending),
            None => false,
        }
    }

    fn unhibernate_failed(&self, error: &str) -> Ending {
        tracing::error!(
            hibernation_usecs = self.created.elapsed().as_micros() as u64,
            error = %error,
            "{}", CLIENT_UNHIBERNATE_ERROR
        );
        Ending::Closed(CLIENT_UNHIBERNATE_ERROR.to_string())
    }

    fn kicked(&mut self, shutdown: bool) -> Ending {
        let _ = self.flush_output();
        let _ = fdpass::fd_write(self.raw_fd(), b"* BYE Shutting down.\r\n");
        let reason = if shutdown {
            SHUTTING_DOWN_MSG
        } else {
            USER_KICKED_MSG
        };
        Ending::Closed(reason.to_string())
    }

    fn keepalive_fire(&mut self) -> Option<Ending> {
        if !self.output.is_empty() {
            if let Err(err) = self.flush_output() {
                return Some(self.disconnected(&err));
            }
            if !self.output.is_empty() {
                // client is slow; skip this round
                self.arm_keepalive();
                return None;
            }
        }
        match self.queue_output(STILL_HERE_TEXT) {
            Ok(()) => {
                self.arm_keepalive();
                None
            }
            Err(OutputError::Io(err)) => Some(self.disconnected(&err)),
            Err(OutputError::Full) => Some(Ending::Closed(CLIENT_BUFFER_FULL_ERROR.to_string())),
        }
    }

    fn arm_keepalive(&mut self) {
        if self.keepalive_interval.is_zero() {
            self.keepalive_at = None;
            return;
        }
        let msecs = keepalive::next_keepalive_msecs(
            &self.state.username,
            self.state.remote_ip,
            self.keepalive_interval,
        );
        self.keepalive_at = Some(Instant::now() + Duration::from_millis(msecs));
    }

    /// Write directly if possible, buffering the remainder. Accepting the
    /// bytes (written or buffered) counts them as client output.
    fn queue_output(&mut self, data: &[u8]) -> Result<(), OutputError> {
        let mut written = 0;
        if self.output.is_empty() {
            match fdpass::fd_write(self.raw_fd(), data) {
                Ok(n) => written = n,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => (),
                Err(err) => return Err(OutputError::Io(err)),
            }
        }
        let rest = &data[written..];
        if self.output.len() + rest.len() > MAX_OUTBUF {
            return Err(OutputError::Full);
        }
        self.output.extend_from_slice(rest);
        self.bytes_out += data.len() as u64;
        Ok(())
    }

    fn flush_output(&mut self) -> io::Result<()> {
        while !self.output.is_empty() {
            match fdpass::fd_write(self.raw_fd(), &self.output) {
                Ok(0) => break,
                Ok(n) => {
                    self.output.drain(..n);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    fn disconnected(&self, err: &io::Error) -> Ending {
        Ending::Closed(format!("Connection closed: {}", err))
    }

    fn raw_fd(&self) -> RawFd {
        self.socket.get_ref().as_raw_fd()
    }

    /// Tear the session down. Always: deregister, dequeue, account the
    /// disconnect, and drop our descriptor handles. The descriptor is
    /// half-closed first if it was passed to a worker whose reply never
    /// confirmed the handoff.
    async fn finish(self, ending: Ending) {
        if let Ending::Closed(reason) = &ending {
            if self.state.stats.is_empty() {
                tracing::info!("Disconnected: {}", reason);
            } else {
                tracing::info!("Disconnected: {} {}", reason, self.state.stats);
            }
        }
        if self.anvil_sent {
            self.core
                .accounting
                .disconnect(
                    &self.state.username,
                    anvil::SERVICE_NAME,
                    self.state.remote_ip,
                    &self.conn_guid,
                )
                .await;
        }
        self.core.retry.remove(self.id);
        self.core.registry.remove(self.id);
        if self.shutdown_fd_on_destroy {
            if let Err(err) = fdpass::shutdown_rdwr(self.raw_fd()) {
                tracing::error!(error = %err, "shutdown() failed");
            }
        }
        // dropping the session closes our handle on the client socket;
        // after a successful handoff the worker keeps its own duplicate
    }

    async fn read_ready(fd: &AsyncFd<OwnedFd>, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = fd.readable().await?;
            match guard.try_io(|inner| fdpass::fd_read(inner.get_ref().as_raw_fd(), buf)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    async fn flush_ready(fd: &AsyncFd<OwnedFd>, output: &mut Vec<u8>) -> io::Result<()> {
        loop {
            let mut guard = fd.writable().await?;
            match guard.try_io(|inner| fdpass::fd_write(inner.get_ref().as_raw_fd(), output)) {
                Ok(result) => {
                    let n = result?;
                    output.drain(..n);
                    return Ok(());
                }
                Err(_would_block) => continue,
            }
        }
    }

    async fn notify_ready(notify_fds: &[NotifyFd]) -> usize {
        let armed: Vec<_> = notify_fds
            .iter()
            .enumerate()
            .filter(|(_, notify)| notify.armed)
            .map(|(i, notify)| {
                Box::pin(async move {
                    let _ = notify.fd.readable().await;
                    i
                })
            })
            .collect();
        if armed.is_empty() {
            return futures::future::pending().await;
        }
        let (i, _, _) = futures::future::select_all(armed).await;
        i
    }
}

async fn sleep_opt(at: Option<Instant>) {
    match at {
        Some(at) => time::sleep_until(at).await,
        None => futures::future::pending().await,
    }
}
