//! Serialized session state: what a worker hands us when it hibernates a
//! client, and what we hand back to the imap-master socket when the client
//! becomes interesting again. Both directions are single tab-separated,
//! tab-escaped lines; the IMAP-layer state blob is carried as opaque
//! base64 and never interpreted here.

use std::borrow::Cow;
use std::fmt::Write as _;
use std::net::IpAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{ensure, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use crate::escape::{tabescape, tabunescape};

/// Counters the worker accumulated before hibernation, reported back on
/// unhibernation so the final logout log line stays accurate.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LogoutStats {
    pub fetch_hdr_count: u32,
    pub fetch_hdr_bytes: u64,
    pub fetch_body_count: u32,
    pub fetch_body_bytes: u64,
    pub deleted_count: u32,
    pub expunged_count: u32,
    pub trashed_count: u32,
    pub autoexpunged_count: u32,
    pub append_count: u32,
    pub input_bytes_extra: u64,
    pub output_bytes_extra: u64,
}

/// Which protocol situation the handoff record reports to the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandoffFlag {
    /// Client ended IDLE cleanly (or never was in IDLE).
    None,
    /// Client sent something that was not DONE; the worker must answer
    /// with the protocol error.
    BadDone,
    /// Client is still inside IDLE; the worker resumes it after sending
    /// the pending changes.
    IdleContinue,
}

#[derive(Debug, Clone)]
pub struct ClientState {
    pub username: String,
    pub session_id: Option<String>,
    pub session_created: i64,
    pub tag: Option<String>,
    pub local_ip: Option<IpAddr>,
    pub local_port: u16,
    pub remote_ip: Option<IpAddr>,
    pub remote_port: u16,
    pub multiplex_ostream: bool,
    /// Tab-joined `key=value` list, each element individually tab-escaped.
    /// Passed through; only `auth_user` is ever looked up here.
    pub userdb_fields: Option<String>,
    pub peer_dev_major: u64,
    pub peer_dev_minor: u64,
    pub peer_ino: u64,
    /// Opaque serialized IMAP-layer state.
    pub state: Vec<u8>,
    pub logout_stats: LogoutStats,
    /// True when the client was parked inside an IDLE command.
    pub idle_cmd: bool,
    /// Human-readable byte counters for the disconnect log line.
    pub stats: String,
    /// Per-session override of the configured keepalive interval.
    pub idle_notify_interval: Option<Duration>,
}

impl ClientState {
    pub fn new(username: String) -> Self {
        Self {
            username,
            session_id: None,
            session_created: 0,
            tag: None,
            local_ip: None,
            local_port: 0,
            remote_ip: None,
            remote_port: 0,
            multiplex_ostream: false,
            userdb_fields: None,
            peer_dev_major: 0,
            peer_dev_minor: 0,
            peer_ino: 0,
            state: Vec::new(),
            logout_stats: LogoutStats::default(),
            idle_cmd: false,
            stats: String::new(),
            idle_notify_interval: None,
        }
    }

    /// The `auth_user` entry of `userdb_fields`, falling back to the
    /// login username.
    pub fn auth_user(&self) -> Cow<'_, str> {
        if let Some(fields) = &self.userdb_fields {
            for field in fields.split('\t') {
                if let Some(value) = field.strip_prefix("auth_user=") {
                    return Cow::Owned(tabunescape(value));
                }
            }
        }
        Cow::Borrowed(&self.username)
    }

    /// Parse the record a hibernating worker sends on the acceptor socket.
    pub fn parse_handoff(line: &str) -> Result<Self> {
        let mut fields = line.trim_end_matches('\n').split('\t');
        let username = tabunescape(fields.next().unwrap_or(""));
        ensure!(!username.is_empty(), "handoff record has no username");
        let mut state = ClientState::new(username);

        for field in fields {
            let (key, value) = match field.split_once('=') {
                Some((key, value)) => (key, Some(value)),
                None => (field, None),
            };
            match (key, value) {
                ("idle_cmd", None) => state.idle_cmd = true,
                ("multiplex_ostream", None) => state.multiplex_ostream = true,
                ("session", Some(v)) => state.session_id = Some(tabunescape(v)),
                ("session_created", Some(v)) => {
                    state.session_created = v.parse().context("invalid session_created")?
                }
                ("tag", Some(v)) => state.tag = Some(v.to_string()),
                ("lip", Some(v)) => state.local_ip = Some(v.parse().context("invalid lip")?),
                ("lport", Some(v)) => state.local_port = v.parse().context("invalid lport")?,
                ("rip", Some(v)) => state.remote_ip = Some(v.parse().context("invalid rip")?),
                ("rport", Some(v)) => state.remote_port = v.parse().context("invalid rport")?,
                ("userdb_fields", Some(v)) => state.userdb_fields = Some(tabunescape(v)),
                ("peer_dev_major", Some(v)) => {
                    state.peer_dev_major = v.parse().context("invalid peer_dev_major")?
                }
                ("peer_dev_minor", Some(v)) => {
                    state.peer_dev_minor = v.parse().context("invalid peer_dev_minor")?
                }
                ("peer_ino", Some(v)) => state.peer_ino = v.parse().context("invalid peer_ino")?,
                ("state", Some(v)) => {
                    state.state = BASE64.decode(v).context("invalid base64 in state")?
                }
                ("stats", Some(v)) => state.stats = tabunescape(v),
                ("idle_notify_interval", Some(v)) => {
                    let secs: u64 = v.parse().context("invalid idle_notify_interval")?;
                    state.idle_notify_interval = Some(Duration::from_secs(secs));
                }
                ("fetch_hdr_count", Some(v)) => state.logout_stats.fetch_hdr_count = num(v)?,
                ("fetch_hdr_bytes", Some(v)) => state.logout_stats.fetch_hdr_bytes = num(v)?,
                ("fetch_body_count", Some(v)) => state.logout_stats.fetch_body_count = num(v)?,
                ("fetch_body_bytes", Some(v)) => state.logout_stats.fetch_body_bytes = num(v)?,
                ("deleted_count", Some(v)) => state.logout_stats.deleted_count = num(v)?,
                ("expunged_count", Some(v)) => state.logout_stats.expunged_count = num(v)?,
                ("trashed_count", Some(v)) => state.logout_stats.trashed_count = num(v)?,
                ("autoexpunged_count", Some(v)) => {
                    state.logout_stats.autoexpunged_count = num(v)?
                }
                ("append_count", Some(v)) => state.logout_stats.append_count = num(v)?,
                ("input_bytes_extra", Some(v)) => state.logout_stats.input_bytes_extra = num(v)?,
                ("output_bytes_extra", Some(v)) => {
                    state.logout_stats.output_bytes_extra = num(v)?
                }
                (other, _) => {
                    tracing::debug!(field = other, "ignoring unknown handoff field");
                }
            }
        }

        if state.idle_cmd {
            ensure!(state.tag.is_some(), "idle_cmd handoff without a tag");
        }
        Ok(state)
    }

    /// The record a worker would send to hand this session over to us.
    /// This is the exact inverse of [`ClientState::parse_handoff`].
    pub fn to_handoff_line(&self) -> String {
        let mut r = String::with_capacity(256);
        r.push_str(&tabescape(&self.username));
        if let Some(session) = &self.session_id {
            r.push_str("\tsession=");
            r.push_str(&tabescape(session));
        }
        if self.session_created != 0 {
            let _ = write!(r, "\tsession_created={}", self.session_created);
        }
        if let Some(tag) = &self.tag {
            let _ = write!(r, "\ttag={}", tag);
        }
        self.append_endpoints(&mut r);
        if self.multiplex_ostream {
            r.push_str("\tmultiplex_ostream");
        }
        if let Some(fields) = &self.userdb_fields {
            r.push_str("\tuserdb_fields=");
            r.push_str(&tabescape(fields));
        }
        self.append_peer(&mut r);
        if !self.state.is_empty() {
            r.push_str("\tstate=");
            r.push_str(&BASE64.encode(&self.state));
        }
        if self.idle_cmd {
            r.push_str("\tidle_cmd");
        }
        if let Some(interval) = self.idle_notify_interval {
            let _ = write!(r, "\tidle_notify_interval={}", interval.as_secs());
        }
        if !self.stats.is_empty() {
            r.push_str("\tstats=");
            r.push_str(&tabescape(&self.stats));
        }
        self.append_logout_stats(&mut r, 0, 0);
        r.push('\n');
        r
    }

    /// The record sent to the imap-master socket to resurrect this session.
    /// `client_input` is whatever the client already sent but the worker
    /// still has to parse; `input_bytes`/`output_bytes` are what this
    /// process read/wrote on the client socket while it was hibernated.
    pub fn build_master_record(
        &self,
        hibernation_started: SystemTime,
        client_input: &[u8],
        flag: HandoffFlag,
        input_bytes: u64,
        output_bytes: u64,
    ) -> String {
        let mut r = String::with_capacity(256);
        r.push_str(&tabescape(&self.username));
        let started = hibernation_started
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let _ = write!(
            r,
            "\thibernation_started={}.{:06}",
            started.as_secs(),
            started.subsec_micros()
        );
        if let Some(session) = &self.session_id {
            r.push_str("\tsession=");
            r.push_str(&tabescape(session));
        }
        if self.session_created != 0 {
            let _ = write!(r, "\tsession_created={}", self.session_created);
        }
        if let Some(tag) = &self.tag {
            let _ = write!(r, "\ttag={}", tag);
        }
        self.append_endpoints(&mut r);
        if self.multiplex_ostream {
            r.push_str("\tmultiplex_ostream");
        }
        if let Some(fields) = &self.userdb_fields {
            r.push_str("\tuserdb_fields=");
            r.push_str(&tabescape(fields));
        }
        self.append_peer(&mut r);
        if !self.state.is_empty() {
            r.push_str("\tstate=");
            r.push_str(&BASE64.encode(&self.state));
        }
        if !client_input.is_empty() {
            r.push_str("\tclient_input=");
            r.push_str(&BASE64.encode(client_input));
        }
        match flag {
            HandoffFlag::None => (),
            HandoffFlag::BadDone => r.push_str("\tbad-done"),
            HandoffFlag::IdleContinue => r.push_str("\tidle-continue"),
        }
        self.append_logout_stats(&mut r, input_bytes, output_bytes);
        r.push('\n');
        r
    }

    fn append_endpoints(&self, r: &mut String) {
        if let Some(ip) = self.local_ip {
            let _ = write!(r, "\tlip={}", ip);
        }
        if self.local_port != 0 {
            let _ = write!(r, "\tlport={}", self.local_port);
        }
        if let Some(ip) = self.remote_ip {
            let _ = write!(r, "\trip={}", ip);
        }
        if self.remote_port != 0 {
            let _ = write!(r, "\trport={}", self.remote_port);
        }
    }

    fn append_peer(&self, r: &mut String) {
        if self.peer_dev_major != 0 || self.peer_dev_minor != 0 {
            let _ = write!(
                r,
                "\tpeer_dev_major={}\tpeer_dev_minor={}",
                self.peer_dev_major, self.peer_dev_minor
            );
        }
        if self.peer_ino != 0 {
            let _ = write!(r, "\tpeer_ino={}", self.peer_ino);
        }
    }

    fn append_logout_stats(&self, r: &mut String, input_bytes: u64, output_bytes: u64) {
        let stats = &self.logout_stats;
        let _ = write!(
            r,
            "\tfetch_hdr_count={}\tfetch_hdr_bytes={}\
             \tfetch_body_count={}\tfetch_body_bytes={}\
             \tdeleted_count={}\texpunged_count={}\ttrashed_count={}\
             \tautoexpunged_count={}\tappend_count={}\
             \tinput_bytes_extra={}\toutput_bytes_extra={}",
            stats.fetch_hdr_count,
            stats.fetch_hdr_bytes,
            stats.fetch_body_count,
            stats.fetch_body_bytes,
            stats.deleted_count,
            stats.expunged_count,
            stats.trashed_count,
            stats.autoexpunged_count,
            stats.append_count,
            input_bytes + stats.input_bytes_extra,
            output_bytes + stats.output_bytes_extra,
        );
    }
}

fn num<T: std::str::FromStr>(v: &str) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    v.parse().context("invalid numeric handoff field")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_state() -> ClientState {
        let mut state = ClientState::new("alice@example.com".to_string());
        state.session_id = Some("sess/with\ttab".to_string());
        state.session_created = 1_700_000_000;
        state.tag = Some("A000".to_string());
        state.local_ip = Some("10.0.0.1".parse().unwrap());
        state.local_port = 143;
        state.remote_ip = Some("203.0.113.5".parse().unwrap());
        state.remote_port = 61234;
        state.multiplex_ostream = true;
        state.userdb_fields = Some("auth_user=alice\tquota_rule=*:storage=1G".to_string());
        state.peer_dev_major = 8;
        state.peer_dev_minor = 1;
        state.peer_ino = 424242;
        state.state = b"\x00\x01imap-state-blob\xff".to_vec();
        state.idle_cmd = true;
        state.stats = "in=12 out=3456".to_string();
        state.idle_notify_interval = Some(Duration::from_secs(90));
        state.logout_stats.fetch_hdr_count = 2;
        state.logout_stats.fetch_body_bytes = 9000;
        state.logout_stats.input_bytes_extra = 10;
        state
    }

    #[test]
    fn handoff_line_round_trips() {
        let state = full_state();
        let line = state.to_handoff_line();
        let parsed = ClientState::parse_handoff(&line).unwrap();
        assert_eq!(parsed.username, state.username);
        assert_eq!(parsed.session_id, state.session_id);
        assert_eq!(parsed.session_created, state.session_created);
        assert_eq!(parsed.tag, state.tag);
        assert_eq!(parsed.local_ip, state.local_ip);
        assert_eq!(parsed.remote_port, state.remote_port);
        assert_eq!(parsed.multiplex_ostream, state.multiplex_ostream);
        assert_eq!(parsed.userdb_fields, state.userdb_fields);
        assert_eq!(parsed.peer_ino, state.peer_ino);
        assert_eq!(parsed.state, state.state);
        assert_eq!(parsed.idle_cmd, state.idle_cmd);
        assert_eq!(parsed.stats, state.stats);
        assert_eq!(parsed.idle_notify_interval, state.idle_notify_interval);
        assert_eq!(parsed.logout_stats, state.logout_stats);
    }

    #[test]
    fn rejects_records_without_username() {
        assert!(ClientState::parse_handoff("\tidle_cmd").is_err());
        assert!(ClientState::parse_handoff("").is_err());
    }

    #[test]
    fn rejects_idle_without_tag() {
        assert!(ClientState::parse_handoff("bob\tidle_cmd").is_err());
        assert!(ClientState::parse_handoff("bob\tidle_cmd\ttag=A1").is_ok());
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let parsed = ClientState::parse_handoff("bob\tfuture_field=1\tother").unwrap();
        assert_eq!(parsed.username, "bob");
    }

    #[test]
    fn master_record_field_order_and_flags() {
        let state = full_state();
        let started = UNIX_EPOCH + Duration::new(1_700_000_100, 123_456_000);
        let record =
            state.build_master_record(started, b"FOO\r\n", HandoffFlag::BadDone, 5, 17);
        assert!(record.starts_with("alice@example.com\thibernation_started=1700000100.123456\t"));
        assert!(record.ends_with("\n"));
        let fields: Vec<&str> = record.trim_end().split('\t').collect();
        let idx = |name: &str| {
            fields
                .iter()
                .position(|f| *f == name || f.starts_with(&format!("{}=", name)))
                .unwrap_or_else(|| panic!("missing field {} in {:?}", name, fields))
        };
        // order prescribed by the control protocol
        assert!(idx("session") < idx("session_created"));
        assert!(idx("session_created") < idx("tag"));
        assert!(idx("tag") < idx("lip"));
        assert!(idx("rport") < idx("multiplex_ostream"));
        assert!(idx("userdb_fields") < idx("peer_dev_major"));
        assert!(idx("state") < idx("client_input"));
        assert!(idx("client_input") < idx("bad-done"));
        assert!(idx("bad-done") < idx("fetch_hdr_count"));
        assert_eq!(fields[idx("client_input")], "client_input=Rk9PDQo=");
        // bytes moved by this process are folded into the extra counters
        assert_eq!(fields[idx("input_bytes_extra")], "input_bytes_extra=15");
        assert_eq!(fields[idx("output_bytes_extra")], "output_bytes_extra=17");
    }

    #[test]
    fn master_record_omits_empty_fields() {
        let state = ClientState::new("bob".to_string());
        let record = state.build_master_record(
            UNIX_EPOCH + Duration::from_secs(1),
            b"",
            HandoffFlag::None,
            0,
            0,
        );
        assert!(!record.contains("session="));
        assert!(!record.contains("tag="));
        assert!(!record.contains("state="));
        assert!(!record.contains("client_input="));
        assert!(!record.contains("bad-done"));
        assert!(!record.contains("idle-continue"));
        assert!(record.contains("\tfetch_hdr_count=0"));
    }

    #[test]
    fn idle_continue_flag() {
        let state = full_state();
        let record = state.build_master_record(
            UNIX_EPOCH + Duration::from_secs(1),
            b"",
            HandoffFlag::IdleContinue,
            0,
            0,
        );
        assert!(record.contains("\tidle-continue\t"));
    }
}
