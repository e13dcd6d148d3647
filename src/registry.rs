//! Process-wide registry of hibernated sessions. Every cross-session
//! operation (administrative kick, graceful shutdown) goes through the
//! command sender registered here; the session itself stays the single
//! owner of its state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::mpsc;

use crate::session::SessionCmd;

pub type SessionId = u64;

pub struct SessionHandle {
    pub username: String,
    pub conn_guid: String,
    pub tx: mpsc::Sender<SessionCmd>,
}

#[derive(Default)]
pub struct Registry {
    sessions: Mutex<HashMap<SessionId, SessionHandle>>,
    next_id: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate_id(&self) -> SessionId {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn insert(&self, id: SessionId, handle: SessionHandle) {
        self.sessions
            .lock()
            .expect("session registry poisoned")
            .insert(id, handle);
    }

    pub fn remove(&self, id: SessionId) -> Option<SessionHandle> {
        self.sessions
            .lock()
            .expect("session registry poisoned")
            .remove(&id)
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().expect("session registry poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Kick every session of `username`. An empty `conn_guid` matches all
    /// of the user's sessions, otherwise only the exact connection.
    /// Returns how many sessions were signalled.
    pub async fn kick_user(&self, username: &str, conn_guid: &str) -> usize {
        let targets = self.collect(|handle| {
            handle.username == username
                && (conn_guid.is_empty() || handle.conn_guid == conn_guid)
        });
        self.kick(targets, false).await
    }

    /// Graceful deinit: kick everything.
    pub async fn kick_all(&self) -> usize {
        let targets = self.collect(|_| true);
        self.kick(targets, true).await
    }

    fn collect(&self, keep: impl Fn(&SessionHandle) -> bool) -> Vec<mpsc::Sender<SessionCmd>> {
        self.sessions
            .lock()
            .expect("session registry poisoned")
            .values()
            .filter(|handle| keep(handle))
            .map(|handle| handle.tx.clone())
            .collect()
    }

    async fn kick(&self, targets: Vec<mpsc::Sender<SessionCmd>>, shutdown: bool) -> usize {
        let mut count = 0;
        for tx in targets {
            if tx.send(SessionCmd::Kick { shutdown }).await.is_ok() {
                count += 1;
            }
        }
        count
    }
}

pub fn generate_conn_guid() -> String {
    format!("{:032x}", rand::random::<u128>())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(username: &str, conn_guid: &str) -> (SessionHandle, mpsc::Receiver<SessionCmd>) {
        let (tx, rx) = mpsc::channel(1);
        (
            SessionHandle {
                username: username.to_string(),
                conn_guid: conn_guid.to_string(),
                tx,
            },
            rx,
        )
    }

    #[tokio::test]
    async fn kick_matches_by_user_and_guid() {
        let registry = Registry::new();
        let (alice1, mut alice1_rx) = handle("alice", "g1");
        let (alice2, mut alice2_rx) = handle("alice", "g2");
        let (bob, mut bob_rx) = handle("bob", "g3");
        registry.insert(registry.allocate_id(), alice1);
        registry.insert(registry.allocate_id(), alice2);
        registry.insert(registry.allocate_id(), bob);

        assert_eq!(registry.kick_user("alice", "g2").await, 1);
        assert!(matches!(
            alice2_rx.try_recv(),
            Ok(SessionCmd::Kick { shutdown: false })
        ));
        assert!(alice1_rx.try_recv().is_err());

        assert_eq!(registry.kick_user("alice", "").await, 2);
        assert!(alice1_rx.try_recv().is_ok());
        assert!(bob_rx.try_recv().is_err());

        assert_eq!(registry.kick_user("nobody", "").await, 0);
    }

    #[tokio::test]
    async fn kick_all_signals_shutdown() {
        let registry = Registry::new();
        let (alice, mut alice_rx) = handle("alice", "g1");
        registry.insert(registry.allocate_id(), alice);
        assert_eq!(registry.kick_all().await, 1);
        assert!(matches!(
            alice_rx.try_recv(),
            Ok(SessionCmd::Kick { shutdown: true })
        ));
    }

    #[test]
    fn conn_guids_are_unique_and_well_formed() {
        let a = generate_conn_guid();
        let b = generate_conn_guid();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }
}
