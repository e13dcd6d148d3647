//! Keepalive scheduling. Each hibernated session periodically writes
//! `* OK Still here` so NAT mappings and dumb middleboxes keep the
//! connection alive. The interval is perturbed deterministically per
//! (username, remote IP) so a fleet of clients does not wake in lockstep,
//! while any single client keeps a fixed phase inside the base interval.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Milliseconds until the next keepalive for this client, computed against
/// the given wall clock (unix milliseconds). The result is in
/// `(0, interval]` and lands on the client's phase boundary.
pub fn interval_msecs(
    username: &str,
    remote_ip: Option<IpAddr>,
    interval: Duration,
    now_unix_ms: u64,
) -> u64 {
    let interval_ms = (interval.as_millis() as u64).max(1);
    let mut hasher = DefaultHasher::new();
    username.hash(&mut hasher);
    if let Some(ip) = remote_ip {
        ip.hash(&mut hasher);
    }
    let phase = hasher.finish() % interval_ms;
    let since_phase = (now_unix_ms + interval_ms - phase) % interval_ms;
    interval_ms - since_phase
}

pub fn next_keepalive_msecs(username: &str, remote_ip: Option<IpAddr>, interval: Duration) -> u64 {
    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    interval_msecs(username, remote_ip, interval, now_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERVAL: Duration = Duration::from_secs(120);

    #[test]
    fn result_is_within_the_interval() {
        for now in [0u64, 1, 59_999, 120_000, 7_777_777] {
            let ms = interval_msecs("alice@example.com", None, INTERVAL, now);
            assert!(ms > 0 && ms <= 120_000, "got {} at now={}", ms, now);
        }
    }

    #[test]
    fn deterministic_for_a_given_client_and_instant() {
        let ip: IpAddr = "192.0.2.7".parse().unwrap();
        let a = interval_msecs("bob", Some(ip), INTERVAL, 1_000_000);
        let b = interval_msecs("bob", Some(ip), INTERVAL, 1_000_000);
        assert_eq!(a, b);
    }

    #[test]
    fn keeps_a_fixed_phase_across_windows() {
        let ip: IpAddr = "192.0.2.7".parse().unwrap();
        let now = 5_000_000u64;
        let first = interval_msecs("bob", Some(ip), INTERVAL, now);
        // firing at now+first and asking again must yield a full interval
        let second = interval_msecs("bob", Some(ip), INTERVAL, now + first);
        assert_eq!(second, 120_000);
    }

    #[test]
    fn different_users_get_different_phases() {
        let now = 42_000u64;
        let phases: Vec<u64> = ["a", "b", "c", "d", "e", "f", "g", "h"]
            .iter()
            .map(|u| interval_msecs(u, None, INTERVAL, now))
            .collect();
        let first = phases[0];
        assert!(
            phases.iter().any(|p| *p != first),
            "all users hashed to the same phase: {:?}",
            phases
        );
    }
}
