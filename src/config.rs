use std::io::Read;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::master::MASTER_SOCKET_NAME;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct HibernateConfig {
    /// Directory holding the local sockets shared with the other mail
    /// processes (imap-master, anvil, and our own listeners).
    pub base_dir: PathBuf,

    /// Seconds between `* OK Still here` keepalives; 0 disables them.
    /// Workers may override this per session in the handoff record.
    #[serde(default = "default_idle_notify_interval")]
    pub imap_idle_notify_interval: u64,

    /// Template for the per-session log prefix.
    #[serde(default = "default_mail_log_prefix")]
    pub mail_log_prefix: String,

    /// Override for the handoff listener path (default: `<base_dir>/imap-hibernate`).
    #[serde(default)]
    pub listen: Option<PathBuf>,

    /// Override for the admin listener path (default: `<base_dir>/imap-hibernate-admin`).
    #[serde(default)]
    pub admin: Option<PathBuf>,

    /// Override for the accounting socket path (default: `<base_dir>/anvil`).
    #[serde(default)]
    pub anvil: Option<PathBuf>,
}

impl HibernateConfig {
    pub fn listen_path(&self) -> PathBuf {
        self.listen
            .clone()
            .unwrap_or_else(|| self.base_dir.join("imap-hibernate"))
    }

    pub fn admin_path(&self) -> PathBuf {
        self.admin
            .clone()
            .unwrap_or_else(|| self.base_dir.join("imap-hibernate-admin"))
    }

    pub fn anvil_path(&self) -> PathBuf {
        self.anvil
            .clone()
            .unwrap_or_else(|| self.base_dir.join("anvil"))
    }

    pub fn master_socket_path(&self) -> PathBuf {
        self.base_dir.join(MASTER_SOCKET_NAME)
    }

    pub fn idle_notify_interval(&self) -> Duration {
        Duration::from_secs(self.imap_idle_notify_interval)
    }
}

pub fn read_config(config_file: PathBuf) -> Result<HibernateConfig> {
    let mut file = std::fs::OpenOptions::new()
        .read(true)
        .open(config_file.as_path())?;

    let mut config = String::new();
    file.read_to_string(&mut config)?;

    Ok(toml::from_str(&config)?)
}

fn default_idle_notify_interval() -> u64 {
    120
}

fn default_mail_log_prefix() -> String {
    "imap(%u)<%{session}>: ".into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_gets_defaults() {
        let config: HibernateConfig = toml::from_str("base_dir = \"/run/mail\"").unwrap();
        assert_eq!(config.imap_idle_notify_interval, 120);
        assert_eq!(config.mail_log_prefix, "imap(%u)<%{session}>: ");
        assert_eq!(config.listen_path(), PathBuf::from("/run/mail/imap-hibernate"));
        assert_eq!(
            config.master_socket_path(),
            PathBuf::from("/run/mail/imap-master")
        );
        assert_eq!(config.anvil_path(), PathBuf::from("/run/mail/anvil"));
    }

    #[test]
    fn overrides_win() {
        let config: HibernateConfig = toml::from_str(
            "base_dir = \"/run/mail\"\nimap_idle_notify_interval = 0\nlisten = \"/tmp/hib\"",
        )
        .unwrap();
        assert_eq!(config.imap_idle_notify_interval, 0);
        assert_eq!(config.listen_path(), PathBuf::from("/tmp/hib"));
        assert!(config.idle_notify_interval().is_zero());
    }
}
