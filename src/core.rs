//! The shared context handle: configuration plus the process-wide session
//! registry, retry queue and accounting client. Passed explicitly to every
//! task instead of living in globals.

use std::sync::Arc;

use crate::anvil::ArcAccounting;
use crate::config::HibernateConfig;
use crate::registry::Registry;
use crate::retry::RetryQueue;

pub struct Core {
    pub config: HibernateConfig,
    pub registry: Registry,
    pub retry: Arc<RetryQueue>,
    pub accounting: ArcAccounting,
}

impl Core {
    pub fn new(config: HibernateConfig, accounting: ArcAccounting) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry: Registry::new(),
            retry: RetryQueue::new(),
            accounting,
        })
    }
}
