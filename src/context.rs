//! Application context: the single ownership anchor for shared services.
//!
//! No process-wide mutable state and no lazy globals; everything hangs off
//! this struct and is passed down by reference.

use std::sync::Arc;

use anyhow::{Context as _, Result};

use crate::capability::CapabilityReport;
use crate::clock::MonotonicClock;
use crate::config::Config;

pub struct ApplicationContext {
    pub config: Config,
    pub caps: Arc<CapabilityReport>,
    pub clock: MonotonicClock,
    pub hostname: String,
}

impl ApplicationContext {
    /// Probe the environment and assemble the context.
    pub fn init(config: Config) -> Result<Self> {
        let caps = Arc::new(CapabilityReport::probe().context("probing kernel capabilities")?);
        let hostname = hostname();

        Ok(Self {
            config,
            caps,
            clock: MonotonicClock::new(),
            hostname,
        })
    }
}

fn hostname() -> String {
    nix::unistd::gethostname()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string())
}
