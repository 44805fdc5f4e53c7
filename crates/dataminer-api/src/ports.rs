//! Random port allocation within the configured range.
//!
//! Ports are sampled uniformly; a candidate is skipped when the registry
//! already holds it or when binding fails. Sampling gives up after
//! `PORT_SAMPLE_FACTOR x range size` attempts so an exhausted range reports
//! quickly instead of spinning.

use std::net::TcpListener;

use dataminer_core::defaults::PORT_SAMPLE_FACTOR;
use dataminer_core::{Error, PortRange, Result};
use rand::Rng;
use tracing::trace;

#[derive(Debug, Clone)]
pub struct PortAllocator {
    range: PortRange,
    host: String,
}

impl PortAllocator {
    pub fn new(range: PortRange, host: impl Into<String>) -> Self {
        Self {
            range,
            host: host.into(),
        }
    }

    pub fn range(&self) -> PortRange {
        self.range
    }

    /// Bind a listener on a free port not rejected by `taken`.
    pub fn allocate(&self, taken: impl Fn(u16) -> bool) -> Result<TcpListener> {
        if self.range.is_empty() {
            return Err(self.exhausted());
        }
        let attempts = self.range.len().saturating_mul(PORT_SAMPLE_FACTOR);
        let mut rng = rand::thread_rng();
        for _ in 0..attempts {
            let port = rng.gen_range(self.range.start()..=self.range.end());
            if taken(port) {
                continue;
            }
            match TcpListener::bind((self.host.as_str(), port)) {
                Ok(listener) => return Ok(listener),
                Err(e) => trace!(port, error = %e, "Port unavailable"),
            }
        }
        Err(self.exhausted())
    }

    fn exhausted(&self) -> Error {
        Error::PortExhausted {
            start: self.range.start(),
            end: self.range.end(),
        }
    }
}
