//! Reverse port pair candidates.
//!
//! A pair is `(p, p + 1)` with `p` stepping by 2 from the bottom of the
//! configured range. [`PortAllocator::is_free`] binds both ports on the
//! loopback host and releases them immediately. That probe only filters out
//! ports something else on the machine holds. The reservation itself is the
//! insert into the session registry's port index.

use std::net::TcpListener;

#[derive(Debug, Clone)]
pub struct PortAllocator {
    min: u16,
    max: u16,
    bind_host: String,
    probe: bool,
}

impl PortAllocator {
    /// Pairs in `[min, max)`.
    pub fn new(min: u16, max: u16, bind_host: impl Into<String>) -> Self {
        Self {
            min,
            max,
            bind_host: bind_host.into(),
            probe: true,
        }
    }

    /// Allocator that trusts the registry alone (no bind probe).
    #[cfg(test)]
    pub fn unprobed(min: u16, max: u16) -> Self {
        Self {
            probe: false,
            ..Self::new(min, max, "127.0.0.1")
        }
    }

    pub fn range(&self) -> (u16, u16) {
        (self.min, self.max)
    }

    /// First port of every pair that fits entirely inside the range.
    pub fn candidates(&self) -> impl Iterator<Item = u16> {
        (self.min..self.max.saturating_sub(1)).step_by(2)
    }

    /// Bind-probe both ports of the pair starting at `port`.
    pub fn is_free(&self, port: u16) -> bool {
        if !self.probe {
            return true;
        }
        let Some(http_port) = port.checked_add(1) else {
            return false;
        };
        let host = self.bind_host.as_str();
        // Both listeners are dropped at the end of this expression
        TcpListener::bind((host, port)).is_ok() && TcpListener::bind((host, http_port)).is_ok()
    }
}
