//! Brute-force protection shared by both SSH endpoints.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::config::DenyListConfig;

pub trait DenyList: Send + Sync {
    fn record_failure(&self, ip: IpAddr);
    fn is_blocked(&self, ip: IpAddr) -> bool;
}

#[derive(Debug, Clone, Copy)]
struct Strikes {
    failures: u32,
    /// Start of the current counting window, or of the ban once blocked.
    since: Instant,
}

/// Counts failures per address; `max_failures` within `ban` blocks the
/// address for `ban`.
pub struct InMemoryDenyList {
    max_failures: u32,
    ban: Duration,
    entries: Mutex<Entries>,
}

struct Entries {
    by_ip: HashMap<IpAddr, Strikes>,
    last_pruned: Instant,
}

impl InMemoryDenyList {
    pub fn new(config: &DenyListConfig) -> Self {
        Self::with_window(config.max_failures, Duration::from_secs(config.ban_secs))
    }

    pub fn with_window(max_failures: u32, ban: Duration) -> Self {
        Self {
            max_failures: max_failures.max(1),
            ban,
            entries: Mutex::new(Entries {
                by_ip: HashMap::new(),
                last_pruned: Instant::now(),
            }),
        }
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.entries.lock().map_or(0, |e| e.by_ip.len())
    }
}

impl DenyList for InMemoryDenyList {
    fn record_failure(&self, ip: IpAddr) {
        let now = Instant::now();
        let Ok(mut entries) = self.entries.lock() else {
            return;
        };
        // At most one sweep per ban window
        if now.duration_since(entries.last_pruned) >= self.ban {
            let ban = self.ban;
            entries.by_ip.retain(|_, s| now.duration_since(s.since) < ban);
            entries.last_pruned = now;
        }
        let strikes = entries.by_ip.entry(ip).or_insert(Strikes {
            failures: 0,
            since: now,
        });
        if now.duration_since(strikes.since) >= self.ban {
            *strikes = Strikes {
                failures: 0,
                since: now,
            };
        }
        if strikes.failures >= self.max_failures {
            return;
        }
        strikes.failures += 1;
        if strikes.failures == self.max_failures {
            strikes.since = now;
            warn!(%ip, "Blocking address after {} failed authentications", strikes.failures);
        }
    }

    fn is_blocked(&self, ip: IpAddr) -> bool {
        let Ok(mut entries) = self.entries.lock() else {
            return false;
        };
        let Some(strikes) = entries.by_ip.get(&ip).copied() else {
            return false;
        };
        if strikes.since.elapsed() >= self.ban {
            entries.by_ip.remove(&ip);
            return false;
        }
        strikes.failures >= self.max_failures
    }
}
