//! Port pool for hosted instances.
//!
//! Ports come from a bounded inclusive range configured at startup. Leasing always
//! hands out the lowest free port so allocation is reproducible, and every lease
//! carries an id so a stale release can never free a port that was re-leased to
//! someone else in the meantime.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::error::{HostError, HostResult};

/// Inclusive port range configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortRange {
    /// First port of the range.
    pub start: u16,
    /// Last port of the range (inclusive).
    pub end: u16,
    /// Skip ports that a foreign process already has bound.
    pub probe: bool,
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            start: 17001,
            end: 17101,
            probe: true,
        }
    }
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Self {
        Self {
            start,
            end,
            probe: false,
        }
    }

    /// Number of ports in the range.
    pub fn len(&self) -> usize {
        if self.end < self.start {
            0
        } else {
            usize::from(self.end - self.start) + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, port: u16) -> bool {
        port >= self.start && port <= self.end
    }
}

/// Exclusive ownership of one port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortLease {
    port: u16,
    id: u64,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }
}

#[derive(Debug, Default)]
struct PoolState {
    free: BTreeSet<u16>,
    /// port -> lease id
    leased: HashMap<u16, u64>,
    next_id: u64,
}

/// Bounded pool of ports.
#[derive(Debug)]
pub struct PortPool {
    range: PortRange,
    state: Mutex<PoolState>,
}

impl PortPool {
    /// Create a pool with every port of the range free.
    pub fn new(range: PortRange) -> Self {
        let free = if range.is_empty() {
            BTreeSet::new()
        } else {
            (range.start..=range.end).collect()
        };

        Self {
            range,
            state: Mutex::new(PoolState {
                free,
                leased: HashMap::new(),
                next_id: 1,
            }),
        }
    }

    pub fn range(&self) -> &PortRange {
        &self.range
    }

    fn state(&self) -> MutexGuard<'_, PoolState> {
        // Every critical section leaves the sets consistent, so a poisoned lock is usable.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Lease the lowest free port.
    ///
    /// Never blocks: an empty pool is reported as `PoolExhausted` and the caller
    /// decides whether to retry.
    pub fn lease(&self) -> HostResult<PortLease> {
        let mut state = self.state();

        let candidate = state
            .free
            .iter()
            .copied()
            .find(|&port| !self.range.probe || is_port_available(port));

        let Some(port) = candidate else {
            return Err(HostError::PoolExhausted);
        };

        state.free.remove(&port);
        let id = state.next_id;
        state.next_id += 1;
        state.leased.insert(port, id);

        debug!("Leased port {} (lease {})", port, id);
        Ok(PortLease { port, id })
    }

    /// Return a lease to the pool.
    ///
    /// Idempotent: releasing twice, or releasing a lease whose port has since been
    /// handed to a newer lease, is a no-op.
    pub fn release(&self, lease: PortLease) {
        let mut state = self.state();

        match state.leased.get(&lease.port) {
            Some(&id) if id == lease.id => {
                state.leased.remove(&lease.port);
                state.free.insert(lease.port);
                debug!("Released port {} (lease {})", lease.port, lease.id);
            }
            Some(&id) => {
                warn!(
                    "Ignoring stale release of port {} (lease {}, current lease {})",
                    lease.port, lease.id, id
                );
            }
            None => {
                debug!("Port {} already released", lease.port);
            }
        }
    }

    pub fn is_leased(&self, port: u16) -> bool {
        self.state().leased.contains_key(&port)
    }

    pub fn free_count(&self) -> usize {
        self.state().free.len()
    }

    pub fn leased_count(&self) -> usize {
        self.state().leased.len()
    }
}

/// Check if a port is available for binding.
pub fn is_port_available(port: u16) -> bool {
    std::net::TcpListener::bind(("0.0.0.0", port)).is_ok()
}
