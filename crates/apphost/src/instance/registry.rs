//! Instance registry: the single source of truth for every key.
//!
//! Transitions are synchronous and atomic per key. The map entry is locked only
//! for the duration of one state-machine step and never across an await, so
//! concurrent transitions on different keys never wait on each other while two
//! requests on the same key are serialized (or rejected with `Busy`).

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use log::{debug, info};

use super::models::{Instance, InstanceEvent, InstanceKey, InstanceState};
use crate::error::{HostError, HostResult};
use crate::supervisor::{PortLease, ProcessHandle};

/// Result of an applied transition.
#[derive(Debug, Clone)]
pub struct TransitionOutcome {
    /// Snapshot after the transition.
    pub instance: Instance,
    /// Lease the caller must hand back to the pool.
    pub released: Option<PortLease>,
}

/// Concurrency-safe map of instance key to instance.
#[derive(Debug, Default)]
pub struct Registry {
    instances: DashMap<InstanceKey, Instance>,
    generations: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the instance for `key`. New instances start out idle in `Pending`.
    pub fn ensure(&self, key: &InstanceKey) -> Instance {
        self.instances
            .entry(key.clone())
            .or_insert_with(|| {
                debug!("Registered instance {}", key);
                Instance::new(key.clone())
            })
            .clone()
    }

    pub fn get(&self, key: &InstanceKey) -> HostResult<Instance> {
        self.instances
            .get(key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| HostError::NotFound(key.to_string()))
    }

    pub fn contains(&self, key: &InstanceKey) -> bool {
        self.instances.contains_key(key)
    }

    /// Snapshot of every instance, ordered by key.
    pub fn list(&self) -> Vec<Instance> {
        let mut all: Vec<Instance> = self.instances.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.key.cmp(&b.key));
        all
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Keys belonging to one repository.
    pub fn keys_for_repository(&self, repository: &str) -> Vec<InstanceKey> {
        let mut keys: Vec<InstanceKey> = self
            .instances
            .iter()
            .filter(|e| e.key().repository() == repository)
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        keys
    }

    /// Running instances with their generation and handle.
    pub fn running(&self) -> Vec<(InstanceKey, u64, ProcessHandle)> {
        self.instances
            .iter()
            .filter(|e| e.state == InstanceState::Running)
            .filter_map(|e| {
                e.process
                    .clone()
                    .map(|handle| (e.key().clone(), e.generation, handle))
            })
            .collect()
    }

    /// Remove a settled instance.
    ///
    /// Only `Stopped`, `Failed` and never-started instances can be removed; anything
    /// holding a port or a process must be stopped first.
    pub fn remove(&self, key: &InstanceKey) -> HostResult<Instance> {
        match self.instances.entry(key.clone()) {
            Entry::Vacant(_) => Err(HostError::NotFound(key.to_string())),
            Entry::Occupied(entry) => {
                let instance = entry.get();
                let removable = matches!(
                    instance.state,
                    InstanceState::Stopped | InstanceState::Failed
                ) || instance.is_idle();
                if !removable {
                    return Err(HostError::Busy(key.to_string()));
                }
                info!("Removed instance {}", key);
                Ok(entry.remove())
            }
        }
    }

    /// Apply one event to the state machine for `key`.
    pub fn transition(&self, key: &InstanceKey, event: InstanceEvent) -> HostResult<TransitionOutcome> {
        let mut entry = self
            .instances
            .get_mut(key)
            .ok_or_else(|| HostError::NotFound(key.to_string()))?;
        let instance = entry.value_mut();
        let from = instance.state;
        let event_name = event.name();

        let invalid = |state: InstanceState| HostError::InvalidTransition {
            key: key.to_string(),
            event: event_name.to_string(),
            state: state.to_string(),
        };

        if let Some(generation) = event.generation() {
            if generation != instance.generation {
                debug!(
                    "Ignoring {} for {} from generation {} (current {})",
                    event_name, key, generation, instance.generation
                );
                return Err(invalid(instance.state));
            }
        }

        let mut released = None;

        match event {
            InstanceEvent::RequestStart => match instance.state {
                InstanceState::Stopped | InstanceState::Failed => {
                    instance.generation = self.next_generation();
                    instance.state = InstanceState::Pending;
                    instance.stop_pending = false;
                }
                InstanceState::Pending if instance.is_idle() => {
                    instance.generation = self.next_generation();
                    instance.stop_pending = false;
                }
                InstanceState::Running => return Err(invalid(instance.state)),
                InstanceState::Pending | InstanceState::Starting | InstanceState::Stopping => {
                    return Err(HostError::Busy(key.to_string()));
                }
            },

            InstanceEvent::PortLeased { lease, .. } => {
                if instance.state != InstanceState::Pending {
                    return Err(invalid(instance.state));
                }
                if instance.stop_pending {
                    // Cancelled before anything was launched.
                    instance.state = InstanceState::Stopped;
                    instance.stop_pending = false;
                    released = Some(lease);
                } else {
                    instance.state = InstanceState::Starting;
                    instance.port = Some(lease);
                }
            }

            InstanceEvent::SpawnSucceeded { handle, .. } => {
                if instance.state != InstanceState::Starting {
                    return Err(invalid(instance.state));
                }
                instance.started_at = Some(handle.started_at());
                instance.process = Some(handle);
                if instance.stop_pending {
                    instance.state = InstanceState::Stopping;
                    instance.stop_pending = false;
                } else {
                    instance.state = InstanceState::Running;
                    instance.last_error = None;
                }
            }

            InstanceEvent::SpawnFailed { reason, .. } => {
                if !matches!(
                    instance.state,
                    InstanceState::Pending | InstanceState::Starting
                ) {
                    return Err(invalid(instance.state));
                }
                instance.state = InstanceState::Failed;
                instance.stop_pending = false;
                instance.process = None;
                instance.started_at = None;
                instance.last_error = Some(reason);
                released = instance.port.take();
            }

            InstanceEvent::ExternalCrash { reason, .. } => {
                if instance.state != InstanceState::Running {
                    return Err(invalid(instance.state));
                }
                instance.state = InstanceState::Failed;
                instance.process = None;
                instance.started_at = None;
                instance.last_error = Some(reason);
                released = instance.port.take();
            }

            InstanceEvent::RequestStop => match instance.state {
                InstanceState::Running => instance.state = InstanceState::Stopping,
                InstanceState::Pending if instance.is_idle() => {
                    instance.state = InstanceState::Stopped;
                }
                InstanceState::Pending | InstanceState::Starting => {
                    instance.stop_pending = true;
                }
                InstanceState::Failed => instance.state = InstanceState::Stopped,
                InstanceState::Stopped => {}
                InstanceState::Stopping => return Err(HostError::Busy(key.to_string())),
            },

            InstanceEvent::StopConfirmed { .. } => {
                if instance.state != InstanceState::Stopping {
                    return Err(invalid(instance.state));
                }
                instance.state = InstanceState::Stopped;
                instance.process = None;
                instance.started_at = None;
                released = instance.port.take();
            }
        }

        instance.updated_at = Utc::now();
        if from != instance.state {
            info!(
                "{} generation {}: {} -> {} ({})",
                key, instance.generation, from, instance.state, event_name
            );
        }

        Ok(TransitionOutcome {
            instance: instance.clone(),
            released,
        })
    }

    fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::Relaxed) + 1
    }
}
