//! Service location registry: the discovery seam.
//!
//! Discovery itself (cluster membership, regions, seeds) lives outside the
//! crate. Whatever mechanism a host wires up, it lands here: `bind` and
//! `unbind` record the chosen endpoint for a service and fan a location
//! change out to every subscribed aggregator. The registry is
//! authoritative; aggregators never second-guess it.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;

use crate::aggregator::{AggregatorMsg, AggregatorRef};
use crate::core::{Limits, ServiceKey};
use crate::endpoint::EndpointRef;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry subscriber limit {max} reached")]
    SubscriberLimitReached { max: usize },
    #[error("registry lock poisoned")]
    LockPoisoned,
}

struct RegistryState {
    limits: Limits,
    bindings: BTreeMap<ServiceKey, EndpointRef>,
    subscribers: BTreeMap<u64, AggregatorRef>,
}

/// Shared, thread-safe binding table.
#[derive(Clone)]
pub struct LocationRegistry {
    inner: Arc<Mutex<RegistryState>>,
}

impl LocationRegistry {
    pub fn new(limits: Limits) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RegistryState {
                limits,
                bindings: BTreeMap::new(),
                subscribers: BTreeMap::new(),
            })),
        }
    }

    /// Registers an aggregator for location changes. The current bindings
    /// are replayed to it immediately so a late subscriber starts from the
    /// same snapshot everyone else has.
    pub fn subscribe(&self, subscriber: AggregatorRef) -> Result<(), RegistryError> {
        let mut state = self.lock_state()?;
        if state.subscribers.len() >= state.limits.max_registry_subscribers {
            return Err(RegistryError::SubscriberLimitReached {
                max: state.limits.max_registry_subscribers,
            });
        }
        for (service, endpoint) in &state.bindings {
            subscriber.send(AggregatorMsg::LocationChanged {
                service: service.clone(),
                endpoint: Some(endpoint.clone()),
            });
        }
        state.subscribers.insert(subscriber.id(), subscriber);
        Ok(())
    }

    pub fn unsubscribe(&self, subscriber_id: u64) -> Result<(), RegistryError> {
        let mut state = self.lock_state()?;
        state.subscribers.remove(&subscriber_id);
        Ok(())
    }

    /// Records `endpoint` as the location of `service` and notifies every
    /// subscriber.
    pub fn bind(&self, service: ServiceKey, endpoint: EndpointRef) -> Result<(), RegistryError> {
        let mut state = self.lock_state()?;
        state.bindings.insert(service.clone(), endpoint.clone());
        fan_out(&mut state, service, Some(endpoint));
        Ok(())
    }

    /// Drops the binding for `service` and notifies every subscriber.
    pub fn unbind(&self, service: &ServiceKey) -> Result<(), RegistryError> {
        let mut state = self.lock_state()?;
        if state.bindings.remove(service).is_some() {
            fan_out(&mut state, service.clone(), None);
        }
        Ok(())
    }

    /// Point lookup, used for routing signals.
    pub fn lookup(&self, service: &ServiceKey) -> Option<EndpointRef> {
        let state = self.inner.lock().ok()?;
        state.bindings.get(service).cloned()
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, RegistryState>, RegistryError> {
        self.inner.lock().map_err(|_| RegistryError::LockPoisoned)
    }
}

fn fan_out(state: &mut RegistryState, service: ServiceKey, endpoint: Option<EndpointRef>) {
    let mut dead = Vec::new();
    for (id, subscriber) in &state.subscribers {
        let delivered = subscriber.send(AggregatorMsg::LocationChanged {
            service: service.clone(),
            endpoint: endpoint.clone(),
        });
        if !delivered {
            dead.push(*id);
        }
    }
    for id in dead {
        state.subscribers.remove(&id);
    }
}
