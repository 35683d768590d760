//! Per-node port claims. Two instances on one node must not configure
//! their extensions onto the same port.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use super::ExtensionError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortClaim {
    pub kind: String,
    pub port: u16,
    pub owner: String,
}

#[derive(Debug, Default)]
pub struct PortRegistry {
    claims: Mutex<BTreeMap<u16, PortClaim>>,
}

impl PortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<u16, PortClaim>> {
        self.claims.lock().unwrap_or_else(|poisoned| {
            tracing::error!("PortRegistry lock poisoned, continuing with inner state");
            poisoned.into_inner()
        })
    }

    /// Claim `port` for `owner` as `kind`. Re-claiming the same (kind, port) by the
    /// same owner is a no-op; any other holder of the port is a conflict, including
    /// the same owner under a different kind.
    pub fn claim(&self, kind: &str, port: u16, owner: &str) -> Result<(), ExtensionError> {
        let mut claims = self.lock();
        match claims.get(&port) {
            Some(existing) if existing.owner == owner && existing.kind == kind => Ok(()),
            Some(existing) => Err(ExtensionError::PortConflict {
                kind: kind.to_string(),
                port,
                owner: existing.owner.clone(),
                held_as: existing.kind.clone(),
            }),
            None => {
                tracing::debug!("{} port {} claimed by '{}'", kind, port, owner);
                claims.insert(
                    port,
                    PortClaim {
                        kind: kind.to_string(),
                        port,
                        owner: owner.to_string(),
                    },
                );
                Ok(())
            }
        }
    }

    /// Release every claim held by `owner`; returns how many were dropped.
    pub fn release_owner(&self, owner: &str) -> usize {
        let mut claims = self.lock();
        let before = claims.len();
        claims.retain(|_, c| c.owner != owner);
        before - claims.len()
    }

    pub fn owner_of(&self, port: u16) -> Option<PortClaim> {
        self.lock().get(&port).cloned()
    }

    pub fn claims(&self) -> Vec<PortClaim> {
        self.lock().values().cloned().collect()
    }
}
