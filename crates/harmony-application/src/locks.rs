// SPDX-License-Identifier: GPL-3.0-or-later

//! In-process advisory locks serializing work per artist.
//!
//! One `artist_sync` runs per artist key at a time; a second claimant
//! backs off and retries through the queue. The registry is process-local,
//! matching the single-database deployment of the queue itself.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use harmony_domain::ArtistKey;
use tracing::warn;

#[derive(Clone, Default)]
pub struct ArtistLockRegistry {
    held: Arc<Mutex<HashSet<ArtistKey>>>,
}

impl ArtistLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the artist, or return `None` when another job holds it.
    pub fn try_acquire(&self, key: &ArtistKey) -> Option<ArtistLockGuard> {
        let mut held = self.held.lock().unwrap_or_else(|poisoned| {
            warn!(target: "locks", "artist lock registry poisoned, recovering");
            poisoned.into_inner()
        });
        if held.insert(key.clone()) {
            Some(ArtistLockGuard {
                registry: self.clone(),
                key: key.clone(),
            })
        } else {
            None
        }
    }

    pub fn is_held(&self, key: &ArtistKey) -> bool {
        self.held
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(key)
    }

    fn release(&self, key: &ArtistKey) {
        let mut held = self.held.lock().unwrap_or_else(|p| p.into_inner());
        held.remove(key);
    }
}

/// RAII guard; dropping it releases the artist.
pub struct ArtistLockGuard {
    registry: ArtistLockRegistry,
    key: ArtistKey,
}

impl Drop for ArtistLockGuard {
    fn drop(&mut self) {
        self.registry.release(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_claim_fails_until_release() {
        let registry = ArtistLockRegistry::new();
        let key = ArtistKey::new("spotify", "abc");

        let guard = registry.try_acquire(&key).expect("first claim");
        assert!(registry.try_acquire(&key).is_none());
        assert!(registry.is_held(&key));

        drop(guard);
        assert!(!registry.is_held(&key));
        assert!(registry.try_acquire(&key).is_some());
    }

    #[test]
    fn distinct_artists_do_not_contend() {
        let registry = ArtistLockRegistry::new();
        let _a = registry.try_acquire(&ArtistKey::new("spotify", "a")).unwrap();
        let _b = registry.try_acquire(&ArtistKey::new("spotify", "b")).unwrap();
    }
}
