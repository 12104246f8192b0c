//! Per-origin caching of challenges

use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
};

use crate::{Challenge, Origin, OriginRef};

/// Storage for the most recent challenge observed for each origin
///
/// Entries never expire. A stale entry is detected when the server answers
/// an authenticated request with a fresh `401 Unauthorized`, at which point
/// the entry is overwritten.
pub trait ChallengeCache: Send + Sync {
    /// Gets the cached challenge for an origin, if any
    fn get(&self, origin: &OriginRef) -> Option<Challenge>;

    /// Stores the challenge for an origin, replacing any existing entry
    fn put(&self, origin: Origin, challenge: Challenge);
}

impl<C: ChallengeCache + ?Sized> ChallengeCache for Arc<C> {
    fn get(&self, origin: &OriginRef) -> Option<Challenge> {
        (**self).get(origin)
    }

    fn put(&self, origin: Origin, challenge: Challenge) {
        (**self).put(origin, challenge)
    }
}

/// An in-memory challenge cache, safe to share between concurrent requests
#[derive(Debug, Default)]
pub struct InMemoryChallengeCache {
    entries: RwLock<HashMap<Origin, Challenge>>,
}

impl InMemoryChallengeCache {
    /// Constructs a new, empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of origins with a cached challenge
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether no challenge has been cached yet
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ChallengeCache for InMemoryChallengeCache {
    fn get(&self, origin: &OriginRef) -> Option<Challenge> {
        let challenge = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(origin)
            .cloned();

        tracing::trace!(%origin, hit = challenge.is_some(), "challenge cache lookup");
        challenge
    }

    fn put(&self, origin: Origin, challenge: Challenge) {
        tracing::trace!(%origin, "caching challenge");
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(origin, challenge);
    }
}
