//! Record of script-hash subscriptions and the statuses seen for each.

use crate::wallet::ScriptHash;

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

/// Statuses reported per subscribed script hash, oldest first.
///
/// A `None` status means the script hash has no history yet. The subscription response and the
/// reader's notifications both record here.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    statuses: Mutex<HashMap<ScriptHash, Vec<Option<String>>>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest status of a subscribed script hash
    pub fn status_of(&self, script_hash: &ScriptHash) -> Option<String> {
        self.lock()
            .get(script_hash)
            .and_then(|statuses| statuses.last().cloned().flatten())
    }

    pub fn is_subscribed(&self, script_hash: &ScriptHash) -> bool {
        self.lock().contains_key(script_hash)
    }

    /// Append a status unless it repeats the latest one
    pub fn record(&self, script_hash: ScriptHash, status: Option<String>) {
        let mut statuses = self.lock();
        let history = statuses.entry(script_hash).or_default();
        if history.last() != Some(&status) {
            history.push(status);
        }
    }

    pub fn history(&self, script_hash: &ScriptHash) -> Vec<Option<String>> {
        self.lock().get(script_hash).cloned().unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ScriptHash, Vec<Option<String>>>> {
        self.statuses.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(c: char) -> ScriptHash {
        ScriptHash::from(c.to_string().repeat(64))
    }

    #[test]
    fn null_status_counts_as_subscribed() {
        let registry = SubscriptionRegistry::new();
        registry.record(hash('a'), None);

        assert!(registry.is_subscribed(&hash('a')));
        assert_eq!(registry.status_of(&hash('a')), None);
        assert!(!registry.is_subscribed(&hash('b')));
    }

    #[test]
    fn latest_status_wins() {
        let registry = SubscriptionRegistry::new();
        registry.record(hash('a'), None);
        registry.record(hash('a'), Some("s1".into()));
        registry.record(hash('a'), Some("s1".into()));
        registry.record(hash('a'), Some("s2".into()));

        assert_eq!(registry.status_of(&hash('a')), Some("s2".into()));
        assert_eq!(
            registry.history(&hash('a')),
            vec![None, Some("s1".into()), Some("s2".into())]
        );
    }

    #[test]
    fn clear_forgets_everything() {
        let registry = SubscriptionRegistry::new();
        registry.record(hash('a'), Some("s".into()));
        registry.clear();
        assert!(registry.is_empty());
        assert!(!registry.is_subscribed(&hash('a')));
    }
}
