//! Push subscription bookkeeping.
//!
//! Tracks which `eth_subscribe` subscriptions the client opened so callers
//! can list them (for example to re-issue them after a reconnect, since the
//! server forgets subscriptions when the socket drops). Delivery itself goes
//! through the event bus on `Channel::Subscription(id)`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;

/// A unique subscription ID returned by `eth_subscribe`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub String);

impl From<String> for SubscriptionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What was asked for when the subscription was opened.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionEntry {
    /// The subscription type (e.g. `"newHeads"`, `"logs"`).
    pub kind: String,
    /// Extra parameters (e.g. a log filter).
    pub params: Vec<Value>,
}

/// Active subscriptions keyed by server-issued id.
#[derive(Clone, Default)]
pub struct SubscriptionRegistry {
    entries: Arc<Mutex<HashMap<SubscriptionId, SubscriptionEntry>>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: SubscriptionId, kind: String, params: Vec<Value>) {
        self.lock().insert(id, SubscriptionEntry { kind, params });
    }

    /// Remove a subscription (e.g. after `eth_unsubscribe`).
    pub fn remove(&self, id: &SubscriptionId) -> Option<SubscriptionEntry> {
        self.lock().remove(id)
    }

    /// Forget every subscription, returning how many there were.
    pub fn clear(&self) -> usize {
        let mut entries = self.lock();
        let count = entries.len();
        entries.clear();
        count
    }

    /// Snapshot of every active subscription.
    pub fn active(&self) -> Vec<(SubscriptionId, SubscriptionEntry)> {
        self.lock()
            .iter()
            .map(|(id, entry)| (id.clone(), entry.clone()))
            .collect()
    }

    /// Number of active subscriptions.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns `true` if there are no active subscriptions.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SubscriptionId, SubscriptionEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("active", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_remove() {
        let reg = SubscriptionRegistry::new();
        let id = SubscriptionId("0x1".into());
        reg.register(id.clone(), "logs".into(), vec![]);
        assert_eq!(reg.len(), 1);
        let entry = reg.remove(&id).unwrap();
        assert_eq!(entry.kind, "logs");
        assert!(reg.is_empty());
        assert!(reg.remove(&id).is_none());
    }

    #[test]
    fn clear_forgets_everything() {
        let reg = SubscriptionRegistry::new();
        reg.register(SubscriptionId("0xa".into()), "newHeads".into(), vec![]);
        reg.register(SubscriptionId("0xb".into()), "logs".into(), vec![]);
        assert_eq!(reg.clear(), 2);
        assert!(reg.is_empty());
        assert!(reg.active().is_empty());
    }

    #[test]
    fn active_lists_kind_and_params() {
        let reg = SubscriptionRegistry::new();
        reg.register(SubscriptionId("0xa".into()), "newHeads".into(), vec![]);
        reg.register(
            SubscriptionId("0xb".into()),
            "logs".into(),
            vec![serde_json::json!({"address": "0xdead"})],
        );

        let mut active = reg.active();
        active.sort_by(|a, b| a.0 .0.cmp(&b.0 .0));
        assert_eq!(active.len(), 2);
        assert_eq!(active[1].1.params[0]["address"], "0xdead");
    }
}
