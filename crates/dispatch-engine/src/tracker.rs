//! In-memory map of in-flight calls, keyed by correlation id, with a
//! secondary index from the switch's unique id.

use dashmap::DashMap;

use crate::models::InFlightCall;

#[derive(Default)]
pub struct ActiveCallTracker {
    by_correlation: DashMap<String, InFlightCall>,
    unique_to_correlation: DashMap<String, String>,
}

impl ActiveCallTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, call: InFlightCall) {
        self.by_correlation.insert(call.correlation_id.clone(), call);
    }

    /// Records the switch-assigned unique id once the channel exists,
    /// populating the secondary index used by `get_by_unique_id`.
    pub fn attach_unique_id(&self, correlation_id: &str, unique_id: impl Into<String>) {
        let unique_id = unique_id.into();
        if let Some(mut entry) = self.by_correlation.get_mut(correlation_id) {
            entry.unique_id = Some(unique_id.clone());
        }
        self.unique_to_correlation.insert(unique_id, correlation_id.to_string());
    }

    pub fn get(&self, correlation_id: &str) -> Option<InFlightCall> {
        self.by_correlation.get(correlation_id).map(|e| e.clone())
    }

    pub fn get_by_unique_id(&self, unique_id: &str) -> Option<InFlightCall> {
        let correlation_id = self.unique_to_correlation.get(unique_id)?;
        self.get(&correlation_id)
    }

    pub fn update<F: FnOnce(&mut InFlightCall)>(&self, correlation_id: &str, f: F) -> bool {
        if let Some(mut entry) = self.by_correlation.get_mut(correlation_id) {
            f(&mut entry);
            true
        } else {
            false
        }
    }

    /// Removes the in-flight record, returning it if present. This is the
    /// single point through which a call stops "consuming a slot" from the
    /// tracker's point of view.
    pub fn remove(&self, correlation_id: &str) -> Option<InFlightCall> {
        let removed = self.by_correlation.remove(correlation_id).map(|(_, v)| v);
        if let Some(call) = &removed {
            if let Some(unique_id) = &call.unique_id {
                self.unique_to_correlation.remove(unique_id);
            }
        }
        removed
    }

    pub fn contains(&self, correlation_id: &str) -> bool {
        self.by_correlation.contains_key(correlation_id)
    }

    pub fn len(&self) -> usize {
        self.by_correlation.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_correlation.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CallState;
    use crate::pool::ChannelPool;
    use chrono::Utc;
    use std::sync::Arc;

    fn sample(correlation_id: &str) -> InFlightCall {
        let pool = ChannelPool::new(10, 100);
        pool.register_trunk("sbc233", 10);
        let slot = Arc::new(pool.reserve("sbc233").unwrap());
        InFlightCall {
            correlation_id: correlation_id.to_string(),
            call_log_id: 1,
            project_id: 1,
            phone: "3000000001".to_string(),
            trunk: "sbc233".to_string(),
            caller_id: "123".to_string(),
            channel_name: None,
            unique_id: None,
            created_at: Utc::now(),
            state: CallState::Originating,
            campaign_id: None,
            contact_id: None,
            answered_at: None,
            amd_verdict: None,
            slot,
        }
    }

    #[tokio::test]
    async fn attach_unique_id_enables_secondary_lookup() {
        let tracker = ActiveCallTracker::new();
        tracker.insert(sample("corr-1"));
        tracker.attach_unique_id("corr-1", "1700000000.1");

        let found = tracker.get_by_unique_id("1700000000.1").unwrap();
        assert_eq!(found.correlation_id, "corr-1");
    }

    #[tokio::test]
    async fn remove_clears_both_indexes() {
        let tracker = ActiveCallTracker::new();
        tracker.insert(sample("corr-1"));
        tracker.attach_unique_id("corr-1", "uid-1");
        tracker.remove("corr-1");

        assert!(tracker.get("corr-1").is_none());
        assert!(tracker.get_by_unique_id("uid-1").is_none());
    }
}
