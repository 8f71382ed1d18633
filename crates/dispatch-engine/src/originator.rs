//! The admission-to-originate pipeline: blacklist and trunk checks,
//! caller id selection, persistence, and the synchronous originate call.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use apicall_switch_core::{Fields, SwitchClient};
use chrono::Utc;
use dashmap::DashMap;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::DatabaseManager;
use crate::error::{EngineError, Result};
use crate::models::{CallState, InFlightCall};
use crate::pool::{ChannelPool, RejectReason};
use crate::smartcid::{SmartCidGenerator, SMART_CID_PREFIX_LEN};
use crate::tracker::ActiveCallTracker;

#[derive(Debug, Clone)]
pub struct DialRequest {
    pub project_id: i64,
    pub phone: String,
    pub campaign_id: Option<i64>,
    pub contact_id: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct Admitted {
    pub call_log_id: i64,
    pub correlation_id: String,
    pub trunk: String,
}

pub struct Originator {
    db: Arc<DatabaseManager>,
    pool: Arc<ChannelPool>,
    tracker: Arc<ActiveCallTracker>,
    switch: SwitchClient,
    ivr_context: String,
    smart_cid_prefix_len: usize,
    round_robin: DashMap<i64, AtomicUsize>,
}

impl Originator {
    pub fn new(
        db: Arc<DatabaseManager>,
        pool: Arc<ChannelPool>,
        tracker: Arc<ActiveCallTracker>,
        switch: SwitchClient,
        ivr_context: impl Into<String>,
    ) -> Self {
        Self {
            db,
            pool,
            tracker,
            switch,
            ivr_context: ivr_context.into(),
            smart_cid_prefix_len: SMART_CID_PREFIX_LEN,
            round_robin: DashMap::new(),
        }
    }

    pub async fn dial(&self, req: DialRequest) -> Result<Admitted> {
        // 1. blacklist check — reject pre-admission, no side effects.
        if self.db.is_blacklisted(req.project_id, &req.phone).await? {
            return Err(EngineError::Blacklisted(req.phone));
        }

        let project = self
            .db
            .get_project(req.project_id)
            .await?
            .ok_or(EngineError::UnknownProject(req.project_id))?;

        // 2. select a trunk: pinned trunk first, else round-robin among
        // active linked trunks with spare capacity (hinted, no slot taken).
        let trunk = self.select_trunk(&project).await?;

        // 3. reserve admission slot.
        let slot = Arc::new(self.pool.reserve(&trunk.name).map_err(|reason| match reason {
            RejectReason::GlobalFull => EngineError::GlobalFull,
            RejectReason::TrunkFull => EngineError::TrunkFull(trunk.name.clone()),
        })?);

        // 4. choose caller id: Smart-CID candidate, else project default.
        let caller_id = self.choose_caller_id(&project, &req.phone).await;
        if project.smart_cid_enabled {
            let generator = SmartCidGenerator::new(&self.db, self.smart_cid_prefix_len);
            if let Err(e) = generator.record_attempt(&req.phone, &caller_id).await {
                warn!(phone = %req.phone, error = %e, "failed to record smart-cid attempt");
            }
        }

        // 5. persist the dialing row.
        let call_log_id = match self
            .db
            .insert_call_log_dialing(req.project_id, &req.phone, req.campaign_id, req.contact_id, &caller_id)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                slot.release();
                return Err(e);
            }
        };

        // 6. register the in-flight record under a fresh correlation id.
        // The slot travels with the record: the record owns the only
        // reference to it until the event handler or reaper removes it.
        let correlation_id = Uuid::new_v4().to_string();
        self.tracker.insert(InFlightCall {
            correlation_id: correlation_id.clone(),
            call_log_id,
            project_id: req.project_id,
            phone: req.phone.clone(),
            trunk: trunk.name.clone(),
            caller_id: caller_id.clone(),
            channel_name: None,
            unique_id: None,
            created_at: Utc::now(),
            state: CallState::Originating,
            campaign_id: req.campaign_id,
            contact_id: req.contact_id,
            answered_at: None,
            amd_verdict: None,
            slot: slot.clone(),
        });

        // 7. CPS pacing, only after admission succeeded.
        self.pool.acquire_cps().await;

        // 8. issue the originate request.
        let channel = format!("SIP/{}/{}{}", trunk.name, project.dial_prefix, req.phone);
        let mut fields = Fields::new();
        fields
            .push("Channel", &channel)
            .push("CallerID", &caller_id)
            .push("Context", &self.ivr_context)
            .push("Exten", "s")
            .push("Priority", "1")
            .push("Timeout", "30000")
            .push("Variable", format!("corr_id={correlation_id}"))
            .push("Variable", format!("project_id={}", project.id))
            .push("Async", "true");

        match self.switch.send("Originate", fields).await {
            Ok(_) => {
                info!(correlation_id = %correlation_id, trunk = %trunk.name, "originate accepted");
                // 9. slot stays reserved inside the tracker record; the
                // event handler drives the call forward from here.
                Ok(Admitted {
                    call_log_id,
                    correlation_id,
                    trunk: trunk.name,
                })
            }
            Err(e) => {
                // 10. synchronous failure: terminal for this attempt.
                // Removing from the tracker drops the last Arc<Slot>,
                // releasing the reservation.
                warn!(correlation_id = %correlation_id, error = %e, "originate failed synchronously");
                self.tracker.remove(&correlation_id);
                let _ = self
                    .db
                    .finalize_call_log(call_log_id, crate::models::CallStatus::Failed, None, false, None, None)
                    .await;
                Err(EngineError::OriginateFailed(e.to_string()))
            }
        }
    }

    async fn select_trunk(&self, project: &crate::models::Project) -> Result<crate::models::Trunk> {
        let trunks = self.db.get_trunks_for_project(project.id).await?;
        if trunks.is_empty() {
            return Err(EngineError::NoTrunkAvailable(project.id));
        }
        if let Some(pinned_name) = &project.preferred_trunk {
            if let Some(t) = trunks.iter().find(|t| &t.name == pinned_name) {
                return Ok(t.clone());
            }
        }
        // Round-robin among trunks with spare per-trunk capacity, per the
        // pool's hint — this does not reserve a slot.
        let candidates: Vec<&crate::models::Trunk> = trunks
            .iter()
            .filter(|t| self.pool.trunk_free(&t.name) > 0 || self.pool.trunk_in_use(&t.name) == 0)
            .collect();
        let pool_list = if candidates.is_empty() { trunks.iter().collect::<Vec<_>>() } else { candidates };

        let counter = self
            .round_robin
            .entry(project.id)
            .or_insert_with(|| AtomicUsize::new(0));
        let idx = counter.fetch_add(1, Ordering::Relaxed) % pool_list.len();
        Ok(pool_list[idx].clone())
    }

    async fn choose_caller_id(&self, project: &crate::models::Project, phone: &str) -> String {
        if project.smart_cid_enabled {
            let generator = SmartCidGenerator::new(&self.db, self.smart_cid_prefix_len);
            if let Ok(Some(candidate)) = generator.candidate(phone).await {
                return candidate;
            }
        }
        project.caller_id.clone()
    }
}
