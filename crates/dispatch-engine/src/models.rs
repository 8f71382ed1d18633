//! Persistent and in-flight data model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::pool::Slot;

/// Final status of a terminated call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallStatus {
    Answer,
    NoAnswer,
    Busy,
    Failed,
    Congestion,
    Transfer,
    NoDtmf,
    Orphan,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Answer => "ANSWER",
            CallStatus::NoAnswer => "NOANSWER",
            CallStatus::Busy => "BUSY",
            CallStatus::Failed => "FAILED",
            CallStatus::Congestion => "CONGESTION",
            CallStatus::Transfer => "TRANSFER",
            CallStatus::NoDtmf => "NO-DTMF",
            CallStatus::Orphan => "ORPHAN",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "ANSWER" => CallStatus::Answer,
            "NOANSWER" => CallStatus::NoAnswer,
            "BUSY" => CallStatus::Busy,
            "FAILED" => CallStatus::Failed,
            "CONGESTION" => CallStatus::Congestion,
            "TRANSFER" => CallStatus::Transfer,
            "NO-DTMF" => CallStatus::NoDtmf,
            "ORPHAN" => CallStatus::Orphan,
            _ => return None,
        })
    }

    /// Terminal statuses that count as an "interaction" success for the
    /// purposes of campaign contact completion.
    pub fn is_contact_success(&self) -> bool {
        matches!(self, CallStatus::Answer | CallStatus::Transfer | CallStatus::NoDtmf)
    }
}

/// Admission/dial-time state of an in-flight call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Originating,
    Ringing,
    Answered,
    Ivr,
    Transferring,
    Terminating,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    pub name: String,
    pub caller_id: String,
    pub prompt_audio: String,
    pub prompt_duration_secs: i64,
    pub expected_digit: char,
    pub transfer_destination: String,
    pub preferred_trunk: Option<String>,
    pub dial_prefix: String,
    pub authorized_ips: Vec<String>,
    pub max_retries: i32,
    pub retry_backoff_secs: i64,
    pub amd_enabled: bool,
    pub smart_cid_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trunk {
    pub id: i64,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub secret: String,
    pub context: String,
    pub caller_id_override: Option<String>,
    pub active: bool,
    pub max_channels: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallLog {
    pub id: i64,
    pub project_id: i64,
    pub phone: String,
    pub campaign_id: Option<i64>,
    pub contact_id: Option<i64>,
    pub caller_id: String,
    pub dtmf: Option<String>,
    pub interacted: bool,
    pub status: Option<CallStatus>,
    pub duration_secs: Option<i64>,
    pub unique_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CampaignState {
    Draft,
    Active,
    Paused,
    Completed,
    Stopped,
}

impl CampaignState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignState::Draft => "draft",
            CampaignState::Active => "active",
            CampaignState::Paused => "paused",
            CampaignState::Completed => "completed",
            CampaignState::Stopped => "stopped",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "draft" => CampaignState::Draft,
            "active" => CampaignState::Active,
            "paused" => CampaignState::Paused,
            "completed" => CampaignState::Completed,
            "stopped" => CampaignState::Stopped,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: i64,
    pub name: String,
    pub project_id: i64,
    pub state: CampaignState,
    pub total: i64,
    pub processed: i64,
    pub succeeded: i64,
    pub failed: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContactState {
    Pending,
    Dialing,
    Completed,
    Failed,
    Skipped,
}

impl ContactState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContactState::Pending => "pending",
            ContactState::Dialing => "dialing",
            ContactState::Completed => "completed",
            ContactState::Failed => "failed",
            ContactState::Skipped => "skipped",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => ContactState::Pending,
            "dialing" => ContactState::Dialing,
            "completed" => ContactState::Completed,
            "failed" => ContactState::Failed,
            "skipped" => ContactState::Skipped,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub id: i64,
    pub campaign_id: i64,
    pub phone: String,
    pub extra: HashMap<String, String>,
    pub state: ContactState,
    pub attempts: i32,
    pub last_attempt: Option<DateTime<Utc>>,
    pub result: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub campaign_id: i64,
    /// 0 = Sunday.
    pub day_of_week: u8,
    pub start: chrono::NaiveTime,
    pub end: chrono::NaiveTime,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlacklistEntry {
    pub project_id: i64,
    pub phone: String,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct InFlightCall {
    pub correlation_id: String,
    pub call_log_id: i64,
    pub project_id: i64,
    pub phone: String,
    pub trunk: String,
    pub caller_id: String,
    pub channel_name: Option<String>,
    pub unique_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub state: CallState,
    pub campaign_id: Option<i64>,
    pub contact_id: Option<i64>,
    pub answered_at: Option<DateTime<Utc>>,
    /// Answering-machine-detection verdict, populated from the switch's
    /// `AMDSTATUS` channel variable once it fires; read by the IVR session
    /// handler at session start instead of re-querying the channel.
    pub amd_verdict: Option<String>,
    /// The admission slot this call holds. Dropping the last reference
    /// releases it — removing the record from the tracker is what frees
    /// the slot.
    pub slot: Arc<Slot>,
}

/// Hangup cause-code mapping.
pub fn status_from_hangup_cause(cause: u32, was_answered: bool) -> CallStatus {
    match cause {
        16 => {
            if was_answered {
                CallStatus::Answer
            } else {
                CallStatus::NoAnswer
            }
        }
        17 => CallStatus::Busy,
        19 | 21 => CallStatus::NoAnswer,
        34 => CallStatus::Congestion,
        _ => CallStatus::Failed,
    }
}
