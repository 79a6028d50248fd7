//! Core domain types for the voice broadcast dispatch engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A named dispatch job targeting a contact list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub template: String,
    pub voice: VoiceProfile,
    pub audio_assets: Vec<AudioAsset>,
    pub status: CampaignStatus,
    pub stats: CampaignStats,
    pub config: CampaignConfig,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Voice synthesis profile requested for the campaign.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceProfile {
    pub provider: String,
    pub voice_id: String,
    pub language: String,
}

/// Campaign lifecycle. Transitions are monotonic: the only loop is
/// `queued -> queued` when paused externally, which is not a feature this
/// service implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Draft,
    Queued,
    InProgress,
    Completed,
    Cancelled,
}

/// Derived aggregates. Must sum to `total` at rest.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CampaignStats {
    pub total: usize,
    pub queued: usize,
    pub calling: usize,
    pub answered: usize,
    pub completed: usize,
    pub failed: usize,
    pub opted_out: usize,
    pub cancelled: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignConfig {
    pub max_concurrent: usize,
    pub max_retries: u32,
    pub retry_delay: chrono::Duration,
    pub compliance: ComplianceConfig,
}

impl Default for CampaignConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            max_retries: 2,
            // Open Question resolution (SPEC_FULL.md §9): fixed at 5 minutes.
            retry_delay: chrono::Duration::minutes(5),
            compliance: ComplianceConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplianceConfig {
    pub disclaimer_text: String,
    pub opt_out_enabled: bool,
    pub dnd_respect: bool,
}

impl Default for ComplianceConfig {
    fn default() -> Self {
        Self {
            disclaimer_text:
                "This is an automated broadcast message. Press 9 to stop receiving these calls."
                    .to_string(),
            opt_out_enabled: true,
            dnd_respect: true,
        }
    }
}

/// One dial attempt against one contact within a campaign.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Call {
    pub id: String,
    pub broadcast_id: String,
    pub contact: Contact,
    pub personalized_message: PersonalizedMessage,
    pub provider_sid: Option<String>,
    pub status: CallStatus,
    pub attempts: u32,
    pub retry_after: Option<DateTime<Utc>>,
    pub duration: Option<u32>,
    pub start_time: Option<DateTime<Utc>>,
    pub answer_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub provider_error: Option<ProviderError>,
    pub dnd_status: DndStatus,
    pub opted_out: bool,
    pub metadata: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub phone: String,
    pub name: String,
    pub custom_fields: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonalizedMessage {
    pub text: String,
    pub audio_url: String,
    pub audio_asset_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DndStatus {
    Unchecked,
    Allowed,
    Blocked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderError {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Queued,
    Calling,
    Ringing,
    InProgress,
    Answered,
    Completed,
    Failed,
    Busy,
    NoAnswer,
    Cancelled,
    OptedOut,
}

impl CallStatus {
    /// Terminal statuses never accept a subsequent transition (spec.md §8).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CallStatus::Completed
                | CallStatus::Failed
                | CallStatus::Cancelled
                | CallStatus::OptedOut
        )
    }

    pub fn is_active(self) -> bool {
        matches!(
            self,
            CallStatus::Calling | CallStatus::Ringing | CallStatus::InProgress
        )
    }

    pub fn is_pending(self) -> bool {
        self.is_active() || matches!(self, CallStatus::Queued)
    }
}

/// Embedded in `Campaign`, deduplicated by `unique_key`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioAsset {
    pub unique_key: String,
    pub text: String,
    pub audio_url: String,
    pub duration: u32,
    pub generated_at: DateTime<Utc>,
}

/// A phone number that, by user action, must not receive broadcast calls.
/// Global, phone-keyed, independent of any one campaign.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptOut {
    pub phone: String,
    pub source: OptOutSource,
    pub opted_out_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub metadata: HashMap<String, String>,
}

impl OptOut {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptOutSource {
    BroadcastKeypress,
    Manual,
    DndRegistry,
    Api,
}

/// Default lifetime for a newly-created opt-out record when the caller
/// doesn't specify one explicitly.
pub const DEFAULT_OPT_OUT_LIFETIME_DAYS: i64 = 365;
