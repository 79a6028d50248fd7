//! Compliance Filter (spec.md §4.B).
//!
//! Decides whether a call may be dialed; it never dials or mutates state
//! itself, leaving that to the caller (`dispatch::engine`), mirroring how
//! `flash_call.rs` checks its rate limiter and returns a verdict before the
//! caller decides whether to actually place the call.

use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::{Call, Campaign, DndStatus};
use crate::error::Result;
use crate::store::CampaignStore;

/// Outcome of running a call through the compliance pipeline, in the fixed
/// order spec.md §4.B requires: DND first, then opt-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComplianceOutcome {
    Proceed,
    Blocked,
    OptedOut,
}

/// External DND registry lookup. Out of scope per spec.md §1; the shipped
/// implementation is a stub that allows everything.
#[async_trait]
pub trait DndProvider: Send + Sync {
    async fn check(&self, phone: &str) -> Result<DndStatus>;
}

pub struct AlwaysAllowDndProvider;

#[async_trait]
impl DndProvider for AlwaysAllowDndProvider {
    async fn check(&self, _phone: &str) -> Result<DndStatus> {
        Ok(DndStatus::Allowed)
    }
}

pub struct ComplianceFilter {
    store: Arc<dyn CampaignStore>,
    dnd: Arc<dyn DndProvider>,
}

impl ComplianceFilter {
    pub fn new(store: Arc<dyn CampaignStore>, dnd: Arc<dyn DndProvider>) -> Self {
        Self { store, dnd }
    }

    /// Idempotent within a tick: re-asking the same call/campaign pair
    /// returns the same answer (spec.md §4.B), since neither step here has
    /// a side effect that would change the verdict mid-tick.
    pub async fn evaluate(&self, call: &Call, campaign: &Campaign) -> Result<ComplianceOutcome> {
        if campaign.config.compliance.dnd_respect {
            let status = self.dnd.check(&call.contact.phone).await?;
            if status == DndStatus::Blocked {
                return Ok(ComplianceOutcome::Blocked);
            }
        }

        if campaign.config.compliance.opt_out_enabled
            && self.store.is_active_opt_out(&call.contact.phone).await
        {
            return Ok(ComplianceOutcome::OptedOut);
        }

        Ok(ComplianceOutcome::Proceed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::*;
    use crate::store::InMemoryCampaignStore;
    use chrono::Utc;
    use std::collections::HashMap;

    fn campaign() -> Campaign {
        Campaign {
            id: "c1".to_string(),
            owner_id: "o1".to_string(),
            name: "Test".to_string(),
            template: "Hi {{name}}".to_string(),
            voice: VoiceProfile {
                provider: "polly".to_string(),
                voice_id: "Joanna".to_string(),
                language: "en-US".to_string(),
            },
            audio_assets: vec![],
            status: CampaignStatus::Draft,
            stats: CampaignStats::default(),
            config: CampaignConfig::default(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    fn call(phone: &str) -> Call {
        Call {
            id: "k1".to_string(),
            broadcast_id: "c1".to_string(),
            contact: Contact {
                phone: phone.to_string(),
                name: "A".to_string(),
                custom_fields: HashMap::new(),
            },
            personalized_message: PersonalizedMessage {
                text: "Hi A".to_string(),
                audio_url: "https://cdn.example/a.mp3".to_string(),
                audio_asset_id: "asset-1".to_string(),
            },
            provider_sid: None,
            status: CallStatus::Queued,
            attempts: 0,
            retry_after: None,
            duration: None,
            start_time: None,
            answer_time: None,
            end_time: None,
            provider_error: None,
            dnd_status: DndStatus::Unchecked,
            opted_out: false,
            metadata: HashMap::new(),
            created_at: Utc::now(),
        }
    }

    struct BlockingDnd;
    #[async_trait]
    impl DndProvider for BlockingDnd {
        async fn check(&self, _phone: &str) -> Result<DndStatus> {
            Ok(DndStatus::Blocked)
        }
    }

    #[tokio::test]
    async fn opted_out_short_circuits_dial() {
        let store = Arc::new(InMemoryCampaignStore::new());
        store
            .upsert_opt_out("+15559", OptOutSource::Manual, HashMap::new())
            .await
            .unwrap();
        let filter = ComplianceFilter::new(store, Arc::new(AlwaysAllowDndProvider));
        let outcome = filter.evaluate(&call("+15559"), &campaign()).await.unwrap();
        assert_eq!(outcome, ComplianceOutcome::OptedOut);
    }

    #[tokio::test]
    async fn dnd_block_takes_priority_over_opt_out_check() {
        let store = Arc::new(InMemoryCampaignStore::new());
        let filter = ComplianceFilter::new(store, Arc::new(BlockingDnd));
        let outcome = filter.evaluate(&call("+15550"), &campaign()).await.unwrap();
        assert_eq!(outcome, ComplianceOutcome::Blocked);
    }

    #[tokio::test]
    async fn clean_number_proceeds() {
        let store = Arc::new(InMemoryCampaignStore::new());
        let filter = ComplianceFilter::new(store, Arc::new(AlwaysAllowDndProvider));
        let outcome = filter.evaluate(&call("+15550"), &campaign()).await.unwrap();
        assert_eq!(outcome, ComplianceOutcome::Proceed);
    }
}
