//! Persistence Gateway (spec §4.A).
//!
//! `CampaignStore` is the single source of truth every other component
//! serializes its Call mutations through. The shipped `InMemoryCampaignStore`
//! follows this workspace's existing convention for in-process state
//! (`BulkVoiceService`, `PredictiveDialer` in the sibling `bulk_voice.rs` /
//! `predictive_dialer.rs`: `Arc<DashMap<...>>` fields, no external database).
//! A LumaDB-backed implementation of this same trait is the natural next
//! step (see DESIGN.md) but is out of scope for this service.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;

use crate::domain::*;
use crate::error::{BroadcastError, Result};

#[async_trait]
pub trait CampaignStore: Send + Sync {
    async fn create_campaign(&self, campaign: Campaign) -> Result<()>;
    async fn get_campaign(&self, id: &str) -> Option<Campaign>;
    async fn list_campaigns(
        &self,
        owner_id: Option<&str>,
        status: Option<CampaignStatus>,
        page: usize,
        limit: usize,
    ) -> (Vec<Campaign>, usize);
    async fn transition_campaign_status(
        &self,
        id: &str,
        status: CampaignStatus,
    ) -> Result<Campaign>;
    async fn delete_campaign(&self, id: &str) -> Result<Campaign>;

    async fn add_calls(&self, campaign_id: &str, calls: Vec<Call>) -> Result<()>;
    async fn get_call(&self, id: &str) -> Option<Call>;
    async fn list_calls(
        &self,
        campaign_id: &str,
        status: Option<CallStatus>,
        page: usize,
        limit: usize,
    ) -> (Vec<Call>, usize);

    async fn get_fresh(&self, campaign_id: &str, limit: usize) -> Vec<Call>;
    async fn get_retryable(&self, campaign_id: &str, limit: usize) -> Vec<Call>;
    async fn count_active(&self, campaign_id: &str) -> usize;
    async fn count_pending(&self, campaign_id: &str) -> usize;
    /// Recomputes `stats` from the current Call rows and persists it onto
    /// the campaign. Authoritative per spec.md §4.F / §9 — there is no
    /// incremental counter path.
    async fn aggregate_by_status(&self, campaign_id: &str) -> Result<CampaignStats>;

    async fn mark_calling(&self, call_id: &str, provider_sid: &str) -> Result<Call>;
    async fn mark_failed(
        &self,
        call_id: &str,
        code: &str,
        message: &str,
        retry: bool,
        max_retries: u32,
        retry_delay: chrono::Duration,
    ) -> Result<Call>;
    async fn mark_opted_out(&self, call_id: &str) -> Result<Call>;
    /// Persists the outcome of `ComplianceFilter::evaluate`'s DND check onto
    /// the call row (spec.md §4.B / §3 `dndStatus`).
    async fn set_dnd_status(&self, call_id: &str, status: DndStatus) -> Result<Call>;
    /// Applied by the Webhook Sink after mapping a provider status to a
    /// domain `CallStatus`. Rank-gated so a delayed/duplicate webhook can
    /// never regress a call past a later, already-applied status.
    async fn apply_status_update(
        &self,
        call_id: &str,
        status: CallStatus,
        duration: Option<u32>,
        answered_by: Option<&str>,
        error: Option<ProviderError>,
    ) -> Result<Call>;
    /// Webhook reconciliation (spec.md §4.F / §9): locate the call by
    /// provider SID first, falling back to the internal id from the URL and
    /// backfilling the SID atomically. Returns the canonical row.
    async fn reconcile(&self, internal_id: Option<&str>, provider_sid: &str) -> Result<Call>;
    /// Bulk-flip every `queued` call in the campaign to `cancelled`.
    /// Returns the number of rows affected.
    async fn cancel_pending_calls(&self, campaign_id: &str) -> Result<usize>;

    async fn add_audio_asset(&self, campaign_id: &str, asset: AudioAsset) -> Result<()>;
    async fn find_audio_asset(&self, campaign_id: &str, unique_key: &str) -> Option<AudioAsset>;

    async fn upsert_opt_out(
        &self,
        phone: &str,
        source: OptOutSource,
        metadata: HashMap<String, String>,
    ) -> Result<()>;
    async fn is_active_opt_out(&self, phone: &str) -> bool;
}

/// In-memory Persistence Gateway, `DashMap`-backed throughout.
pub struct InMemoryCampaignStore {
    campaigns: Arc<DashMap<String, Campaign>>,
    calls: Arc<DashMap<String, Call>>,
    /// provider_sid -> call id, enforces the "unique across the system"
    /// invariant from spec.md §3 and gives reconcile() an O(1) lookup.
    sid_index: Arc<DashMap<String, String>>,
    opt_outs: Arc<DashMap<String, OptOut>>,
}

impl InMemoryCampaignStore {
    pub fn new() -> Self {
        Self {
            campaigns: Arc::new(DashMap::new()),
            calls: Arc::new(DashMap::new()),
            sid_index: Arc::new(DashMap::new()),
            opt_outs: Arc::new(DashMap::new()),
        }
    }

    fn calls_for(&self, campaign_id: &str) -> Vec<Call> {
        self.calls
            .iter()
            .filter(|c| c.broadcast_id == campaign_id)
            .map(|c| c.value().clone())
            .collect()
    }

    fn status_rank(status: CallStatus) -> u8 {
        if status.is_terminal() {
            return u8::MAX;
        }
        match status {
            CallStatus::Queued => 0,
            CallStatus::Calling => 1,
            CallStatus::Ringing => 2,
            CallStatus::InProgress => 3,
            CallStatus::Answered => 4,
            _ => u8::MAX,
        }
    }
}

impl Default for InMemoryCampaignStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CampaignStore for InMemoryCampaignStore {
    async fn create_campaign(&self, campaign: Campaign) -> Result<()> {
        self.campaigns.insert(campaign.id.clone(), campaign);
        Ok(())
    }

    async fn get_campaign(&self, id: &str) -> Option<Campaign> {
        self.campaigns.get(id).map(|c| c.value().clone())
    }

    async fn list_campaigns(
        &self,
        owner_id: Option<&str>,
        status: Option<CampaignStatus>,
        page: usize,
        limit: usize,
    ) -> (Vec<Campaign>, usize) {
        let mut matching: Vec<Campaign> = self
            .campaigns
            .iter()
            .filter(|c| owner_id.map_or(true, |o| c.owner_id == o))
            .filter(|c| status.map_or(true, |s| c.status == s))
            .map(|c| c.value().clone())
            .collect();
        matching.sort_by_key(|c| c.created_at);
        let total = matching.len();
        let start = page.saturating_sub(1) * limit;
        let page_items = matching.into_iter().skip(start).take(limit).collect();
        (page_items, total)
    }

    async fn transition_campaign_status(
        &self,
        id: &str,
        status: CampaignStatus,
    ) -> Result<Campaign> {
        let mut campaign = self
            .campaigns
            .get_mut(id)
            .ok_or_else(|| BroadcastError::NotFound(format!("campaign {id}")))?;
        campaign.status = status;
        campaign.updated_at = Utc::now();
        match status {
            CampaignStatus::InProgress if campaign.started_at.is_none() => {
                campaign.started_at = Some(Utc::now());
            }
            CampaignStatus::Completed | CampaignStatus::Cancelled => {
                campaign.completed_at = Some(Utc::now());
            }
            _ => {}
        }
        Ok(campaign.clone())
    }

    async fn delete_campaign(&self, id: &str) -> Result<Campaign> {
        let (_, campaign) = self
            .campaigns
            .remove(id)
            .ok_or_else(|| BroadcastError::NotFound(format!("campaign {id}")))?;
        let call_ids: Vec<String> = self
            .calls
            .iter()
            .filter(|c| c.broadcast_id == id)
            .map(|c| c.id.clone())
            .collect();
        for call_id in call_ids {
            if let Some((_, call)) = self.calls.remove(&call_id) {
                if let Some(sid) = call.provider_sid {
                    self.sid_index.remove(&sid);
                }
            }
        }
        Ok(campaign)
    }

    async fn add_calls(&self, campaign_id: &str, calls: Vec<Call>) -> Result<()> {
        if self.get_campaign(campaign_id).await.is_none() {
            return Err(BroadcastError::NotFound(format!("campaign {campaign_id}")));
        }
        for call in calls {
            self.calls.insert(call.id.clone(), call);
        }
        Ok(())
    }

    async fn get_call(&self, id: &str) -> Option<Call> {
        self.calls.get(id).map(|c| c.value().clone())
    }

    async fn list_calls(
        &self,
        campaign_id: &str,
        status: Option<CallStatus>,
        page: usize,
        limit: usize,
    ) -> (Vec<Call>, usize) {
        let mut matching: Vec<Call> = self
            .calls_for(campaign_id)
            .into_iter()
            .filter(|c| status.map_or(true, |s| c.status == s))
            .collect();
        matching.sort_by_key(|c| c.created_at);
        let total = matching.len();
        let start = page.saturating_sub(1) * limit;
        let page_items = matching.into_iter().skip(start).take(limit).collect();
        (page_items, total)
    }

    async fn get_fresh(&self, campaign_id: &str, limit: usize) -> Vec<Call> {
        let mut fresh: Vec<Call> = self
            .calls_for(campaign_id)
            .into_iter()
            .filter(|c| c.status == CallStatus::Queued && c.attempts == 0)
            .collect();
        // Stable FIFO order by creation time (spec.md §4.G "Ordering & tie-breaks").
        fresh.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        fresh.truncate(limit);
        fresh
    }

    async fn get_retryable(&self, campaign_id: &str, limit: usize) -> Vec<Call> {
        let now = Utc::now();
        let mut retryable: Vec<Call> = self
            .calls_for(campaign_id)
            .into_iter()
            .filter(|c| {
                c.status == CallStatus::Queued
                    && c.attempts > 0
                    && c.retry_after.is_some_and(|t| t <= now)
            })
            .collect();
        retryable.sort_by(|a, b| {
            a.retry_after
                .cmp(&b.retry_after)
                .then(a.id.cmp(&b.id))
        });
        retryable.truncate(limit);
        retryable
    }

    async fn count_active(&self, campaign_id: &str) -> usize {
        self.calls_for(campaign_id)
            .iter()
            .filter(|c| c.status.is_active())
            .count()
    }

    async fn count_pending(&self, campaign_id: &str) -> usize {
        self.calls_for(campaign_id)
            .iter()
            .filter(|c| c.status.is_pending())
            .count()
    }

    async fn aggregate_by_status(&self, campaign_id: &str) -> Result<CampaignStats> {
        let calls = self.calls_for(campaign_id);
        let mut stats = CampaignStats {
            total: calls.len(),
            ..Default::default()
        };
        for call in &calls {
            match call.status {
                CallStatus::Queued => stats.queued += 1,
                CallStatus::Calling | CallStatus::Ringing | CallStatus::InProgress => {
                    stats.calling += 1
                }
                CallStatus::Answered => stats.answered += 1,
                CallStatus::Completed => stats.completed += 1,
                CallStatus::Failed | CallStatus::Busy | CallStatus::NoAnswer => stats.failed += 1,
                CallStatus::OptedOut => stats.opted_out += 1,
                CallStatus::Cancelled => stats.cancelled += 1,
            }
        }
        if let Some(mut campaign) = self.campaigns.get_mut(campaign_id) {
            campaign.stats = stats;
        }
        Ok(stats)
    }

    async fn mark_calling(&self, call_id: &str, provider_sid: &str) -> Result<Call> {
        let mut call = self
            .calls
            .get_mut(call_id)
            .ok_or_else(|| BroadcastError::NotFound(format!("call {call_id}")))?;
        if call.status.is_terminal() {
            return Ok(call.clone());
        }
        call.status = CallStatus::Calling;
        call.start_time = Some(Utc::now());
        call.attempts += 1;
        call.provider_sid = Some(provider_sid.to_string());
        drop(call);
        self.sid_index
            .insert(provider_sid.to_string(), call_id.to_string());
        Ok(self.calls.get(call_id).unwrap().clone())
    }

    async fn mark_failed(
        &self,
        call_id: &str,
        code: &str,
        message: &str,
        retry: bool,
        max_retries: u32,
        retry_delay: chrono::Duration,
    ) -> Result<Call> {
        let mut call = self
            .calls
            .get_mut(call_id)
            .ok_or_else(|| BroadcastError::NotFound(format!("call {call_id}")))?;
        if call.status.is_terminal() {
            return Ok(call.clone());
        }
        call.provider_error = Some(ProviderError {
            code: code.to_string(),
            message: message.to_string(),
        });
        // A dial attempt happened whether or not the provider ever accepted
        // it; count it here since `markCalling` only runs on the success
        // path (spec.md §4.A/§4.G dial pipeline step f).
        call.attempts += 1;
        // attempts <= maxRetries + 1 invariant (spec.md §3 / §8).
        if retry && call.attempts < max_retries + 1 {
            call.status = CallStatus::Queued;
            call.retry_after = Some(Utc::now() + retry_delay);
        } else {
            call.status = CallStatus::Failed;
            call.end_time = Some(Utc::now());
        }
        Ok(call.clone())
    }

    async fn mark_opted_out(&self, call_id: &str) -> Result<Call> {
        let mut call = self
            .calls
            .get_mut(call_id)
            .ok_or_else(|| BroadcastError::NotFound(format!("call {call_id}")))?;
        if call.status.is_terminal() {
            return Ok(call.clone());
        }
        call.status = CallStatus::OptedOut;
        call.opted_out = true;
        call.end_time = Some(Utc::now());
        Ok(call.clone())
    }

    async fn set_dnd_status(&self, call_id: &str, status: DndStatus) -> Result<Call> {
        let mut call = self
            .calls
            .get_mut(call_id)
            .ok_or_else(|| BroadcastError::NotFound(format!("call {call_id}")))?;
        call.dnd_status = status;
        Ok(call.clone())
    }

    async fn apply_status_update(
        &self,
        call_id: &str,
        status: CallStatus,
        duration: Option<u32>,
        answered_by: Option<&str>,
        error: Option<ProviderError>,
    ) -> Result<Call> {
        let mut call = self
            .calls
            .get_mut(call_id)
            .ok_or_else(|| BroadcastError::NotFound(format!("call {call_id}")))?;

        if call.status.is_terminal() {
            // Terminal is final; duplicate/late webhooks are a no-op so
            // redelivery stays idempotent (spec.md §8).
            return Ok(call.clone());
        }
        if Self::status_rank(status) < Self::status_rank(call.status) {
            // A late update must not regress an already-advanced call.
            return Ok(call.clone());
        }

        call.status = status;
        if status == CallStatus::Answered && call.answer_time.is_none() {
            call.answer_time = Some(Utc::now());
        }
        if status == CallStatus::Completed {
            call.duration = duration.or(call.duration);
            call.end_time = Some(Utc::now());
        }
        if status.is_terminal() && call.end_time.is_none() {
            call.end_time = Some(Utc::now());
        }
        if let Some(by) = answered_by {
            call.metadata.insert("answered_by".to_string(), by.to_string());
        }
        if let Some(err) = error {
            call.metadata
                .insert("error_code".to_string(), err.code.clone());
            call.metadata
                .insert("error_message".to_string(), err.message.clone());
            call.provider_error = Some(err);
        }
        Ok(call.clone())
    }

    async fn reconcile(&self, internal_id: Option<&str>, provider_sid: &str) -> Result<Call> {
        if let Some(call_id) = self.sid_index.get(provider_sid).map(|e| e.value().clone()) {
            return self
                .get_call(&call_id)
                .await
                .ok_or_else(|| BroadcastError::NotFound(format!("call {call_id}")));
        }

        let internal_id = internal_id
            .ok_or_else(|| BroadcastError::NotFound(format!("call for sid {provider_sid}")))?;

        let mut call = self
            .calls
            .get_mut(internal_id)
            .ok_or_else(|| BroadcastError::NotFound(format!("call {internal_id}")))?;

        // Backfill resolves the dial-response-vs-first-webhook race
        // (spec.md §4.F point 1 / §9).
        if call.provider_sid.is_none() {
            call.provider_sid = Some(provider_sid.to_string());
            self.sid_index
                .insert(provider_sid.to_string(), internal_id.to_string());
        }
        Ok(call.clone())
    }

    async fn cancel_pending_calls(&self, campaign_id: &str) -> Result<usize> {
        let ids: Vec<String> = self
            .calls_for(campaign_id)
            .into_iter()
            .filter(|c| c.status == CallStatus::Queued)
            .map(|c| c.id)
            .collect();
        let mut n = 0;
        for id in &ids {
            if let Some(mut call) = self.calls.get_mut(id) {
                call.status = CallStatus::Cancelled;
                call.end_time = Some(Utc::now());
                n += 1;
            }
        }
        Ok(n)
    }

    async fn add_audio_asset(&self, campaign_id: &str, asset: AudioAsset) -> Result<()> {
        let mut campaign = self
            .campaigns
            .get_mut(campaign_id)
            .ok_or_else(|| BroadcastError::NotFound(format!("campaign {campaign_id}")))?;
        campaign.audio_assets.push(asset);
        Ok(())
    }

    async fn find_audio_asset(&self, campaign_id: &str, unique_key: &str) -> Option<AudioAsset> {
        self.campaigns
            .get(campaign_id)?
            .audio_assets
            .iter()
            .find(|a| a.unique_key == unique_key)
            .cloned()
    }

    async fn upsert_opt_out(
        &self,
        phone: &str,
        source: OptOutSource,
        metadata: HashMap<String, String>,
    ) -> Result<()> {
        let now = Utc::now();
        self.opt_outs.insert(
            phone.to_string(),
            OptOut {
                phone: phone.to_string(),
                source,
                opted_out_at: now,
                expires_at: now + chrono::Duration::days(DEFAULT_OPT_OUT_LIFETIME_DAYS),
                metadata,
            },
        );
        Ok(())
    }

    async fn is_active_opt_out(&self, phone: &str) -> bool {
        match self.opt_outs.get(phone) {
            Some(record) => record.is_active(Utc::now()),
            None => false,
        }
    }
}
