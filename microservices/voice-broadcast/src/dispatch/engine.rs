//! Per-campaign scheduler. One `tokio::spawn`'d ticker per registered
//! campaign, owned by a `DashMap<CampaignId, DispatchHandle>` registry —
//! the same shape as `PredictiveDialer::run_predictive_loop` and
//! `BulkVoiceService::execute_campaign`, generalized to a start/stop-managed
//! registry per spec.md §9's "Model as a `Map<CampaignId, DispatchHandle>`".

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::interval;

use brivas_telemetry::{Counter, Gauge};

use crate::compliance::{ComplianceFilter, ComplianceOutcome};
use crate::domain::{Call, CallStatus, Campaign, CampaignStatus, DndStatus};
use crate::error::{BroadcastError, Result};
use crate::fanout::{room_for, Event, Publisher, GLOBAL_ROOM};
use crate::provider::ProviderAdapter;
use crate::store::CampaignStore;

/// `T_poll` (spec.md §5).
pub const TICK_INTERVAL: Duration = Duration::from_secs(5);

pub struct EngineConfig {
    pub base_public_url: String,
}

struct DispatchHandle {
    join: JoinHandle<()>,
    /// Re-entrancy guard: a tick in progress suppresses the next tick for
    /// the same campaign (spec.md §5).
    ticking: Arc<AtomicBool>,
}

pub struct DispatchEngine {
    store: Arc<dyn CampaignStore>,
    compliance: Arc<ComplianceFilter>,
    provider: Arc<dyn ProviderAdapter>,
    publisher: Arc<dyn Publisher>,
    config: EngineConfig,
    registry: DashMap<String, DispatchHandle>,
    dial_attempts: Counter,
    active_calls_gauge: Gauge,
}

impl DispatchEngine {
    pub fn new(
        store: Arc<dyn CampaignStore>,
        compliance: Arc<ComplianceFilter>,
        provider: Arc<dyn ProviderAdapter>,
        publisher: Arc<dyn Publisher>,
        config: EngineConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            compliance,
            provider,
            publisher,
            config,
            registry: DashMap::new(),
            dial_attempts: Counter::new("voice_broadcast_dial_attempts"),
            active_calls_gauge: Gauge::new("voice_broadcast_active_in_flight_calls"),
        })
    }

    pub fn is_registered(&self, campaign_id: &str) -> bool {
        self.registry.contains_key(campaign_id)
    }

    /// `start(campaignId)` (spec.md §4.G). Idempotent — a campaign already
    /// registered produces a warning and no-op.
    pub fn start(self: &Arc<Self>, campaign_id: String) {
        if self.registry.contains_key(&campaign_id) {
            tracing::warn!(campaign_id = %campaign_id, "dispatch already registered; start() is a no-op");
            return;
        }
        let ticking = Arc::new(AtomicBool::new(false));
        let engine = Arc::clone(self);
        let ticking_loop = Arc::clone(&ticking);
        let loop_campaign_id = campaign_id.clone();
        let join = tokio::spawn(async move {
            let mut ticker = interval(TICK_INTERVAL);
            loop {
                ticker.tick().await;
                if ticking_loop.swap(true, Ordering::SeqCst) {
                    continue;
                }
                let should_stop = engine.tick(&loop_campaign_id).await;
                ticking_loop.store(false, Ordering::SeqCst);
                if should_stop {
                    engine.registry.remove(&loop_campaign_id);
                    break;
                }
            }
        });
        self.registry
            .insert(campaign_id, DispatchHandle { join, ticking });
    }

    pub fn stop(&self, campaign_id: &str) {
        if let Some((_, handle)) = self.registry.remove(campaign_id) {
            handle.join.abort();
        }
    }

    /// Runs one tick of spec.md §4.G's procedure. Returns `true` when the
    /// caller should stop the ticker for this campaign.
    pub(crate) async fn tick(&self, campaign_id: &str) -> bool {
        let campaign = match self.store.get_campaign(campaign_id).await {
            Some(c) => c,
            None => {
                tracing::warn!(campaign_id = %campaign_id, "dispatch tick for unknown campaign; stopping");
                return true;
            }
        };

        if matches!(
            campaign.status,
            CampaignStatus::Completed | CampaignStatus::Cancelled
        ) {
            return true;
        }

        let campaign = if campaign.status == CampaignStatus::Queued {
            self.store
                .transition_campaign_status(campaign_id, CampaignStatus::InProgress)
                .await
                .unwrap_or(campaign)
        } else {
            campaign
        };

        let active = self.store.count_active(campaign_id).await;
        self.active_calls_gauge.set(active as u64);
        let slots = campaign.config.max_concurrent.saturating_sub(active);
        if slots == 0 {
            return false;
        }

        let mut batch = self.store.get_fresh(campaign_id, slots).await;
        if batch.len() < slots {
            let deficit = slots - batch.len();
            batch.extend(self.store.get_retryable(campaign_id, deficit).await);
        }

        if batch.is_empty() {
            if self.store.count_pending(campaign_id).await == 0 {
                if let Ok(completed) = self
                    .store
                    .transition_campaign_status(campaign_id, CampaignStatus::Completed)
                    .await
                {
                    self.store.aggregate_by_status(campaign_id).await.ok();
                    if let Some(refreshed) = self.store.get_campaign(campaign_id).await {
                        self.emit_broadcast_update(&refreshed).await;
                    } else {
                        self.emit_broadcast_update(&completed).await;
                    }
                    self.publisher.publish(
                        GLOBAL_ROOM,
                        Event::BroadcastListUpdate {
                            timestamp: chrono::Utc::now(),
                        },
                    );
                }
                return true;
            }
            return false;
        }

        // Step 7: dialed concurrently, but the tick waits for every dial to
        // resolve before returning — bounds in-flight work and keeps the
        // next tick's `active` count accurate.
        let dials = batch.into_iter().map(|call| self.dial_one(call, &campaign));
        futures_util::future::join_all(dials).await;

        false
    }

    async fn dial_one(&self, call: Call, campaign: &Campaign) {
        // (a) optimistic pre-dial emit.
        self.publisher.publish(
            &room_for(&campaign.id),
            Event::CallUpdate {
                broadcast_id: campaign.id.clone(),
                call_id: call.id.clone(),
                call_sid: call.provider_sid.clone(),
                phone: call.contact.phone.clone(),
                status: "calling".to_string(),
                duration: None,
                timestamp: chrono::Utc::now(),
            },
        );

        // (b) compliance filter, short-circuiting before any dial.
        match self.compliance.evaluate(&call, campaign).await {
            Ok(ComplianceOutcome::Blocked) => {
                self.store.set_dnd_status(&call.id, DndStatus::Blocked).await.ok();
                if let Ok(updated) = self
                    .store
                    .mark_failed(
                        &call.id,
                        "dnd_blocked",
                        "blocked by do-not-disturb registry",
                        false,
                        campaign.config.max_retries,
                        campaign.config.retry_delay,
                    )
                    .await
                {
                    self.emit_call_update(&updated).await;
                }
                return;
            }
            Ok(ComplianceOutcome::OptedOut) => {
                if let Ok(updated) = self.store.mark_opted_out(&call.id).await {
                    self.emit_call_update(&updated).await;
                }
                return;
            }
            Ok(ComplianceOutcome::Proceed) => {
                self.store.set_dnd_status(&call.id, DndStatus::Allowed).await.ok();
            }
            Err(err) => {
                tracing::warn!(call_id = %call.id, error = %err, "compliance check failed; leaving call queued for the next tick");
                return;
            }
        }

        // (c) place the call, referencing the Script Generator URL rather
        // than carrying inline script data.
        self.dial_attempts.inc();
        let script_url = script_url_for(&self.config.base_public_url, &call, campaign);
        let status_callback_url = format!(
            "{}/broadcast/{}/status",
            self.config.base_public_url, call.id
        );

        match self
            .provider
            .place(&call, &script_url, &status_callback_url)
            .await
        {
            Ok(placed) => {
                // (d)/(e)
                match self.store.mark_calling(&call.id, &placed.provider_sid).await {
                    Ok(updated) => self.emit_call_update(&updated).await,
                    Err(err) => {
                        tracing::error!(call_id = %call.id, error = %err, "mark_calling failed after a successful place")
                    }
                }
            }
            Err(err) => {
                // (f)
                let (code, message) = provider_error_parts(&err);
                if let Ok(updated) = self
                    .store
                    .mark_failed(
                        &call.id,
                        &code,
                        &message,
                        true,
                        campaign.config.max_retries,
                        campaign.config.retry_delay,
                    )
                    .await
                {
                    self.emit_call_update(&updated).await;
                }
            }
        }
    }

    async fn emit_call_update(&self, call: &Call) {
        self.publisher.publish(
            &room_for(&call.broadcast_id),
            Event::CallUpdate {
                broadcast_id: call.broadcast_id.clone(),
                call_id: call.id.clone(),
                call_sid: call.provider_sid.clone(),
                phone: call.contact.phone.clone(),
                status: status_label(call.status),
                duration: call.duration,
                timestamp: chrono::Utc::now(),
            },
        );
    }

    async fn emit_broadcast_update(&self, campaign: &Campaign) {
        let active = self.store.count_active(&campaign.id).await;
        self.publisher.publish(
            &room_for(&campaign.id),
            Event::BroadcastUpdate {
                broadcast_id: campaign.id.clone(),
                status: campaign_status_label(campaign.status),
                stats: campaign.stats,
                active_calls: Some(active),
                timestamp: chrono::Utc::now(),
            },
        );
    }

    /// `cancel(campaignId)` (spec.md §4.G). In-flight provider calls are
    /// deliberately left to complete via their own webhooks (spec.md §9) —
    /// a no-op on an already-terminal campaign, matching §8's idempotence
    /// requirement.
    pub async fn cancel(&self, campaign_id: &str) -> Result<()> {
        let campaign = self
            .store
            .get_campaign(campaign_id)
            .await
            .ok_or_else(|| BroadcastError::NotFound(format!("campaign {campaign_id}")))?;
        if matches!(
            campaign.status,
            CampaignStatus::Completed | CampaignStatus::Cancelled
        ) {
            return Ok(());
        }

        self.stop(campaign_id);
        self.store.cancel_pending_calls(campaign_id).await?;
        self.store
            .transition_campaign_status(campaign_id, CampaignStatus::Cancelled)
            .await?;
        self.store.aggregate_by_status(campaign_id).await?;

        if let Some(refreshed) = self.store.get_campaign(campaign_id).await {
            self.emit_broadcast_update(&refreshed).await;
        }
        self.publisher.publish(
            GLOBAL_ROOM,
            Event::BroadcastListUpdate {
                timestamp: chrono::Utc::now(),
            },
        );
        Ok(())
    }
}

fn script_url_for(base_public_url: &str, call: &Call, campaign: &Campaign) -> String {
    format!(
        "{base_public_url}/broadcast/twiml?audioUrl={}&disclaimer={}",
        percent_encode(&call.personalized_message.audio_url),
        percent_encode(&campaign.config.compliance.disclaimer_text),
    )
}

/// Minimal query-string percent-encoding; this workspace has no dedicated
/// URL crate, so this follows the hand-rolled-over-new-dependency precedent
/// already set by `script.rs`'s `escape_xml`.
fn percent_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

fn provider_error_parts(err: &BroadcastError) -> (String, String) {
    match err {
        BroadcastError::ProviderRejection { code, message } => (code.clone(), message.clone()),
        BroadcastError::ProviderUnreachable(message) => {
            ("provider_unreachable".to_string(), message.clone())
        }
        other => ("dial_error".to_string(), other.to_string()),
    }
}

fn status_label(status: CallStatus) -> String {
    serde_json::to_value(status)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| "unknown".to_string())
}

fn campaign_status_label(status: CampaignStatus) -> String {
    serde_json::to_value(status)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| "unknown".to_string())
}
