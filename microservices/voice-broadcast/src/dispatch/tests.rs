//! End-to-end Dispatch Engine scenarios (spec.md §8), driven against a real
//! `InMemoryCampaignStore` with fake `ProviderAdapter`/`Publisher`
//! implementations that record what they were asked to do.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use super::engine::{DispatchEngine, EngineConfig};
use crate::compliance::{AlwaysAllowDndProvider, ComplianceFilter};
use crate::domain::*;
use crate::error::Result;
use crate::fanout::{Event, Publisher};
use crate::provider::{PlacedCall, ProviderAdapter};
use crate::store::{CampaignStore, InMemoryCampaignStore};

struct FakeProvider {
    placed: Mutex<Vec<(String, String)>>, // (call_id, phone)
    /// Phones that should be rejected with this (code, message) pair;
    /// everything else succeeds.
    reject: Mutex<HashMap<String, (String, String)>>,
}

impl FakeProvider {
    fn new() -> Self {
        Self {
            placed: Mutex::new(Vec::new()),
            reject: Mutex::new(HashMap::new()),
        }
    }

    fn always_reject(phone: &str, code: &str, message: &str) -> Self {
        let mut reject = HashMap::new();
        reject.insert(phone.to_string(), (code.to_string(), message.to_string()));
        Self {
            placed: Mutex::new(Vec::new()),
            reject: Mutex::new(reject),
        }
    }
}

#[async_trait]
impl ProviderAdapter for FakeProvider {
    async fn place(
        &self,
        call: &Call,
        _script_url: &str,
        _status_callback_url: &str,
    ) -> Result<PlacedCall> {
        self.placed
            .lock()
            .unwrap()
            .push((call.id.clone(), call.contact.phone.clone()));
        if let Some((code, message)) = self.reject.lock().unwrap().get(&call.contact.phone) {
            return Err(crate::error::BroadcastError::ProviderRejection {
                code: code.clone(),
                message: message.clone(),
            });
        }
        Ok(PlacedCall {
            provider_sid: format!("SID-{}", call.id),
            provider_status: "initiated".to_string(),
        })
    }

    async fn terminate(&self, _provider_sid: &str) -> Result<()> {
        Ok(())
    }
}

struct RecordingPublisher {
    events: Mutex<Vec<Event>>,
}

impl RecordingPublisher {
    fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }
}

impl Publisher for RecordingPublisher {
    fn publish(&self, _room: &str, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

fn campaign(id: &str, max_concurrent: usize) -> Campaign {
    Campaign {
        id: id.to_string(),
        owner_id: "owner-1".to_string(),
        name: "Test".to_string(),
        template: "Hi {{name}}".to_string(),
        voice: VoiceProfile {
            provider: "polly".to_string(),
            voice_id: "Joanna".to_string(),
            language: "en-US".to_string(),
        },
        audio_assets: vec![],
        status: CampaignStatus::Queued,
        stats: CampaignStats::default(),
        config: CampaignConfig {
            max_concurrent,
            ..CampaignConfig::default()
        },
        created_at: Utc::now(),
        updated_at: Utc::now(),
        started_at: None,
        completed_at: None,
    }
}

fn call(campaign_id: &str, id: &str, phone: &str) -> Call {
    Call {
        id: id.to_string(),
        broadcast_id: campaign_id.to_string(),
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

fn engine_with(
    store: Arc<InMemoryCampaignStore>,
    provider: Arc<dyn ProviderAdapter>,
    publisher: Arc<RecordingPublisher>,
) -> Arc<DispatchEngine> {
    let compliance = Arc::new(ComplianceFilter::new(
        store.clone(),
        Arc::new(AlwaysAllowDndProvider),
    ));
    DispatchEngine::new(
        store,
        compliance,
        provider,
        publisher,
        EngineConfig {
            base_public_url: "https://api.example.com".to_string(),
        },
    )
}

#[tokio::test]
async fn happy_path_two_contacts_complete() {
    let store = Arc::new(InMemoryCampaignStore::new());
    store.create_campaign(campaign("c1", 2)).await.unwrap();
    store
        .add_calls(
            "c1",
            vec![call("c1", "k1", "+15551"), call("c1", "k2", "+15552")],
        )
        .await
        .unwrap();

    let provider = Arc::new(FakeProvider::new());
    let publisher = Arc::new(RecordingPublisher::new());
    let engine = engine_with(store.clone(), provider.clone(), publisher.clone());

    let stop = engine.tick("c1").await;
    assert!(!stop);
    assert_eq!(provider.placed.lock().unwrap().len(), 2);

    for call_id in ["k1", "k2"] {
        store
            .apply_status_update(call_id, CallStatus::Answered, None, None, None)
            .await
            .unwrap();
        store
            .apply_status_update(call_id, CallStatus::Completed, Some(12), None, None)
            .await
            .unwrap();
    }

    let stop = engine.tick("c1").await;
    assert!(stop);

    let finished = store.get_campaign("c1").await.unwrap();
    assert_eq!(finished.status, CampaignStatus::Completed);
    assert_eq!(finished.stats.completed, 2);

    let events = publisher.events();
    assert!(events
        .iter()
        .any(|e| matches!(e, Event::BroadcastUpdate { status, .. } if status == "completed")));
}

#[tokio::test]
async fn opted_out_contact_never_dials() {
    let store = Arc::new(InMemoryCampaignStore::new());
    store.create_campaign(campaign("c1", 1)).await.unwrap();
    store
        .add_calls("c1", vec![call("c1", "k1", "+15559")])
        .await
        .unwrap();
    store
        .upsert_opt_out("+15559", OptOutSource::Manual, HashMap::new())
        .await
        .unwrap();

    let provider = Arc::new(FakeProvider::new());
    let publisher = Arc::new(RecordingPublisher::new());
    let engine = engine_with(store.clone(), provider.clone(), publisher.clone());

    engine.tick("c1").await;

    assert!(provider.placed.lock().unwrap().is_empty());
    let call = store.get_call("k1").await.unwrap();
    assert_eq!(call.status, CallStatus::OptedOut);
}

#[tokio::test]
async fn provider_rejection_retries_then_fails() {
    let store = Arc::new(InMemoryCampaignStore::new());
    let mut c = campaign("c1", 1);
    c.config.max_retries = 2;
    c.config.retry_delay = chrono::Duration::milliseconds(20);
    store.create_campaign(c).await.unwrap();
    store
        .add_calls("c1", vec![call("c1", "k1", "+15551")])
        .await
        .unwrap();

    let provider = Arc::new(FakeProvider::always_reject("+15551", "21610", "blocked"));
    let publisher = Arc::new(RecordingPublisher::new());
    let engine = engine_with(store.clone(), provider.clone(), publisher.clone());

    engine.tick("c1").await;
    let after_first = store.get_call("k1").await.unwrap();
    assert_eq!(after_first.status, CallStatus::Queued);
    assert_eq!(after_first.attempts, 1);

    tokio::time::sleep(std::time::Duration::from_millis(30)).await;
    engine.tick("c1").await;
    let after_second = store.get_call("k1").await.unwrap();
    assert_eq!(after_second.attempts, 2);

    tokio::time::sleep(std::time::Duration::from_millis(30)).await;
    engine.tick("c1").await;
    let after_third = store.get_call("k1").await.unwrap();
    assert_eq!(after_third.status, CallStatus::Failed);
    assert_eq!(after_third.attempts, 3);
    assert_eq!(provider.placed.lock().unwrap().len(), 3);
}

#[tokio::test]
async fn max_concurrent_one_bounds_in_flight_calls() {
    let store = Arc::new(InMemoryCampaignStore::new());
    store.create_campaign(campaign("c1", 1)).await.unwrap();
    store
        .add_calls(
            "c1",
            vec![
                call("c1", "k1", "+15551"),
                call("c1", "k2", "+15552"),
                call("c1", "k3", "+15553"),
            ],
        )
        .await
        .unwrap();

    let provider = Arc::new(FakeProvider::new());
    let publisher = Arc::new(RecordingPublisher::new());
    let engine = engine_with(store.clone(), provider.clone(), publisher.clone());

    engine.tick("c1").await;
    assert_eq!(store.count_active("c1").await, 1);
    assert_eq!(provider.placed.lock().unwrap().len(), 1);

    // Complete the in-flight call so the next tick has a free slot.
    let in_flight_id = provider.placed.lock().unwrap()[0].0.clone();
    store
        .apply_status_update(&in_flight_id, CallStatus::Completed, Some(5), None, None)
        .await
        .unwrap();

    engine.tick("c1").await;
    assert_eq!(store.count_active("c1").await, 1);
    assert_eq!(provider.placed.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn cancel_mid_flight_cancels_only_queued_calls() {
    let store = Arc::new(InMemoryCampaignStore::new());
    store.create_campaign(campaign("c1", 10)).await.unwrap();
    let mut calls = Vec::new();
    for i in 0..20 {
        calls.push(call("c1", &format!("in-flight-{i}"), &format!("+1555{i}")));
    }
    for i in 0..80 {
        calls.push(call("c1", &format!("queued-{i}"), &format!("+1666{i}")));
    }
    store.add_calls("c1", calls).await.unwrap();

    for i in 0..20 {
        store
            .mark_calling(&format!("in-flight-{i}"), &format!("SID-{i}"))
            .await
            .unwrap();
    }

    let provider = Arc::new(FakeProvider::new());
    let publisher = Arc::new(RecordingPublisher::new());
    let engine = engine_with(store.clone(), provider.clone(), publisher.clone());

    engine.cancel("c1").await.unwrap();

    let campaign_after = store.get_campaign("c1").await.unwrap();
    assert_eq!(campaign_after.status, CampaignStatus::Cancelled);

    let (queued_calls, _) = store.list_calls("c1", Some(CallStatus::Cancelled), 1, 200).await;
    assert_eq!(queued_calls.len(), 80);

    let (in_flight, _) = store.list_calls("c1", Some(CallStatus::Calling), 1, 200).await;
    assert_eq!(in_flight.len(), 20);

    // cancel() on an already-cancelled campaign is a no-op.
    engine.cancel("c1").await.unwrap();
    assert_eq!(
        store.get_campaign("c1").await.unwrap().status,
        CampaignStatus::Cancelled
    );
}

#[tokio::test]
async fn cancel_on_a_completed_campaign_is_a_no_op() {
    let store = Arc::new(InMemoryCampaignStore::new());
    let mut c = campaign("c1", 10);
    c.status = CampaignStatus::Completed;
    store.create_campaign(c).await.unwrap();
    store
        .add_calls("c1", vec![call("c1", "k1", "+15551")])
        .await
        .unwrap();

    let provider = Arc::new(FakeProvider::new());
    let publisher = Arc::new(RecordingPublisher::new());
    let engine = engine_with(store.clone(), provider, publisher);

    engine.cancel("c1").await.unwrap();

    let after = store.get_campaign("c1").await.unwrap();
    assert_eq!(after.status, CampaignStatus::Completed);
    // The call was never touched by cancel() on a campaign that's already terminal.
    let call_after = store.get_call("k1").await.unwrap();
    assert_eq!(call_after.status, CallStatus::Queued);
}

#[tokio::test]
async fn start_called_twice_registers_exactly_one_ticker() {
    let store = Arc::new(InMemoryCampaignStore::new());
    store.create_campaign(campaign("c1", 1)).await.unwrap();

    let provider = Arc::new(FakeProvider::new());
    let publisher = Arc::new(RecordingPublisher::new());
    let engine = engine_with(store.clone(), provider, publisher);

    assert!(!engine.is_registered("c1"));
    engine.start("c1".to_string());
    assert!(engine.is_registered("c1"));
    engine.start("c1".to_string());
    assert!(engine.is_registered("c1"));

    engine.stop("c1");
    assert!(!engine.is_registered("c1"));
}
