//! Webhook Sink (spec.md §4.F).
//!
//! Consumes the provider's status and keypress callbacks. Signature
//! verification follows `stir_shaken.rs`'s verification-result shape; the
//! `hmac`/`sha2` pair was already a declared dependency in this workspace's
//! `payment-service` and is used for real here.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;

use crate::domain::{Call, CallStatus, OptOutSource, ProviderError};
use crate::error::{BroadcastError, Result};
use crate::fanout::{room_for, Event, Publisher, GLOBAL_ROOM};
use crate::provider::map_provider_status;
use crate::store::CampaignStore;

type HmacSha256 = Hmac<Sha256>;

/// `HMAC-SHA256(signing_secret, full_url || sorted_form_params)` where
/// `sorted_form_params` is every form field, sorted by key, joined as
/// `key=value` pairs separated by `&` (spec.md §6).
pub fn verify_signature(
    signing_secret: &str,
    full_url: &str,
    form_params: &HashMap<String, String>,
    provided_signature: &str,
) -> bool {
    let mut keys: Vec<&String> = form_params.keys().collect();
    keys.sort();
    let sorted: String = keys
        .into_iter()
        .map(|k| format!("{k}={}", form_params[k]))
        .collect::<Vec<_>>()
        .join("&");
    let payload = format!("{full_url}{sorted}");

    let mut mac = match HmacSha256::new_from_slice(signing_secret.as_bytes()) {
        Ok(m) => m,
        Err(_) => return false,
    };
    mac.update(payload.as_bytes());
    let expected = mac.finalize().into_bytes();
    let expected_hex = hex_encode(&expected);
    constant_time_eq(expected_hex.as_bytes(), provided_signature.as_bytes())
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[derive(Debug, Deserialize)]
pub struct StatusWebhookForm {
    #[serde(rename = "providerSid")]
    pub provider_sid: String,
    #[serde(rename = "providerStatus")]
    pub provider_status: String,
    pub duration: Option<u32>,
    #[serde(rename = "answeredBy")]
    pub answered_by: Option<String>,
    #[serde(rename = "errorCode")]
    pub error_code: Option<String>,
    #[serde(rename = "errorMessage")]
    pub error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct KeypressWebhookForm {
    #[serde(rename = "providerSid")]
    pub provider_sid: String,
    pub digits: String,
}

/// Steps 1–5 of spec.md §4.F's call-status algorithm. Step 6 (status code
/// selection) is the caller's job since it depends on how the `Result` here
/// is translated to a response.
pub async fn handle_status_webhook(
    store: &dyn CampaignStore,
    publisher: &dyn Publisher,
    internal_call_id: &str,
    form: StatusWebhookForm,
) -> Result<Call> {
    let located = store.reconcile(Some(internal_call_id), &form.provider_sid).await?;

    let mapped = map_provider_status(&form.provider_status);
    let error = match (&form.error_code, &form.error_message) {
        (Some(code), Some(message)) => Some(ProviderError {
            code: code.clone(),
            message: message.clone(),
        }),
        (Some(code), None) => Some(ProviderError {
            code: code.clone(),
            message: String::new(),
        }),
        _ => None,
    };

    let updated = store
        .apply_status_update(
            &located.id,
            mapped,
            form.duration,
            form.answered_by.as_deref(),
            error,
        )
        .await?;

    publisher.publish(
        &room_for(&updated.broadcast_id),
        Event::CallUpdate {
            broadcast_id: updated.broadcast_id.clone(),
            call_id: updated.id.clone(),
            call_sid: updated.provider_sid.clone(),
            phone: updated.contact.phone.clone(),
            status: status_label(updated.status),
            duration: updated.duration,
            timestamp: Utc::now(),
        },
    );

    let stats = store.aggregate_by_status(&updated.broadcast_id).await?;
    if let Some(campaign) = store.get_campaign(&updated.broadcast_id).await {
        let active = store.count_active(&updated.broadcast_id).await;
        publisher.publish(
            &room_for(&updated.broadcast_id),
            Event::BroadcastUpdate {
                broadcast_id: campaign.id.clone(),
                status: status_label_campaign(campaign.status),
                stats,
                active_calls: Some(active),
                timestamp: Utc::now(),
            },
        );
    }

    Ok(updated)
}

/// spec.md §4.F keypress algorithm. `digits == "9"` opts the contact out
/// globally and marks the call terminal; anything else is a no-op reply.
pub async fn handle_keypress_webhook(
    store: Arc<dyn CampaignStore>,
    publisher: &dyn Publisher,
    form: KeypressWebhookForm,
) -> Result<bool> {
    let call = store.reconcile(None, &form.provider_sid).await?;

    if form.digits != "9" {
        return Ok(false);
    }

    let updated = store.mark_opted_out(&call.id).await?;
    store
        .upsert_opt_out(&call.contact.phone, OptOutSource::BroadcastKeypress, HashMap::new())
        .await?;

    publisher.publish(
        &room_for(&updated.broadcast_id),
        Event::CallUpdate {
            broadcast_id: updated.broadcast_id.clone(),
            call_id: updated.id.clone(),
            call_sid: updated.provider_sid.clone(),
            phone: updated.contact.phone.clone(),
            status: status_label(updated.status),
            duration: updated.duration,
            timestamp: Utc::now(),
        },
    );

    let stats = store.aggregate_by_status(&updated.broadcast_id).await?;
    publisher.publish(
        GLOBAL_ROOM,
        Event::StatsUpdate {
            broadcast_id: updated.broadcast_id.clone(),
            stats,
            timestamp: Utc::now(),
        },
    );

    Ok(true)
}

fn status_label(status: CallStatus) -> String {
    serde_json::to_value(status)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| "unknown".to_string())
}

fn status_label_campaign(status: crate::domain::CampaignStatus) -> String {
    serde_json::to_value(status)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| "unknown".to_string())
}

pub fn not_found_error(internal_call_id: &str) -> BroadcastError {
    BroadcastError::NotFound(format!("call {internal_call_id}"))
}
