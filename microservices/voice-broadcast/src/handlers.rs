//! HTTP handlers, wired into the router in `main.rs`. One section per
//! resource group, following `instant-messaging/src/api/rest.rs`'s layout.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::config::BroadcastConfig;
use crate::dispatch::DispatchEngine;
use crate::domain::*;
use crate::error::{BroadcastError, Result};
use crate::fanout::{room_for, Event, Publisher, GLOBAL_ROOM};
use crate::script::{self, VoiceScript};
use crate::store::CampaignStore;
use crate::templating::TemplateRenderer;
use crate::tts::TtsMaterializer;
use crate::webhook::{self, KeypressWebhookForm, StatusWebhookForm};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn CampaignStore>,
    pub engine: Arc<DispatchEngine>,
    pub publisher: Arc<dyn Publisher>,
    pub materializer: Arc<TtsMaterializer>,
    pub renderer: Arc<dyn TemplateRenderer>,
    pub config: Arc<BroadcastConfig>,
    pub probe_client: reqwest::Client,
}

/// Standard API response wrapper.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

// =============================================================================
// Health Handlers
// =============================================================================

pub async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(serde_json::json!({ "status": "healthy" })),
    )
}

pub async fn ready_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(serde_json::json!({ "status": "ready" })),
    )
}

// =============================================================================
// POST /broadcast/start
// =============================================================================

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ContactInput {
    #[validate(length(min = 1))]
    pub phone: String,
    #[validate(length(min = 1))]
    pub name: String,
    #[serde(default)]
    pub custom_fields: HashMap<String, String>,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct StartBroadcastRequest {
    #[validate(length(min = 1))]
    pub name: String,
    #[validate(length(min = 1))]
    pub message_template: String,
    pub voice: VoiceProfile,
    #[validate(length(min = 1, max = 10_000))]
    #[validate(nested)]
    pub contacts: Vec<ContactInput>,
    pub max_concurrent: Option<usize>,
    pub max_retries: Option<u32>,
    pub compliance: Option<ComplianceConfig>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartBroadcastResponse {
    pub id: String,
    pub name: String,
    pub status: CampaignStatus,
    pub total_contacts: usize,
}

/// Creates the Campaign and Call rows, materializes TTS once, then hands the
/// campaign to the Dispatch Engine. A TTS/CDN failure leaves the campaign in
/// `draft` with no calls enqueued.
pub async fn start_broadcast(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<StartBroadcastRequest>,
) -> Result<impl IntoResponse> {
    req.validate()
        .map_err(|e| BroadcastError::Validation(e.to_string()))?;
    state.renderer.validate(&req.message_template)?;

    let owner_id = headers
        .get("x-owner-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("anonymous")
        .to_string();

    let mut config = CampaignConfig::default();
    if let Some(max_concurrent) = req.max_concurrent {
        config.max_concurrent = max_concurrent;
    }
    if let Some(max_retries) = req.max_retries {
        config.max_retries = max_retries;
    }
    if let Some(compliance) = req.compliance {
        config.compliance = compliance;
    }

    let now = Utc::now();
    let campaign_id = Uuid::new_v4().to_string();
    let campaign = Campaign {
        id: campaign_id.clone(),
        owner_id,
        name: req.name.clone(),
        template: req.message_template.clone(),
        voice: req.voice,
        audio_assets: vec![],
        status: CampaignStatus::Draft,
        stats: CampaignStats {
            total: req.contacts.len(),
            ..Default::default()
        },
        config,
        created_at: now,
        updated_at: now,
        started_at: None,
        completed_at: None,
    };
    state.store.create_campaign(campaign.clone()).await?;

    let asset = state.materializer.materialize(&campaign).await?;

    let calls: Vec<Call> = req
        .contacts
        .into_iter()
        .map(|contact| {
            let contact = Contact {
                phone: contact.phone,
                name: contact.name,
                custom_fields: contact.custom_fields,
            };
            let text = state.renderer.render(&campaign.template, &contact);
            Call {
                id: Uuid::new_v4().to_string(),
                broadcast_id: campaign_id.clone(),
                personalized_message: PersonalizedMessage {
                    text,
                    audio_url: asset.audio_url.clone(),
                    audio_asset_id: asset.unique_key.clone(),
                },
                contact,
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
        })
        .collect();
    let total_contacts = calls.len();
    state.store.add_calls(&campaign_id, calls).await?;
    state
        .store
        .transition_campaign_status(&campaign_id, CampaignStatus::Queued)
        .await?;
    state.store.aggregate_by_status(&campaign_id).await?;

    state.publisher.publish(
        &room_for(&campaign_id),
        Event::CallsCreated {
            broadcast_id: campaign_id.clone(),
            timestamp: Utc::now(),
        },
    );
    state.publisher.publish(
        GLOBAL_ROOM,
        Event::BroadcastListUpdate {
            timestamp: Utc::now(),
        },
    );

    state.engine.start(campaign_id.clone());

    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::success(StartBroadcastResponse {
            id: campaign_id,
            name: req.name,
            status: CampaignStatus::Queued,
            total_contacts,
        })),
    ))
}

// =============================================================================
// GET /broadcast/status/:id
// =============================================================================

pub async fn get_broadcast_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    state.store.aggregate_by_status(&id).await?;
    let campaign = state
        .store
        .get_campaign(&id)
        .await
        .ok_or_else(|| BroadcastError::NotFound(format!("campaign {id}")))?;
    Ok(Json(ApiResponse::success(campaign)))
}

// =============================================================================
// POST /broadcast/:id/cancel
// =============================================================================

pub async fn cancel_broadcast(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    state.engine.cancel(&id).await?;
    Ok(Json(ApiResponse::success(
        serde_json::json!({ "cancelled": true }),
    )))
}

// =============================================================================
// GET /broadcast/:id/calls
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct CallsQuery {
    pub status: Option<CallStatus>,
    #[serde(default = "default_page")]
    pub page: usize,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_page() -> usize {
    1
}

fn default_limit() -> usize {
    50
}

#[derive(Debug, Serialize)]
pub struct PaginatedResponse<T: Serialize> {
    pub items: Vec<T>,
    pub total: usize,
    pub page: usize,
    pub limit: usize,
}

pub async fn list_calls(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<CallsQuery>,
) -> Result<impl IntoResponse> {
    let (items, total) = state
        .store
        .list_calls(&id, query.status, query.page, query.limit)
        .await;
    Ok(Json(ApiResponse::success(PaginatedResponse {
        items,
        total,
        page: query.page,
        limit: query.limit,
    })))
}

// =============================================================================
// GET /broadcast/list
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<CampaignStatus>,
    #[serde(default = "default_page")]
    pub page: usize,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

pub async fn list_broadcasts(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse> {
    let owner_id = headers.get("x-owner-id").and_then(|v| v.to_str().ok());
    let (items, total) = state
        .store
        .list_campaigns(owner_id, query.status, query.page, query.limit)
        .await;
    Ok(Json(ApiResponse::success(PaginatedResponse {
        items,
        total,
        page: query.page,
        limit: query.limit,
    })))
}

// =============================================================================
// DELETE /broadcast/:id
// =============================================================================

pub async fn delete_broadcast(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    // Cancelling first stops the ticker and flips any still-queued calls
    // before the row disappears.
    state.engine.cancel(&id).await.ok();
    let campaign = state.store.delete_campaign(&id).await?;
    for asset in &campaign.audio_assets {
        tracing::info!(unique_key = %asset.unique_key, "would delete CDN asset for deleted campaign");
    }
    Ok(Json(ApiResponse::success(
        serde_json::json!({ "deleted": true }),
    )))
}

// =============================================================================
// GET/ALL /broadcast/twiml
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct ScriptQuery {
    #[serde(rename = "audioUrl")]
    pub audio_url: Option<String>,
    pub disclaimer: Option<String>,
}

pub async fn script_document(
    State(state): State<AppState>,
    Query(query): Query<ScriptQuery>,
) -> impl IntoResponse {
    let headers = [
        (header::CONTENT_TYPE, "text/xml"),
        (header::CACHE_CONTROL, "no-cache"),
    ];

    let (Some(audio_url), Some(disclaimer)) = (query.audio_url, query.disclaimer) else {
        return (
            headers,
            script::error_document("Sorry, this call cannot be completed."),
        );
    };

    let probe_client = state.probe_client.clone();
    let probe_url = audio_url.clone();
    tokio::spawn(async move {
        script::probe_audio_reachable(probe_client, probe_url).await;
    });

    let doc = VoiceScript {
        disclaimer_text: disclaimer,
        audio_url,
        keypress_action_url: format!("{}/broadcast/keypress", state.config.base_public_url),
    }
    .to_xml();

    (headers, doc)
}

// =============================================================================
// Webhooks: POST /broadcast/:callId/status, POST /broadcast/keypress
// =============================================================================

pub async fn status_webhook(
    State(state): State<AppState>,
    Path(internal_call_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let full_url = format!(
        "{}/broadcast/{}/status",
        state.config.base_public_url, internal_call_id
    );
    match verify_and_parse::<StatusWebhookForm>(&state, &headers, &full_url, &body) {
        Ok(form) => {
            match webhook::handle_status_webhook(
                state.store.as_ref(),
                state.publisher.as_ref(),
                &internal_call_id,
                form,
            )
            .await
            {
                Ok(_) => StatusCode::OK.into_response(),
                Err(err) => err.into_response(),
            }
        }
        Err(err) => err.into_response(),
    }
}

pub async fn keypress_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let full_url = format!("{}/broadcast/keypress", state.config.base_public_url);
    let form = match verify_and_parse::<KeypressWebhookForm>(&state, &headers, &full_url, &body) {
        Ok(form) => form,
        Err(err) => return err.into_response(),
    };
    let opted_out_request = form.digits == "9";

    let response_headers = [
        (header::CONTENT_TYPE, "text/xml"),
        (header::CACHE_CONTROL, "no-cache"),
    ];
    match webhook::handle_keypress_webhook(state.store.clone(), state.publisher.as_ref(), form)
        .await
    {
        Ok(opted_out) => {
            (response_headers, script::keypress_response_document(opted_out)).into_response()
        }
        Err(_) if opted_out_request => {
            (response_headers, script::keypress_response_document(false)).into_response()
        }
        Err(err) => err.into_response(),
    }
}

fn verify_and_parse<T: for<'de> Deserialize<'de>>(
    state: &AppState,
    headers: &HeaderMap,
    full_url: &str,
    body: &[u8],
) -> Result<T> {
    let signature = headers
        .get("x-provider-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or(BroadcastError::SignatureInvalid)?;

    let params: HashMap<String, String> = serde_urlencoded::from_bytes(body)
        .map_err(|e| BroadcastError::Validation(e.to_string()))?;

    if !webhook::verify_signature(
        &state.config.provider_signing_secret,
        full_url,
        &params,
        signature,
    ) {
        return Err(BroadcastError::SignatureInvalid);
    }

    serde_urlencoded::from_bytes(body).map_err(|e| BroadcastError::Validation(e.to_string()))
}
