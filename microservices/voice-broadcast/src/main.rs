//! Voice Broadcast Microservice
//!
//! Outbound voice broadcast campaign dispatch engine:
//! - Campaign intake, TTS materialization, per-campaign dispatch scheduling
//! - Provider status/keypress webhook ingestion with signature verification
//! - Room-scoped event fan-out for live dashboards
//! - Compliance gating (do-not-disturb, opt-out) ahead of every dial

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::routing::{delete, get, post};
use axum::Router;
use brivas_core::{BrivasService, HealthStatus, MicroserviceRuntime, ReadinessStatus, Result};
use tracing::info;

mod compliance;
mod config;
mod dispatch;
mod domain;
mod error;
mod fanout;
mod handlers;
mod provider;
mod script;
mod store;
mod templating;
mod tts;
mod webhook;

pub use config::BroadcastConfig;
pub use domain::Campaign;

use compliance::{AlwaysAllowDndProvider, ComplianceFilter};
use dispatch::{DispatchEngine, EngineConfig};
use fanout::RoomFanout;
use handlers::AppState;
use provider::HttpProviderAdapter;
use store::InMemoryCampaignStore;
use templating::MiniTemplateRenderer;
use tts::{HttpCdnUploader, HttpTtsClient, TtsMaterializer};

#[tokio::main]
async fn main() -> Result<()> {
    let _telemetry_guard = brivas_telemetry::init("voice-broadcast")
        .map_err(|e| brivas_core::BrivasError::Internal(e.to_string()))?;

    info!("Starting Voice Broadcast microservice");

    let service = Arc::new(VoiceBroadcastService::new().await?);
    MicroserviceRuntime::run(service).await
}

pub struct VoiceBroadcastService {
    config: Arc<BroadcastConfig>,
    state: AppState,
    start_time: std::time::Instant,
}

impl VoiceBroadcastService {
    pub async fn new() -> Result<Self> {
        let config = Arc::new(BroadcastConfig::from_env());
        for warning in config.validate_startup() {
            tracing::warn!("{warning}");
        }

        let store: Arc<dyn store::CampaignStore> = Arc::new(InMemoryCampaignStore::new());
        let publisher: Arc<dyn fanout::Publisher> = Arc::new(RoomFanout::new());
        let compliance = Arc::new(ComplianceFilter::new(
            store.clone(),
            Arc::new(AlwaysAllowDndProvider),
        ));
        let provider: Arc<dyn provider::ProviderAdapter> = Arc::new(HttpProviderAdapter::new(
            config.provider_api_base.clone(),
            config.provider_account_sid.clone(),
            config.provider_auth_token.clone(),
            config.provider_from_number.clone(),
        ));
        let materializer = Arc::new(TtsMaterializer::new(
            store.clone(),
            Arc::new(HttpTtsClient::new(config.tts_endpoint.clone())),
            Arc::new(HttpCdnUploader::new(config.cdn_base_url.clone())),
            config.cdn_folder.clone(),
        ));
        let renderer: Arc<dyn templating::TemplateRenderer> = Arc::new(MiniTemplateRenderer);

        let engine = DispatchEngine::new(
            store.clone(),
            compliance,
            provider,
            publisher.clone(),
            EngineConfig {
                base_public_url: config.base_public_url.clone(),
            },
        );

        let probe_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .expect("reqwest client");

        let state = AppState {
            store,
            engine,
            publisher,
            materializer,
            renderer,
            config: config.clone(),
            probe_client,
        };

        Ok(Self {
            config,
            state,
            start_time: std::time::Instant::now(),
        })
    }

    fn router(&self) -> Router {
        Router::new()
            .route("/health", get(handlers::health_check))
            .route("/ready", get(handlers::ready_check))
            .route("/broadcast/start", post(handlers::start_broadcast))
            .route("/broadcast/status/:id", get(handlers::get_broadcast_status))
            .route("/broadcast/:id/cancel", post(handlers::cancel_broadcast))
            .route("/broadcast/:id/calls", get(handlers::list_calls))
            .route("/broadcast/list", get(handlers::list_broadcasts))
            .route("/broadcast/:id", delete(handlers::delete_broadcast))
            .route(
                "/broadcast/twiml",
                get(handlers::script_document).post(handlers::script_document),
            )
            .route("/broadcast/:call_id/status", post(handlers::status_webhook))
            .route("/broadcast/keypress", post(handlers::keypress_webhook))
            .with_state(self.state.clone())
    }
}

#[async_trait::async_trait]
impl BrivasService for VoiceBroadcastService {
    fn service_id(&self) -> &'static str {
        "voice-broadcast"
    }

    async fn health(&self) -> HealthStatus {
        HealthStatus {
            healthy: true,
            service_id: self.service_id().to_string(),
            version: self.version().to_string(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    async fn ready(&self) -> ReadinessStatus {
        ReadinessStatus {
            ready: true,
            dependencies: vec![
                brivas_core::DependencyStatus {
                    name: "telephony-provider".to_string(),
                    available: !self.config.provider_account_sid.is_empty(),
                    latency_ms: None,
                },
                brivas_core::DependencyStatus {
                    name: "tts".to_string(),
                    available: true,
                    latency_ms: None,
                },
            ],
        }
    }

    async fn shutdown(&self) -> Result<()> {
        info!("Shutting down Voice Broadcast service");
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        info!(bind = %self.config.http_bind, "Starting Voice Broadcast HTTP server");

        let app = self.router();
        let listener = tokio::net::TcpListener::bind(&self.config.http_bind).await?;
        axum::serve(listener, app).await?;

        Ok(())
    }
}
