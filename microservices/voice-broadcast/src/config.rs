//! Environment configuration (spec.md §6 "Configuration"), following
//! `VoiceIvrConfig::from_env`'s shape: one env var per field, a sane local
//! default via `unwrap_or_else`.

use std::env;

#[derive(Debug, Clone)]
pub struct BroadcastConfig {
    pub http_bind: String,
    pub base_public_url: String,

    pub provider_api_base: String,
    pub provider_account_sid: String,
    pub provider_auth_token: String,
    pub provider_from_number: String,
    pub provider_signing_secret: String,

    pub tts_endpoint: String,
    pub cdn_base_url: String,
    pub cdn_folder: String,

    pub jwt_secret: String,
    pub db_uri: String,
    pub log_level: String,
}

impl BroadcastConfig {
    pub fn from_env() -> Self {
        Self {
            http_bind: env::var("HTTP_BIND").unwrap_or_else(|_| "0.0.0.0:8085".to_string()),
            base_public_url: env::var("BASE_PUBLIC_URL")
                .unwrap_or_else(|_| "http://localhost:8085".to_string()),

            provider_api_base: env::var("PROVIDER_API_BASE")
                .unwrap_or_else(|_| "https://api.telephony-provider.example/v1".to_string()),
            provider_account_sid: env::var("PROVIDER_ACCOUNT_SID").unwrap_or_default(),
            provider_auth_token: env::var("PROVIDER_AUTH_TOKEN").unwrap_or_default(),
            provider_from_number: env::var("PROVIDER_FROM_NUMBER").unwrap_or_default(),
            provider_signing_secret: env::var("PROVIDER_SIGNING_SECRET").unwrap_or_default(),

            tts_endpoint: env::var("TTS_ENDPOINT")
                .unwrap_or_else(|_| "http://localhost:9000/synthesize".to_string()),
            cdn_base_url: env::var("CDN_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:9100".to_string()),
            cdn_folder: env::var("CDN_FOLDER").unwrap_or_else(|_| "voice-broadcast".to_string()),

            jwt_secret: env::var("JWT_SECRET").unwrap_or_default(),
            db_uri: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgres://localhost/brivas".to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        }
    }

    /// Critical, non-fatal startup warnings (spec.md §6): a missing or
    /// `localhost` base URL means the provider can never reach the Script
    /// Generator or status callback endpoints.
    pub fn validate_startup(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.base_public_url.is_empty() {
            warnings.push("BASE_PUBLIC_URL is not set; the provider cannot reach this service".to_string());
        } else if self.base_public_url.contains("localhost") || self.base_public_url.contains("127.0.0.1") {
            warnings.push(format!(
                "BASE_PUBLIC_URL ({}) looks like a local address; the telephony provider will not be able to reach it",
                self.base_public_url
            ));
        }
        if self.provider_account_sid.is_empty() || self.provider_auth_token.is_empty() {
            warnings.push("telephony provider credentials are not configured".to_string());
        }
        if self.provider_signing_secret.is_empty() {
            warnings.push("PROVIDER_SIGNING_SECRET is not set; webhook signature checks will reject everything".to_string());
        }
        warnings
    }
}
