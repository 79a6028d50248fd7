//! Provider Adapter (spec.md §4.D).
//!
//! Places calls through the external telephony provider and maps its status
//! vocabulary onto the domain's. Grounded on `flash_call.rs`'s
//! `FlashCallService::initiate`, which calls out to the same kind of
//! telephony collaborator over `reqwest`.

use std::time::Duration as StdDuration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::domain::{Call, CallStatus};
use crate::error::{BroadcastError, Result};

/// Answer timeout enforced by the provider itself (spec.md §5).
pub const ANSWER_TIMEOUT_SECS: u32 = 25;
/// Answering-machine detection decision window (spec.md §4.D / §5).
pub const AMD_DETECTION_SECS: u32 = 4;

pub struct PlacedCall {
    pub provider_sid: String,
    pub provider_status: String,
}

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    async fn place(
        &self,
        call: &Call,
        script_url: &str,
        status_callback_url: &str,
    ) -> Result<PlacedCall>;

    /// Forces a completed state on the provider side. Present per spec.md
    /// §4.D but never invoked by `cancel()` (§4.G / §9) — in-flight calls
    /// are left to complete naturally.
    async fn terminate(&self, provider_sid: &str) -> Result<()>;
}

/// Fixed mapping table from spec.md §4.D.
pub fn map_provider_status(provider_status: &str) -> CallStatus {
    match provider_status {
        "initiated" => CallStatus::Calling,
        "ringing" => CallStatus::Ringing,
        "in-progress" => CallStatus::Answered,
        "completed" => CallStatus::Completed,
        "busy" => CallStatus::Failed,
        "no-answer" => CallStatus::Failed,
        "failed" => CallStatus::Failed,
        "canceled" => CallStatus::Cancelled,
        _ => CallStatus::Failed,
    }
}

pub struct HttpProviderAdapter {
    client: reqwest::Client,
    api_base: String,
    account_sid: String,
    auth_token: String,
    from_number: String,
}

impl HttpProviderAdapter {
    pub fn new(api_base: String, account_sid: String, auth_token: String, from_number: String) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(StdDuration::from_secs(10))
                .build()
                .expect("reqwest client"),
            api_base,
            account_sid,
            auth_token,
            from_number,
        }
    }
}

#[derive(Deserialize)]
struct PlaceCallResponse {
    sid: String,
    status: String,
}

#[async_trait]
impl ProviderAdapter for HttpProviderAdapter {
    async fn place(
        &self,
        call: &Call,
        script_url: &str,
        status_callback_url: &str,
    ) -> Result<PlacedCall> {
        // The dial request never carries inline script data — the
        // provider always pulls the script document from `script_url`
        // at call time (spec.md §4.D).
        let form: Vec<(&str, String)> = vec![
            ("To", call.contact.phone.clone()),
            ("From", self.from_number.clone()),
            ("Url", script_url.to_string()),
            ("StatusCallback", status_callback_url.to_string()),
            ("Timeout", ANSWER_TIMEOUT_SECS.to_string()),
            ("MachineDetection", "DetectMessageEnd".to_string()),
            ("MachineDetectionTimeout", AMD_DETECTION_SECS.to_string()),
        ];
        let body = serde_urlencoded::to_string(&form)
            .map_err(|e| BroadcastError::Internal(e.to_string()))?;

        let response = self
            .client
            .post(format!("{}/Calls", self.api_base))
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .header("content-type", "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await
            .map_err(|e| BroadcastError::ProviderUnreachable(e.to_string()))?;

        if !response.status().is_success() {
            let code = response.status().as_str().to_string();
            let message = response.text().await.unwrap_or_default();
            return Err(BroadcastError::ProviderRejection { code, message });
        }

        let parsed: PlaceCallResponse = response
            .json()
            .await
            .map_err(|e| BroadcastError::ProviderUnreachable(e.to_string()))?;
        Ok(PlacedCall {
            provider_sid: parsed.sid,
            provider_status: parsed.status,
        })
    }

    async fn terminate(&self, provider_sid: &str) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/Calls/{}", self.api_base, provider_sid))
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&[("Status", "completed")])
            .send()
            .await
            .map_err(|e| BroadcastError::ProviderUnreachable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(BroadcastError::ProviderRejection {
                code: response.status().as_str().to_string(),
                message: "terminate failed".to_string(),
            });
        }
        Ok(())
    }
}
