//! TTS Materializer (spec.md §4.C).
//!
//! Runs once per campaign, before dispatch is ever registered: hash the
//! template, synthesize if no asset with that hash exists yet, upload to the
//! CDN, persist the result. `TtsClient`/`CdnUploader` are the narrow HTTP
//! collaborator traits this workspace always puts in front of an external
//! service (see `flash_call.rs`'s comment calling out to its own telephony
//! collaborator).

use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::Utc;
use md5::{Digest, Md5};

use crate::domain::{AudioAsset, Campaign, VoiceProfile};
use crate::error::{BroadcastError, Result};
use crate::store::CampaignStore;

#[async_trait]
pub trait TtsClient: Send + Sync {
    /// Returns raw audio bytes and, when the provider reports one, the
    /// duration in seconds.
    async fn synthesize(&self, text: &str, voice: &VoiceProfile) -> Result<(Vec<u8>, Option<u32>)>;
}

#[async_trait]
pub trait CdnUploader: Send + Sync {
    /// Uploads `bytes` under `folder/key` and returns the public URL.
    async fn upload(&self, folder: &str, key: &str, bytes: Vec<u8>) -> Result<String>;
}

pub struct HttpTtsClient {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpTtsClient {
    pub fn new(endpoint: String) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(StdDuration::from_secs(30))
                .build()
                .expect("reqwest client"),
            endpoint,
        }
    }
}

#[async_trait]
impl TtsClient for HttpTtsClient {
    async fn synthesize(&self, text: &str, voice: &VoiceProfile) -> Result<(Vec<u8>, Option<u32>)> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&serde_json::json!({
                "text": text,
                "voice": voice.voice_id,
                "provider": voice.provider,
                "language": voice.language,
            }))
            .send()
            .await
            .map_err(|e| BroadcastError::TtsUnavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(BroadcastError::TtsUnavailable(format!(
                "tts service returned {}",
                response.status()
            )));
        }

        let duration = response
            .headers()
            .get("x-audio-duration-seconds")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u32>().ok());
        let bytes = response
            .bytes()
            .await
            .map_err(|e| BroadcastError::TtsUnavailable(e.to_string()))?;
        Ok((bytes.to_vec(), duration))
    }
}

pub struct HttpCdnUploader {
    client: reqwest::Client,
    base_url: String,
}

impl HttpCdnUploader {
    pub fn new(base_url: String) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(StdDuration::from_secs(30))
                .build()
                .expect("reqwest client"),
            base_url,
        }
    }
}

#[async_trait]
impl CdnUploader for HttpCdnUploader {
    async fn upload(&self, folder: &str, key: &str, bytes: Vec<u8>) -> Result<String> {
        let url = format!("{}/{}/{}", self.base_url.trim_end_matches('/'), folder, key);
        let response = self
            .client
            .put(&url)
            .body(bytes)
            .send()
            .await
            .map_err(|e| BroadcastError::CdnUnavailable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(BroadcastError::CdnUnavailable(format!(
                "cdn upload returned {}",
                response.status()
            )));
        }
        Ok(url)
    }
}

pub struct TtsMaterializer {
    store: Arc<dyn CampaignStore>,
    tts: Arc<dyn TtsClient>,
    cdn: Arc<dyn CdnUploader>,
    cdn_folder: String,
}

impl TtsMaterializer {
    pub fn new(
        store: Arc<dyn CampaignStore>,
        tts: Arc<dyn TtsClient>,
        cdn: Arc<dyn CdnUploader>,
        cdn_folder: String,
    ) -> Self {
        Self {
            store,
            tts,
            cdn,
            cdn_folder,
        }
    }

    pub fn unique_key(template_text: &str) -> String {
        let mut hasher = Md5::new();
        hasher.update(template_text.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    fn estimate_duration(text: &str) -> u32 {
        let word_count = text.split_whitespace().count().max(1) as f64;
        (word_count / 2.5).ceil() as u32
    }

    /// Synthesizes and uploads the campaign's template once, reusing any
    /// existing asset with the same `uniqueKey` (spec.md §4.C).
    pub async fn materialize(&self, campaign: &Campaign) -> Result<AudioAsset> {
        let unique_key = Self::unique_key(&campaign.template);

        if let Some(existing) = self.store.find_audio_asset(&campaign.id, &unique_key).await {
            return Ok(existing);
        }

        let (bytes, reported_duration) = self
            .tts
            .synthesize(&campaign.template, &campaign.voice)
            .await?;
        let audio_url = self
            .cdn
            .upload(&self.cdn_folder, &unique_key, bytes)
            .await?;
        let duration = reported_duration.unwrap_or_else(|| Self::estimate_duration(&campaign.template));

        let asset = AudioAsset {
            unique_key,
            text: campaign.template.clone(),
            audio_url,
            duration,
            generated_at: Utc::now(),
        };
        self.store.add_audio_asset(&campaign.id, asset.clone()).await?;
        Ok(asset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_key_is_stable_for_same_template() {
        let a = TtsMaterializer::unique_key("Hi {{name}}");
        let b = TtsMaterializer::unique_key("Hi {{name}}");
        let c = TtsMaterializer::unique_key("Bye {{name}}");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn duration_estimate_rounds_up() {
        assert_eq!(TtsMaterializer::estimate_duration("one two three"), 2);
        assert_eq!(TtsMaterializer::estimate_duration("one"), 1);
        assert_eq!(
            TtsMaterializer::estimate_duration("a b c d e f g h i j"),
            4
        );
    }

    #[tokio::test]
    async fn http_tts_client_reads_body_and_duration_header() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .and(wiremock::matchers::path("/synthesize"))
            .respond_with(
                wiremock::ResponseTemplate::new(200)
                    .insert_header("x-audio-duration-seconds", "7")
                    .set_body_bytes(b"audio-bytes".to_vec()),
            )
            .mount(&server)
            .await;

        let client = HttpTtsClient::new(format!("{}/synthesize", server.uri()));
        let voice = VoiceProfile {
            provider: "polly".to_string(),
            voice_id: "Joanna".to_string(),
            language: "en-US".to_string(),
        };
        let (bytes, duration) = client.synthesize("Hi {{name}}", &voice).await.unwrap();
        assert_eq!(bytes, b"audio-bytes".to_vec());
        assert_eq!(duration, Some(7));
    }

    #[tokio::test]
    async fn http_tts_client_maps_non_success_to_tts_unavailable() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .respond_with(wiremock::ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = HttpTtsClient::new(server.uri());
        let voice = VoiceProfile {
            provider: "polly".to_string(),
            voice_id: "Joanna".to_string(),
            language: "en-US".to_string(),
        };
        let err = client.synthesize("Hi", &voice).await.unwrap_err();
        assert!(matches!(err, BroadcastError::TtsUnavailable(_)));
    }

    #[tokio::test]
    async fn http_cdn_uploader_returns_public_url_on_success() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("PUT"))
            .and(wiremock::matchers::path("/voice-broadcast/asset-key"))
            .respond_with(wiremock::ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let uploader = HttpCdnUploader::new(server.uri());
        let url = uploader
            .upload("voice-broadcast", "asset-key", b"bytes".to_vec())
            .await
            .unwrap();
        assert_eq!(url, format!("{}/voice-broadcast/asset-key", server.uri()));
    }

    #[tokio::test]
    async fn http_cdn_uploader_maps_non_success_to_cdn_unavailable() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("PUT"))
            .respond_with(wiremock::ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let uploader = HttpCdnUploader::new(server.uri());
        let err = uploader
            .upload("voice-broadcast", "asset-key", b"bytes".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(err, BroadcastError::CdnUnavailable(_)));
    }
}
