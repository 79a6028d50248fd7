//! Script Generator (spec.md §4.E).
//!
//! Produces the call-time instruction document the provider fetches when a
//! placed call connects. This workspace doesn't pull in an XML templating
//! crate anywhere — `ivr/nodes.rs` builds its own node enum and interprets it
//! directly — so this follows the same precedent: a small struct tree with a
//! hand-written `to_xml()` plus an `escape_xml` helper.

use std::time::Duration;

/// `Gather` timeout for the keypress prompt (spec.md §4.E).
const GATHER_TIMEOUT_SECS: u32 = 3;
/// HEAD-reachability probe timeout (spec.md §5, §9 design notes).
const PROBE_TIMEOUT_SECS: u64 = 3;

pub struct VoiceScript {
    pub disclaimer_text: String,
    pub audio_url: String,
    pub keypress_action_url: String,
}

impl VoiceScript {
    pub fn to_xml(&self) -> String {
        format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
<Response>\n  \
<Say>{disclaimer}</Say>\n  \
<Gather numDigits=\"1\" timeout=\"{timeout}\" action=\"{action}\" method=\"POST\">\n    \
<Say>Press 9 to stop receiving these calls.</Say>\n  \
</Gather>\n  \
<Play>{audio}</Play>\n  \
<Hangup/>\n\
</Response>\n",
            disclaimer = escape_xml(&self.disclaimer_text),
            timeout = GATHER_TIMEOUT_SECS,
            action = escape_xml(&self.keypress_action_url),
            audio = escape_xml(&self.audio_url),
        )
    }
}

/// Minimal document so the callee always hears a polite termination, never
/// silence (spec.md §7).
pub fn error_document(spoken_message: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
<Response>\n  \
<Say>{message}</Say>\n  \
<Hangup/>\n\
</Response>\n",
        message = escape_xml(spoken_message)
    )
}

/// Response played after a keypress webhook: a confirmation phrase for
/// `digits == "9"`, an "invalid option" phrase otherwise, both followed by
/// hangup (spec.md §4.F).
pub fn keypress_response_document(opted_out: bool) -> String {
    let message = if opted_out {
        "You have been removed from this broadcast list. Goodbye."
    } else {
        "Invalid option."
    };
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
<Response>\n  \
<Say>{message}</Say>\n  \
<Hangup/>\n\
</Response>\n",
        message = escape_xml(message)
    )
}

fn escape_xml(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

/// Best-effort, non-blocking reachability check on the audio URL. Failures
/// only log; callers spawn this rather than await it (spec.md §9).
pub async fn probe_audio_reachable(client: reqwest::Client, audio_url: String) {
    let result = client
        .head(&audio_url)
        .timeout(Duration::from_secs(PROBE_TIMEOUT_SECS))
        .send()
        .await;
    match result {
        Ok(resp) if resp.status().is_success() => {}
        Ok(resp) => {
            tracing::warn!(status = %resp.status(), url = %audio_url, "audio asset HEAD probe returned non-success");
        }
        Err(err) => {
            tracing::warn!(error = %err, url = %audio_url, "audio asset HEAD probe failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_ampersand_in_disclaimer() {
        let script = VoiceScript {
            disclaimer_text: "Terms & Conditions apply".to_string(),
            audio_url: "https://cdn.example/a.mp3".to_string(),
            keypress_action_url: "https://api.example/broadcast/keypress".to_string(),
        };
        let xml = script.to_xml();
        assert!(xml.contains("Terms &amp; Conditions"));
        assert!(xml.contains("<Play>https://cdn.example/a.mp3</Play>"));
        assert!(xml.contains("<Hangup/>"));
    }

    #[test]
    fn error_document_always_hangs_up() {
        let doc = error_document("Sorry, something went wrong.");
        assert!(doc.contains("<Hangup/>"));
        assert!(doc.contains("Sorry, something went wrong."));
    }

    #[test]
    fn keypress_confirmation_differs_from_invalid() {
        let confirmed = keypress_response_document(true);
        let invalid = keypress_response_document(false);
        assert!(confirmed.contains("removed"));
        assert!(invalid.contains("Invalid option"));
    }
}
