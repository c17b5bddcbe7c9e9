//! Speech-to-text via hosted HTTP providers.
//!
//! Three interchangeable backends. AssemblyAI is a two-step upload/poll
//! flow; Deepgram and Mistral answer a single request.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

const ASSEMBLYAI_UPLOAD_URL: &str = "https://api.assemblyai.com/v2/upload";
const ASSEMBLYAI_TRANSCRIPT_URL: &str = "https://api.assemblyai.com/v2/transcript";
const DEEPGRAM_URL: &str =
    "https://api.deepgram.com/v1/listen?model=nova-3-general&punctuate=true&detect_language=true";
const MISTRAL_URL: &str = "https://api.mistral.ai/v1/audio/transcriptions";
const MISTRAL_MODEL: &str = "voxtral-mini-2507";

const POLL_INTERVAL: Duration = Duration::from_secs(1);
const MAX_POLLS: usize = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    AssemblyAi,
    Deepgram,
    Mistral,
}

#[derive(Debug)]
pub enum TranscribeError {
    /// No API token configured for the selected provider.
    NoToken,
    /// Transport or HTTP-level failure.
    Http(String),
    /// The provider accepted the audio but reported an error.
    Provider(String),
    /// Polling gave up before the transcript was ready.
    Timeout,
}

impl fmt::Display for TranscribeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoToken => write!(f, "no API token configured"),
            Self::Http(msg) => write!(f, "http error: {msg}"),
            Self::Provider(msg) => write!(f, "provider error: {msg}"),
            Self::Timeout => write!(f, "timed out waiting for transcript"),
        }
    }
}

impl std::error::Error for TranscribeError {}

pub struct Transcriber {
    provider: Provider,
    token: Option<String>,
    http: reqwest::Client,
}

impl Transcriber {
    pub fn new(provider: Provider, token: Option<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .expect("Failed to build HTTP client");
        Self {
            provider,
            token,
            http,
        }
    }

    /// Transcribe one audio file.
    pub async fn transcribe(&self, path: &Path) -> Result<String, TranscribeError> {
        let token = self.token.as_deref().ok_or(TranscribeError::NoToken)?;
        let data = tokio::fs::read(path)
            .await
            .map_err(|e| TranscribeError::Http(format!("failed to read {path:?}: {e}")))?;
        info!(
            "Transcribing {:?} ({} bytes) via {:?}",
            path,
            data.len(),
            self.provider
        );

        match self.provider {
            Provider::AssemblyAi => self.assemblyai(token, data).await,
            Provider::Deepgram => self.deepgram(token, data).await,
            Provider::Mistral => self.mistral(token, path, data).await,
        }
    }

    async fn assemblyai(&self, token: &str, data: Vec<u8>) -> Result<String, TranscribeError> {
        // Step 1: upload raw audio.
        let upload: Value = self
            .request_json(
                self.http
                    .post(ASSEMBLYAI_UPLOAD_URL)
                    .header("authorization", token)
                    .body(data),
            )
            .await?;
        let audio_url = upload
            .get("upload_url")
            .and_then(Value::as_str)
            .ok_or_else(|| TranscribeError::Provider("no upload_url in response".into()))?
            .to_string();

        // Step 2: create the transcript job.
        let created: Value = self
            .request_json(
                self.http
                    .post(ASSEMBLYAI_TRANSCRIPT_URL)
                    .header("authorization", token)
                    .json(&serde_json::json!({
                        "audio_url": audio_url,
                        "language_detection": true,
                    })),
            )
            .await?;
        let id = created
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| TranscribeError::Provider("no transcript id in response".into()))?
            .to_string();

        // Step 3: poll until done.
        for _ in 0..MAX_POLLS {
            tokio::time::sleep(POLL_INTERVAL).await;
            let status: Value = self
                .request_json(
                    self.http
                        .get(format!("{ASSEMBLYAI_TRANSCRIPT_URL}/{id}"))
                        .header("authorization", token),
                )
                .await?;
            match parse_assemblyai_poll(&status)? {
                Poll::Completed(text) => return Ok(text),
                Poll::Pending => {
                    debug!("Transcript {} still processing", id);
                }
            }
        }
        Err(TranscribeError::Timeout)
    }

    async fn deepgram(&self, token: &str, data: Vec<u8>) -> Result<String, TranscribeError> {
        let body: Value = self
            .request_json(
                self.http
                    .post(DEEPGRAM_URL)
                    .header("Authorization", format!("Token {token}"))
                    .header("Content-Type", "audio/*")
                    .body(data),
            )
            .await?;
        parse_deepgram(&body)
    }

    async fn mistral(
        &self,
        token: &str,
        path: &Path,
        data: Vec<u8>,
    ) -> Result<String, TranscribeError> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "audio.ogg".to_string());
        let form = reqwest::multipart::Form::new()
            .part("file", reqwest::multipart::Part::bytes(data).file_name(name))
            .text("model", MISTRAL_MODEL);

        let body: Value = self
            .request_json(
                self.http
                    .post(MISTRAL_URL)
                    .header("x-api-key", token)
                    .multipart(form),
            )
            .await?;
        parse_mistral(&body)
    }

    async fn request_json(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<Value, TranscribeError> {
        let resp = request
            .send()
            .await
            .map_err(|e| TranscribeError::Http(e.to_string()))?;
        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| TranscribeError::Http(e.to_string()))?;
        if !status.is_success() {
            return Err(TranscribeError::Http(format!("{status}: {body}")));
        }
        serde_json::from_str(&body).map_err(|e| TranscribeError::Provider(e.to_string()))
    }
}

#[derive(Debug)]
enum Poll {
    Completed(String),
    Pending,
}

fn parse_assemblyai_poll(body: &Value) -> Result<Poll, TranscribeError> {
    match body.get("status").and_then(Value::as_str) {
        Some("completed") => {
            let text = body
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();
            Ok(Poll::Completed(text))
        }
        Some("error") => Err(TranscribeError::Provider(
            body.get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
        )),
        _ => Ok(Poll::Pending),
    }
}

fn parse_deepgram(body: &Value) -> Result<String, TranscribeError> {
    body.pointer("/results/channels/0/alternatives/0/transcript")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| TranscribeError::Provider("no transcript in response".into()))
}

fn parse_mistral(body: &Value) -> Result<String, TranscribeError> {
    body.get("text")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| TranscribeError::Provider("no text in response".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_missing_token_is_rejected_before_any_io() {
        let t = Transcriber::new(Provider::Deepgram, None);
        let err = t
            .transcribe(Path::new("/nonexistent/audio.ogg"))
            .await
            .unwrap_err();
        assert!(matches!(err, TranscribeError::NoToken));
    }

    #[test]
    fn test_provider_deserializes_lowercase() {
        assert_eq!(
            serde_json::from_str::<Provider>("\"assemblyai\"").unwrap(),
            Provider::AssemblyAi
        );
        assert_eq!(
            serde_json::from_str::<Provider>("\"deepgram\"").unwrap(),
            Provider::Deepgram
        );
        assert_eq!(
            serde_json::from_str::<Provider>("\"mistral\"").unwrap(),
            Provider::Mistral
        );
    }

    #[test]
    fn test_parse_assemblyai_poll_states() {
        let done = json!({"status": "completed", "text": "hello world"});
        assert!(matches!(
            parse_assemblyai_poll(&done).unwrap(),
            Poll::Completed(t) if t == "hello world"
        ));

        let pending = json!({"status": "processing"});
        assert!(matches!(
            parse_assemblyai_poll(&pending).unwrap(),
            Poll::Pending
        ));

        let failed = json!({"status": "error", "error": "bad audio"});
        let err = parse_assemblyai_poll(&failed).unwrap_err();
        assert!(matches!(err, TranscribeError::Provider(m) if m == "bad audio"));
    }

    #[test]
    fn test_parse_deepgram_response() {
        let body = json!({
            "results": {
                "channels": [
                    {"alternatives": [{"transcript": "good morning", "confidence": 0.98}]}
                ]
            }
        });
        assert_eq!(parse_deepgram(&body).unwrap(), "good morning");

        let empty = json!({"results": {"channels": []}});
        assert!(parse_deepgram(&empty).is_err());
    }

    #[test]
    fn test_parse_mistral_response() {
        let body = json!({"model": "voxtral-mini-2507", "text": "guten tag"});
        assert_eq!(parse_mistral(&body).unwrap(), "guten tag");
        assert!(parse_mistral(&json!({})).is_err());
    }
}
