//! Cookie-authenticated client for the Gemini web app.
//!
//! Speaks the same unofficial wire format the web frontend uses: an `at`
//! token scraped from the app page, batched `f.req` payloads, and an
//! opaque (conversation id, response id, choice id) triple as continuation
//! state.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const APP_URL: &str = "https://gemini.google.com/app";
const GENERATE_URL: &str =
    "https://gemini.google.com/_/BardChatUi/data/assistant.lamda.BardFrontendService/StreamGenerate";
const BATCH_URL: &str = "https://gemini.google.com/_/BardChatUi/data/batchexecute";
const UPLOAD_URL: &str = "https://content-push.googleapis.com/upload";
const UPLOAD_PUSH_ID: &str = "feeds/mcudyrk2a4khkz";
const LIST_GEMS_RPC: &str = "CNgdBe";

/// An image returned alongside a reply.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyImage {
    /// Generated image saved to a local temp file; delete after sending.
    Saved(PathBuf),
    /// Web image referenced by URL.
    Linked(String),
}

/// One upstream turn.
#[derive(Debug, Clone)]
pub struct UpstreamReply {
    pub text: String,
    pub images: Vec<ReplyImage>,
    /// Replay this on the next call to keep the conversation going.
    pub continuation: Option<Value>,
}

/// A named upstream configuration profile ("gem").
#[derive(Debug, Clone, PartialEq)]
pub struct Persona {
    pub id: String,
    pub name: String,
}

/// The upstream chat service as the resolver sees it.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Continue (or open) a session and send one prompt with attachments.
    async fn send(
        &self,
        continuation: Option<Value>,
        persona: Option<&str>,
        prompt: &str,
        files: &[PathBuf],
    ) -> Result<UpstreamReply, String>;

    /// List the personas available to this account.
    async fn list_personas(&self) -> Result<Vec<Persona>, String>;
}

pub struct GeminiWeb {
    http: reqwest::Client,
    cookies: String,
    temp_dir: PathBuf,
    /// Cached `at` token; fetched lazily, refreshed on demand.
    token: Mutex<Option<String>>,
}

impl GeminiWeb {
    pub fn new(secure_1psid: &str, secure_1psidts: Option<&str>, temp_dir: PathBuf) -> Self {
        let mut cookies = format!("__Secure-1PSID={secure_1psid}");
        if let Some(ts) = secure_1psidts {
            cookies.push_str(&format!("; __Secure-1PSIDTS={ts}"));
        }

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .expect("Failed to build HTTP client");

        Self {
            http,
            cookies,
            temp_dir,
            token: Mutex::new(None),
        }
    }

    /// Scrape the `at` token from the app page, caching it.
    async fn ensure_token(&self) -> Result<String, String> {
        let mut cached = self.token.lock().await;
        if let Some(ref token) = *cached {
            return Ok(token.clone());
        }

        let body = self
            .http
            .get(APP_URL)
            .header(reqwest::header::COOKIE, &self.cookies)
            .send()
            .await
            .map_err(|e| format!("HTTP error: {e}"))?
            .text()
            .await
            .map_err(|e| format!("Failed to read app page: {e}"))?;

        let token = extract_token(&body)
            .ok_or("No access token in app page; cookies are likely expired")?;
        debug!("Fetched access token");
        *cached = Some(token.clone());
        Ok(token)
    }

    /// Upload one attachment, returning its resource id.
    async fn upload_file(&self, path: &Path) -> Result<String, String> {
        let data = tokio::fs::read(path)
            .await
            .map_err(|e| format!("Failed to read {path:?}: {e}"))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "file.bin".to_string());

        info!("Uploading attachment {} ({} bytes)", name, data.len());
        let form = reqwest::multipart::Form::new()
            .part("file", reqwest::multipart::Part::bytes(data).file_name(name));

        let resp = self
            .http
            .post(UPLOAD_URL)
            .header("push-id", UPLOAD_PUSH_ID)
            .header(reqwest::header::COOKIE, &self.cookies)
            .multipart(form)
            .send()
            .await
            .map_err(|e| format!("Upload failed: {e}"))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| format!("Failed to read upload response: {e}"))?;
        if !status.is_success() {
            return Err(format!("Upload failed: {status}: {body}"));
        }
        Ok(body.trim().to_string())
    }

    /// Download a generated image to a temp PNG the caller owns.
    async fn save_generated_image(&self, url: &str, user_tag: &str, index: usize) -> Result<PathBuf, String> {
        let resp = self
            .http
            .get(url)
            .header(reqwest::header::COOKIE, &self.cookies)
            .send()
            .await
            .map_err(|e| format!("Image download failed: {e}"))?;
        if !resp.status().is_success() {
            return Err(format!("Image download failed: {}", resp.status()));
        }
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| format!("Image download failed: {e}"))?;

        let path = self.temp_dir.join(format!("gweb_gen_{user_tag}_{index}.png"));
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|e| format!("Failed to save image: {e}"))?;
        info!("Saved generated image to {:?} ({} bytes)", path, bytes.len());
        Ok(path)
    }
}

#[async_trait]
impl Upstream for GeminiWeb {
    async fn send(
        &self,
        continuation: Option<Value>,
        persona: Option<&str>,
        prompt: &str,
        files: &[PathBuf],
    ) -> Result<UpstreamReply, String> {
        let token = self.ensure_token().await?;

        let mut attachments = Vec::new();
        for path in files {
            let resource_id = self.upload_file(path).await?;
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "file.bin".to_string());
            attachments.push(json!([[resource_id], name]));
        }

        let request = build_request(prompt, &attachments, continuation.as_ref(), persona);
        let freq = json!([Value::Null, request.to_string()]).to_string();

        let resp = self
            .http
            .post(GENERATE_URL)
            .header(reqwest::header::COOKIE, &self.cookies)
            .form(&[("f.req", freq.as_str()), ("at", token.as_str())])
            .send()
            .await
            .map_err(|e| format!("HTTP error: {e}"))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| format!("Failed to read response: {e}"))?;
        if !status.is_success() {
            // A stale token produces auth errors; drop the cache so the
            // next attempt re-scrapes it.
            *self.token.lock().await = None;
            return Err(format!("Upstream error {status}: {body}"));
        }

        let parsed = parse_reply(&body)?;

        let mut images = Vec::new();
        let user_tag = chrono::Utc::now().format("%s").to_string();
        for (i, raw) in parsed.images.into_iter().enumerate() {
            match raw {
                RawImage::Generated(url) => {
                    match self.save_generated_image(&url, &user_tag, i).await {
                        Ok(path) => images.push(ReplyImage::Saved(path)),
                        Err(e) => warn!("Skipping generated image: {e}"),
                    }
                }
                RawImage::Web(url) => images.push(ReplyImage::Linked(url)),
            }
        }

        Ok(UpstreamReply {
            text: parsed.text,
            images,
            continuation: parsed.continuation,
        })
    }

    async fn list_personas(&self) -> Result<Vec<Persona>, String> {
        let token = self.ensure_token().await?;

        let rpc = json!([[[LIST_GEMS_RPC, "[4]", Value::Null, "generic"]]]).to_string();
        let body = self
            .http
            .post(BATCH_URL)
            .header(reqwest::header::COOKIE, &self.cookies)
            .form(&[("f.req", rpc.as_str()), ("at", token.as_str())])
            .send()
            .await
            .map_err(|e| format!("HTTP error: {e}"))?
            .text()
            .await
            .map_err(|e| format!("Failed to read response: {e}"))?;

        parse_personas(&body)
    }
}

/// `"SNlM0e":"<token>"` somewhere in the app page.
fn extract_token(page: &str) -> Option<String> {
    let needle = "\"SNlM0e\":\"";
    let start = page.find(needle)? + needle.len();
    let end = page[start..].find('"')?;
    let token = &page[start..start + end];
    if token.is_empty() { None } else { Some(token.to_string()) }
}

fn build_request(
    prompt: &str,
    attachments: &[Value],
    continuation: Option<&Value>,
    persona: Option<&str>,
) -> Value {
    let prompt_part = if attachments.is_empty() {
        json!([prompt])
    } else {
        json!([prompt, 0, Value::Null, attachments])
    };

    let metadata = continuation.cloned().unwrap_or(Value::Null);
    let mut parts = vec![prompt_part, Value::Null, metadata];
    if let Some(gem) = persona {
        // The gem id rides at index 16 of the request envelope.
        while parts.len() < 16 {
            parts.push(Value::Null);
        }
        parts.push(json!(gem));
    }
    Value::Array(parts)
}

#[derive(Debug)]
enum RawImage {
    Web(String),
    Generated(String),
}

#[derive(Debug)]
struct ParsedReply {
    text: String,
    images: Vec<RawImage>,
    continuation: Option<Value>,
}

/// The response is a stream of length-prefixed JSON chunks; the chunk
/// tagged `wrb.fr` wraps the actual payload as a JSON string.
fn parse_reply(body: &str) -> Result<ParsedReply, String> {
    let payload = extract_payload(body)?;
    parse_payload(&payload)
}

fn extract_payload(body: &str) -> Result<Value, String> {
    for line in body.lines() {
        if !line.contains("wrb.fr") {
            continue;
        }
        let envelope: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(_) => continue,
        };
        if let Some(inner) = envelope
            .get(0)
            .and_then(|part| part.get(2))
            .and_then(Value::as_str)
        {
            return serde_json::from_str(inner)
                .map_err(|e| format!("Unparseable payload: {e}"));
        }
    }
    Err("No reply payload in response".to_string())
}

fn parse_payload(payload: &Value) -> Result<ParsedReply, String> {
    let candidate = payload
        .get(4)
        .and_then(|c| c.get(0))
        .ok_or("No candidate in reply")?;

    let text = candidate
        .get(1)
        .and_then(|t| t.get(0))
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();

    // (conversation id, response id, choice id)
    let continuation = match (
        payload.get(1).and_then(|m| m.get(0)).and_then(Value::as_str),
        payload.get(1).and_then(|m| m.get(1)).and_then(Value::as_str),
        candidate.get(0).and_then(Value::as_str),
    ) {
        (Some(cid), Some(rid), Some(rcid)) => Some(json!([cid, rid, rcid])),
        _ => None,
    };

    let mut images = Vec::new();
    if let Some(web) = candidate.get(4).and_then(Value::as_array) {
        for entry in web {
            if let Some(url) = entry
                .get(0)
                .and_then(|e| e.get(0))
                .and_then(|e| e.get(0))
                .and_then(Value::as_str)
            {
                images.push(RawImage::Web(url.to_string()));
            }
        }
    }
    if let Some(generated) = candidate
        .get(12)
        .and_then(|g| g.get(7))
        .and_then(|g| g.get(0))
        .and_then(Value::as_array)
    {
        for entry in generated {
            if let Some(url) = entry
                .get(0)
                .and_then(|e| e.get(3))
                .and_then(|e| e.get(3))
                .and_then(Value::as_str)
            {
                images.push(RawImage::Generated(url.to_string()));
            }
        }
    }

    Ok(ParsedReply {
        text,
        images,
        continuation,
    })
}

fn parse_personas(body: &str) -> Result<Vec<Persona>, String> {
    for line in body.lines() {
        if !line.contains("wrb.fr") {
            continue;
        }
        let envelope: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(_) => continue,
        };
        let Some(inner) = envelope
            .get(0)
            .and_then(|part| part.get(2))
            .and_then(Value::as_str)
        else {
            continue;
        };
        let payload: Value =
            serde_json::from_str(inner).map_err(|e| format!("Unparseable gem list: {e}"))?;

        let mut personas = Vec::new();
        if let Some(gems) = payload.get(2).and_then(Value::as_array) {
            for gem in gems {
                if let (Some(id), Some(name)) = (
                    gem.get(0).and_then(Value::as_str),
                    gem.get(1).and_then(Value::as_str),
                ) {
                    personas.push(Persona {
                        id: id.to_string(),
                        name: name.to_string(),
                    });
                }
            }
        }
        return Ok(personas);
    }
    Err("No gem list in response".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_token() {
        let page = r#"...,"SNlM0e":"AKtu94_abc123","other":1..."#;
        assert_eq!(extract_token(page), Some("AKtu94_abc123".to_string()));
        assert_eq!(extract_token("no token here"), None);
        assert_eq!(extract_token(r#""SNlM0e":"""#), None);
    }

    #[test]
    fn test_build_request_plain() {
        let req = build_request("hello", &[], None, None);
        assert_eq!(req[0], json!(["hello"]));
        assert_eq!(req[2], Value::Null);
        assert_eq!(req.as_array().unwrap().len(), 3);
    }

    #[test]
    fn test_build_request_with_continuation_and_persona() {
        let cont = json!(["c_1", "r_1", "rc_1"]);
        let req = build_request("hi", &[], Some(&cont), Some("gem-42"));
        assert_eq!(req[2], cont);
        assert_eq!(req[16], json!("gem-42"));
    }

    #[test]
    fn test_build_request_with_attachments() {
        let attachments = vec![json!([["res-1"], "voice.ogg"])];
        let req = build_request("listen", &attachments, None, None);
        assert_eq!(req[0][0], json!("listen"));
        assert_eq!(req[0][3], json!(attachments));
    }

    fn sample_payload() -> Value {
        json!([
            null,
            ["c_123", "r_456"],
            null,
            null,
            [[
                "rc_789",
                ["the answer"],
                null,
                null,
                [[[["https://example.com/web.jpg"]], "title"]],
                null, null, null, null, null, null, null,
                [null, null, null, null, null, null, null,
                 [[[[null, null, null, ["t", "u", "v", "https://example.com/gen.png"]]]]]]
            ]]
        ])
    }

    #[test]
    fn test_parse_payload_text_and_continuation() {
        let parsed = parse_payload(&sample_payload()).unwrap();
        assert_eq!(parsed.text, "the answer");
        assert_eq!(
            parsed.continuation,
            Some(json!(["c_123", "r_456", "rc_789"]))
        );
    }

    #[test]
    fn test_parse_payload_images() {
        let parsed = parse_payload(&sample_payload()).unwrap();
        assert_eq!(parsed.images.len(), 2);
        assert!(matches!(
            &parsed.images[0],
            RawImage::Web(url) if url == "https://example.com/web.jpg"
        ));
        assert!(matches!(
            &parsed.images[1],
            RawImage::Generated(url) if url == "https://example.com/gen.png"
        ));
    }

    #[test]
    fn test_parse_payload_without_candidate_fails() {
        let err = parse_payload(&json!([null, null])).unwrap_err();
        assert!(err.contains("candidate"));
    }

    #[test]
    fn test_extract_payload_from_stream() {
        let inner = sample_payload().to_string();
        let envelope = json!([["wrb.fr", null, inner]]).to_string();
        let body = format!(")]}}'\n\n12345\n{envelope}\n");
        let payload = extract_payload(&body).unwrap();
        let parsed = parse_payload(&payload).unwrap();
        assert_eq!(parsed.text, "the answer");
    }

    #[test]
    fn test_parse_personas() {
        let inner = json!([null, null, [["gem-1", "Helper"], ["gem-2", "Coach"]]]).to_string();
        let envelope = json!([["wrb.fr", null, inner]]).to_string();
        let personas = parse_personas(&envelope).unwrap();
        assert_eq!(
            personas,
            vec![
                Persona { id: "gem-1".into(), name: "Helper".into() },
                Persona { id: "gem-2".into(), name: "Coach".into() },
            ]
        );
    }
}
