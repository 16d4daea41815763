use std::io::BufRead;
use std::io::BufReader;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use parley_contracts::conversation::{ImageData, Role};
use parley_contracts::error::ChatError;
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Map, Value};

use crate::config::GeminiSettings;
use crate::service::{
    ChunkStream, GenerativeService, ImageGenerationRequest, ServiceReply, TextRequest,
    VisionRequest,
};

/// Gemini REST client. One-shot calls are bounded by the configured
/// request timeout end to end; streamed calls only bound connecting, since
/// a long reply may legitimately outlast it.
pub struct GeminiService {
    settings: GeminiSettings,
    http: HttpClient,
    stream_http: HttpClient,
}

impl GeminiService {
    pub fn new(settings: GeminiSettings) -> Result<Self> {
        let limit = Duration::from_secs_f64(settings.request_timeout_s);
        let http = HttpClient::builder()
            .connect_timeout(limit)
            .timeout(limit)
            .build()
            .context("failed to build Gemini HTTP client")?;
        let stream_http = HttpClient::builder()
            .connect_timeout(limit)
            .timeout(None)
            .build()
            .context("failed to build Gemini streaming client")?;
        Ok(Self {
            settings,
            http,
            stream_http,
        })
    }

    fn api_key(&self) -> Result<&str> {
        match self.settings.api_key.as_deref() {
            Some(key) => Ok(key),
            None => Err(ChatError::MissingCredentials(
                "GEMINI_API_KEY or GOOGLE_API_KEY".to_string(),
            )
            .into()),
        }
    }

    fn endpoint_for_model(&self, model: &str, method: &str) -> String {
        let trimmed = model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        format!("{}/{}:{}", self.settings.api_base, model_path, method)
    }

    fn post(&self, endpoint: &str, payload: &Value, sse: bool) -> Result<HttpResponse> {
        let api_key = self.api_key()?;
        let client = if sse { &self.stream_http } else { &self.http };
        let mut request = client.post(endpoint).query(&[("key", api_key)]).json(payload);
        if sse {
            request = request.query(&[("alt", "sse")]);
        }
        request
            .send()
            .with_context(|| format!("Gemini request failed ({endpoint})"))
    }

    fn generate_content(&self, model: &str, payload: &Value) -> Result<Value> {
        let endpoint = self.endpoint_for_model(model, "generateContent");
        let response = self.post(&endpoint, payload, false)?;
        response_json_or_error("Gemini", response)
    }
}

impl GenerativeService for GeminiService {
    fn name(&self) -> &str {
        "gemini"
    }

    fn has_credentials(&self) -> bool {
        self.settings.api_key.is_some()
    }

    fn generate_text(&self, request: &TextRequest) -> Result<String> {
        let response = self.generate_content(&request.model, &text_payload(request))?;
        Ok(extract_reply(&response)?.text)
    }

    fn stream_text(&self, request: &TextRequest) -> Result<ChunkStream> {
        let endpoint = self.endpoint_for_model(&request.model, "streamGenerateContent");
        let response = self.post(&endpoint, &text_payload(request), true)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            bail!(
                "Gemini request failed ({}): {}",
                status.as_u16(),
                truncate_text(&body, 512)
            );
        }
        Ok(Box::new(SseChunks::new(BufReader::new(response))))
    }

    fn generate_image(&self, request: &ImageGenerationRequest) -> Result<ServiceReply> {
        let payload = json!({
            "contents": [{
                "role": "user",
                "parts": [{ "text": request.prompt }],
            }],
            "generationConfig": {
                "responseModalities": ["TEXT", "IMAGE"],
            },
        });
        let response = self.generate_content(&request.model, &payload)?;
        let reply = extract_reply(&response)?;
        if reply.image.is_none() && reply.text.trim().is_empty() {
            bail!("Gemini returned no image");
        }
        Ok(reply)
    }

    fn understand_image(&self, request: &VisionRequest) -> Result<ServiceReply> {
        let mut payload = Map::new();
        payload.insert(
            "contents".to_string(),
            json!([{
                "role": "user",
                "parts": [
                    {
                        "inlineData": {
                            "mimeType": request.image.mime_type,
                            "data": request.image.data,
                        }
                    },
                    { "text": request.prompt },
                ],
            }]),
        );
        if request.allow_image_output {
            payload.insert(
                "generationConfig".to_string(),
                json!({ "responseModalities": ["TEXT", "IMAGE"] }),
            );
        }
        let response = self.generate_content(&request.model, &Value::Object(payload))?;
        extract_reply(&response)
    }
}

pub(crate) fn text_payload(request: &TextRequest) -> Value {
    let mut contents = request
        .history
        .iter()
        .map(|turn| {
            let role = match turn.role {
                Role::Model => "model",
                _ => "user",
            };
            json!({ "role": role, "parts": [{ "text": turn.text }] })
        })
        .collect::<Vec<Value>>();
    contents.push(json!({ "role": "user", "parts": [{ "text": request.prompt }] }));

    let mut payload = Map::new();
    payload.insert("contents".to_string(), Value::Array(contents));
    if let Some(instruction) = request
        .system_instruction
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        payload.insert(
            "systemInstruction".to_string(),
            json!({ "parts": [{ "text": instruction }] }),
        );
    }
    Value::Object(payload)
}

/// Collects text and the first inline image from a generate-content
/// response. Thought parts are skipped.
pub(crate) fn extract_reply(payload: &Value) -> Result<ServiceReply> {
    if let Some(message) = payload
        .get("error")
        .and_then(|error| error.get("message"))
        .and_then(Value::as_str)
    {
        bail!("Gemini error: {message}");
    }
    let candidates = payload
        .get("candidates")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    if candidates.is_empty() {
        if let Some(reason) = payload
            .get("promptFeedback")
            .and_then(|feedback| feedback.get("blockReason"))
            .and_then(Value::as_str)
        {
            bail!("Gemini blocked the prompt ({reason})");
        }
    }

    let mut reply = ServiceReply::default();
    let parts = candidates
        .first()
        .and_then(|candidate| candidate.get("content"))
        .and_then(|content| content.get("parts"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    for part in parts {
        if part.get("thought").and_then(Value::as_bool).unwrap_or(false) {
            continue;
        }
        if let Some(text) = part.get("text").and_then(Value::as_str) {
            reply.text.push_str(text);
        }
        if reply.image.is_some() {
            continue;
        }
        let inline = part
            .get("inlineData")
            .or_else(|| part.get("inline_data"))
            .and_then(Value::as_object);
        let Some(inline) = inline else {
            continue;
        };
        let data = inline
            .get("data")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if data.is_empty() {
            continue;
        }
        let bytes = BASE64
            .decode(data.as_bytes())
            .context("Gemini image base64 decode failed")?;
        let mime_type = inline
            .get("mimeType")
            .or_else(|| inline.get("mime_type"))
            .and_then(Value::as_str)
            .unwrap_or("image/png");
        reply.image = Some(ImageData::from_bytes(mime_type, &bytes));
    }
    Ok(reply)
}

/// Server-sent event reader yielding the text of each event in order.
/// Events are separated by blank lines; multi-line `data:` fields are
/// joined with newlines.
pub struct SseChunks<R> {
    reader: R,
    data: String,
    done: bool,
}

impl<R: BufRead> SseChunks<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            data: String::new(),
            done: false,
        }
    }

    fn take_event(&mut self) -> Option<Result<String>> {
        let data = std::mem::take(&mut self.data);
        let trimmed = data.trim();
        if trimmed.is_empty() || trimmed == "[DONE]" {
            return None;
        }
        let parsed = serde_json::from_str::<Value>(trimmed)
            .context("Gemini stream returned invalid JSON event")
            .and_then(|payload| extract_reply(&payload));
        match parsed {
            Ok(reply) if reply.text.is_empty() => None,
            Ok(reply) => Some(Ok(reply.text)),
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

impl<R: BufRead> Iterator for SseChunks<R> {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            let mut line = String::new();
            match self.reader.read_line(&mut line) {
                Ok(0) => {
                    self.done = true;
                    return self.take_event();
                }
                Ok(_) => {
                    let line = line.trim_end_matches(['\r', '\n']);
                    if line.is_empty() {
                        if let Some(item) = self.take_event() {
                            return Some(item);
                        }
                    } else if let Some(rest) = line.strip_prefix("data:") {
                        if !self.data.is_empty() {
                            self.data.push('\n');
                        }
                        self.data.push_str(rest.strip_prefix(' ').unwrap_or(rest));
                    }
                }
                Err(err) => {
                    self.done = true;
                    return Some(Err(
                        anyhow::Error::new(err).context("Gemini stream read failed")
                    ));
                }
            }
        }
        None
    }
}

fn response_json_or_error(provider: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{provider} response body read failed"))?;
    if !status.is_success() {
        bail!(
            "{provider} request failed ({code}): {}",
            truncate_text(&body, 512)
        );
    }
    let parsed: Value = serde_json::from_str(&body)
        .with_context(|| format!("{provider} returned invalid JSON payload"))?;
    Ok(parsed)
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}
