use std::env;
use std::time::Instant;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Map, Value};
use storyboard_contracts::media::ImageData;
use tracing::debug;

use crate::capability::{
    GenerationPart, ImageGenerator, ImageRequest, ImageResponse, ResponsePart,
    StructuredGenerator, StructuredRequest,
};
use crate::error::CapabilityError;
use crate::schema::OutputSchema;

const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

pub struct GeminiProvider {
    api_base: String,
    http: HttpClient,
}

impl Default for GeminiProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl GeminiProvider {
    pub fn new() -> Self {
        let api_base = env::var("GEMINI_API_BASE")
            .ok()
            .map(|value| value.trim().trim_end_matches('/').to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string());
        Self::with_api_base(api_base)
    }

    pub fn with_api_base(api_base: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into(),
            http: HttpClient::new(),
        }
    }

    fn api_key() -> Result<String, CapabilityError> {
        non_empty_env("GEMINI_API_KEY")
            .or_else(|| non_empty_env("GOOGLE_API_KEY"))
            .ok_or_else(|| CapabilityError::quota("GEMINI_API_KEY or GOOGLE_API_KEY not set"))
    }

    fn endpoint_for_model(&self, model: &str) -> String {
        let trimmed = model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        format!("{}/{}:generateContent", self.api_base, model_path)
    }

    fn build_parts(parts: &[GenerationPart]) -> Vec<Value> {
        parts
            .iter()
            .map(|part| match part {
                GenerationPart::Text(text) => json!({ "text": text }),
                GenerationPart::Image(image) => json!({
                    "inlineData": {
                        "mimeType": image.mime_type,
                        "data": image.base64(),
                    }
                }),
            })
            .collect()
    }

    fn default_safety_settings() -> Vec<Value> {
        [
            "HARM_CATEGORY_HARASSMENT",
            "HARM_CATEGORY_HATE_SPEECH",
            "HARM_CATEGORY_SEXUALLY_EXPLICIT",
            "HARM_CATEGORY_DANGEROUS_CONTENT",
        ]
        .into_iter()
        .map(|category| {
            json!({
                "category": category,
                "threshold": "BLOCK_ONLY_HIGH",
            })
        })
        .collect()
    }

    fn structured_payload(request: &StructuredRequest) -> Value {
        json!({
            "contents": [{
                "role": "user",
                "parts": Self::build_parts(&request.parts),
            }],
            "generationConfig": {
                "responseMimeType": "application/json",
                "responseSchema": request.schema.to_gemini_schema(),
            },
            "safetySettings": Self::default_safety_settings(),
        })
    }

    fn image_payload(request: &ImageRequest) -> Value {
        json!({
            "contents": [{
                "role": "user",
                "parts": Self::build_parts(&request.parts),
            }],
            "generationConfig": {
                "candidateCount": 1,
                "responseModalities": ["IMAGE"],
                "imageConfig": {
                    "aspectRatio": request.aspect_ratio.as_str(),
                },
            },
            "safetySettings": Self::default_safety_settings(),
        })
    }

    fn post(
        &self,
        model: &str,
        payload: &Value,
        timeout: std::time::Duration,
    ) -> Result<Value, CapabilityError> {
        let api_key = Self::api_key()?;
        let endpoint = self.endpoint_for_model(model);
        let started = Instant::now();
        let response = self
            .http
            .post(&endpoint)
            .query(&[("key", api_key.as_str())])
            .timeout(timeout)
            .json(payload)
            .send()
            .map_err(|err| classify_transport_error(&endpoint, &err))?;
        let status = response.status();
        let body = response
            .text()
            .map_err(|err| classify_transport_error(&endpoint, &err))?;
        debug!(
            model,
            status = status.as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "gemini response"
        );
        if !status.is_success() {
            return Err(CapabilityError::from_status(
                "Gemini",
                status.as_u16(),
                &truncate_text(&body, 512),
            ));
        }
        serde_json::from_str(&body)
            .map_err(|_| CapabilityError::invalid_response("Gemini returned invalid JSON payload"))
    }

    fn block_reason(response: &Value) -> Option<String> {
        response
            .get("promptFeedback")
            .and_then(|feedback| feedback.get("blockReason"))
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    fn extract_parts(response: &Value) -> Result<Vec<ResponsePart>, CapabilityError> {
        let candidates = response
            .get("candidates")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let mut out = Vec::new();

        for candidate in candidates {
            let parts = candidate
                .get("content")
                .and_then(|content| content.get("parts"))
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            for part in parts {
                if let Some(text) = part.get("text").and_then(Value::as_str) {
                    out.push(ResponsePart::Text(text.to_string()));
                    continue;
                }
                let inline = part
                    .get("inlineData")
                    .or_else(|| part.get("inline_data"))
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default();
                let data = inline
                    .get("data")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                if data.is_empty() {
                    continue;
                }
                let bytes = BASE64.decode(data.as_bytes()).map_err(|_| {
                    CapabilityError::invalid_response("Gemini image base64 decode failed")
                })?;
                let mime_type = inline
                    .get("mimeType")
                    .or_else(|| inline.get("mime_type"))
                    .and_then(Value::as_str)
                    .unwrap_or("image/png");
                out.push(ResponsePart::InlineImage(ImageData::new(bytes, mime_type)));
            }
        }

        Ok(out)
    }

    fn parse_structured(response: &Value, schema: &OutputSchema) -> Result<Value, CapabilityError> {
        if let Some(reason) = Self::block_reason(response) {
            return Err(CapabilityError::invalid_response(format!(
                "Gemini blocked the prompt ({reason})"
            )));
        }
        let text: String = Self::extract_parts(response)?
            .into_iter()
            .filter_map(|part| match part {
                ResponsePart::Text(text) => Some(text),
                ResponsePart::InlineImage(_) => None,
            })
            .collect();
        if text.trim().is_empty() {
            return Err(CapabilityError::invalid_response(
                "Gemini returned no structured payload",
            ));
        }
        let parsed: Value = serde_json::from_str(text.trim()).map_err(|err| {
            CapabilityError::invalid_response(format!("Gemini payload is not JSON: {err}"))
        })?;
        let validated = schema.validate(&parsed).map_err(|violation| {
            CapabilityError::invalid_response(format!("Gemini payload violates schema: {violation}"))
        })?;
        Ok(Value::Object(validated))
    }
}

impl StructuredGenerator for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    fn generate_structured(&self, request: &StructuredRequest) -> Result<Value, CapabilityError> {
        let payload = Self::structured_payload(request);
        let response = self.post(&request.model, &payload, request.timeout)?;
        Self::parse_structured(&response, &request.schema)
    }
}

impl ImageGenerator for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    fn generate_image(&self, request: &ImageRequest) -> Result<ImageResponse, CapabilityError> {
        let payload = Self::image_payload(request);
        let response = self.post(&request.model, &payload, request.timeout)?;
        if let Some(reason) = Self::block_reason(&response) {
            return Err(CapabilityError::invalid_response(format!(
                "Gemini blocked the prompt ({reason})"
            )));
        }
        Ok(ImageResponse {
            parts: Self::extract_parts(&response)?,
        })
    }
}

fn classify_transport_error(endpoint: &str, err: &reqwest::Error) -> CapabilityError {
    let message = format!("Gemini request failed ({endpoint}): {err}");
    if err.is_timeout() {
        return CapabilityError::timeout(message);
    }
    if err.is_connect() {
        return CapabilityError::unavailable(message);
    }
    CapabilityError::transport(message)
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use storyboard_contracts::story::AspectRatio;

    use super::*;
    use crate::error::CapabilityErrorKind;

    fn schema() -> OutputSchema {
        OutputSchema::new()
            .string("imagePrompt", "prompt")
            .nullable_number("visualAnchorIndex", "anchor")
    }

    fn candidate_with_parts(parts: Value) -> Value {
        json!({ "candidates": [{ "content": { "parts": parts } }] })
    }

    #[test]
    fn endpoint_accepts_bare_and_prefixed_model_names() {
        let provider = GeminiProvider::with_api_base("https://example.test/v1beta");
        assert_eq!(
            provider.endpoint_for_model("gemini-2.5-flash"),
            "https://example.test/v1beta/models/gemini-2.5-flash:generateContent"
        );
        assert_eq!(
            provider.endpoint_for_model("models/gemini-2.5-flash"),
            "https://example.test/v1beta/models/gemini-2.5-flash:generateContent"
        );
    }

    #[test]
    fn structured_payload_carries_schema_and_parts_in_order() {
        let request = StructuredRequest {
            model: "gemini-2.5-flash".to_string(),
            parts: vec![
                GenerationPart::text("SUBJECT"),
                GenerationPart::Image(ImageData::new(vec![1, 2, 3], "image/jpeg")),
                GenerationPart::text("instruction"),
            ],
            schema: schema(),
            timeout: Duration::from_secs(5),
        };
        let payload = GeminiProvider::structured_payload(&request);
        let parts = &payload["contents"][0]["parts"];
        assert_eq!(parts[0]["text"], "SUBJECT");
        assert_eq!(parts[1]["inlineData"]["mimeType"], "image/jpeg");
        assert_eq!(parts[1]["inlineData"]["data"], "AQID");
        assert_eq!(parts[2]["text"], "instruction");
        assert_eq!(
            payload["generationConfig"]["responseMimeType"],
            "application/json"
        );
        assert_eq!(
            payload["generationConfig"]["responseSchema"]["required"],
            json!(["imagePrompt", "visualAnchorIndex"])
        );
    }

    #[test]
    fn image_payload_requests_image_modality_and_ratio() {
        let request = ImageRequest {
            model: "gemini-2.5-flash-image".to_string(),
            parts: vec![GenerationPart::text("draw")],
            aspect_ratio: AspectRatio::Vertical,
            timeout: Duration::from_secs(5),
        };
        let payload = GeminiProvider::image_payload(&request);
        assert_eq!(
            payload["generationConfig"]["responseModalities"],
            json!(["IMAGE"])
        );
        assert_eq!(
            payload["generationConfig"]["imageConfig"]["aspectRatio"],
            "9:16"
        );
    }

    #[test]
    fn extract_parts_keeps_text_and_decodes_images() -> anyhow::Result<()> {
        let response = candidate_with_parts(json!([
            { "text": "Here you go" },
            { "inlineData": { "mimeType": "image/webp", "data": "AQID" } },
            { "inline_data": { "data": "" } },
        ]));
        let parts = GeminiProvider::extract_parts(&response)?;
        assert_eq!(
            parts,
            vec![
                ResponsePart::Text("Here you go".to_string()),
                ResponsePart::InlineImage(ImageData::new(vec![1, 2, 3], "image/webp")),
            ]
        );
        Ok(())
    }

    #[test]
    fn structured_response_is_validated_not_coerced() {
        let ok = candidate_with_parts(json!([
            { "text": "{\"imagePrompt\": \"a fox\", \"visualAnchorIndex\": null}" }
        ]));
        assert!(GeminiProvider::parse_structured(&ok, &schema()).is_ok());

        let missing = candidate_with_parts(json!([{ "text": "{\"imagePrompt\": \"a fox\"}" }]));
        let err = GeminiProvider::parse_structured(&missing, &schema())
            .err()
            .map(|err| err.kind);
        assert_eq!(err, Some(CapabilityErrorKind::InvalidResponse));

        let prose = candidate_with_parts(json!([{ "text": "Sure! Here is the JSON" }]));
        assert!(GeminiProvider::parse_structured(&prose, &schema()).is_err());

        let blocked = json!({ "promptFeedback": { "blockReason": "SAFETY" } });
        assert!(GeminiProvider::parse_structured(&blocked, &schema()).is_err());
    }
}
