use std::time::Duration;

use base64::{engine::general_purpose, Engine as _};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::config::{
    ANALYZE_SYSTEM_PROMPT, CONFIG, CRITIQUE_SYSTEM_PROMPT, RENDER_SYSTEM_PROMPT,
};
use crate::error::{StudioError, StudioResult};
use crate::llm::media::detect_mime_type;
use crate::session::Critique;
use crate::utils::http::get_http_client;
use crate::utils::timing::log_llm_timing;

const GEMINI_CALL_TIMEOUT: Duration = Duration::from_secs(90);

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    candidates: Option<Vec<GeminiCandidate>>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContent>,
}

#[derive(Debug, Deserialize)]
struct GeminiContent {
    parts: Option<Vec<GeminiPart>>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum GeminiPart {
    Text {
        text: String,
    },
    InlineData {
        #[serde(rename = "inlineData")]
        inline_data: GeminiInlineData,
    },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiInlineData {
    mime_type: String,
    data: String,
}

// The key typed into the page wins over the environment credential.
pub fn resolve_api_key(override_key: Option<&str>) -> StudioResult<String> {
    if let Some(key) = override_key {
        if !key.trim().is_empty() {
            return Ok(key.trim().to_string());
        }
    }
    let key = CONFIG.gemini_api_key.trim();
    if key.is_empty() {
        return Err(StudioError::Configuration(
            "No Gemini API key configured. Set GEMINI_API_KEY or enter a key in the page."
                .to_string(),
        ));
    }
    Ok(key.to_string())
}

fn redact_api_key(text: &str, api_key: &str) -> String {
    let mut redacted = text.to_string();
    for key in [api_key, CONFIG.gemini_api_key.trim()] {
        if !key.is_empty() {
            redacted = redacted.replace(key, "[redacted]");
        }
    }
    redacted
}

fn truncate_for_log(value: &str, limit: usize) -> String {
    if value.chars().count() <= limit {
        return value.to_string();
    }
    let truncated: String = value.chars().take(limit).collect();
    format!("{truncated}... (truncated)")
}

fn summarize_error_body(body: &str) -> (Option<String>, String) {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return (None, "empty response body".to_string());
    }

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        let message = value
            .pointer("/error/message")
            .and_then(|v| v.as_str())
            .map(|v| v.to_string())
            .or_else(|| {
                value
                    .get("message")
                    .and_then(|v| v.as_str())
                    .map(|v| v.to_string())
            });
        return (message, truncate_for_log(&value.to_string(), 2000));
    }

    (None, truncate_for_log(trimmed, 2000))
}

fn build_safety_settings() -> Vec<Value> {
    let threshold = match CONFIG.gemini_safety_settings.as_str() {
        "standard" => "BLOCK_MEDIUM_AND_ABOVE",
        _ => "OFF",
    };

    vec![
        json!({ "category": "HARM_CATEGORY_HARASSMENT", "threshold": threshold }),
        json!({ "category": "HARM_CATEGORY_HATE_SPEECH", "threshold": threshold }),
        json!({ "category": "HARM_CATEGORY_SEXUALLY_EXPLICIT", "threshold": threshold }),
        json!({ "category": "HARM_CATEGORY_DANGEROUS_CONTENT", "threshold": threshold }),
        json!({ "category": "HARM_CATEGORY_CIVIC_INTEGRITY", "threshold": threshold }),
    ]
}

fn build_image_config() -> Option<Value> {
    let mut map = Map::new();

    let aspect_ratio = CONFIG.image_aspect_ratio.trim();
    if !aspect_ratio.is_empty() {
        map.insert("aspectRatio".to_string(), json!(aspect_ratio));
    }

    let image_size = CONFIG.image_size.trim();
    if !image_size.is_empty() {
        map.insert("imageSize".to_string(), json!(image_size));
    }

    if map.is_empty() {
        None
    } else {
        Some(Value::Object(map))
    }
}

// Text part first, then images, matching the order the prompts reference
// them in ("Image 1 ... Image 2 ...").
fn build_parts(user_content: &str, images: &[(&[u8], &str)]) -> Vec<Value> {
    let mut parts = vec![json!({ "text": user_content })];

    for (bytes, mime_type) in images {
        let mime_type = if mime_type.is_empty() {
            detect_mime_type(bytes).unwrap_or_else(|| "image/png".to_string())
        } else {
            (*mime_type).to_string()
        };
        let encoded = general_purpose::STANDARD.encode(bytes);
        parts.push(json!({
            "inlineData": {
                "mimeType": mime_type,
                "data": encoded
            }
        }));
    }

    parts
}

fn summarize_parts(parts: &[Value]) -> Vec<Value> {
    parts
        .iter()
        .map(|part| {
            if let Some(text) = part.get("text").and_then(|value| value.as_str()) {
                json!({ "text": truncate_for_log(text, 200) })
            } else if let Some(inline_data) = part.get("inlineData") {
                let mime_type = inline_data
                    .get("mimeType")
                    .and_then(|value| value.as_str())
                    .unwrap_or("unknown");
                let data_len = inline_data
                    .get("data")
                    .and_then(|value| value.as_str())
                    .map(|value| value.len())
                    .unwrap_or(0);
                json!({ "inlineData": { "mimeType": mime_type, "dataLen": data_len } })
            } else {
                json!({ "unknownPart": true })
            }
        })
        .collect()
}

fn summarize_payload(payload: &Value) -> Value {
    let mut summary = Map::new();

    if let Some(instruction) = payload.pointer("/systemInstruction/parts/0/text") {
        summary.insert(
            "systemInstruction".to_string(),
            json!(truncate_for_log(instruction.as_str().unwrap_or(""), 120)),
        );
    }

    if let Some(contents) = payload.get("contents").and_then(|value| value.as_array()) {
        let summarized: Vec<Value> = contents
            .iter()
            .map(|content| {
                let role = content
                    .get("role")
                    .and_then(|value| value.as_str())
                    .unwrap_or("user");
                let parts = content
                    .get("parts")
                    .and_then(|value| value.as_array())
                    .map(|parts| summarize_parts(parts))
                    .unwrap_or_default();
                json!({ "role": role, "parts": parts })
            })
            .collect();
        summary.insert("contents".to_string(), Value::Array(summarized));
    }

    if let Some(config) = payload.get("generationConfig") {
        summary.insert("generationConfig".to_string(), config.clone());
    }

    Value::Object(summary)
}

fn summarize_response(response: &GeminiResponse) -> Value {
    let mut text_parts = 0usize;
    let mut image_parts = 0usize;
    let mut text_preview = None;

    for candidate in response.candidates.as_deref().unwrap_or(&[]) {
        let Some(parts) = candidate.content.as_ref().and_then(|c| c.parts.as_ref()) else {
            continue;
        };
        for part in parts {
            match part {
                GeminiPart::Text { text } => {
                    text_parts += 1;
                    if text_preview.is_none() && !text.trim().is_empty() {
                        text_preview = Some(truncate_for_log(text, 200));
                    }
                }
                GeminiPart::InlineData { inline_data } => {
                    if inline_data.mime_type.starts_with("image/") {
                        image_parts += 1;
                    }
                }
            }
        }
    }

    json!({
        "candidates": response.candidates.as_ref().map(|c| c.len()).unwrap_or(0),
        "textParts": text_parts,
        "imageParts": image_parts,
        "textPreview": text_preview
    })
}

fn extract_text_from_response(response: GeminiResponse) -> String {
    let mut text_parts = Vec::new();
    for candidate in response.candidates.unwrap_or_default() {
        if let Some(content) = candidate.content {
            if let Some(parts) = content.parts {
                for part in parts {
                    if let GeminiPart::Text { text } = part {
                        if !text.trim().is_empty() {
                            text_parts.push(text);
                        }
                    }
                }
            }
        }
    }
    text_parts.join("\n")
}

fn extract_first_image_from_response(response: GeminiResponse) -> Option<(Vec<u8>, String)> {
    for candidate in response.candidates.unwrap_or_default() {
        if let Some(content) = candidate.content {
            if let Some(parts) = content.parts {
                for part in parts {
                    if let GeminiPart::InlineData { inline_data } = part {
                        if !inline_data.mime_type.starts_with("image/") {
                            continue;
                        }
                        if let Ok(bytes) = general_purpose::STANDARD.decode(inline_data.data) {
                            return Some((bytes, inline_data.mime_type));
                        }
                    }
                }
            }
        }
    }
    None
}

// Models wrap JSON in markdown fences even when asked not to.
fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").or_else(|| rest.strip_prefix("JSON")).unwrap_or(rest);
    let rest = rest.strip_suffix("```").unwrap_or(rest);
    rest.trim()
}

fn parse_json_object(text: &str, context: &str) -> StudioResult<Value> {
    let stripped = strip_code_fences(text);
    if stripped.is_empty() {
        return Err(StudioError::MalformedResponse(format!(
            "{context}: the model returned no text"
        )));
    }
    let value: Value = serde_json::from_str(stripped).map_err(|err| {
        StudioError::MalformedResponse(format!(
            "{context}: expected JSON, got parse error: {err} (text: {})",
            truncate_for_log(stripped, 200)
        ))
    })?;
    if !value.is_object() {
        return Err(StudioError::MalformedResponse(format!(
            "{context}: expected a JSON object, got {}",
            truncate_for_log(&value.to_string(), 200)
        )));
    }
    Ok(value)
}

fn parse_critique(text: &str) -> StudioResult<Critique> {
    let value = parse_json_object(text, "critique")?;

    let changes = value
        .get("changes")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default();

    let new_prompt = value
        .get("new_prompt")
        .filter(|v| v.is_object())
        .cloned()
        .ok_or_else(|| {
            StudioError::MalformedResponse(
                "critique: the model returned no 'new_prompt' object".to_string(),
            )
        })?;

    Ok(Critique {
        changes,
        new_prompt,
    })
}

async fn call_gemini_api(model: &str, payload: Value, api_key: &str) -> StudioResult<GeminiResponse> {
    let client = get_http_client();
    let url = format!(
        "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent",
        model
    );

    if tracing::enabled!(tracing::Level::DEBUG) {
        debug!(target: "llm.gemini", model = model, payload = %summarize_payload(&payload));
    }

    let response = client
        .post(&url)
        .header("x-goog-api-key", api_key)
        .timeout(GEMINI_CALL_TIMEOUT)
        .json(&payload)
        .send()
        .await
        .map_err(|err| {
            StudioError::Transport(redact_api_key(
                &format!(
                    "Gemini request failed to send: {err} (timeout={}, connect={})",
                    err.is_timeout(),
                    err.is_connect()
                ),
                api_key,
            ))
        })?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let (message, body_summary) = summarize_error_body(&body);
        if tracing::enabled!(tracing::Level::DEBUG) {
            debug!(target: "llm.gemini", status = %status, body = %truncate_for_log(&body, 4000));
        }
        let detail = message.unwrap_or(body_summary);
        return Err(StudioError::Transport(redact_api_key(
            &format!("Gemini returned status {status}: {detail}"),
            api_key,
        )));
    }

    let value = response.json::<GeminiResponse>().await.map_err(|err| {
        StudioError::MalformedResponse(format!("Gemini response body was not valid JSON: {err}"))
    })?;
    if tracing::enabled!(tracing::Level::DEBUG) {
        debug!(target: "llm.gemini", model = model, response = %summarize_response(&value));
    }
    Ok(value)
}

fn text_generation_config() -> Value {
    json!({
        "temperature": CONFIG.gemini_temperature,
        "topK": CONFIG.gemini_top_k,
        "topP": CONFIG.gemini_top_p,
        "maxOutputTokens": CONFIG.gemini_max_output_tokens,
        "responseMimeType": "application/json",
    })
}

pub async fn analyze_image(
    api_key: &str,
    image_bytes: &[u8],
    image_mime: &str,
) -> StudioResult<Value> {
    let user_content = format!(
        "Analyze this image and provide a detailed, structured JSON description.\nFollow this structure exactly:\n\n{}",
        CONFIG.prompt_template
    );
    let parts = build_parts(&user_content, &[(image_bytes, image_mime)]);
    let payload = json!({
        "systemInstruction": { "parts": [{ "text": ANALYZE_SYSTEM_PROMPT }] },
        "contents": [{ "role": "user", "parts": parts }],
        "generationConfig": text_generation_config(),
        "safetySettings": build_safety_settings(),
    });

    let model = &CONFIG.gemini_model;
    log_llm_timing(model, "analyze_image", || async {
        let response = call_gemini_api(model, payload, api_key).await?;
        parse_json_object(&extract_text_from_response(response), "analysis")
    })
    .await
}

pub async fn critique_image(
    api_key: &str,
    source: (&[u8], &str),
    generated: (&[u8], &str),
    current_description: &Value,
) -> StudioResult<Critique> {
    let current_json = serde_json::to_string_pretty(current_description)
        .unwrap_or_else(|_| current_description.to_string());
    let user_content = format!(
        "Image 1 is the SOURCE image (the goal).\n\
         Image 2 is the GENERATED image (current attempt).\n\n\
         The generated image was created from this JSON prompt:\n{current_json}\n\n\
         Compare the two images and identify where the generated image fails to capture the source. Pay specific attention to:\n\
         1. Relative proportions: the size of elements relative to each other (head vs body, object vs hand).\n\
         2. Spatial layout and positioning: the exact position of elements (left, right, above, below, center) and whether they sit in the correct quadrant.\n\
         3. Angles and perspective: the camera angle (high angle, low angle, eye level) and the angle of the subject.\n\
         4. Key details: specific colors, textures, lighting, and background elements.\n\n\
         Rewrite the JSON prompt to fix these issues so the next generation looks closer to the source.\n\n\
         Return a JSON object with this structure:\n\
         {{\n  \"changes\": [\"list\", \"of\", \"key\", \"changes\", \"made\"],\n  \"new_prompt\": {{ ... the full updated JSON prompt ... }}\n}}"
    );
    let parts = build_parts(&user_content, &[source, generated]);
    let payload = json!({
        "systemInstruction": { "parts": [{ "text": CRITIQUE_SYSTEM_PROMPT }] },
        "contents": [{ "role": "user", "parts": parts }],
        "generationConfig": text_generation_config(),
        "safetySettings": build_safety_settings(),
    });

    let model = &CONFIG.gemini_model;
    log_llm_timing(model, "critique_image", || async {
        let response = call_gemini_api(model, payload, api_key).await?;
        parse_critique(&extract_text_from_response(response))
    })
    .await
}

pub async fn generate_image(api_key: &str, description: &Value) -> StudioResult<(Vec<u8>, String)> {
    let description_json =
        serde_json::to_string_pretty(description).unwrap_or_else(|_| description.to_string());
    let user_content = format!(
        "Generate a photorealistic image based on this detailed description:\n\n{description_json}"
    );
    let parts = build_parts(&user_content, &[]);

    let mut generation_config = json!({
        "responseModalities": ["TEXT", "IMAGE"]
    });
    if let Some(image_config) = build_image_config() {
        if let Some(config_object) = generation_config.as_object_mut() {
            config_object.insert("imageConfig".to_string(), image_config);
        }
    }

    let payload = json!({
        "systemInstruction": { "parts": [{ "text": RENDER_SYSTEM_PROMPT }] },
        "contents": [{ "role": "user", "parts": parts }],
        "generationConfig": generation_config,
        "safetySettings": build_safety_settings(),
    });

    let model = &CONFIG.gemini_image_model;
    log_llm_timing(model, "generate_image", || async {
        let response = call_gemini_api(model, payload, api_key).await?;
        extract_first_image_from_response(response).ok_or_else(|| {
            StudioError::MalformedResponse(format!(
                "No image payload returned by Gemini (model: {model})"
            ))
        })
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_fenced_json() {
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```\n{}\n```"), "{}");
        assert_eq!(strip_code_fences("  {\"a\":1}  "), "{\"a\":1}");
    }

    #[test]
    fn parse_json_object_rejects_non_objects() {
        assert!(parse_json_object("{\"subject\": \"cat\"}", "analysis").is_ok());
        let err = parse_json_object("[1, 2]", "analysis").unwrap_err();
        assert_eq!(err.kind(), "malformed_response");
        let err = parse_json_object("not json at all", "analysis").unwrap_err();
        assert_eq!(err.kind(), "malformed_response");
    }

    #[test]
    fn parse_critique_accepts_missing_changes() {
        let critique =
            parse_critique("{\"new_prompt\": {\"subject\": \"cat\"}}").expect("valid critique");
        assert!(critique.changes.is_empty());
        assert_eq!(critique.new_prompt["subject"], "cat");
    }

    #[test]
    fn parse_critique_requires_new_prompt_object() {
        let err = parse_critique("{\"changes\": [\"bigger ears\"]}").unwrap_err();
        assert_eq!(err.kind(), "malformed_response");
        let err = parse_critique("{\"changes\": [], \"new_prompt\": \"not an object\"}").unwrap_err();
        assert_eq!(err.kind(), "malformed_response");
    }

    #[test]
    fn parse_critique_reads_fenced_output() {
        let critique = parse_critique(
            "```json\n{\"changes\": [\"moved subject left\"], \"new_prompt\": {\"subject\": \"dog\"}}\n```",
        )
        .expect("valid critique");
        assert_eq!(critique.changes, vec!["moved subject left".to_string()]);
    }

    #[test]
    fn extracts_first_image_part() {
        let raw = serde_json::json!({
            "candidates": [{
                "content": {
                    "parts": [
                        { "text": "here you go" },
                        { "inlineData": { "mimeType": "image/png", "data": "AQID" } },
                        { "inlineData": { "mimeType": "image/png", "data": "BAUG" } }
                    ]
                }
            }]
        });
        let response: GeminiResponse = serde_json::from_value(raw).unwrap();
        let (bytes, mime) = extract_first_image_from_response(response).unwrap();
        assert_eq!(bytes, vec![1, 2, 3]);
        assert_eq!(mime, "image/png");
    }

    #[test]
    fn extract_text_skips_image_parts_and_blank_text() {
        let raw = serde_json::json!({
            "candidates": [{
                "content": {
                    "parts": [
                        { "text": "  " },
                        { "inlineData": { "mimeType": "image/png", "data": "AQID" } },
                        { "text": "{\"subject\": \"cat\"}" }
                    ]
                }
            }]
        });
        let response: GeminiResponse = serde_json::from_value(raw).unwrap();
        assert_eq!(extract_text_from_response(response), "{\"subject\": \"cat\"}");
    }

    #[test]
    fn build_parts_places_text_before_images() {
        let parts = build_parts("describe this", &[(&[0x89u8, 0x50, 0x4E, 0x47][..], "image/png")]);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0]["text"], "describe this");
        assert_eq!(parts[1]["inlineData"]["mimeType"], "image/png");
    }

    #[test]
    fn error_body_summary_prefers_nested_message() {
        let (message, _) = summarize_error_body(
            "{\"error\": {\"code\": 400, \"message\": \"API key not valid\"}}",
        );
        assert_eq!(message.as_deref(), Some("API key not valid"));
        let (message, summary) = summarize_error_body("plain text failure");
        assert!(message.is_none());
        assert_eq!(summary, "plain text failure");
    }
}
