//! Intent and item extraction through a hosted Gemini model.
//!
//! Model output is not trusted to be clean JSON. Whatever comes back is
//! searched for the first balanced JSON value, and any failure along the way
//! becomes `ExtractionResult::fallback()` so the session keeps going.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use shared::{sanitize_quantity, ExtractionConfig, ExtractionResult, Intent, LineItem, PaymentMode};
use std::time::Duration;

#[async_trait]
pub trait Extractor: Send + Sync {
    /// Never fails: errors are folded into the fallback result.
    async fn extract(&self, transcript: &str, role: &str) -> ExtractionResult;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    contents: Vec<Content>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct Content {
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
struct Part {
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    response_mime_type: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    candidates: Option<Vec<Candidate>>,
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<ResponseContent>,
}

#[derive(Debug, Deserialize)]
struct ResponseContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

pub struct GeminiExtractor {
    client: reqwest::Client,
    api_key: Option<String>,
    model: String,
    base_url: String,
    default_unit: String,
}

impl GeminiExtractor {
    pub fn new(config: &ExtractionConfig, default_unit: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .context("failed to build HTTP client")?;

        let api_key = config.resolved_api_key();
        if api_key.is_none() {
            warn!("No extraction API key configured; every turn will fall back");
        }

        Ok(Self {
            client,
            api_key,
            model: config.model.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            default_unit: default_unit.to_string(),
        })
    }

    async fn generate(&self, prompt: String) -> Result<String> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| anyhow!("no API key configured"))?;

        let request = GenerateRequest {
            contents: vec![Content {
                parts: vec![Part { text: prompt }],
            }],
            generation_config: GenerationConfig {
                temperature: 0.1,
                response_mime_type: "application/json".to_string(),
            },
        };

        let url = format!("{}/models/{}:generateContent", self.base_url, self.model);
        debug!("Sending extraction request to {}", url);

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", api_key)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("extraction request failed with status {}: {}", status, body));
        }

        let body: GenerateResponse = response.json().await?;

        if let Some(reason) = body.prompt_feedback.and_then(|feedback| feedback.block_reason) {
            return Err(anyhow!("extraction request blocked: {}", reason));
        }

        let text: String = body
            .candidates
            .and_then(|candidates| candidates.into_iter().next())
            .and_then(|candidate| candidate.content)
            .map(|content| {
                content
                    .parts
                    .into_iter()
                    .filter_map(|part| part.text)
                    .collect()
            })
            .unwrap_or_default();

        if text.trim().is_empty() {
            return Err(anyhow!("extraction response had no text"));
        }
        Ok(text)
    }
}

#[async_trait]
impl Extractor for GeminiExtractor {
    async fn extract(&self, transcript: &str, role: &str) -> ExtractionResult {
        let text = match self.generate(build_prompt(transcript, role)).await {
            Ok(text) => text,
            Err(e) => {
                warn!("Extraction call failed: {:#}", e);
                return ExtractionResult::fallback();
            }
        };

        match parse_extraction(&text, &self.default_unit) {
            Some(result) => result,
            None => {
                warn!("Could not read extraction response: {}", text);
                ExtractionResult::fallback()
            }
        }
    }
}

pub fn build_prompt(transcript: &str, role: &str) -> String {
    format!(
        r#"You are the sales assistant of a neighbourhood grocery (kirana) store.
Role of the speaker: {role}
Transcript: "{transcript}"

Reply with one JSON object and nothing else:
{{
  "message": short reply in the speaker's own language style (Hindi, Hinglish or English),
  "intent": "record_sale" when items sold are being listed,
            "finalize_sale" when the speaker is done, wants the total or checkout,
            "stock_check" when asking whether something is available,
  "items": [{{"product": name, "qty": number, "unit": unit, "price": number or null}}],
  "payment_mode": "CASH" or "UDHAAR" when mentioned, otherwise omit
}}

List every item mentioned. "2 kilo chawal aur ek packet namak" has two items.
Only include "price" when the speaker said one."#
    )
}

/// Reads an extraction out of free model text; `None` when no usable JSON is present.
pub fn parse_extraction(text: &str, default_unit: &str) -> Option<ExtractionResult> {
    let cleaned = strip_fences(text);

    for (start, ch) in cleaned.char_indices() {
        if ch != '{' && ch != '[' {
            continue;
        }
        let Some(candidate) = balanced_from(&cleaned, start) else {
            continue;
        };
        if let Ok(value) = serde_json::from_str::<Value>(candidate) {
            if let Some(result) = result_from_value(value, default_unit) {
                return Some(result);
            }
        }
    }
    None
}

fn strip_fences(text: &str) -> String {
    let mut cleaned = text.to_string();
    for marker in ["```json", "```JSON", "```"] {
        cleaned = cleaned.replace(marker, " ");
    }
    cleaned
}

/// The balanced `{...}` or `[...]` starting at `start`, skipping brackets inside strings.
fn balanced_from(text: &str, start: usize) -> Option<&str> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &byte) in text.as_bytes()[start..].iter().enumerate() {
        if in_string {
            match byte {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'{' | b'[' => depth += 1,
            b'}' | b']' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(&text[start..=start + offset]);
                }
            }
            _ => {}
        }
    }
    None
}

fn result_from_value(value: Value, default_unit: &str) -> Option<ExtractionResult> {
    match value {
        Value::Object(map) => {
            let label = string_field(&map, &["intent"]);
            let message = string_field(&map, &["message"]);
            // Some other object the model happened to mention.
            if label.is_none() && message.is_none() {
                return None;
            }

            let items = map
                .get("items")
                .and_then(Value::as_array)
                .map(|items| items_from_values(items, default_unit))
                .unwrap_or_default();
            let intent = label.map(Intent::from_label).unwrap_or(Intent::Error);
            let payment_mode = string_field(&map, &["payment_mode", "paymentMode"])
                .and_then(PaymentMode::from_label);
            let message = match message.unwrap_or_default() {
                text if text.trim().is_empty() && intent == Intent::Error => {
                    ExtractionResult::FALLBACK_MESSAGE.to_string()
                }
                text => text.to_string(),
            };

            Some(ExtractionResult {
                message,
                intent,
                items,
                payment_mode,
            })
        }
        // A bare item list is accepted, but only if it really holds items.
        Value::Array(values) => {
            let items = items_from_values(&values, default_unit);
            if items.is_empty() {
                return None;
            }
            Some(ExtractionResult {
                message: String::new(),
                intent: Intent::RecordSale,
                items,
                payment_mode: None,
            })
        }
        _ => None,
    }
}

fn items_from_values(values: &[Value], default_unit: &str) -> Vec<LineItem> {
    values
        .iter()
        .filter_map(Value::as_object)
        .filter_map(|item| item_from_map(item, default_unit))
        .collect()
}

fn item_from_map(map: &Map<String, Value>, default_unit: &str) -> Option<LineItem> {
    let product_name = string_field(map, &["product", "productName", "name"])?
        .trim()
        .to_string();
    if product_name.is_empty() {
        return None;
    }

    let quantity = number_field(map, &["qty", "quantity"])
        .map(sanitize_quantity)
        .unwrap_or(1.0);
    let unit = string_field(map, &["unit"])
        .map(str::trim)
        .filter(|unit| !unit.is_empty())
        .unwrap_or(default_unit)
        .to_string();
    let estimated_price = number_field(map, &["price", "estimatedPrice"])
        .filter(|price| price.is_finite() && *price >= 0.0);

    Some(LineItem {
        product_name,
        quantity,
        unit,
        estimated_price,
    })
}

fn string_field<'a>(map: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|key| map.get(*key).and_then(Value::as_str))
}

fn number_field(map: &Map<String, Value>, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|key| match map.get(*key)? {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    })
}
