//! Vision-model collaborator: the Gemini `generateContent` wire format and a
//! thin reqwest client behind the [`VisionModel`] seam. The decision engine
//! only sees [`ModelRequest`]/[`ModelResponse`]; tests script the trait.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_MODEL: &str = "gemini-2.0-flash-exp";

const GEMINI_ENDPOINT: &str = "https://generativelanguage.googleapis.com/v1beta/models";

/// Failures of one model invocation. All variants are transport-class from
/// the decision engine's point of view: none of them is retried, unlike a
/// JSON parse failure of the returned text (Protocol A), which is local to
/// the engine.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("malformed model payload: {0}")]
    Malformed(String),
    #[error("model returned no candidates")]
    Empty,
}

/// One conversation turn, Gemini wire shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Content {
    pub role: String,
    #[serde(default)]
    pub parts: Vec<Part>,
}

impl Content {
    pub fn user(parts: Vec<Part>) -> Self {
        Self {
            role: "user".to_string(),
            parts,
        }
    }

    pub fn model(parts: Vec<Part>) -> Self {
        Self {
            role: "model".to_string(),
            parts,
        }
    }
}

/// A content part: exactly one of the fields is set in practice.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<Blob>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_call: Option<FunctionCall>,
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }

    /// A base64 PNG image part.
    pub fn png(data_b64: impl Into<String>) -> Self {
        Self {
            inline_data: Some(Blob {
                mime_type: "image/png".to_string(),
                data: data_b64.into(),
            }),
            ..Default::default()
        }
    }

    pub fn function_call(name: impl Into<String>, args: serde_json::Value) -> Self {
        Self {
            function_call: Some(FunctionCall {
                name: name.into(),
                args,
            }),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

/// A tool the model may invoke, with a JSON-schema parameter description.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Everything one model invocation needs, protocol-independent.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub system_instruction: Option<String>,
    pub contents: Vec<Content>,
    pub tools: Option<Vec<FunctionDeclaration>>,
    pub temperature: f32,
    pub max_output_tokens: u32,
}

/// The model's turn: its parts plus the control-channel finish reason.
#[derive(Debug, Clone, Default)]
pub struct ModelResponse {
    pub parts: Vec<Part>,
    pub finish_reason: Option<String>,
}

impl ModelResponse {
    /// All text parts concatenated.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| p.text.as_deref())
            .collect::<Vec<_>>()
            .join("")
    }

    /// The first requested tool invocation, if any.
    pub fn function_call(&self) -> Option<&FunctionCall> {
        self.parts.iter().find_map(|p| p.function_call.as_ref())
    }
}

/// Capability seam for anything that can look at a screenshot and reply.
#[async_trait]
pub trait VisionModel: Send + Sync {
    async fn generate(&self, request: ModelRequest) -> Result<ModelResponse, ModelError>;
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<SystemInstruction>,
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ToolConfig>>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Clone, Serialize)]
struct SystemInstruction {
    parts: Vec<Part>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolConfig {
    function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    max_output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<Content>,
    finish_reason: Option<String>,
}

/// Gemini REST client. One instance per run is fine; the inner reqwest
/// client pools connections.
pub struct GeminiClient {
    http: reqwest::Client,
    api_key: String,
    model: String,
}

impl GeminiClient {
    pub fn new(api_key: String, model: String) -> Self {
        // The client-wide timeout also bounds tool-call invocations, which
        // have no other application-level deadline.
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .expect("failed to build HTTP client");
        Self {
            http,
            api_key,
            model,
        }
    }
}

#[async_trait]
impl VisionModel for GeminiClient {
    async fn generate(&self, request: ModelRequest) -> Result<ModelResponse, ModelError> {
        let url = format!(
            "{GEMINI_ENDPOINT}/{}:generateContent?key={}",
            self.model, self.api_key
        );
        let body = GenerateRequest {
            system_instruction: request.system_instruction.map(|text| SystemInstruction {
                parts: vec![Part::text(text)],
            }),
            contents: request.contents,
            tools: request.tools.map(|function_declarations| {
                vec![ToolConfig {
                    function_declarations,
                }]
            }),
            generation_config: GenerationConfig {
                temperature: request.temperature,
                max_output_tokens: request.max_output_tokens,
            },
        };

        let response = self.http.post(&url).json(&body).send().await?;
        let status = response.status();
        let payload: serde_json::Value = response.json().await?;

        if !status.is_success() {
            let message = payload["error"]["message"]
                .as_str()
                .unwrap_or("unknown API error")
                .to_string();
            return Err(ModelError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let reply: GenerateResponse =
            serde_json::from_value(payload).map_err(|e| ModelError::Malformed(e.to_string()))?;
        let candidate = reply.candidates.into_iter().next().ok_or(ModelError::Empty)?;
        debug!(
            finish_reason = candidate.finish_reason.as_deref().unwrap_or(""),
            "model candidate received"
        );
        Ok(ModelResponse {
            parts: candidate.content.map(|c| c.parts).unwrap_or_default(),
            finish_reason: candidate.finish_reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_parts_deserialize_from_camel_case() {
        let json = r#"{
            "role": "model",
            "parts": [
                {"text": "looking"},
                {"functionCall": {"name": "computer_use_click", "args": {"coordinate": [10, 20]}}}
            ]
        }"#;
        let content: Content = serde_json::from_str(json).unwrap();
        assert_eq!(content.parts.len(), 2);
        let call = content.parts[1].function_call.as_ref().unwrap();
        assert_eq!(call.name, "computer_use_click");
        assert_eq!(call.args["coordinate"][0], 10);
    }

    #[test]
    fn image_parts_serialize_with_inline_data() {
        let part = Part::png("QUJD");
        let value = serde_json::to_value(&part).unwrap();
        assert_eq!(value["inlineData"]["mimeType"], "image/png");
        assert_eq!(value["inlineData"]["data"], "QUJD");
        assert!(value.get("text").is_none());
    }

    #[test]
    fn response_text_concatenates_text_parts_only() {
        let response = ModelResponse {
            parts: vec![
                Part::text("all "),
                Part::function_call("computer_use_screenshot", serde_json::json!({})),
                Part::text("done"),
            ],
            finish_reason: Some("STOP".to_string()),
        };
        assert_eq!(response.text(), "all done");
        assert!(response.function_call().is_some());
    }
}
