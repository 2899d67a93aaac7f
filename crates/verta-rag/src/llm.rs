//! LLM Client implementations
//!
//! Provides OpenAI-compatible and Ollama chat clients with support for both
//! synchronous and streaming responses. Each agent in the conversation graph
//! gets its own client so that agents can run on different models.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::io::StreamReader;
use verta_core::{LlmClient, LlmConfig, LlmProvider, Prompt, Result, ResponseSchema, VertaError};

const OPENAI_DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

// ============================================================================
// OpenAI Client
// ============================================================================

/// OpenAI-compatible chat completions client
pub struct OpenAiClient {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat<'a>>,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

/// `response_format` of type `json_schema`
#[derive(Debug, Serialize)]
struct ResponseFormat<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    json_schema: JsonSchemaFormat<'a>,
}

#[derive(Debug, Serialize)]
struct JsonSchemaFormat<'a> {
    name: &'a str,
    strict: bool,
    schema: &'a serde_json::Value,
}

impl<'a> ResponseFormat<'a> {
    fn strict(schema: &'a ResponseSchema) -> Self {
        Self {
            kind: "json_schema",
            json_schema: JsonSchemaFormat {
                name: &schema.name,
                strict: true,
                schema: &schema.schema,
            },
        }
    }
}

/// System message first when present, then the user turn
fn chat_messages(prompt: &Prompt) -> Vec<Message<'_>> {
    let mut messages = Vec::with_capacity(2);
    if let Some(system) = &prompt.system {
        messages.push(Message {
            role: "system",
            content: system,
        });
    }
    messages.push(Message {
        role: "user",
        content: &prompt.user,
    });
    messages
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamResponse {
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: Delta,
}

#[derive(Debug, Deserialize)]
struct Delta {
    content: Option<String>,
}

impl OpenAiClient {
    /// Create a new OpenAI client
    pub fn new(
        api_key: impl Into<String>,
        model: impl Into<String>,
        max_tokens: u32,
        temperature: f32,
    ) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            base_url: OPENAI_DEFAULT_BASE_URL.to_string(),
            model: model.into(),
            max_tokens,
            temperature,
        }
    }

    /// Create from config for the given model
    pub fn from_config(config: &LlmConfig, model: &str) -> Result<Self> {
        let api_key = config
            .openai_api_key
            .as_ref()
            .ok_or_else(|| VertaError::ConfigError("OpenAI API key required".to_string()))?;

        let mut client = Self::new(api_key.clone(), model, config.max_tokens, config.temperature);
        client.client = http_client(config)?;
        if let Some(base_url) = &config.openai_base_url {
            client = client.with_base_url(base_url.clone());
        }
        Ok(client)
    }

    /// Set custom base URL (for Groq, Azure or other compatible APIs)
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    fn request<'a>(
        &'a self,
        prompt: &'a Prompt,
        stream: bool,
        schema: Option<&'a ResponseSchema>,
    ) -> OpenAiRequest<'a> {
        OpenAiRequest {
            model: &self.model,
            messages: chat_messages(prompt),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            stream: stream.then_some(true),
            response_format: schema.map(ResponseFormat::strict),
        }
    }

    async fn send(&self, request: &OpenAiRequest<'_>) -> Result<Response> {

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await
            .map_err(|e| VertaError::ProviderError(format!("Request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(VertaError::ProviderError(format!(
                "OpenAI error ({status}): {error_text}"
            )));
        }
        Ok(response)
    }

    async fn complete(&self, request: &OpenAiRequest<'_>) -> Result<String> {
        let result: OpenAiResponse = self
            .send(request)
            .await?
            .json()
            .await
            .map_err(|e| VertaError::ProviderError(format!("Failed to parse response: {e}")))?;

        result
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content.unwrap_or_default())
            .ok_or_else(|| VertaError::ProviderError("No response generated".to_string()))
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn generate(&self, prompt: &Prompt) -> Result<String> {
        self.complete(&self.request(prompt, false, None)).await
    }

    async fn generate_structured(&self, prompt: &Prompt, schema: &ResponseSchema) -> Result<String> {
        self.complete(&self.request(prompt, false, Some(schema))).await
    }

    async fn generate_stream(&self, prompt: &Prompt) -> Result<BoxStream<'static, Result<String>>> {
        let response = self.send(&self.request(prompt, true, None)).await?;
        let tokens = response_lines(response)
            .try_filter_map(|line| futures::future::ready(parse_openai_line(&line)));
        Ok(tokens.boxed())
    }

    fn model(&self) -> &str {
        &self.model
    }
}

/// Decode one server-sent line of a streamed chat completion.
///
/// Returns `None` for keep-alives, the `[DONE]` marker, and chunks without
/// content (role announcements, finish reasons).
fn parse_openai_line(line: &str) -> Result<Option<String>> {
    let Some(data) = line.trim().strip_prefix("data:") else {
        return Ok(None);
    };
    let data = data.trim();
    if data.is_empty() || data == "[DONE]" {
        return Ok(None);
    }

    let parsed: StreamResponse = serde_json::from_str(data)
        .map_err(|e| VertaError::ProviderError(format!("Malformed stream chunk: {e}")))?;

    Ok(parsed
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta.content)
        .filter(|c| !c.is_empty()))
}

// ============================================================================
// Ollama Client
// ============================================================================

/// Ollama API client
pub struct OllamaClient {
    client: Client,
    base_url: String,
    model: String,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    /// JSON Schema the reply must follow
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<&'a serde_json::Value>,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Debug, Clone, Copy, Serialize)]
struct OllamaOptions {
    temperature: f32,
    num_predict: u32,
}

#[derive(Debug, Deserialize)]
struct OllamaResponse {
    #[serde(default)]
    response: String,
    #[serde(default)]
    error: Option<String>,
}

impl OllamaClient {
    /// Create a new Ollama client
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            options: OllamaOptions {
                temperature: 0.1,
                num_predict: 1024,
            },
        }
    }

    /// Create from config for the given model
    pub fn from_config(config: &LlmConfig, model: &str) -> Result<Self> {
        let mut client = Self::new(config.ollama_url.clone(), model);
        client.client = http_client(config)?;
        client.options = OllamaOptions {
            temperature: config.temperature,
            num_predict: config.max_tokens,
        };
        Ok(client)
    }

    fn request<'a>(
        &'a self,
        prompt: &'a Prompt,
        stream: bool,
        schema: Option<&'a ResponseSchema>,
    ) -> OllamaRequest<'a> {
        OllamaRequest {
            model: &self.model,
            prompt: &prompt.user,
            system: prompt.system.as_deref(),
            format: schema.map(|s| &s.schema),
            stream,
            options: self.options,
        }
    }

    async fn send(&self, request: &OllamaRequest<'_>) -> Result<Response> {

        let response = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .json(request)
            .send()
            .await
            .map_err(|e| VertaError::ProviderError(format!("Ollama request failed: {e}")))?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(VertaError::ProviderError(format!(
                "Ollama error: {error_text}"
            )));
        }
        Ok(response)
    }

    async fn complete(&self, request: &OllamaRequest<'_>) -> Result<String> {
        let result: OllamaResponse = self.send(request).await?.json().await.map_err(|e| {
            VertaError::ProviderError(format!("Failed to parse Ollama response: {e}"))
        })?;

        match result.error {
            Some(error) => Err(VertaError::ProviderError(format!("Ollama error: {error}"))),
            None => Ok(result.response),
        }
    }
}

#[async_trait]
impl LlmClient for OllamaClient {
    async fn generate(&self, prompt: &Prompt) -> Result<String> {
        self.complete(&self.request(prompt, false, None)).await
    }

    async fn generate_structured(&self, prompt: &Prompt, schema: &ResponseSchema) -> Result<String> {
        self.complete(&self.request(prompt, false, Some(schema))).await
    }

    async fn generate_stream(&self, prompt: &Prompt) -> Result<BoxStream<'static, Result<String>>> {
        let response = self.send(&self.request(prompt, true, None)).await?;
        let tokens = response_lines(response)
            .try_filter_map(|line| futures::future::ready(parse_ollama_line(&line)));
        Ok(tokens.boxed())
    }

    fn model(&self) -> &str {
        &self.model
    }
}

/// Decode one line of Ollama's newline-delimited JSON stream
fn parse_ollama_line(line: &str) -> Result<Option<String>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let parsed: OllamaResponse = serde_json::from_str(line)
        .map_err(|e| VertaError::ProviderError(format!("Malformed stream chunk: {e}")))?;

    if let Some(error) = parsed.error {
        return Err(VertaError::ProviderError(format!("Ollama error: {error}")));
    }
    Ok(Some(parsed.response).filter(|r| !r.is_empty()))
}

// ============================================================================
// Shared plumbing
// ============================================================================

fn http_client(config: &LlmConfig) -> Result<Client> {
    // Only the connect phase is bounded; streamed bodies may legitimately run long.
    Client::builder()
        .connect_timeout(Duration::from_secs(config.timeout_secs))
        .build()
        .map_err(|e| VertaError::ProviderError(format!("Failed to build HTTP client: {e}")))
}

/// Split a streamed response body into lines, regardless of how the
/// transport chunks it.
fn response_lines(response: Response) -> impl futures::Stream<Item = Result<String>> + Send {
    let body = response
        .bytes_stream()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));

    FramedRead::new(StreamReader::new(body), LinesCodec::new())
        .map_err(|e| VertaError::ProviderError(format!("Stream error: {e}")))
}

// ============================================================================
// Factory function
// ============================================================================

/// Create an LLM client for `model` from config
pub fn create_llm_client(config: &LlmConfig, model: &str) -> Result<Arc<dyn LlmClient>> {
    match config.provider {
        LlmProvider::OpenAI | LlmProvider::Azure => {
            Ok(Arc::new(OpenAiClient::from_config(config, model)?))
        }
        LlmProvider::Ollama => Ok(Arc::new(OllamaClient::from_config(config, model)?)),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openai_client_creation() {
        let client = OpenAiClient::new("test-key", "gpt-4o-mini", 2048, 0.1)
            .with_base_url("https://api.groq.com/openai/v1/");
        assert_eq!(client.model(), "gpt-4o-mini");
        assert_eq!(client.base_url, "https://api.groq.com/openai/v1");
    }

    #[test]
    fn test_ollama_client_creation() {
        let client = OllamaClient::new("http://localhost:11434", "llama3");
        assert_eq!(client.model(), "llama3");
    }

    #[test]
    fn test_factory_picks_model_per_agent() {
        let config = LlmConfig {
            provider: LlmProvider::Ollama,
            ..Default::default()
        };
        let supervisor = create_llm_client(&config, "llama3.1").unwrap();
        let followup = create_llm_client(&config, "mistral").unwrap();
        assert_eq!(supervisor.model(), "llama3.1");
        assert_eq!(followup.model(), "mistral");
    }

    #[test]
    fn test_factory_requires_openai_key() {
        let config = LlmConfig::default();
        assert!(matches!(
            create_llm_client(&config, "gpt-4o-mini"),
            Err(VertaError::ConfigError(_))
        ));
    }

    fn route_schema() -> ResponseSchema {
        ResponseSchema {
            name: "route_query".to_string(),
            schema: serde_json::json!({
                "type": "object",
                "properties": {"datasource": {"type": "string", "enum": ["A", "B"]}},
                "required": ["datasource"]
            }),
        }
    }

    #[test]
    fn test_openai_request_sends_system_then_user() {
        let client = OpenAiClient::new("k", "gpt-4o-mini", 256, 0.0);
        let prompt = Prompt::with_system("Product summary: a kettle", "Is it loud?");
        let json = serde_json::to_value(client.request(&prompt, false, None)).unwrap();

        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][0]["content"], "Product summary: a kettle");
        assert_eq!(json["messages"][1]["role"], "user");
        assert_eq!(json["messages"][1]["content"], "Is it loud?");
        assert!(json.get("response_format").is_none());
        assert!(json.get("stream").is_none());
    }

    #[test]
    fn test_openai_structured_request_carries_json_schema() {
        let client = OpenAiClient::new("k", "gpt-4o-mini", 256, 0.0);
        let schema = route_schema();
        let prompt = Prompt::user("Route this");
        let json = serde_json::to_value(client.request(&prompt, false, Some(&schema))).unwrap();

        assert_eq!(json["messages"].as_array().unwrap().len(), 1);
        assert_eq!(json["response_format"]["type"], "json_schema");
        assert_eq!(json["response_format"]["json_schema"]["name"], "route_query");
        assert_eq!(json["response_format"]["json_schema"]["strict"], true);
        assert_eq!(
            json["response_format"]["json_schema"]["schema"]["properties"]["datasource"]["enum"],
            serde_json::json!(["A", "B"])
        );
    }

    #[test]
    fn test_ollama_request_carries_system_and_format() {
        let client = OllamaClient::new("http://localhost:11434", "llama3");
        let schema = route_schema();
        let prompt = Prompt::with_system("You route questions.", "Is it loud?");

        let json = serde_json::to_value(client.request(&prompt, false, Some(&schema))).unwrap();
        assert_eq!(json["system"], "You route questions.");
        assert_eq!(json["prompt"], "Is it loud?");
        assert_eq!(json["format"]["required"], serde_json::json!(["datasource"]));

        let plain = serde_json::to_value(client.request(&Prompt::user("Hi"), true, None)).unwrap();
        assert!(plain.get("system").is_none());
        assert!(plain.get("format").is_none());
        assert_eq!(plain["stream"], true);
    }

    #[test]
    fn test_parse_openai_line() {
        let chunk = r#"data: {"choices":[{"delta":{"content":"Hel"},"finish_reason":null}]}"#;
        assert_eq!(parse_openai_line(chunk).unwrap(), Some("Hel".to_string()));

        let role_only = r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#;
        assert_eq!(parse_openai_line(role_only).unwrap(), None);

        assert_eq!(parse_openai_line("data: [DONE]").unwrap(), None);
        assert_eq!(parse_openai_line("").unwrap(), None);
        assert_eq!(parse_openai_line(": keep-alive").unwrap(), None);
        assert!(parse_openai_line("data: {not json").is_err());
    }

    #[test]
    fn test_parse_ollama_line() {
        let chunk = r#"{"model":"llama3","response":"lo","done":false}"#;
        assert_eq!(parse_ollama_line(chunk).unwrap(), Some("lo".to_string()));

        let done = r#"{"model":"llama3","response":"","done":true}"#;
        assert_eq!(parse_ollama_line(done).unwrap(), None);

        let failed = r#"{"error":"model not found"}"#;
        assert!(matches!(
            parse_ollama_line(failed),
            Err(VertaError::ProviderError(_))
        ));
    }
}
