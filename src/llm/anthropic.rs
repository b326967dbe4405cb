//! Anthropic messages-API engine.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use wayfinder_agent::{AgentError, ModelEngine, ModelQuery};

#[derive(Debug, Clone)]
pub struct AnthropicConfig {
    pub api_key: String,
    pub model: String,
    pub api_base: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout: Duration,
}

impl AnthropicConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: "claude-sonnet-4-5".to_string(),
            api_base: "https://api.anthropic.com/v1".to_string(),
            temperature: 0.1,
            max_tokens: 2048,
            timeout: Duration::from_secs(60),
        }
    }
}

pub struct AnthropicEngine {
    client: Client,
    config: AnthropicConfig,
}

impl AnthropicEngine {
    pub fn new(config: AnthropicConfig) -> Result<Self, AgentError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|err| AgentError::model(format!("failed to build HTTP client: {err}")))?;
        Ok(Self { client, config })
    }

    async fn invoke(
        &self,
        system: &str,
        messages: Vec<AnthropicMessage>,
    ) -> Result<String, AgentError> {
        let body = AnthropicRequest {
            model: self.config.model.clone(),
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
            system: system.to_string(),
            messages,
        };

        let url = format!("{}/messages", self.config.api_base.trim_end_matches('/'));
        let response = self
            .client
            .post(url)
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await
            .map_err(|err| AgentError::model(format!("anthropic request failed: {err}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "<response unavailable>".to_string());
            return Err(AgentError::model(format!(
                "anthropic returned {status}: {text}"
            )));
        }

        let response: AnthropicResponse = response
            .json()
            .await
            .map_err(|err| AgentError::model(format!("anthropic response invalid: {err}")))?;

        let content = response
            .content
            .iter()
            .filter_map(|part| part.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n");
        if content.is_empty() {
            return Err(AgentError::model("anthropic response missing content"));
        }
        Ok(content)
    }

    fn user_blocks(query: &ModelQuery) -> Vec<ContentBlock> {
        let mut blocks = Vec::new();
        if let Some(screenshot) = &query.screenshot_base64 {
            blocks.push(ContentBlock::Image {
                source: ImageSource {
                    source_type: "base64".to_string(),
                    media_type: "image/png".to_string(),
                    data: screenshot.clone(),
                },
            });
        }
        blocks.push(ContentBlock::Text {
            text: query.query.clone(),
        });
        blocks
    }
}

#[async_trait]
impl ModelEngine for AnthropicEngine {
    async fn generate_plan(&self, query: &ModelQuery) -> Result<String, AgentError> {
        let messages = vec![AnthropicMessage::user(Self::user_blocks(query))];
        self.invoke(&query.system_prompt, messages).await
    }

    async fn generate_grounding(
        &self,
        query: &ModelQuery,
        planning_output: &str,
    ) -> Result<String, AgentError> {
        let messages = vec![
            AnthropicMessage::user(Self::user_blocks(query)),
            AnthropicMessage::assistant(planning_output),
            AnthropicMessage::user(vec![ContentBlock::Text {
                text: "Commit to exactly one interaction now, as the JSON object described."
                    .to_string(),
            }]),
        ];
        self.invoke(&query.system_prompt, messages).await
    }

    async fn generate_judgment(
        &self,
        query: &ModelQuery,
        planning_output: &str,
        grounding_output: &str,
    ) -> Result<String, AgentError> {
        let mut blocks = Self::user_blocks(query);
        blocks.push(ContentBlock::Text {
            text: format!(
                "Agent planning output:\n{planning_output}\n\nAgent grounding output:\n{grounding_output}"
            ),
        });
        let messages = vec![AnthropicMessage::user(blocks)];
        self.invoke(&query.system_prompt, messages).await
    }
}

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    temperature: f32,
    max_tokens: u32,
    system: String,
    messages: Vec<AnthropicMessage>,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: String,
    content: Vec<ContentBlock>,
}

impl AnthropicMessage {
    fn user(content: Vec<ContentBlock>) -> Self {
        Self {
            role: "user".to_string(),
            content,
        }
    }

    fn assistant(text: &str) -> Self {
        Self {
            role: "assistant".to_string(),
            content: vec![ContentBlock::Text {
                text: text.to_string(),
            }],
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ContentBlock {
    Text { text: String },
    Image { source: ImageSource },
}

#[derive(Debug, Serialize)]
struct ImageSource {
    #[serde(rename = "type")]
    source_type: String,
    media_type: String,
    data: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicResponseContent>,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponseContent {
    #[serde(rename = "type")]
    _type: String,
    #[serde(default)]
    text: Option<String>,
}
