//! OpenAI chat-completions engine.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use wayfinder_agent::{AgentError, ModelEngine, ModelQuery};

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub model: String,
    pub api_base: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout: Duration,
}

impl OpenAiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: "gpt-4o".to_string(),
            api_base: "https://api.openai.com/v1".to_string(),
            temperature: 0.1,
            max_tokens: 2048,
            timeout: Duration::from_secs(60),
        }
    }
}

pub struct OpenAiEngine {
    client: Client,
    config: OpenAiConfig,
}

impl OpenAiEngine {
    pub fn new(config: OpenAiConfig) -> Result<Self, AgentError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|err| AgentError::model(format!("failed to build HTTP client: {err}")))?;
        Ok(Self { client, config })
    }

    async fn invoke(&self, messages: Vec<ChatMessage>) -> Result<String, AgentError> {
        let body = ChatRequest {
            model: self.config.model.clone(),
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
            messages,
        };

        let url = format!(
            "{}/chat/completions",
            self.config.api_base.trim_end_matches('/')
        );
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| AgentError::model(format!("openai request failed: {err}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "<response unavailable>".to_string());
            return Err(AgentError::model(format!("openai returned {status}: {text}")));
        }

        let response: ChatResponse = response
            .json()
            .await
            .map_err(|err| AgentError::model(format!("openai response invalid: {err}")))?;

        response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.is_empty())
            .ok_or_else(|| AgentError::model("openai response missing content"))
    }

    fn user_message(query: &ModelQuery) -> ChatMessage {
        let mut parts = Vec::new();
        if let Some(screenshot) = &query.screenshot_base64 {
            parts.push(ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: format!("data:image/png;base64,{screenshot}"),
                },
            });
        }
        parts.push(ContentPart::Text {
            text: query.query.clone(),
        });
        ChatMessage {
            role: "user".to_string(),
            content: ChatContent::Parts(parts),
        }
    }

    fn system_message(text: &str) -> ChatMessage {
        ChatMessage {
            role: "system".to_string(),
            content: ChatContent::Text(text.to_string()),
        }
    }

    fn assistant_message(text: &str) -> ChatMessage {
        ChatMessage {
            role: "assistant".to_string(),
            content: ChatContent::Text(text.to_string()),
        }
    }
}

#[async_trait]
impl ModelEngine for OpenAiEngine {
    async fn generate_plan(&self, query: &ModelQuery) -> Result<String, AgentError> {
        self.invoke(vec![
            Self::system_message(&query.system_prompt),
            Self::user_message(query),
        ])
        .await
    }

    async fn generate_grounding(
        &self,
        query: &ModelQuery,
        planning_output: &str,
    ) -> Result<String, AgentError> {
        self.invoke(vec![
            Self::system_message(&query.system_prompt),
            Self::user_message(query),
            Self::assistant_message(planning_output),
            ChatMessage {
                role: "user".to_string(),
                content: ChatContent::Text(
                    "Commit to exactly one interaction now, as the JSON object described."
                        .to_string(),
                ),
            },
        ])
        .await
    }

    async fn generate_judgment(
        &self,
        query: &ModelQuery,
        planning_output: &str,
        grounding_output: &str,
    ) -> Result<String, AgentError> {
        let mut message = Self::user_message(query);
        if let ChatContent::Parts(parts) = &mut message.content {
            parts.push(ContentPart::Text {
                text: format!(
                    "Agent planning output:\n{planning_output}\n\nAgent grounding output:\n{grounding_output}"
                ),
            });
        }
        self.invoke(vec![Self::system_message(&query.system_prompt), message])
            .await
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    temperature: f32,
    max_tokens: u32,
    messages: Vec<ChatMessage>,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: ChatContent,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum ChatContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_part_uses_data_uri() {
        let query = ModelQuery::new("system", "query")
            .with_screenshot(Some("aGVsbG8=".to_string()));
        let message = OpenAiEngine::user_message(&query);
        let json = serde_json::to_string(&message).unwrap();
        assert!(json.contains("data:image/png;base64,aGVsbG8="));
        assert!(json.contains("\"type\":\"image_url\""));
    }
}
