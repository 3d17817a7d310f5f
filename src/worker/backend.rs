use async_trait::async_trait;
use reqwest::{Client, Url};
use serde_json::{json, Value};

use crate::config::WorkerConfig;
use crate::error::WorkerError;

/// A model-serving backend that answers chat requests.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Run one non-streaming chat completion. The returned body always
    /// carries a `message` field.
    async fn chat(&self, messages: &[Value]) -> Result<Value, WorkerError>;
}

/// Ollama-compatible `/api/chat` backend.
pub struct OllamaBackend {
    client: Client,
    chat_url: String,
    model: String,
}

impl OllamaBackend {
    pub fn new(config: &WorkerConfig) -> Result<Self, WorkerError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| WorkerError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            chat_url: config.backend_url.clone(),
            model: config.model_name.clone(),
        })
    }

    pub fn tags_url(&self) -> String {
        tags_url(&self.chat_url)
    }

    /// Names of the models installed on the backend.
    pub async fn list_models(&self) -> Result<Vec<String>, WorkerError> {
        let url = self.tags_url();
        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(WorkerError::Http {
                status: status.to_string(),
                url,
            });
        }

        let payload: Value = response.json().await?;
        let models = payload
            .get("models")
            .and_then(Value::as_array)
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|entry| {
                        ["name", "model", "tag"]
                            .iter()
                            .filter_map(|key| entry.get(*key).and_then(Value::as_str))
                            .find(|v| !v.is_empty())
                            .map(str::to_string)
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(models)
    }

    /// Fail with [`WorkerError::Startup`] unless the backend is reachable and
    /// has the configured model installed.
    pub async fn verify_model(&self) -> Result<(), WorkerError> {
        let models = self.list_models().await.map_err(|e| {
            WorkerError::Startup(format!(
                "could not reach model backend at {}: {}",
                self.tags_url(),
                e
            ))
        })?;

        if models.iter().any(|name| model_matches(name, &self.model)) {
            tracing::info!(model = %self.model, "Model is available on backend");
            Ok(())
        } else {
            Err(WorkerError::Startup(format!(
                "model `{}` is not installed on the backend (found: {})",
                self.model,
                if models.is_empty() {
                    "none".to_string()
                } else {
                    models.join(", ")
                }
            )))
        }
    }
}

#[async_trait]
impl ChatBackend for OllamaBackend {
    async fn chat(&self, messages: &[Value]) -> Result<Value, WorkerError> {
        let payload = json!({
            "model": self.model,
            "messages": messages,
            "stream": false,
        });

        let response = self
            .client
            .post(&self.chat_url)
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(WorkerError::Http {
                status: status.to_string(),
                url: self.chat_url.clone(),
            });
        }

        let data: Value = response.json().await?;
        if data.get("message").is_none() {
            return Err(WorkerError::MalformedPayload(
                "response missing `message`".to_string(),
            ));
        }
        Ok(data)
    }
}

/// `llama3` matches an installed `llama3:latest`.
fn model_matches(installed: &str, wanted: &str) -> bool {
    installed == wanted || (!wanted.contains(':') && installed.split(':').next() == Some(wanted))
}

/// Model-list URL for a chat endpoint: `.../api/chat` becomes `.../api/tags`,
/// anything else maps to `<api base>/tags`.
pub fn tags_url(chat_url: &str) -> String {
    let Ok(mut url) = Url::parse(chat_url) else {
        return format!("{}/api/tags", chat_url.trim_end_matches('/'));
    };

    let path = url.path().to_string();
    let new_path = match path.strip_suffix("/chat") {
        Some(base) => format!("{}/tags", base),
        None => {
            let api_base = path
                .find("/api/")
                .map(|i| &path[..i + "/api".len()])
                .unwrap_or("/api");
            format!("{}/tags", api_base).replace("//", "/")
        }
    };

    url.set_path(&new_path);
    url.set_query(None);
    url.set_fragment(None);
    url.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_url_replaces_chat_suffix() {
        assert_eq!(
            tags_url("http://localhost:11434/api/chat"),
            "http://localhost:11434/api/tags"
        );
        assert_eq!(
            tags_url("http://gpu:8080/proxy/api/chat?x=1"),
            "http://gpu:8080/proxy/api/tags"
        );
    }

    #[test]
    fn tags_url_falls_back_to_api_base() {
        assert_eq!(tags_url("http://localhost:11434"), "http://localhost:11434/api/tags");
        assert_eq!(
            tags_url("http://localhost:11434/api/generate"),
            "http://localhost:11434/api/tags"
        );
    }

    #[test]
    fn untagged_model_matches_latest() {
        assert!(model_matches("llama3:latest", "llama3"));
        assert!(model_matches("phi4-mini", "phi4-mini"));
        assert!(!model_matches("llama3:8b", "llama3:70b"));
        assert!(!model_matches("llama3-instruct", "llama3"));
    }
}
