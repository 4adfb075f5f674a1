//! Task payload validation and action execution.
//!
//! Payloads are tagged unions keyed by `action`, with the raw JSON kept on
//! the task row for forward compatibility. Validation happens twice: at
//! create time (risk/approval computation) and again at dispatch.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use lattice_config::ChatProviderConfig;

use crate::error::{LatticeError, Result};
use crate::ingest::{IngestService, WriteRequest};
use crate::messaging::{MessagingRequest, MessagingService};
use crate::retrieval::{RetrievalEngine, SearchRequest};

use super::TaskRow;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum TaskActionPayload {
    MemoryWrite {
        #[serde(alias = "projectName")]
        project: Option<String>,
        #[serde(alias = "fileName")]
        file: String,
        content: String,
        #[serde(alias = "topicPath")]
        topic_path: Option<String>,
    },
    MemorySearch {
        query: String,
        limit: Option<usize>,
        project: Option<String>,
    },
    MessagingCommand {
        channel: String,
        source_id: Option<String>,
        text: String,
        project: Option<String>,
    },
    HttpCallback {
        url: String,
        method: Option<String>,
        headers: Option<HashMap<String, String>>,
        body: Option<Value>,
    },
    ProviderChat {
        prompt: String,
        model: Option<String>,
        system: Option<String>,
    },
}

impl TaskActionPayload {
    pub fn action_type(&self) -> &'static str {
        match self {
            Self::MemoryWrite { .. } => "memory_write",
            Self::MemorySearch { .. } => "memory_search",
            Self::MessagingCommand { .. } => "messaging_command",
            Self::HttpCallback { .. } => "http_callback",
            Self::ProviderChat { .. } => "provider_chat",
        }
    }

    pub fn risk_level(&self) -> &'static str {
        match self {
            Self::MemoryWrite { .. } | Self::MemorySearch { .. } => "low",
            Self::MessagingCommand { .. } => "medium",
            Self::HttpCallback { .. } | Self::ProviderChat { .. } => "high",
        }
    }
}

/// Create-time view of a validated payload.
#[derive(Debug, Clone)]
pub struct ActionMeta {
    pub action_type: &'static str,
    pub risk_level: &'static str,
    pub approval_required: bool,
}

/// Validate a raw payload against the action allowlist and, for callbacks,
/// the host allowlist. High-risk actions require approval by default.
pub fn validate_payload(
    payload: &Value,
    allowed_actions: &[String],
    callback_hosts: &[String],
) -> Result<(TaskActionPayload, ActionMeta)> {
    let action = payload["action"]
        .as_str()
        .ok_or_else(|| LatticeError::validation("payload.action is required"))?;
    if !allowed_actions.iter().any(|allowed| allowed == action) {
        return Err(LatticeError::validation(format!(
            "action '{action}' is not allowed"
        )));
    }
    let parsed: TaskActionPayload = serde_json::from_value(payload.clone())
        .map_err(|err| LatticeError::validation(format!("invalid payload for '{action}': {err}")))?;

    if let TaskActionPayload::HttpCallback { url, method, .. } = &parsed {
        validate_callback_url(url, callback_hosts)?;
        if let Some(method) = method {
            let upper = method.to_ascii_uppercase();
            if !matches!(upper.as_str(), "GET" | "POST" | "PUT" | "PATCH" | "DELETE") {
                return Err(LatticeError::validation(format!(
                    "callback method '{method}' is not allowed"
                )));
            }
        }
    }

    let meta = ActionMeta {
        action_type: parsed.action_type(),
        risk_level: parsed.risk_level(),
        approval_required: parsed.risk_level() == "high",
    };
    Ok((parsed, meta))
}

fn validate_callback_url(raw: &str, callback_hosts: &[String]) -> Result<()> {
    let parsed = url::Url::parse(raw)
        .map_err(|err| LatticeError::validation(format!("invalid callback url: {err}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(LatticeError::validation(format!(
            "callback scheme '{}' is not allowed",
            parsed.scheme()
        )));
    }
    let host = parsed
        .host_str()
        .ok_or_else(|| LatticeError::validation("callback url has no host"))?;
    if !callback_hosts
        .iter()
        .any(|allowed| allowed.eq_ignore_ascii_case(host))
    {
        return Err(LatticeError::validation(format!(
            "callback host '{host}' is not in the allowlist"
        )));
    }
    Ok(())
}

/// Executes validated task actions against the in-process services.
pub struct ActionExecutor {
    ingest: Arc<IngestService>,
    retrieval: Arc<RetrievalEngine>,
    messaging: Arc<MessagingService>,
    http: reqwest::Client,
    chat: ChatProviderConfig,
    allowed_actions: Vec<String>,
    callback_hosts: Vec<String>,
}

impl std::fmt::Debug for ActionExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionExecutor")
            .field("allowed_actions", &self.allowed_actions)
            .finish()
    }
}

impl ActionExecutor {
    pub fn new(
        ingest: Arc<IngestService>,
        retrieval: Arc<RetrievalEngine>,
        messaging: Arc<MessagingService>,
        chat: ChatProviderConfig,
        allowed_actions: Vec<String>,
        callback_hosts: Vec<String>,
    ) -> Self {
        Self {
            ingest,
            retrieval,
            messaging,
            http: reqwest::Client::new(),
            chat,
            allowed_actions,
            callback_hosts,
        }
    }

    pub async fn execute(&self, task: &TaskRow) -> Result<Value> {
        // Re-validate at dispatch: the allowlist may have tightened since
        // the task was created.
        let (parsed, _) =
            validate_payload(&task.payload, &self.allowed_actions, &self.callback_hosts)?;
        match parsed {
            TaskActionPayload::MemoryWrite {
                project,
                file,
                content,
                topic_path,
            } => {
                let project = project
                    .or_else(|| task.project.clone())
                    .unwrap_or_else(|| "_global".to_string());
                let outcome = self
                    .ingest
                    .write(WriteRequest {
                        project,
                        file,
                        content,
                        topic_path,
                        request_id: Some(format!("task:{}", task.id)),
                    })
                    .await?;
                Ok(serde_json::to_value(outcome)?)
            }
            TaskActionPayload::MemorySearch {
                query,
                limit,
                project,
            } => {
                let mut request = SearchRequest::simple(query);
                request.limit = limit.unwrap_or(8);
                request.project = project.or_else(|| task.project.clone());
                let response = self.retrieval.search(&request).await;
                Ok(serde_json::to_value(response)?)
            }
            TaskActionPayload::MessagingCommand {
                channel,
                source_id,
                text,
                project,
            } => {
                // Task dispatch is an edge too: classify the surface here.
                let strict = self.messaging.is_strict_channel(&channel);
                let response = self
                    .messaging
                    .execute(MessagingRequest {
                        channel,
                        source_id: source_id.unwrap_or_else(|| format!("task:{}", task.id)),
                        text,
                        project: project.or_else(|| task.project.clone()),
                        topic_path: None,
                        user_id: None,
                        require_prefix: false,
                        strict,
                    })
                    .await?;
                Ok(response)
            }
            TaskActionPayload::HttpCallback {
                url,
                method,
                headers,
                body,
            } => self.execute_callback(&url, method.as_deref(), headers, body).await,
            TaskActionPayload::ProviderChat {
                prompt,
                model,
                system,
            } => self.execute_chat(&prompt, model.as_deref(), system.as_deref()).await,
        }
    }

    async fn execute_callback(
        &self,
        url: &str,
        method: Option<&str>,
        headers: Option<HashMap<String, String>>,
        body: Option<Value>,
    ) -> Result<Value> {
        let method = method.unwrap_or("POST").to_ascii_uppercase();
        let mut request = match method.as_str() {
            "GET" => self.http.get(url),
            "PUT" => self.http.put(url),
            "PATCH" => self.http.patch(url),
            "DELETE" => self.http.delete(url),
            _ => self.http.post(url),
        };
        request = request.timeout(std::time::Duration::from_secs(30));
        if let Some(headers) = headers {
            for (name, value) in headers {
                request = request.header(name, value);
            }
        }
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            let mut cut = text.len().min(200);
            while !text.is_char_boundary(cut) {
                cut -= 1;
            }
            return Err(LatticeError::upstream(format!(
                "callback status {status}: {}",
                &text[..cut]
            )));
        }
        Ok(json!({"status": status.as_u16(), "body": text}))
    }

    async fn execute_chat(
        &self,
        prompt: &str,
        model: Option<&str>,
        system: Option<&str>,
    ) -> Result<Value> {
        let Some(base_url) = &self.chat.url else {
            return Err(LatticeError::validation(
                "provider_chat is not configured (PROVIDER_CHAT_URL unset)",
            ));
        };
        let model = model.unwrap_or(&self.chat.model);
        let mut messages = Vec::new();
        if let Some(system) = system {
            messages.push(json!({"role": "system", "content": system}));
        }
        messages.push(json!({"role": "user", "content": prompt}));

        let endpoint = format!("{}/v1/chat/completions", base_url.trim_end_matches('/'));
        let response = self
            .http
            .post(&endpoint)
            .timeout(std::time::Duration::from_secs_f64(self.chat.timeout_secs))
            .json(&json!({
                "model": model,
                "messages": messages,
                "temperature": 0.2,
                "stream": false,
            }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(LatticeError::upstream(format!(
                "provider chat status {}",
                response.status()
            )));
        }
        let parsed: Value = response.json().await?;
        let content = parsed["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        Ok(json!({"model": model, "content": content}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allowed() -> Vec<String> {
        ["memory_write", "memory_search", "http_callback"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    #[test]
    fn memory_write_is_low_risk_and_accepts_camel_case() {
        let payload = json!({
            "action": "memory_write",
            "projectName": "alpha",
            "fileName": "notes/a.md",
            "content": "hello",
        });
        let (parsed, meta) = validate_payload(&payload, &allowed(), &[]).unwrap();
        assert_eq!(meta.action_type, "memory_write");
        assert_eq!(meta.risk_level, "low");
        assert!(!meta.approval_required);
        match parsed {
            TaskActionPayload::MemoryWrite { project, file, .. } => {
                assert_eq!(project.as_deref(), Some("alpha"));
                assert_eq!(file, "notes/a.md");
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn disallowed_action_is_rejected() {
        let payload = json!({"action": "provider_chat", "prompt": "hi"});
        let err = validate_payload(&payload, &allowed(), &[]).unwrap_err();
        assert!(matches!(err, LatticeError::Validation(_)));
    }

    #[test]
    fn callback_requires_allowlisted_host_and_scheme() {
        let hosts = vec!["hooks.internal".to_string()];
        let ok = json!({"action": "http_callback", "url": "https://hooks.internal/notify"});
        let (_, meta) = validate_payload(&ok, &allowed(), &hosts).unwrap();
        assert!(meta.approval_required);

        let bad_host = json!({"action": "http_callback", "url": "https://evil.example/x"});
        assert!(validate_payload(&bad_host, &allowed(), &hosts).is_err());

        let bad_scheme = json!({"action": "http_callback", "url": "ftp://hooks.internal/x"});
        assert!(validate_payload(&bad_scheme, &allowed(), &hosts).is_err());

        let no_hosts = json!({"action": "http_callback", "url": "https://hooks.internal/x"});
        assert!(validate_payload(&no_hosts, &allowed(), &[]).is_err());
    }
}
