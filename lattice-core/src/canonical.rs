//! Canonical (file-addressed) memory store client.
//!
//! The store sits behind a tool-call gateway that issues session ids. A
//! request rejected with a "no valid session" shape forces one session
//! re-initialisation and a single retry; missing files can be auto-stubbed
//! for index documents.

use serde_json::{Value, json};
use tokio::sync::Mutex;

use crate::error::{LatticeError, Result};

const SESSION_HEADER: &str = "session-id";

#[derive(Debug)]
pub struct CanonicalClient {
    http: reqwest::Client,
    url: String,
    session: Mutex<Option<String>>,
    timeout: std::time::Duration,
}

impl CanonicalClient {
    pub fn new(url: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            url,
            session: Mutex::new(None),
            timeout: std::time::Duration::from_secs(15),
        }
    }

    async fn ensure_session(&self, force_refresh: bool) -> Result<String> {
        let mut session = self.session.lock().await;
        if !force_refresh
            && let Some(existing) = session.as_ref()
        {
            return Ok(existing.clone());
        }
        let endpoint = format!("{}/rpc", self.url.trim_end_matches('/'));
        let response = self
            .http
            .post(&endpoint)
            .timeout(self.timeout)
            .json(&json!({
                "jsonrpc": "2.0",
                "id": "init",
                "method": "initialize",
                "params": {"client": "lattice-server"},
            }))
            .send()
            .await?;
        let id = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| {
                LatticeError::upstream("canonical gateway did not return a session id")
            })?;
        *session = Some(id.clone());
        Ok(id)
    }

    fn is_missing_session_error(status: u16, body: &str) -> bool {
        if !matches!(status, 400 | 404) {
            return false;
        }
        let lowered = body.to_ascii_lowercase();
        lowered.contains("no valid session") || lowered.contains("session not found")
    }

    async fn post_tool_call(&self, session_id: &str, name: &str, arguments: &Value) -> Result<(u16, String, Option<String>)> {
        let endpoint = format!("{}/rpc", self.url.trim_end_matches('/'));
        let response = self
            .http
            .post(&endpoint)
            .timeout(self.timeout)
            .header(SESSION_HEADER, session_id)
            .json(&json!({
                "jsonrpc": "2.0",
                "id": "1",
                "method": "tools/call",
                "params": {"name": name, "arguments": arguments},
            }))
            .send()
            .await?;
        let status = response.status().as_u16();
        let new_session = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let body = response.text().await?;
        Ok((status, body, new_session))
    }

    /// Execute a tool call, re-initialising the session once when the
    /// gateway rejects the current one.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value> {
        let session_id = self.ensure_session(false).await?;
        let (status, body, new_session) =
            self.post_tool_call(&session_id, name, &arguments).await?;

        let (status, body, new_session) = if Self::is_missing_session_error(status, &body) {
            let refreshed = self.ensure_session(true).await?;
            self.post_tool_call(&refreshed, name, &arguments).await?
        } else {
            (status, body, new_session)
        };

        if let Some(id) = new_session {
            let mut session = self.session.lock().await;
            *session = Some(id);
        }
        if status >= 400 {
            let mut cut = body.len().min(300);
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            return Err(LatticeError::upstream(format!(
                "{name} failed: status={status} body={}",
                &body[..cut]
            )));
        }
        parse_gateway_body(&body)
            .ok_or_else(|| LatticeError::upstream(format!("{name} returned an unreadable body")))
    }

    async fn call_text_tool(&self, name: &str, arguments: Value) -> Result<String> {
        let result = self.call_tool(name, arguments).await?;
        if result["isError"].as_bool().unwrap_or(false) {
            let detail = result_text(&result).unwrap_or_default();
            if detail.contains("NotFoundError") || detail.contains("Resource not found") {
                return Err(LatticeError::NotFound(detail));
            }
            return Err(LatticeError::upstream(format!("{name} failed: {detail}")));
        }
        Ok(result_text(&result).unwrap_or_default())
    }

    pub async fn write_file(&self, project: &str, file: &str, content: &str) -> Result<()> {
        self.call_text_tool(
            "memory_bank_write",
            json!({"projectName": project, "fileName": file, "content": content}),
        )
        .await?;
        Ok(())
    }

    /// Read a file. `allow_missing` maps not-found to an empty string;
    /// `bootstrap_missing` synthesizes and persists an index stub first.
    pub async fn read_file(
        &self,
        project: &str,
        file: &str,
        allow_missing: bool,
        bootstrap_missing: bool,
    ) -> Result<String> {
        match self
            .call_text_tool(
                "memory_bank_read",
                json!({"projectName": project, "fileName": file}),
            )
            .await
        {
            Ok(content) => Ok(content),
            Err(LatticeError::NotFound(detail)) => {
                if bootstrap_missing
                    && let Some(stub) = build_missing_file_stub(file)
                {
                    let rendered = serde_json::to_string_pretty(&stub)?;
                    self.write_file(project, file, &rendered).await?;
                    return Ok(rendered);
                }
                if allow_missing {
                    return Ok(String::new());
                }
                Err(LatticeError::NotFound(detail))
            }
            Err(err) => Err(err),
        }
    }

    pub async fn list_files(&self, project: &str) -> Result<Vec<String>> {
        let raw = self
            .call_text_tool("memory_bank_list_files", json!({"projectName": project}))
            .await?;
        Ok(parse_string_list(&raw))
    }

    pub async fn list_projects(&self) -> Result<Vec<String>> {
        let raw = self
            .call_text_tool("memory_bank_list_projects", json!({}))
            .await?;
        Ok(parse_string_list(&raw))
    }
}

/// The gateway streams tool results either as plain JSON or as a single SSE
/// frame (`event: message\ndata: {...}`).
fn parse_gateway_body(body: &str) -> Option<Value> {
    let trimmed = body.trim();
    if trimmed.starts_with('{') {
        let parsed: Value = serde_json::from_str(trimmed).ok()?;
        return Some(parsed["result"].clone());
    }
    for line in trimmed.lines() {
        if let Some(data) = line.strip_prefix("data:") {
            let parsed: Value = serde_json::from_str(data.trim()).ok()?;
            return Some(parsed["result"].clone());
        }
    }
    None
}

fn result_text(result: &Value) -> Option<String> {
    result["content"]
        .as_array()?
        .iter()
        .find(|item| item["type"] == "text")
        .and_then(|item| item["text"].as_str())
        .map(str::to_string)
}

fn parse_string_list(raw: &str) -> Vec<String> {
    serde_json::from_str::<Vec<String>>(raw).unwrap_or_else(|_| {
        raw.lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect()
    })
}

/// Index documents (`index__<name>.json`) can be bootstrapped with a stub
/// pointing at the matching latest-snapshot file.
pub fn build_missing_file_stub(file: &str) -> Option<Value> {
    let name = file.rsplit('/').next().unwrap_or(file);
    let stem = name.strip_prefix("index__")?.strip_suffix(".json")?;
    Some(json!({
        "kind": "memory_index",
        "latest": format!("{stem}__latest.json"),
        "bootstrap": true,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_session_detection() {
        assert!(CanonicalClient::is_missing_session_error(
            400,
            "Bad Request: No valid session ID provided"
        ));
        assert!(CanonicalClient::is_missing_session_error(
            404,
            "session not found"
        ));
        assert!(!CanonicalClient::is_missing_session_error(
            500,
            "internal server error"
        ));
    }

    #[test]
    fn index_stub_defaults_latest_name() {
        let stub = build_missing_file_stub("index__custom_signal.json").unwrap();
        assert_eq!(stub["kind"], "memory_index");
        assert_eq!(stub["latest"], "custom_signal__latest.json");
        assert_eq!(stub["bootstrap"], true);
        assert!(build_missing_file_stub("notes/a.md").is_none());
    }

    #[test]
    fn gateway_body_parses_sse_and_plain_json() {
        let sse = "event: message\ndata: {\"jsonrpc\":\"2.0\",\"id\":\"1\",\"result\":{\"isError\":false,\"content\":[]}}\n";
        let parsed = parse_gateway_body(sse).unwrap();
        assert_eq!(parsed["isError"], false);

        let plain = "{\"jsonrpc\":\"2.0\",\"id\":\"1\",\"result\":{\"isError\":true}}";
        let parsed = parse_gateway_body(plain).unwrap();
        assert_eq!(parsed["isError"], true);
    }
}
