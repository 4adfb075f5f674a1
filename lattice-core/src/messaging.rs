//! Messaging command interpreter: `remember`, `recall`, `status`, `task`
//! subcommands, and `help`, with hard secret rules on strict surfaces.
//!
//! Strictness is decided at the edge (the HTTP handler classifies the
//! channel) and passed in, so new strict channels never touch command
//! logic.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Value, json};

use lattice_config::MessagingConfig;

use crate::error::{LatticeError, Result};
use crate::ingest::{IngestService, WriteRequest};
use crate::outbox::OutboxSupervisor;
use crate::retrieval::{RetrievalEngine, SearchRequest};
use crate::secrets;
use crate::tasks::{TaskCreate, TaskQueue, TaskStatus, actions};

const HELP: &str = "Commands: remember <text>, recall <query>, status, task <create|status|approve|replay|cancel|list|deadletter|runtime|help>, help";
const TASK_HELP: &str =
    "task create remember <text> | task create recall <query> | task status <id> | task approve <id> | task replay <id> | task cancel <id> | task list | task deadletter | task runtime";

#[derive(Debug, Clone)]
pub struct MessagingRequest {
    pub channel: String,
    pub source_id: String,
    pub text: String,
    pub project: Option<String>,
    pub topic_path: Option<String>,
    pub user_id: Option<String>,
    pub require_prefix: bool,
    /// Classified by the caller (the HTTP handler or action dispatcher),
    /// never inferred here.
    pub strict: bool,
}

#[derive(Debug, Clone)]
pub struct ParsedCommand {
    pub action: String,
    pub content: String,
    pub directives: HashMap<String, String>,
    pub raw: String,
}

/// Strip the mention prefix (accepting `_bot`/`-bot` variants) from the
/// message text.
pub fn strip_mention<'a>(config: &MessagingConfig, text: &'a str, required: bool) -> Result<&'a str> {
    let trimmed = text.trim();
    let prefix = config.prefix.as_str();
    // Longest variants first, or the bare mention would strip a partial
    // `@name` out of `@name_bot`.
    let candidates = [
        format!("{prefix}_bot"),
        format!("{prefix}-bot"),
        prefix.to_string(),
    ];
    for candidate in &candidates {
        if let Some(head) = trimmed.get(..candidate.len())
            && head.eq_ignore_ascii_case(candidate)
        {
            return Ok(trimmed[candidate.len()..].trim_start());
        }
    }
    if required {
        return Err(LatticeError::validation(format!(
            "message must start with the {prefix} mention"
        )));
    }
    Ok(trimmed)
}

/// Split a message into action, content, and trailing `key=value`
/// directives (`priority=3 max_attempts=6` and friends).
pub fn parse_command(
    config: &MessagingConfig,
    text: &str,
    require_prefix: bool,
) -> Result<ParsedCommand> {
    let stripped = strip_mention(config, text, require_prefix)?;
    if stripped.is_empty() {
        return Ok(ParsedCommand {
            action: "help".to_string(),
            content: String::new(),
            directives: HashMap::new(),
            raw: text.to_string(),
        });
    }
    let mut directives = HashMap::new();
    let mut words: Vec<&str> = stripped.split_whitespace().collect();
    while let Some(last) = words.last() {
        let Some((key, value)) = last.split_once('=') else {
            break;
        };
        if !matches!(key, "project" | "topic" | "priority" | "max_attempts" | "agent") {
            break;
        }
        directives.insert(key.to_string(), value.to_string());
        words.pop();
    }
    let action = words
        .first()
        .map(|word| word.to_ascii_lowercase())
        .unwrap_or_else(|| "help".to_string());
    let content = words.get(1..).unwrap_or_default().join(" ");
    let (action, content) = match action.as_str() {
        "remember" | "recall" | "status" | "task" | "help" => (action, content),
        other => ("help".to_string(), format!("unknown command '{other}'")),
    };
    Ok(ParsedCommand {
        action,
        content,
        directives,
        raw: text.to_string(),
    })
}

pub struct MessagingService {
    config: MessagingConfig,
    ingest: Arc<IngestService>,
    retrieval: Arc<RetrievalEngine>,
    tasks: Arc<TaskQueue>,
    outbox: Arc<OutboxSupervisor>,
    allowed_actions: Vec<String>,
    callback_hosts: Vec<String>,
}

impl std::fmt::Debug for MessagingService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagingService")
            .field("strict_channels", &self.config.strict_channels)
            .finish()
    }
}

impl MessagingService {
    pub fn new(
        config: MessagingConfig,
        ingest: Arc<IngestService>,
        retrieval: Arc<RetrievalEngine>,
        tasks: Arc<TaskQueue>,
        outbox: Arc<OutboxSupervisor>,
        allowed_actions: Vec<String>,
        callback_hosts: Vec<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            ingest,
            retrieval,
            tasks,
            outbox,
            allowed_actions,
            callback_hosts,
        })
    }

    pub fn is_strict_channel(&self, channel: &str) -> bool {
        self.config
            .strict_channels
            .iter()
            .any(|strict| strict.eq_ignore_ascii_case(channel))
    }

    pub async fn execute(&self, request: MessagingRequest) -> Result<Value> {
        let strict = request.strict;
        let parsed = parse_command(&self.config, &request.text, request.require_prefix)?;
        let project = request
            .project
            .clone()
            .or_else(|| parsed.directives.get("project").cloned())
            .unwrap_or_else(|| self.config.default_project.clone());
        let topic_root = format!("{}/{}", self.config.topic_root, request.channel);

        let mut response = match parsed.action.as_str() {
            "remember" => {
                self.cmd_remember(&parsed, &request, &project, &topic_root, strict)
                    .await?
            }
            "recall" => self.cmd_recall(&parsed, &request, &project, strict).await?,
            "status" => self.cmd_status().await?,
            "task" => self.cmd_task(&parsed, &request, &project).await?,
            _ => cmd_help(&parsed),
        };

        // Nothing secret-shaped leaves a strict surface, not even nested in
        // a result payload.
        if strict {
            secrets::redact_json(&mut response);
        }
        Ok(response)
    }

    async fn cmd_remember(
        &self,
        parsed: &ParsedCommand,
        request: &MessagingRequest,
        project: &str,
        topic_root: &str,
        strict: bool,
    ) -> Result<Value> {
        let content = parsed.content.trim();
        if content.is_empty() {
            return Err(LatticeError::validation("remember requires content"));
        }
        if strict && secrets::contains_secret(content) {
            return Err(LatticeError::validation(
                "potential secret detected; refusing to store from this surface",
            ));
        }
        let stamp = uuid::Uuid::new_v4().simple().to_string()[..12].to_string();
        let file = format!("{topic_root}/{}/msg_{stamp}.md", request.source_id);
        let topic_path = request
            .topic_path
            .clone()
            .or_else(|| parsed.directives.get("topic").cloned());
        let outcome = self
            .ingest
            .write(WriteRequest {
                project: project.to_string(),
                file,
                content: content.to_string(),
                topic_path,
                request_id: Some(format!("messaging:{}", request.channel)),
            })
            .await?;
        let response_text = format!("Stored ({}).", outcome.event_id);
        Ok(json!({
            "ok": true,
            "action": "remember",
            "event_id": outcome.event_id,
            "warnings": outcome.warnings,
            "response_text": response_text,
        }))
    }

    async fn cmd_recall(
        &self,
        parsed: &ParsedCommand,
        request: &MessagingRequest,
        project: &str,
        strict: bool,
    ) -> Result<Value> {
        let query = parsed.content.trim();
        if query.is_empty() {
            return Err(LatticeError::validation("recall requires a query"));
        }
        if strict && secrets::contains_secret(query) {
            return Err(LatticeError::validation(
                "potential secret detected in query; refusing recall on this surface",
            ));
        }
        let mut search = SearchRequest::simple(query);
        search.project = Some(project.to_string());
        search.topic_path = request.topic_path.clone();
        search.user_id = request.user_id.clone();
        search.limit = 5;
        let result = self.retrieval.search(&search).await;
        let response_text = if result.results.is_empty() {
            "No matching memories found.".to_string()
        } else {
            result
                .results
                .iter()
                .take(3)
                .map(|row| format!("- {}/{}: {}", row.project, row.file, row.summary))
                .collect::<Vec<_>>()
                .join("\n")
        };
        Ok(json!({
            "ok": true,
            "action": "recall",
            "result": serde_json::to_value(&result)?,
            "response_text": response_text,
        }))
    }

    async fn cmd_status(&self) -> Result<Value> {
        let summary = self.outbox.summary_cached().await;
        let runtime = self.tasks.runtime_snapshot(Value::Null).await?;
        let response_text = format!(
            "outbox outstanding: {}; tasks ready: {}",
            summary.outstanding(),
            runtime.queue_ready
        );
        Ok(json!({
            "ok": true,
            "action": "status",
            "result": {
                "outbox": summary,
                "backend": self.outbox.active_backend(),
                "tasks": runtime,
            },
            "response_text": response_text,
        }))
    }

    async fn cmd_task(
        &self,
        parsed: &ParsedCommand,
        request: &MessagingRequest,
        project: &str,
    ) -> Result<Value> {
        let mut words = parsed.content.split_whitespace();
        let subcommand = words.next().unwrap_or("help").to_ascii_lowercase();
        let rest: Vec<&str> = words.collect();

        let response = match subcommand.as_str() {
            "create" => {
                let (payload, title) = build_task_payload(&rest, project)?;
                let (_, meta) = actions::validate_payload(
                    &payload,
                    &self.allowed_actions,
                    &self.callback_hosts,
                )?;
                let priority = parsed
                    .directives
                    .get("priority")
                    .and_then(|value| value.parse().ok())
                    .unwrap_or(0);
                let max_attempts = parsed
                    .directives
                    .get("max_attempts")
                    .and_then(|value| value.parse().ok());
                let agent = parsed.directives.get("agent").cloned();
                let task = self
                    .tasks
                    .create(
                        TaskCreate {
                            title,
                            project: Some(project.to_string()),
                            agent,
                            priority,
                            payload,
                            run_after: None,
                            max_attempts,
                        },
                        meta,
                    )
                    .await?;
                let response_text = format!("Task {} queued ({}).", task.id, task.action_type);
                json!({
                    "ok": true,
                    "action": "task",
                    "subcommand": "create",
                    "task": task,
                    "response_text": response_text,
                })
            }
            "status" => {
                let id = rest
                    .first()
                    .ok_or_else(|| LatticeError::validation("task status requires an id"))?;
                let task = self
                    .tasks
                    .get(id)
                    .await?
                    .ok_or_else(|| LatticeError::NotFound(format!("task {id} not found")))?;
                let events = self.tasks.events(id).await?;
                let response_text = format!("Task {} is {}.", id, task.status.as_str());
                json!({
                    "ok": true,
                    "action": "task",
                    "subcommand": "status",
                    "result": {"task": task, "events": events},
                    "response_text": response_text,
                })
            }
            "approve" => {
                let id = rest
                    .first()
                    .ok_or_else(|| LatticeError::validation("task approve requires an id"))?;
                let task = self
                    .tasks
                    .approve(id, Some(&request.source_id), None)
                    .await?;
                json!({
                    "ok": true,
                    "action": "task",
                    "subcommand": "approve",
                    "task": task,
                    "response_text": format!("Task {id} approved."),
                })
            }
            "replay" => {
                let id = rest
                    .first()
                    .ok_or_else(|| LatticeError::validation("task replay requires an id"))?;
                let task = self
                    .tasks
                    .replay(id, Some(&request.source_id), None, true)
                    .await?;
                json!({
                    "ok": true,
                    "action": "task",
                    "subcommand": "replay",
                    "task": task,
                    "response_text": format!("Task {id} requeued."),
                })
            }
            "cancel" => {
                let id = rest
                    .first()
                    .ok_or_else(|| LatticeError::validation("task cancel requires an id"))?;
                let task = self
                    .tasks
                    .update_status(
                        id,
                        TaskStatus::Canceled,
                        Some("canceled via messaging"),
                        json!({"source": request.source_id}),
                        None,
                    )
                    .await?;
                json!({
                    "ok": true,
                    "action": "task",
                    "subcommand": "cancel",
                    "task": task,
                    "response_text": format!("Task {id} canceled."),
                })
            }
            "list" => {
                let tasks = self.tasks.list(Some(project), None, None, 20).await?;
                let response_text = format!("{} task(s) for {project}.", tasks.len());
                json!({
                    "ok": true,
                    "action": "task",
                    "subcommand": "list",
                    "result": {"tasks": tasks},
                    "response_text": response_text,
                })
            }
            "deadletter" => {
                let tasks = self.tasks.list_deadletter(Some(project), 20).await?;
                let response_text = format!("{} deadlettered task(s).", tasks.len());
                json!({
                    "ok": true,
                    "action": "task",
                    "subcommand": "deadletter",
                    "result": {"tasks": tasks},
                    "response_text": response_text,
                })
            }
            "runtime" => {
                let runtime = self.tasks.runtime_snapshot(Value::Null).await?;
                json!({
                    "ok": true,
                    "action": "task",
                    "subcommand": "runtime",
                    "result": runtime,
                    "response_text": "Task runtime snapshot attached.",
                })
            }
            _ => json!({
                "ok": true,
                "action": "task",
                "subcommand": "help",
                "response_text": TASK_HELP,
            }),
        };
        Ok(response)
    }
}

fn cmd_help(parsed: &ParsedCommand) -> Value {
    let text = if parsed.content.is_empty() {
        HELP.to_string()
    } else {
        format!("{}\n{}", parsed.content, HELP)
    };
    json!({"ok": true, "action": "help", "response_text": text})
}

/// `task create remember <text>` and `task create recall <query>` map onto
/// the allowlisted memory actions.
fn build_task_payload(rest: &[&str], project: &str) -> Result<(Value, String)> {
    let kind = rest
        .first()
        .ok_or_else(|| LatticeError::validation("task create requires a subcommand"))?;
    let body = rest.get(1..).unwrap_or_default().join(" ");
    if body.trim().is_empty() {
        return Err(LatticeError::validation("task create requires content"));
    }
    match kind.to_ascii_lowercase().as_str() {
        "remember" => {
            let stamp = uuid::Uuid::new_v4().simple().to_string()[..12].to_string();
            Ok((
                json!({
                    "action": "memory_write",
                    "project": project,
                    "file": format!("tasks/notes/task_{stamp}.md"),
                    "content": body,
                }),
                format!("remember: {}", clip(&body, 60)),
            ))
        }
        "recall" => Ok((
            json!({
                "action": "memory_search",
                "query": body,
                "project": project,
            }),
            format!("recall: {}", clip(&body, 60)),
        )),
        other => Err(LatticeError::validation(format!(
            "task create '{other}' is not supported (use remember|recall)"
        ))),
    }
}

fn clip(raw: &str, max: usize) -> String {
    if raw.chars().count() <= max {
        raw.to_string()
    } else {
        let clipped: String = raw.chars().take(max).collect();
        format!("{clipped}…")
    }
}
