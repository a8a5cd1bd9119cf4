//! Directive Router
//!
//! The single entry point for user-issued directives. Input is classified as
//! a remote AIDIS directive (`/aidis_<action>`), the `/help` directive, or a
//! shell command. Whatever happens, the caller gets a [`DirectiveResult`];
//! nothing in here returns an error to the presentation layer.

use crate::{
    extractor::ExtractedCommand,
    history::SharedHistory,
    remote::{RemoteServiceClient, ServiceCallResult},
    schema::{CONTEXT_STORE, CreateTaskArgs, StoreContextArgs, TASK_CREATE},
    shell::{ShellError, ShellExecutor},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, instrument};

/// Prefix of every remote directive.
pub const REMOTE_PREFIX: &str = "/aidis_";
pub const HELP_DIRECTIVE: &str = "/help";
/// Number of recent responses mined by `/aidis_store`.
pub const STORE_WINDOW: usize = 5;

const REMOTE_USAGE: &str =
    "Available AIDIS directives: /aidis_ping, /aidis_store --context|--task, /aidis_tools";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DirectiveKind {
    Remote,
    Shell,
    Help,
}

/// Why a directive failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    /// The directive itself was malformed.
    Usage,
    /// Nothing to act on (empty buffer, no matching embedded commands).
    NotFound,
    /// The service was unreachable or rejected every request.
    Remote,
    /// A shell command was refused by the safety policy.
    Safety,
    Timeout,
    /// A shell command could not be started or exited non-zero.
    Execution,
}

/// Uniform outcome of [`CommandRouter::dispatch`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DirectiveResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub kind: DirectiveKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
}

impl DirectiveResult {
    pub fn success(kind: DirectiveKind, output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: Some(output.into()),
            error: None,
            timestamp: Utc::now(),
            kind,
            failure: None,
        }
    }

    pub fn failure(kind: DirectiveKind, failure: FailureKind, error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(error.into()),
            timestamp: Utc::now(),
            kind,
            failure: Some(failure),
        }
    }

    /// True when the safety policy refused to run the command.
    pub fn is_blocked(&self) -> bool {
        self.failure == Some(FailureKind::Safety)
    }
}

/// Which embedded command type `/aidis_store` forwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StoreTarget {
    Context,
    Task,
}

impl StoreTarget {
    fn from_flags(flags: &[&str]) -> Option<Self> {
        match flags {
            ["--context"] => Some(StoreTarget::Context),
            ["--task"] => Some(StoreTarget::Task),
            _ => None,
        }
    }

    fn command_name(self) -> &'static str {
        match self {
            StoreTarget::Context => CONTEXT_STORE,
            StoreTarget::Task => TASK_CREATE,
        }
    }
}

pub struct CommandRouter {
    client: RemoteServiceClient,
    history: SharedHistory,
    shell: ShellExecutor,
}

impl CommandRouter {
    pub fn new(client: RemoteServiceClient, history: SharedHistory, shell: ShellExecutor) -> Self {
        Self {
            client,
            history,
            shell,
        }
    }

    pub fn client(&self) -> &RemoteServiceClient {
        &self.client
    }

    pub fn client_mut(&mut self) -> &mut RemoteServiceClient {
        &mut self.client
    }

    pub fn history(&self) -> &SharedHistory {
        &self.history
    }

    /// Routes a raw directive string.
    #[instrument(skip(self))]
    pub async fn dispatch(&mut self, input: &str) -> DirectiveResult {
        let input = input.trim();
        let result = if let Some(rest) = input.strip_prefix(REMOTE_PREFIX) {
            self.handle_remote(rest).await
        } else if input == HELP_DIRECTIVE {
            self.help().await
        } else {
            self.handle_shell(input).await
        };
        info!(kind = ?result.kind, success = result.success, failure = ?result.failure, "Directive finished");
        result
    }

    async fn handle_remote(&mut self, rest: &str) -> DirectiveResult {
        let mut parts = rest.split_whitespace();
        let action = parts.next().unwrap_or_default();
        let flags: Vec<&str> = parts.collect();

        match action {
            "ping" => self.ping().await,
            "store" => self.store(&flags).await,
            "tools" => self.tools().await,
            _ => DirectiveResult::failure(
                DirectiveKind::Remote,
                FailureKind::Usage,
                format!("Unknown directive '{}{}'. {}", REMOTE_PREFIX, action, REMOTE_USAGE),
            ),
        }
    }

    async fn ensure_connected(&mut self) -> Result<(), DirectiveResult> {
        self.client.connect().await.map_err(|e| {
            DirectiveResult::failure(DirectiveKind::Remote, FailureKind::Remote, e.to_string())
        })
    }

    async fn ping(&mut self) -> DirectiveResult {
        if let Err(failed) = self.ensure_connected().await {
            return failed;
        }
        let result = self.client.ping().await;
        remote_result(result, |data| match data {
            Some(data) => format!("AIDIS is reachable: {}", render_data(data)),
            None => "AIDIS is reachable".to_string(),
        })
    }

    async fn tools(&mut self) -> DirectiveResult {
        if let Err(failed) = self.ensure_connected().await {
            return failed;
        }
        let result = self.client.list_operations().await;
        remote_result(result, |data| match data {
            Some(data) => render_data(data),
            None => "AIDIS returned no operations".to_string(),
        })
    }

    /// Forwards embedded commands from the most recent responses.
    async fn store(&mut self, flags: &[&str]) -> DirectiveResult {
        let Some(target) = StoreTarget::from_flags(flags) else {
            return DirectiveResult::failure(
                DirectiveKind::Remote,
                FailureKind::Usage,
                "Usage: /aidis_store --context | --task (exactly one flag)",
            );
        };
        let name = target.command_name();

        let commands: Vec<ExtractedCommand> = {
            let history = self.history.read().await;
            if history.is_empty() {
                return DirectiveResult::failure(
                    DirectiveKind::Remote,
                    FailureKind::NotFound,
                    "No responses buffered yet; nothing to extract commands from",
                );
            }
            history
                .recent(STORE_WINDOW)
                .iter()
                .flat_map(|response| history.extractor().extract(&response.content))
                .filter(|command| command.name == name)
                .collect()
        };

        if commands.is_empty() {
            return DirectiveResult::failure(
                DirectiveKind::Remote,
                FailureKind::NotFound,
                format!(
                    "No {} commands found in the last {} responses",
                    name, STORE_WINDOW
                ),
            );
        }

        if let Err(failed) = self.ensure_connected().await {
            return failed;
        }

        let total = commands.len();
        let mut succeeded = 0;
        let mut lines = Vec::with_capacity(total);
        for command in commands {
            let (ok, line) = match target {
                StoreTarget::Context => self.store_context(command).await,
                StoreTarget::Task => self.create_task(command).await,
            };
            if ok {
                succeeded += 1;
            }
            lines.push(line);
        }

        let summary = format!(
            "Executed {}/{} {} command(s):\n{}",
            succeeded,
            total,
            name,
            lines.join("\n")
        );
        info!(command = name, succeeded, total, "Forwarded embedded commands");
        if succeeded == 0 {
            DirectiveResult::failure(DirectiveKind::Remote, FailureKind::Remote, summary)
        } else {
            DirectiveResult::success(DirectiveKind::Remote, summary)
        }
    }

    async fn store_context(&self, command: ExtractedCommand) -> (bool, String) {
        let args: StoreContextArgs = match serde_json::from_value(Value::Object(command.payload)) {
            Ok(args) => args,
            Err(e) => return (false, format!("✗ Invalid context payload: {}", e)),
        };
        let result = self.client.store_context(&args).await;
        if result.success {
            (
                true,
                format!("✓ Stored {} context: {}", args.context_type, preview(&args.content)),
            )
        } else {
            (
                false,
                format!(
                    "✗ Failed to store context: {}",
                    result.error.unwrap_or_default()
                ),
            )
        }
    }

    async fn create_task(&self, command: ExtractedCommand) -> (bool, String) {
        let args: CreateTaskArgs = match serde_json::from_value(Value::Object(command.payload)) {
            Ok(args) => args,
            Err(e) => return (false, format!("✗ Invalid task payload: {}", e)),
        };
        let result = self.client.create_task(&args).await;
        if result.success {
            (true, format!("✓ Created task: {}", preview(&args.title)))
        } else {
            (
                false,
                format!(
                    "✗ Failed to create task '{}': {}",
                    preview(&args.title),
                    result.error.unwrap_or_default()
                ),
            )
        }
    }

    async fn help(&self) -> DirectiveResult {
        let (size, capacity, known) = {
            let history = self.history.read().await;
            (
                history.len(),
                history.capacity(),
                history.extractor().registry().names().join(", "),
            )
        };
        let text = format!(
            "Directives:\n\
             \x20 /aidis_ping               Check that AIDIS is reachable\n\
             \x20 /aidis_store --context    Store context commands from the last {window} responses\n\
             \x20 /aidis_store --task       Create tasks from the last {window} responses\n\
             \x20 /aidis_tools              List the operations AIDIS offers\n\
             \x20 /help                     Show this help\n\
             \x20 anything else             Run as a shell command\n\
             \n\
             Embedded commands: {known}\n\
             Connection: {state}\n\
             Buffer: {size}/{capacity} responses",
            window = STORE_WINDOW,
            known = known,
            state = self.client.state(),
            size = size,
            capacity = capacity,
        );
        DirectiveResult::success(DirectiveKind::Help, text)
    }

    async fn handle_shell(&self, command: &str) -> DirectiveResult {
        match self.shell.run(command).await {
            Ok(output) => DirectiveResult::success(DirectiveKind::Shell, output),
            Err(e) => {
                let failure = match &e {
                    ShellError::Empty => FailureKind::Usage,
                    ShellError::Blocked { .. } => FailureKind::Safety,
                    ShellError::Timeout(_) => FailureKind::Timeout,
                    ShellError::Spawn(_) | ShellError::Failed { .. } => FailureKind::Execution,
                };
                DirectiveResult::failure(DirectiveKind::Shell, failure, e.to_string())
            }
        }
    }
}

fn remote_result(
    result: ServiceCallResult,
    render: impl FnOnce(Option<&Value>) -> String,
) -> DirectiveResult {
    if result.success {
        DirectiveResult::success(DirectiveKind::Remote, render(result.data.as_ref()))
    } else {
        DirectiveResult::failure(
            DirectiveKind::Remote,
            FailureKind::Remote,
            result.error.unwrap_or_else(|| "AIDIS call failed".to_string()),
        )
    }
}

fn render_data(data: &Value) -> String {
    match data {
        Value::String(text) => text.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    }
}

/// First 60 characters of `text`, on one line.
fn preview(text: &str) -> String {
    const LIMIT: usize = 60;
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() > LIMIT {
        format!("{}...", flat.chars().take(LIMIT).collect::<String>())
    } else {
        flat
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::ResponseHistory;
    use crate::remote::{MockServiceTransport, RetryPolicy, TransportError};
    use crate::shell::SafetyPolicy;
    use serde_json::json;
    use std::time::Duration;

    fn retry() -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    fn router(transport: MockServiceTransport, responses: &[&str]) -> CommandRouter {
        let mut history = ResponseHistory::default();
        for response in responses {
            history.append(*response, None);
        }
        let client = RemoteServiceClient::new(transport, retry(), "test-client");
        CommandRouter::new(client, history.shared(), ShellExecutor::default())
    }

    fn healthy() -> MockServiceTransport {
        let mut transport = MockServiceTransport::new();
        transport.expect_health_check().returning(|| Ok(()));
        transport
    }

    #[tokio::test]
    async fn test_help_reports_connection_and_buffer() {
        let mut router = router(MockServiceTransport::new(), &["one", "two"]);
        let result = router.dispatch("  /help ").await;
        assert!(result.success);
        assert_eq!(result.kind, DirectiveKind::Help);
        let text = result.output.unwrap();
        assert!(text.contains("Connection: disconnected"));
        assert!(text.contains("Buffer: 2/50 responses"));
        assert!(text.contains("context_store, task_create"));
    }

    #[tokio::test]
    async fn test_store_with_empty_history() {
        let mut router = router(MockServiceTransport::new(), &[]);
        let result = router.dispatch("/aidis_store --context").await;
        assert!(!result.success);
        assert_eq!(result.kind, DirectiveKind::Remote);
        assert_eq!(result.failure, Some(FailureKind::NotFound));
        assert!(result.error.unwrap().contains("No responses buffered"));
    }

    #[tokio::test]
    async fn test_store_without_matching_commands() {
        let mut router = router(
            MockServiceTransport::new(),
            &[r#"Plain answer with aidis:task_create {"title": "a task"}"#],
        );
        let result = router.dispatch("/aidis_store --context").await;
        assert!(!result.success);
        assert_eq!(
            result.error.as_deref(),
            Some("No context_store commands found in the last 5 responses")
        );
    }

    #[tokio::test]
    async fn test_store_requires_exactly_one_flag() {
        let mut router = router(MockServiceTransport::new(), &["x"]);
        for directive in ["/aidis_store", "/aidis_store --context --task", "/aidis_store --all"] {
            let result = router.dispatch(directive).await;
            assert_eq!(result.failure, Some(FailureKind::Usage), "{directive}");
        }
    }

    #[tokio::test]
    async fn test_store_context_end_to_end() {
        let mut transport = healthy();
        transport
            .expect_post()
            .withf(|path, body| {
                path == "mcp/tools/context_store" && body["arguments"]["content"] == "x"
            })
            .times(1)
            .returning(|_, _| Ok(json!({"success": true, "result": {"id": "ctx-1"}})));

        let mut router = router(
            transport,
            &[r#"...aidis:context_store {"content":"x","type":"code"}..."#],
        );
        let result = router.dispatch("/aidis_store --context").await;
        assert!(result.success, "{result:?}");
        assert_eq!(result.kind, DirectiveKind::Remote);
        let output = result.output.unwrap();
        assert!(output.starts_with("Executed 1/1 context_store command(s)"));
        let stored: Vec<&str> = output.lines().filter(|l| l.contains("Stored")).collect();
        assert_eq!(stored, vec!["✓ Stored code context: x"]);
        assert!(router.client().is_connected());
    }

    #[tokio::test]
    async fn test_store_only_mines_last_five_responses() {
        let mut transport = healthy();
        transport
            .expect_post()
            .times(5)
            .returning(|_, _| Ok(json!({"success": true})));

        let responses: Vec<String> = (0..7)
            .map(|i| format!(r#"aidis:task_create {{"title": "task {i}"}}"#))
            .collect();
        let refs: Vec<&str> = responses.iter().map(String::as_str).collect();
        let mut router = router(transport, &refs);

        let output = router.dispatch("/aidis_store --task").await.output.unwrap();
        assert!(output.contains("Executed 5/5 task_create"));
        assert!(!output.contains("task 1"));
        assert!(output.contains("✓ Created task: task 2"));
        assert!(output.contains("✓ Created task: task 6"));
    }

    #[tokio::test]
    async fn test_store_partial_success_is_success() {
        let mut transport = healthy();
        let mut seq = mockall::Sequence::new();
        transport
            .expect_post()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(json!({"success": true})));
        transport
            .expect_post()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(json!({"success": false, "error": "duplicate"})));

        let mut router = router(
            transport,
            &[r#"aidis:task_create {"title": "first"} aidis:task_create {"title": "second"}"#],
        );
        let result = router.dispatch("/aidis_store --task").await;
        assert!(result.success);
        let output = result.output.unwrap();
        assert!(output.contains("Executed 1/2"));
        assert!(output.contains("✓ Created task: first"));
        assert!(output.contains("✗ Failed to create task 'second': AIDIS rejected task_create: duplicate"));
    }

    #[tokio::test]
    async fn test_store_all_failed_is_failure() {
        let mut transport = healthy();
        transport.expect_post().returning(|_, _| {
            Err(TransportError::Status {
                status: 500,
                body: "down".to_string(),
            })
        });
        let mut router = router(transport, &[r#"aidis:task_create {"title": "t"}"#]);
        let result = router.dispatch("/aidis_store --task").await;
        assert!(!result.success);
        assert_eq!(result.failure, Some(FailureKind::Remote));
        assert!(result.error.unwrap().contains("Executed 0/1"));
    }

    #[tokio::test]
    async fn test_ping_connects_on_demand() {
        let mut transport = healthy();
        transport
            .expect_post()
            .withf(|path, _| path == "mcp/tools/aidis_ping")
            .returning(|_, _| Ok(json!({"success": true, "result": "pong"})));
        let mut router = router(transport, &[]);

        let result = router.dispatch("/aidis_ping").await;
        assert!(result.success);
        assert_eq!(result.output.as_deref(), Some("AIDIS is reachable: pong"));
    }

    #[tokio::test]
    async fn test_ping_reports_connection_failure() {
        let mut transport = MockServiceTransport::new();
        transport.expect_health_check().times(2).returning(|| {
            Err(TransportError::Status {
                status: 503,
                body: "unavailable".to_string(),
            })
        });
        let mut router = router(transport, &[]);

        let result = router.dispatch("/aidis_ping").await;
        assert!(!result.success);
        assert_eq!(result.failure, Some(FailureKind::Remote));
        assert!(result.error.unwrap().contains("after 2 attempt(s)"));
    }

    #[tokio::test]
    async fn test_unknown_remote_action() {
        let mut router = router(MockServiceTransport::new(), &[]);
        let result = router.dispatch("/aidis_launch").await;
        assert_eq!(result.failure, Some(FailureKind::Usage));
        assert!(result.error.unwrap().contains("/aidis_launch"));
    }

    #[tokio::test]
    async fn test_shell_safety_rejection_is_distinct() {
        let mut router = router(MockServiceTransport::new(), &[]);
        for command in ["rm -rf /", "echo rm -rf (not really)"] {
            let result = router.dispatch(command).await;
            assert_eq!(result.kind, DirectiveKind::Shell);
            assert!(result.is_blocked(), "{command}");
            assert!(result.error.unwrap().contains("blocked for safety"));
        }
    }

    #[tokio::test]
    async fn test_shell_uses_configured_denylist() {
        let history = ResponseHistory::default().shared();
        let client = RemoteServiceClient::new(MockServiceTransport::new(), retry(), "c");
        let shell = ShellExecutor::new(SafetyPolicy::new(["curl"]), Duration::from_secs(5));
        let mut router = CommandRouter::new(client, history, shell);

        assert!(router.dispatch("curl http://example.com").await.is_blocked());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shell_passthrough() {
        let mut router = router(MockServiceTransport::new(), &[]);
        let ok = router.dispatch("echo routed").await;
        assert!(ok.success);
        assert_eq!(ok.output.as_deref(), Some("routed"));

        let failed = router.dispatch("exit 2").await;
        assert_eq!(failed.failure, Some(FailureKind::Execution));
        assert_eq!(failed.error.as_deref(), Some("Command exited with code 2"));
    }
}
