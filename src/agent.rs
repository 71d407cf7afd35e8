//! The ReAct agent loop: ties the session, provider chain, tool registry,
//! and permission manager together into `AgentLoop::run`.
//!
//! One call to [`AgentLoop::run`] drives a full user turn: call the model,
//! dispatch any tool calls it requests, append the results, and repeat
//! until the model stops asking for tools or [`MAX_ITERATIONS`] is hit.

use crate::chain::ProviderChain;
use crate::hooks::{Hooks, PostToolUseEvent, PreToolUseEvent};
use crate::permission::{PermissionDecision, PermissionManager};
use crate::session::Session;
use crate::tools::Tool;
use crate::types::{ContentBlock, ToolResultBlock, ToolUseBlock};
use crate::{extractor, Error, Result};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Hard ceiling on ReAct iterations within one `run` call, independent of
/// how many tool calls the model tries to make.
const MAX_ITERATIONS: usize = 50;
/// Per-tool execution budget.
const TOOL_TIMEOUT: Duration = Duration::from_secs(30);
/// Script-validation retries before giving up and asking for manual review.
const MAX_VALIDATION_ATTEMPTS: usize = 3;
/// How many recent (tool, argument-hash) pairs the loop detector remembers.
const LOOP_DETECTOR_WINDOW: usize = 8;
/// Repeats of the same pair within the window that count as a loop.
const LOOP_DETECTOR_THRESHOLD: usize = 3;

/// Tools considered unsafe to execute while plan mode is active.
const PLAN_MODE_BLOCKED_TOOLS: &[&str] = &["write_file", "edit_file", "bash"];

/// Tags a tool as either load-bearing or nice-to-have. An optional tool's
/// failure is papered over with a synthesized "unavailable" result rather
/// than aborting the turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolImportance {
    Essential,
    Optional,
}

/// Asks an external party (a UI, a CLI prompt) whether a tool call lacking
/// a persisted rule should run, and whether to remember the answer.
pub trait PermissionPrompt: Send + Sync {
    fn ask(&self, tool_name: &str, input: &serde_json::Value) -> PromptResponse;
}

#[derive(Debug, Clone, Copy)]
pub struct PromptResponse {
    pub allow: bool,
    pub remember: bool,
}

/// A prompt implementation that always denies — the safe default for
/// headless/unattended runs where nothing can answer an interactive ask.
pub struct DenyAllPrompt;

impl PermissionPrompt for DenyAllPrompt {
    fn ask(&self, _tool_name: &str, _input: &serde_json::Value) -> PromptResponse {
        PromptResponse {
            allow: false,
            remember: false,
        }
    }
}

/// Runs an external validator (e.g. `python3 -S <file>`, `node --check
/// <file>`) against a freshly written script file and reports whether it's
/// syntactically sound, keyed by file extension.
fn validator_command_for(extension: &str) -> Option<(&'static str, Vec<String>)> {
    match extension {
        "py" => Some(("python3", vec!["-m".to_string(), "py_compile".to_string()])),
        "js" | "mjs" => Some(("node", vec!["--check".to_string()])),
        "sh" | "bash" => Some(("bash", vec!["-n".to_string()])),
        "rb" => Some(("ruby", vec!["-c".to_string()])),
        _ => None,
    }
}

/// Sliding window of recent (tool name, argument hash) pairs used to detect
/// the model repeating an identical call rather than making progress.
struct LoopDetector {
    window: VecDeque<(String, u64)>,
}

impl LoopDetector {
    fn new() -> Self {
        Self {
            window: VecDeque::with_capacity(LOOP_DETECTOR_WINDOW),
        }
    }

    fn reset(&mut self) {
        self.window.clear();
    }

    fn record(&mut self, tool_name: &str, args: &serde_json::Value) {
        let hash = argument_hash(args);
        if self.window.len() == LOOP_DETECTOR_WINDOW {
            self.window.pop_front();
        }
        self.window.push_back((tool_name.to_string(), hash));
    }

    fn detects_loop(&self) -> bool {
        let mut counts: HashMap<(&str, u64), usize> = HashMap::new();
        for (name, hash) in &self.window {
            *counts.entry((name.as_str(), *hash)).or_insert(0) += 1;
        }
        counts.values().any(|&count| count >= LOOP_DETECTOR_THRESHOLD)
    }
}

fn argument_hash(value: &serde_json::Value) -> u64 {
    use std::hash::{Hash, Hasher};
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    bytes.hash(&mut hasher);
    hasher.finish()
}

/// How one `run` call ended.
#[derive(Debug)]
pub enum AgentOutcome {
    /// The model produced a final answer with no further tool calls.
    Completed(Vec<ContentBlock>),
    /// The loop detector fired; the loop stopped rather than spin.
    LoopDetected,
    /// Script validation failed `MAX_VALIDATION_ATTEMPTS` times in a row.
    ManualReviewNeeded { file: String },
    /// `MAX_ITERATIONS` was reached without the model finishing.
    IterationLimitReached,
}

/// Ties a [`Session`], a [`ProviderChain`], a tool registry, and a
/// [`PermissionManager`] into one `run` call per user turn.
pub struct AgentLoop {
    chain: ProviderChain,
    session: Session,
    tools: HashMap<String, Tool>,
    importance: HashMap<String, ToolImportance>,
    permissions: PermissionManager,
    hooks: Hooks,
    prompt: Box<dyn PermissionPrompt>,
    plan_mode: Mutex<bool>,
    loop_detector: Mutex<LoopDetector>,
    validation_count: Mutex<usize>,
}

impl AgentLoop {
    pub fn new(
        chain: ProviderChain,
        session: Session,
        permissions: PermissionManager,
        hooks: Hooks,
    ) -> Self {
        Self {
            chain,
            session,
            tools: HashMap::new(),
            importance: HashMap::new(),
            permissions,
            hooks,
            prompt: Box::new(DenyAllPrompt),
            plan_mode: Mutex::new(false),
            loop_detector: Mutex::new(LoopDetector::new()),
            validation_count: Mutex::new(0),
        }
    }

    pub fn with_prompt(mut self, prompt: impl PermissionPrompt + 'static) -> Self {
        self.prompt = Box::new(prompt);
        self
    }

    pub fn set_plan_mode(&self, enabled: bool) {
        *self.plan_mode.lock().expect("plan mode lock poisoned") = enabled;
    }

    /// Registers a tool under its own name, recording its category with the
    /// permission manager.
    pub fn register_tool(&mut self, tool: Tool, category: crate::permission::ToolCategory) {
        self.register_tool_with_importance(tool, category, ToolImportance::Essential);
    }

    pub fn register_tool_with_importance(
        &mut self,
        tool: Tool,
        category: crate::permission::ToolCategory,
        importance: ToolImportance,
    ) {
        let name = tool.name().to_string();
        self.permissions.register(name.clone(), category);
        self.importance.insert(name.clone(), importance);
        self.tools.insert(name, tool);
    }

    fn tool_schemas(&self) -> Vec<serde_json::Value> {
        self.tools.values().map(Tool::to_openai_format).collect()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Drives one full user turn: appends `user_input`, then iterates model
    /// calls and tool dispatch until the model stops asking for tools, a
    /// stop condition fires, or [`MAX_ITERATIONS`] is reached.
    pub async fn run(&self, user_input: &str, cancel: &CancellationToken) -> Result<AgentOutcome> {
        self.loop_detector.lock().expect("loop detector lock poisoned").reset();
        *self.validation_count.lock().expect("validation lock poisoned") = 0;
        self.session.append_user(user_input)?;

        for _ in 0..MAX_ITERATIONS {
            if cancel.is_cancelled() {
                return Err(Error::cancelled());
            }

            let validation_count = *self.validation_count.lock().expect("validation lock poisoned");
            if validation_count == 0
                && self.loop_detector.lock().expect("loop detector lock poisoned").detects_loop()
            {
                return Ok(AgentOutcome::LoopDetected);
            }

            let history = self.session.messages();
            let tool_schemas = if self.tools.is_empty() {
                None
            } else {
                Some(self.tool_schemas())
            };

            let mut attempted = HashSet::new();
            let blocks = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::cancelled()),
                result = self.chain.chat("", &history, tool_schemas, &mut attempted) => result?,
            };

            let tool_calls: Vec<&ToolUseBlock> = blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::ToolUse(t) => Some(t),
                    _ => None,
                })
                .collect();

            if tool_calls.is_empty() {
                self.session.append_assistant(blocks.clone())?;
                return Ok(AgentOutcome::Completed(blocks));
            }

            self.session.append_assistant(blocks.clone())?;

            let mut last_write_file_path: Option<String> = None;

            for call in &tool_calls {
                if cancel.is_cancelled() {
                    return Err(Error::cancelled());
                }

                let result_block = self.dispatch_one(call, cancel).await;
                self.session.append_tool_result(ContentBlock::ToolResult(result_block))?;
                self.loop_detector
                    .lock()
                    .expect("loop detector lock poisoned")
                    .record(&call.name, &call.input);

                if call.name == "write_file" {
                    if let Some(path) = call.input.get("path").and_then(|v| v.as_str()) {
                        last_write_file_path = Some(path.to_string());
                    }
                }
            }

            if let Some(path) = last_write_file_path {
                if let Some(outcome) = self.validate_script(&path).await? {
                    return Ok(outcome);
                }
            }
        }

        Ok(AgentOutcome::IterationLimitReached)
    }

    async fn dispatch_one(&self, call: &ToolUseBlock, cancel: &CancellationToken) -> ToolResultBlock {
        if *self.plan_mode.lock().expect("plan mode lock poisoned")
            && PLAN_MODE_BLOCKED_TOOLS.contains(&call.name.as_str())
        {
            return ToolResultBlock::new(
                call.id.clone(),
                serde_json::json!({ "error": "cannot execute in plan mode" }),
            );
        }

        match self.permissions.check(&call.name) {
            PermissionDecision::Deny => {
                return ToolResultBlock::new(
                    call.id.clone(),
                    serde_json::json!({ "error": format!("permission denied for tool '{}'", call.name) }),
                );
            }
            PermissionDecision::Ask => {
                let response = self.prompt.ask(&call.name, &call.input);
                if response.remember {
                    let _ = self.permissions.remember(call.name.clone(), response.allow);
                }
                if !response.allow {
                    return ToolResultBlock::new(
                        call.id.clone(),
                        serde_json::json!({ "error": format!("permission denied for tool '{}'", call.name) }),
                    );
                }
            }
            PermissionDecision::Allow => {}
        }

        let history_snapshot: Vec<serde_json::Value> = Vec::new();
        let pre_event = PreToolUseEvent::new(
            call.name.clone(),
            call.input.clone(),
            call.id.clone(),
            history_snapshot.clone(),
        );
        if let Some(decision) = self.hooks.execute_pre_tool_use(pre_event).await {
            if !decision.continue_execution {
                return ToolResultBlock::new(
                    call.id.clone(),
                    serde_json::json!({ "error": decision.reason.unwrap_or_else(|| "blocked by hook".to_string()) }),
                );
            }
        }

        let Some(tool) = self.tools.get(&call.name) else {
            return ToolResultBlock::new(
                call.id.clone(),
                serde_json::json!({ "error": format!("unknown tool '{}'", call.name) }),
            );
        };

        let execution = tokio::select! {
            _ = cancel.cancelled() => Err(Error::cancelled()),
            result = tokio::time::timeout(TOOL_TIMEOUT, tool.execute(call.input.clone())) => {
                result.unwrap_or_else(|_| Err(Error::timeout()))
            }
        };

        let result_value = match execution {
            Ok(value) => value,
            Err(err) => {
                let importance = self
                    .importance
                    .get(&call.name)
                    .copied()
                    .unwrap_or(ToolImportance::Essential);
                match importance {
                    ToolImportance::Optional => serde_json::json!({
                        "warning": format!("tool '{}' unavailable, continuing without it: {}", call.name, err),
                    }),
                    ToolImportance::Essential => serde_json::json!({ "error": err.to_string() }),
                }
            }
        };

        let post_event = PostToolUseEvent::new(
            call.name.clone(),
            call.input.clone(),
            call.id.clone(),
            result_value.clone(),
            history_snapshot,
        );
        let _ = self.hooks.execute_post_tool_use(post_event).await;

        ToolResultBlock::new(call.id.clone(), result_value)
    }

    /// Implements §4.8.1: after a `write_file` call, run a syntax validator
    /// over the written file if its extension is recognized. Returns
    /// `Some(outcome)` only when validation has been exhausted and the loop
    /// should stop.
    async fn validate_script(&self, path: &str) -> Result<Option<AgentOutcome>> {
        let extension = std::path::Path::new(path)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("");
        let Some((program, mut args)) = validator_command_for(extension) else {
            return Ok(None);
        };
        args.push(path.to_string());

        let outcome = tokio::time::timeout(
            TOOL_TIMEOUT,
            tokio::process::Command::new(program).args(&args).output(),
        )
        .await;

        let success = matches!(&outcome, Ok(Ok(output)) if output.status.success());

        if success {
            *self.validation_count.lock().expect("validation lock poisoned") = 0;
            return Ok(None);
        }

        let mut count = self.validation_count.lock().expect("validation lock poisoned");
        *count += 1;
        if *count >= MAX_VALIDATION_ATTEMPTS {
            return Ok(Some(AgentOutcome::ManualReviewNeeded {
                file: path.to_string(),
            }));
        }

        let message = match &outcome {
            Ok(Ok(output)) => String::from_utf8_lossy(&output.stderr).into_owned(),
            Ok(Err(e)) => e.to_string(),
            Err(_) => "validator timed out".to_string(),
        };
        self.session.append_assistant(vec![ContentBlock::Text(crate::types::TextBlock::new(format!(
            "script validation failed for {path}: {message}"
        )))])?;

        Ok(None)
    }

    /// Recovers tool calls from plain-text model output when a response has
    /// no native tool calls but the prose contains markup-shaped ones.
    pub fn recover_fallback_tool_calls(&self, text: &str) -> Vec<ToolUseBlock> {
        let known: HashSet<String> = self.tools.keys().cloned().collect();
        extractor::extract_tool_calls(text, &known)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permission::ToolCategory;
    use crate::provider::{ChatProvider, ChatStream, ProviderInfo};
    use crate::types::Message;
    use async_trait::async_trait;

    struct EchoProvider;

    #[async_trait]
    impl ChatProvider for EchoProvider {
        async fn chat(
            &self,
            _system_prompt: &str,
            _history: &[Message],
            _tools: Option<Vec<serde_json::Value>>,
        ) -> Result<Vec<ContentBlock>> {
            Ok(vec![ContentBlock::Text(crate::types::TextBlock::new("done"))])
        }

        async fn chat_stream(
            &self,
            _system_prompt: &str,
            _history: &[Message],
            _tools: Option<Vec<serde_json::Value>>,
        ) -> Result<ChatStream> {
            unimplemented!()
        }

        async fn health_check(&self) -> Result<()> {
            Ok(())
        }

        fn info(&self) -> ProviderInfo {
            ProviderInfo {
                name: "echo".to_string(),
                kind: crate::provider::ProviderKind::Local,
                base_url: "n/a".to_string(),
                model: "n/a".to_string(),
                features: crate::provider::ProviderFeatures::default(),
            }
        }
    }

    fn build_loop() -> AgentLoop {
        let mut chain = ProviderChain::new();
        chain.push(Box::new(EchoProvider), crate::chain::ChainRole::Main);
        AgentLoop::new(
            chain,
            Session::new("be helpful", 32_000),
            PermissionManager::new(),
            Hooks::new(),
        )
    }

    #[tokio::test]
    async fn test_run_completes_with_no_tool_calls() {
        let agent = build_loop();
        let cancel = CancellationToken::new();
        let outcome = agent.run("hello", &cancel).await.unwrap();
        assert!(matches!(outcome, AgentOutcome::Completed(_)));
    }

    #[tokio::test]
    async fn test_run_honors_pre_cancelled_token() {
        let agent = build_loop();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = agent.run("hello", &cancel).await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[test]
    fn test_loop_detector_flags_repeated_calls() {
        let mut detector = LoopDetector::new();
        let args = serde_json::json!({ "x": 1 });
        for _ in 0..LOOP_DETECTOR_THRESHOLD {
            detector.record("bash", &args);
        }
        assert!(detector.detects_loop());
    }

    #[test]
    fn test_loop_detector_ignores_distinct_calls() {
        let mut detector = LoopDetector::new();
        detector.record("bash", &serde_json::json!({ "x": 1 }));
        detector.record("bash", &serde_json::json!({ "x": 2 }));
        detector.record("read_file", &serde_json::json!({ "x": 1 }));
        assert!(!detector.detects_loop());
    }

    #[tokio::test]
    async fn test_plan_mode_blocks_dangerous_tools() {
        let mut agent = build_loop();
        agent.register_tool(
            Tool::new("bash", "run shell", serde_json::json!({}), |_| async {
                Ok(serde_json::json!({ "ok": true }))
            }),
            ToolCategory::Dangerous,
        );
        agent.set_plan_mode(true);
        let cancel = CancellationToken::new();
        let call = ToolUseBlock::new("call_1", "bash", serde_json::json!({}));
        let result = agent.dispatch_one(&call, &cancel).await;
        assert_eq!(result.content["error"], "cannot execute in plan mode");
    }

    #[tokio::test]
    async fn test_unknown_tool_returns_error_result() {
        let agent = build_loop();
        let cancel = CancellationToken::new();
        let call = ToolUseBlock::new("call_1", "mystery", serde_json::json!({}));
        let result = agent.dispatch_one(&call, &cancel).await;
        assert!(result.content["error"].as_str().unwrap().contains("unknown tool"));
    }

    #[tokio::test]
    async fn test_optional_tool_failure_yields_warning_not_error() {
        let mut agent = build_loop();
        agent.register_tool_with_importance(
            Tool::new("flaky", "sometimes fails", serde_json::json!({}), |_| async {
                Err(Error::tool("boom"))
            }),
            ToolCategory::Safe,
            ToolImportance::Optional,
        );
        let cancel = CancellationToken::new();
        let call = ToolUseBlock::new("call_1", "flaky", serde_json::json!({}));
        let result = agent.dispatch_one(&call, &cancel).await;
        assert!(result.content.get("warning").is_some());
    }
}
