//! Append-only conversation session with token accounting and compaction.
//!
//! [`Session`] is the single source of truth for one conversation's history.
//! Every append invalidates a cached "view for the LLM" (the wire-ready
//! message list with a leading system entry); the view is rebuilt lazily,
//! only when something actually asks for it. History beyond 500 messages is
//! compacted down to the most recent 300 to keep per-turn request size
//! bounded.

use crate::codec::build_openai_message;
use crate::context::estimate_tokens;
use crate::types::{ContentBlock, Message, MessageRole, OpenAIContent, OpenAIMessage};
use crate::{Error, Result};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

/// History length that triggers compaction.
const COMPACTION_THRESHOLD: usize = 500;
/// How many of the most recent messages survive compaction.
const COMPACTION_KEEP: usize = 300;
/// Refuses further appends to a persisted session file past this size.
const MAX_SESSION_FILE_BYTES: u64 = 64 * 1024 * 1024;

struct SessionState {
    system_prompt: String,
    messages: Vec<Message>,
    token_count: usize,
    context_window: usize,
    /// `None` means the cached view is stale and must be rebuilt before use.
    cached_view: Option<Vec<OpenAIMessage>>,
}

/// One conversation's append-only message log plus derived state (token
/// estimate, wire-ready view). All operations acquire a single
/// reader/writer lock: reads may overlap, writes are exclusive.
pub struct Session {
    state: RwLock<SessionState>,
    persistence_path: Option<PathBuf>,
}

impl Session {
    pub fn new(system_prompt: impl Into<String>, context_window: usize) -> Self {
        Self {
            state: RwLock::new(SessionState {
                system_prompt: system_prompt.into(),
                messages: Vec::new(),
                token_count: 0,
                context_window,
                cached_view: None,
            }),
            persistence_path: None,
        }
    }

    /// Creates a session backed by a JSON-Lines file under `path`, replaying
    /// any messages already recorded there.
    pub fn with_persistence(
        system_prompt: impl Into<String>,
        context_window: usize,
        path: impl Into<PathBuf>,
    ) -> Result<Self> {
        let path = path.into();
        let mut messages = Vec::new();

        if path.exists() {
            let data = std::fs::read_to_string(&path)
                .map_err(|e| Error::config(format!("failed to read session log: {e}")))?;
            for line in data.lines() {
                if line.trim().is_empty() {
                    continue;
                }
                let message: Message = serde_json::from_str(line)
                    .map_err(|e| Error::config(format!("corrupt session log line: {e}")))?;
                messages.push(message);
            }
        }

        let token_count = estimate_tokens(&messages);
        Ok(Self {
            state: RwLock::new(SessionState {
                system_prompt: system_prompt.into(),
                messages,
                token_count,
                context_window,
                cached_view: None,
            }),
            persistence_path: Some(path),
        })
    }

    fn lock_write(&self) -> std::sync::RwLockWriteGuard<'_, SessionState> {
        self.state.write().expect("session lock poisoned")
    }

    fn lock_read(&self) -> std::sync::RwLockReadGuard<'_, SessionState> {
        self.state.read().expect("session lock poisoned")
    }

    fn append(&self, message: Message) -> Result<()> {
        self.persist_one(&message)?;

        let mut state = self.lock_write();
        state.token_count += estimate_tokens(std::slice::from_ref(&message));
        state.messages.push(message);
        state.cached_view = None;
        drop(state);

        self.compact_if_needed();
        Ok(())
    }

    pub fn append_user(&self, text: impl Into<String>) -> Result<()> {
        self.append(Message::user(text))
    }

    pub fn append_assistant(&self, content: Vec<ContentBlock>) -> Result<()> {
        self.append(Message::new(MessageRole::Assistant, content))
    }

    pub fn append_tool_result(&self, content: ContentBlock) -> Result<()> {
        self.append(Message::new(MessageRole::Tool, vec![content]))
    }

    fn persist_one(&self, message: &Message) -> Result<()> {
        let Some(path) = &self.persistence_path else {
            return Ok(());
        };

        if let Ok(meta) = std::fs::metadata(path) {
            if meta.len() >= MAX_SESSION_FILE_BYTES {
                return Err(Error::config("session log has reached its size ceiling"));
            }
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::config(format!("failed to create session dir: {e}")))?;
        }

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| Error::config(format!("failed to open session log: {e}")))?;
        let line = serde_json::to_string(message)?;
        writeln!(file, "{line}").map_err(|e| Error::config(format!("failed to write session log: {e}")))?;
        Ok(())
    }

    /// Retains the most recent [`COMPACTION_KEEP`] messages once the log
    /// reaches [`COMPACTION_THRESHOLD`], subtracting the discarded portion's
    /// token estimate (floored at 0) from the running count.
    fn compact_if_needed(&self) {
        let mut state = self.lock_write();
        if state.messages.len() < COMPACTION_THRESHOLD {
            return;
        }

        let cutoff = state.messages.len() - COMPACTION_KEEP;
        let discarded = &state.messages[..cutoff];
        let discarded_tokens = estimate_tokens(discarded);
        state.token_count = state.token_count.saturating_sub(discarded_tokens);
        state.messages = state.messages[cutoff..].to_vec();
        state.cached_view = None;
    }

    /// Returns the wire-ready view: a system entry (if the prompt is
    /// non-empty) followed by every message, rebuilt lazily when the cache
    /// is stale.
    pub fn messages_for_llm(&self) -> Vec<OpenAIMessage> {
        {
            let state = self.lock_read();
            if let Some(cached) = &state.cached_view {
                return cached.clone();
            }
        }

        let mut state = self.lock_write();
        if let Some(cached) = &state.cached_view {
            return cached.clone();
        }

        let mut view = Vec::with_capacity(state.messages.len() + 1);
        if !state.system_prompt.is_empty() {
            view.push(OpenAIMessage {
                role: "system".to_string(),
                content: Some(OpenAIContent::Text(state.system_prompt.clone())),
                tool_calls: None,
                tool_call_id: None,
            });
        }
        view.extend(state.messages.iter().map(build_openai_message));

        state.cached_view = Some(view.clone());
        view
    }

    /// Plain message history (not the wire-ready view), for UI rendering or
    /// inspection.
    pub fn messages(&self) -> Vec<Message> {
        self.lock_read().messages.clone()
    }

    pub fn token_count(&self) -> usize {
        self.lock_read().token_count
    }

    /// Recomputes the token estimate from scratch rather than trusting the
    /// running total, for callers that want to confirm it hasn't drifted.
    pub fn update_token_count(&self) -> usize {
        let mut state = self.lock_write();
        state.token_count = estimate_tokens(&state.messages);
        state.token_count
    }

    /// `token_count / context_window * 100`, clamped to 100.
    pub fn context_usage_percent(&self) -> f32 {
        let state = self.lock_read();
        if state.context_window == 0 {
            return 100.0;
        }
        let pct = (state.token_count as f32 / state.context_window as f32) * 100.0;
        pct.min(100.0)
    }

    pub fn len(&self) -> usize {
        self.lock_read().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn persistence_path(&self) -> Option<&Path> {
        self.persistence_path.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TextBlock;
    use tempfile::tempdir;

    #[test]
    fn test_append_invalidates_cached_view() {
        let session = Session::new("be helpful", 32_000);
        session.append_user("hi").unwrap();
        let first_view = session.messages_for_llm();
        assert_eq!(first_view.len(), 2); // system + user

        session.append_user("again").unwrap();
        let second_view = session.messages_for_llm();
        assert_eq!(second_view.len(), 3);
    }

    #[test]
    fn test_messages_for_llm_without_system_prompt() {
        let session = Session::new("", 32_000);
        session.append_user("hi").unwrap();
        let view = session.messages_for_llm();
        assert_eq!(view.len(), 1);
        assert_eq!(view[0].role, "user");
    }

    #[test]
    fn test_token_count_increases_on_append() {
        let session = Session::new("", 32_000);
        assert_eq!(session.token_count(), 0);
        session.append_user("hello world").unwrap();
        assert!(session.token_count() > 0);
    }

    #[test]
    fn test_context_usage_percent_clamped_to_100() {
        let session = Session::new("", 10);
        session.append_user("x".repeat(1000)).unwrap();
        assert_eq!(session.context_usage_percent(), 100.0);
    }

    #[test]
    fn test_compaction_keeps_last_300_of_500() {
        let session = Session::new("", 1_000_000);
        for i in 0..500 {
            session.append_user(format!("message {i}")).unwrap();
        }
        assert_eq!(session.len(), COMPACTION_KEEP);
        let messages = session.messages();
        let ContentBlock::Text(TextBlock { text }) = &messages[0].content[0] else {
            panic!("expected text block");
        };
        assert_eq!(text, "message 200");
    }

    #[test]
    fn test_persistence_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("session.jsonl");

        {
            let session = Session::with_persistence("sp", 32_000, &path).unwrap();
            session.append_user("first").unwrap();
            session.append_user("second").unwrap();
        }

        let reloaded = Session::with_persistence("sp", 32_000, &path).unwrap();
        assert_eq!(reloaded.len(), 2);
    }

    #[test]
    fn test_token_count_floors_at_zero_after_compaction() {
        let session = Session::new("", 1_000_000);
        for i in 0..500 {
            session.append_user(format!("m{i}")).unwrap();
        }
        // compaction only ever subtracts an estimate of what it discards,
        // never driving the running count negative (usize would panic).
        assert!(session.token_count() > 0);
    }
}
