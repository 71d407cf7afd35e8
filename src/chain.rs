//! Ordered provider fallback chain.
//!
//! A [`ProviderChain`] tries providers in priority order, advancing to the
//! next one only when [`classify::classify`] says the failure is the kind a
//! [`FallbackCondition`] retries on. Each provider is tried at most once per
//! call — a chain of N providers makes at most N attempts, never loops.

use crate::classify::{self, ErrorClass};
use crate::provider::{ChatProvider, ChatStream, ProviderInfo};
use crate::types::Message;
use crate::{Error, Result};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// The role a chain entry plays, surfaced for diagnostics and logging; does
/// not affect fallback order, which is purely priority-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainRole {
    Main,
    Sub,
    Fallback,
}

/// Governs which [`ErrorClass`] values trigger fallback to the next
/// provider. The field names mirror the taxonomy directly so a caller
/// overriding the default can see exactly what they're changing.
#[derive(Debug, Clone, Copy)]
pub struct FallbackCondition {
    pub network: bool,
    pub timeout: bool,
    pub server_error: bool,
    pub context_window: bool,
    pub rate_limit: bool,
    pub client_error: bool,
    pub unknown: bool,
}

impl Default for FallbackCondition {
    /// network=on, timeout=on, server-error=on, context-window=on,
    /// rate-limit=off, client-error=off, unknown=off.
    fn default() -> Self {
        Self {
            network: true,
            timeout: true,
            server_error: true,
            context_window: true,
            rate_limit: false,
            client_error: false,
            unknown: false,
        }
    }
}

impl FallbackCondition {
    pub fn allows(&self, class: ErrorClass) -> bool {
        match class {
            ErrorClass::Network => self.network,
            ErrorClass::Timeout => self.timeout,
            ErrorClass::ServerError => self.server_error,
            ErrorClass::ContextWindow => self.context_window,
            ErrorClass::RateLimit => self.rate_limit,
            ErrorClass::ClientError => self.client_error,
            ErrorClass::Unknown => self.unknown,
        }
    }
}

/// One provider's slot in the chain plus its rolling failure counter.
struct ChainEntry {
    provider: Box<dyn ChatProvider>,
    role: ChainRole,
    failure_count: AtomicU64,
    last_failure_at: Mutex<Option<std::time::Instant>>,
}

/// A fact about one fallback step, passed to the chain's `on_fallback`
/// callback so callers can log or collect metrics.
#[derive(Debug, Clone)]
pub struct FallbackEvent {
    pub from: ProviderInfo,
    pub to: ProviderInfo,
    pub class: ErrorClass,
    pub attempt: usize,
}

type OnFallback = Box<dyn Fn(&FallbackEvent) + Send + Sync>;

/// Ordered list of providers tried in sequence until one succeeds or every
/// provider has been tried exactly once.
pub struct ProviderChain {
    entries: Vec<ChainEntry>,
    condition: FallbackCondition,
    on_fallback: Option<OnFallback>,
    fallback_enabled: bool,
}

impl ProviderChain {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            condition: FallbackCondition::default(),
            on_fallback: None,
            fallback_enabled: true,
        }
    }

    pub fn with_condition(mut self, condition: FallbackCondition) -> Self {
        self.condition = condition;
        self
    }

    /// Toggles whether the chain is allowed to advance to the next provider
    /// on failure at all. Even when `true`, fallback only actually happens
    /// when the chain holds more than one provider — see
    /// [`ProviderChain::fallback_active`].
    pub fn with_fallback_enabled(mut self, enabled: bool) -> Self {
        self.fallback_enabled = enabled;
        self
    }

    /// Whether fallback is actually in effect: the flag is on AND there is
    /// more than one provider to fall back to.
    pub fn fallback_active(&self) -> bool {
        self.fallback_enabled && self.entries.len() > 1
    }

    pub fn on_fallback(mut self, callback: impl Fn(&FallbackEvent) + Send + Sync + 'static) -> Self {
        self.on_fallback = Some(Box::new(callback));
        self
    }

    /// Appends a provider to the end of the chain (lowest priority so far).
    pub fn push(&mut self, provider: Box<dyn ChatProvider>, role: ChainRole) {
        self.entries.push(ChainEntry {
            provider,
            role,
            failure_count: AtomicU64::new(0),
            last_failure_at: Mutex::new(None),
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Per-provider failure count observed so far, in chain order.
    pub fn failure_counts(&self) -> Vec<u64> {
        self.entries
            .iter()
            .map(|e| e.failure_count.load(Ordering::Relaxed))
            .collect()
    }

    fn record_failure(&self, idx: usize) {
        self.entries[idx].failure_count.fetch_add(1, Ordering::Relaxed);
        *self.entries[idx]
            .last_failure_at
            .lock()
            .expect("chain entry lock poisoned") = Some(std::time::Instant::now());
    }

    /// Runs a non-streaming chat turn through the chain, starting at
    /// whichever provider is highest priority and has not yet been tried
    /// this call.
    ///
    /// `attempted` accumulates indices tried across retries by the caller
    /// (e.g. the agent loop re-entering the chain within the same turn);
    /// pass a fresh empty set for a brand-new turn.
    pub async fn chat(
        &self,
        system_prompt: &str,
        history: &[Message],
        tools: Option<Vec<serde_json::Value>>,
        attempted: &mut HashSet<usize>,
    ) -> Result<Vec<crate::types::ContentBlock>> {
        if self.entries.is_empty() {
            return Err(Error::config("provider chain is empty"));
        }

        let mut last_error: Option<Error> = None;

        for (idx, entry) in self.entries.iter().enumerate() {
            if attempted.contains(&idx) {
                continue;
            }
            attempted.insert(idx);

            match entry.provider.chat(system_prompt, history, tools.clone()).await {
                Ok(blocks) => return Ok(blocks),
                Err(err) => {
                    self.record_failure(idx);

                    if !self.fallback_active() {
                        return Err(err);
                    }

                    let class = classify::classify(&err);

                    let next_idx = self.entries.iter().enumerate().find_map(|(i, _)| {
                        (!attempted.contains(&i)).then_some(i)
                    });

                    if let (Some(callback), Some(next_idx)) = (&self.on_fallback, next_idx) {
                        callback(&FallbackEvent {
                            from: entry.provider.info(),
                            to: self.entries[next_idx].provider.info(),
                            class,
                            attempt: idx,
                        });
                    }

                    last_error = Some(err);

                    if !self.condition.allows(class) {
                        return Err(last_error.unwrap());
                    }
                    // else: loop continues to the next un-attempted entry.
                }
            }
        }

        Err(Error::chain_exhausted(
            last_error.unwrap_or_else(|| Error::other("no providers configured")),
        ))
    }

    /// Streaming variant; same fallback semantics as [`ProviderChain::chat`].
    pub async fn chat_stream(
        &self,
        system_prompt: &str,
        history: &[Message],
        tools: Option<Vec<serde_json::Value>>,
        attempted: &mut HashSet<usize>,
    ) -> Result<ChatStream> {
        if self.entries.is_empty() {
            return Err(Error::config("provider chain is empty"));
        }

        let mut last_error: Option<Error> = None;

        for (idx, entry) in self.entries.iter().enumerate() {
            if attempted.contains(&idx) {
                continue;
            }
            attempted.insert(idx);

            match entry
                .provider
                .chat_stream(system_prompt, history, tools.clone())
                .await
            {
                Ok(stream) => return Ok(stream),
                Err(err) => {
                    self.record_failure(idx);

                    if !self.fallback_active() {
                        return Err(err);
                    }

                    let class = classify::classify(&err);
                    last_error = Some(err);
                    if !self.condition.allows(class) {
                        return Err(last_error.unwrap());
                    }
                }
            }
        }

        Err(Error::chain_exhausted(
            last_error.unwrap_or_else(|| Error::other("no providers configured")),
        ))
    }

    /// Entries' roles in chain order, for diagnostics.
    pub fn roles(&self) -> Vec<ChainRole> {
        self.entries.iter().map(|e| e.role).collect()
    }
}

impl Default for ProviderChain {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderInfo;
    use crate::types::ContentBlock;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::sync::Arc;

    struct FakeProvider {
        name: &'static str,
        calls: Arc<AtomicUsize>,
        fail_with: Option<Error>,
    }

    #[async_trait]
    impl ChatProvider for FakeProvider {
        async fn chat(
            &self,
            _system_prompt: &str,
            _history: &[Message],
            _tools: Option<Vec<serde_json::Value>>,
        ) -> Result<Vec<ContentBlock>> {
            self.calls.fetch_add(1, AtomicOrdering::SeqCst);
            match &self.fail_with {
                Some(_) => Err(Error::api("simulated failure")),
                None => Ok(vec![ContentBlock::Text(crate::types::TextBlock::new("ok"))]),
            }
        }

        async fn chat_stream(
            &self,
            _system_prompt: &str,
            _history: &[Message],
            _tools: Option<Vec<serde_json::Value>>,
        ) -> Result<ChatStream> {
            unimplemented!("not exercised in these tests")
        }

        async fn health_check(&self) -> Result<()> {
            Ok(())
        }

        fn info(&self) -> ProviderInfo {
            ProviderInfo {
                name: self.name.to_string(),
                kind: crate::provider::ProviderKind::Local,
                base_url: "http://test".to_string(),
                model: "test-model".to_string(),
                features: crate::provider::ProviderFeatures::default(),
            }
        }
    }

    fn failing(name: &'static str, calls: Arc<AtomicUsize>) -> FakeProvider {
        FakeProvider {
            name,
            calls,
            fail_with: Some(Error::api("connection refused")),
        }
    }

    fn succeeding(name: &'static str, calls: Arc<AtomicUsize>) -> FakeProvider {
        FakeProvider {
            name,
            calls,
            fail_with: None,
        }
    }

    #[tokio::test]
    async fn test_chain_succeeds_on_first_provider() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut chain = ProviderChain::new();
        chain.push(Box::new(succeeding("primary", calls.clone())), ChainRole::Main);

        let mut attempted = HashSet::new();
        let result = chain.chat("", &[Message::user("hi")], None, &mut attempted).await;
        assert!(result.is_ok());
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_chain_falls_over_on_network_error() {
        let calls_a = Arc::new(AtomicUsize::new(0));
        let calls_b = Arc::new(AtomicUsize::new(0));
        let mut chain = ProviderChain::new();
        chain.push(Box::new(failing("a", calls_a.clone())), ChainRole::Main);
        chain.push(Box::new(succeeding("b", calls_b.clone())), ChainRole::Fallback);

        let mut attempted = HashSet::new();
        let result = chain.chat("", &[Message::user("hi")], None, &mut attempted).await;
        assert!(result.is_ok());
        assert_eq!(calls_a.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(calls_b.load(AtomicOrdering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_chain_does_not_fall_over_on_client_error() {
        let calls_a = Arc::new(AtomicUsize::new(0));
        let calls_b = Arc::new(AtomicUsize::new(0));
        let mut chain = ProviderChain::new();
        chain.push(
            Box::new(FakeProvider {
                name: "a",
                calls: calls_a.clone(),
                fail_with: Some(Error::api("HTTP 401 Unauthorized")),
            }),
            ChainRole::Main,
        );
        chain.push(Box::new(succeeding("b", calls_b.clone())), ChainRole::Fallback);

        let mut attempted = HashSet::new();
        let result = chain.chat("", &[Message::user("hi")], None, &mut attempted).await;
        assert!(result.is_err());
        assert_eq!(calls_a.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(calls_b.load(AtomicOrdering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_chain_tries_each_provider_at_most_once() {
        let calls_a = Arc::new(AtomicUsize::new(0));
        let calls_b = Arc::new(AtomicUsize::new(0));
        let mut chain = ProviderChain::new();
        chain.push(Box::new(failing("a", calls_a.clone())), ChainRole::Main);
        chain.push(Box::new(failing("b", calls_b.clone())), ChainRole::Fallback);

        let mut attempted = HashSet::new();
        let result = chain.chat("", &[Message::user("hi")], None, &mut attempted).await;
        assert!(matches!(result, Err(Error::ChainExhausted(_))));
        assert_eq!(calls_a.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(calls_b.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(attempted.len(), 2);
    }

    #[tokio::test]
    async fn test_fallback_disabled_surfaces_first_error() {
        let calls_a = Arc::new(AtomicUsize::new(0));
        let calls_b = Arc::new(AtomicUsize::new(0));
        let mut chain = ProviderChain::new().with_fallback_enabled(false);
        chain.push(Box::new(failing("a", calls_a.clone())), ChainRole::Main);
        chain.push(Box::new(succeeding("b", calls_b.clone())), ChainRole::Fallback);

        let mut attempted = HashSet::new();
        let result = chain.chat("", &[Message::user("hi")], None, &mut attempted).await;
        assert!(result.is_err());
        assert_eq!(calls_a.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(calls_b.load(AtomicOrdering::SeqCst), 0);
    }

    #[test]
    fn test_fallback_active_requires_more_than_one_provider() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut chain = ProviderChain::new();
        assert!(!chain.fallback_active());
        chain.push(Box::new(succeeding("a", calls.clone())), ChainRole::Main);
        assert!(!chain.fallback_active());
        chain.push(Box::new(succeeding("b", calls)), ChainRole::Fallback);
        assert!(chain.fallback_active());
        let chain = chain.with_fallback_enabled(false);
        assert!(!chain.fallback_active());
    }

    #[test]
    fn test_default_fallback_condition_matches_truth_table() {
        let cond = FallbackCondition::default();
        assert!(cond.allows(ErrorClass::Network));
        assert!(cond.allows(ErrorClass::Timeout));
        assert!(cond.allows(ErrorClass::ServerError));
        assert!(cond.allows(ErrorClass::ContextWindow));
        assert!(!cond.allows(ErrorClass::RateLimit));
        assert!(!cond.allows(ErrorClass::ClientError));
        assert!(!cond.allows(ErrorClass::Unknown));
    }
}
