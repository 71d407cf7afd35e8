//! # Open Agent SDK - Rust Implementation
//!
//! A production-ready, streaming-first Rust SDK for building AI agents with local OpenAI-compatible servers.
//!
//! ## Overview
//!
//! This SDK provides a clean, ergonomic API for working with local LLM servers such as:
//! - LM Studio
//! - Ollama
//! - llama.cpp
//! - vLLM
//!
//! ## Key Features
//!
//! - **Zero API Costs**: Run models on your own hardware
//! - **Privacy-First**: All data stays local on your machine
//! - **High Performance**: Native async/await with Tokio runtime
//! - **Streaming Responses**: Real-time token-by-token streaming
//! - **Tool Calling**: Define and execute tools with automatic schema generation
//! - **Lifecycle Hooks**: Intercept and control execution at key points
//! - **Interrupts**: Gracefully cancel long-running operations
//! - **Context Management**: Manual token estimation and history truncation
//! - **Retry Logic**: Exponential backoff with jitter for reliability
//!
//! ## Driving a Turn
//!
//! A [`Session`] holds the append-only conversation log; an [`AgentLoop`]
//! ties it to a [`ProviderChain`], a tool registry, and a
//! [`PermissionManager`] and drives one full ReAct turn per [`AgentLoop::run`]
//! call:
//!
//! ```rust,no_run
//! use agent_core::{AgentLoop, OpenAICompatibleProvider, Backend, ProviderChain, ChainRole, Session, PermissionManager, Hooks};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let provider = OpenAICompatibleProvider::new(
//!         "lmstudio",
//!         "http://localhost:1234/v1",
//!         "",
//!         "qwen2.5-32b-instruct",
//!         Backend::LmStudio,
//!     )?;
//!     let mut chain = ProviderChain::new();
//!     chain.push(Box::new(provider), ChainRole::Main);
//!
//!     let session = Session::new("You are a helpful assistant", 32_000);
//!     let agent = AgentLoop::new(chain, session, PermissionManager::new(), Hooks::new());
//!
//!     let cancel = CancellationToken::new();
//!     let outcome = agent.run("What's the capital of France?", &cancel).await?;
//!     println!("{outcome:?}");
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! The SDK is organized into several modules, each with a specific responsibility:
//!
//! - **types**: Data structures for messages, content blocks, and configuration
//! - **tools**: Tool definition system with automatic JSON schema generation
//! - **hooks**: Lifecycle event system for intercepting execution
//! - **config**: Provider-specific configuration helpers
//! - **error**: Comprehensive error types and conversions
//! - **context**: Token estimation and message truncation utilities
//! - **retry**: Exponential backoff retry logic with jitter
//! - **utils**: Internal utilities for SSE parsing and tool aggregation
//! - **classify**: Pure error classification used to drive provider fallback
//! - **codec**: Wire-level request/response encoding and JSON salvage
//! - **provider**: Backend drivers (Ollama, LM Studio, cloud, OpenRouter) behind one trait
//! - **chain**: Ordered provider fallback with a per-error-class retry policy
//! - **permission**: Tool permission evaluation and filesystem path validation
//! - **external_tool**: JSON-RPC-over-stdio client/manager for external tool servers
//! - **session**: Append-only conversation log with token accounting and compaction
//! - **agent**: The ReAct loop tying session, chain, tools, and permissions together
//! - **extractor**: Fallback recovery of tool calls from plain-text model output
//! - **reference_tools**: read_file/write_file/glob/grep/bash reference tool set

// ============================================================================
// MODULE DECLARATIONS
// ============================================================================
// These modules are private (internal implementation details) unless explicitly
// re-exported through `pub use` statements below.

/// Pure error classification used by the provider chain to decide whether a
/// failure should trigger fallback to the next provider.
mod classify;

/// Provider configuration helpers for LM Studio, Ollama, llama.cpp, and vLLM.
/// Simplifies endpoint and model name resolution with environment variable support.
mod config;

/// Context window management utilities for token estimation and history truncation.
/// Provides manual control over conversation memory to prevent context overflow.
mod context;

/// Wire-level request/response encoding, JSON salvage, and argument normalization
/// shared by every provider driver.
mod codec;

/// Error types and conversions for comprehensive error handling throughout the SDK.
/// Defines the `Error` enum and `Result<T>` type alias used across all public APIs.
mod error;

/// Backend drivers (Ollama, LM Studio, OpenAI-compatible cloud, OpenRouter) behind
/// a single `Provider` trait.
mod provider;

/// Ordered provider fallback chain with per-class retry policy.
mod chain;

/// Tool permission evaluation, persisted allow/deny rules, and filesystem path
/// validation.
mod permission;

/// JSON-RPC-over-stdio client and manager for external (MCP-style) tool servers.
mod external_tool;

/// Append-only conversation session with token accounting and compaction.
mod session;

/// The ReAct agent loop tying session, chain, tools, and permissions together.
mod agent;

/// Best-effort extraction of tool calls from plain-text model output when the
/// provider does not support native tool calling.
mod extractor;

/// The reference `read_file`/`write_file`/`glob`/`grep`/`bash` tool set, built
/// on the same `Tool`/`ToolBuilder` machinery any caller uses for their own
/// tools.
mod reference_tools;

/// Lifecycle hooks system for intercepting and controlling execution at key points.
/// Enables security gates, audit logging, input/output modification, and compliance checks.
mod hooks;

/// Tool definition and execution system with automatic JSON schema generation.
/// Allows LLMs to call Rust functions with type-safe parameter handling.
mod tools;

/// Core type definitions for messages, content blocks, and agent configuration.
/// Includes builder patterns for ergonomic configuration and OpenAI API serialization.
mod types;

/// Internal utilities for Server-Sent Events (SSE) parsing and tool call aggregation.
/// Handles the low-level details of streaming response parsing.
mod utils;

// ============================================================================
// PUBLIC EXPORTS
// ============================================================================
// These items form the public API of the SDK. Everything else is internal.

/// Retry utilities with exponential backoff and jitter.
/// Made public as a module so users can access retry configuration and functions
/// for their own operations that need retry logic.
pub mod retry;

// --- Provider Configuration ---

pub use config::{Provider, get_base_url, get_model};

// --- Error Classification & Provider Chain ---

pub use chain::{ChainRole, FallbackCondition, FallbackEvent, ProviderChain};
pub use classify::{ErrorClass, classify};
pub use provider::{
    Backend, ChatProvider, ChatStream, CloudProviderDef, ModelInfo, OpenAICompatibleProvider,
    ProviderFeatures, ProviderInfo, ProviderKind, cloud_provider_by_name,
};

// --- Tool Permissions ---

pub use permission::{PathValidator, PermissionDecision, PermissionManager, PermissionRule, ToolCategory};

// --- Fallback Tool-Call Extraction ---

pub use extractor::extract_tool_calls;

// --- External Tool Servers ---

pub use external_tool::{
    ExternalServerConfig, ExternalToolClient, ExternalToolManager, ExternalToolSchema,
    ExternalToolsConfig,
};

// --- Session ---

pub use session::Session;

// --- Reference Tool Set ---

pub use reference_tools::{
    bash_tool, category_for, glob_tool, grep_tool, read_file_tool, reference_tools, write_file_tool,
};

// --- Agent Loop ---

pub use agent::{AgentLoop, AgentOutcome, DenyAllPrompt, PermissionPrompt, PromptResponse, ToolImportance};

// --- Context Management ---

pub use context::{estimate_tokens, is_approaching_limit, truncate_messages};

// --- Error Handling ---

pub use error::{Error, Result};

// --- Lifecycle Hooks ---

pub use hooks::{
    HOOK_POST_TOOL_USE, HOOK_PRE_TOOL_USE, HOOK_USER_PROMPT_SUBMIT, HookDecision, Hooks,
    PostToolUseEvent, PreToolUseEvent, UserPromptSubmitEvent,
};

// --- Tool System ---

pub use tools::{Tool, ToolBuilder, tool};

// --- Core Types ---

pub use types::{
    AgentOptions, AgentOptionsBuilder, ContentBlock, Message, MessageRole, TextBlock,
    ToolResultBlock, ToolUseBlock,
};

// ============================================================================
// CONVENIENCE PRELUDE
// ============================================================================

/// Convenience module containing the most commonly used types and functions.
/// Import with `use agent_core::prelude::*;` to get everything you need for typical usage.
///
/// This includes:
/// - Configuration: AgentOptions, AgentOptionsBuilder
/// - Agent loop: AgentLoop, AgentOutcome, Session, ProviderChain
/// - Content: ContentBlock, TextBlock, ToolUseBlock
/// - Tools: Tool, tool()
/// - Hooks: Hooks, HookDecision, hook event types
/// - Errors: Error, Result
pub mod prelude {
    pub use crate::{
        AgentLoop, AgentOptions, AgentOptionsBuilder, AgentOutcome, ChatProvider, ContentBlock,
        Error, HookDecision, Hooks, PermissionManager, PostToolUseEvent, PreToolUseEvent,
        ProviderChain, Result, Session, TextBlock, Tool, ToolUseBlock, UserPromptSubmitEvent, tool,
    };
}
