//! Context Management Examples
//!
//! This demonstrates manual history management patterns using the context
//! utilities. These are opt-in helpers (`estimate_tokens`, `truncate_messages`,
//! `is_approaching_limit`) — nothing truncates automatically. You decide when
//! and how to manage history based on your domain-specific needs.
//!
//! Patterns demonstrated:
//! 1. Estimating token usage for a history
//! 2. Manual truncation at natural breakpoints
//! 3. Token budget monitoring with periodic checks

use agent_core::{estimate_tokens, is_approaching_limit, truncate_messages, Message};

fn main() {
    println!("{}", "=".repeat(70));
    println!("CONTEXT MANAGEMENT EXAMPLES");
    println!("{}", "=".repeat(70));
    println!();

    pattern_1_token_estimation();
    pattern_2_manual_truncation();
    pattern_3_token_monitoring();
}

// ============================================================================
// Pattern 1: Token Estimation
// ============================================================================

fn pattern_1_token_estimation() {
    println!("=== Pattern 1: Token Estimation ===");
    println!();

    let history = vec![
        Message::system("You are a helpful assistant"),
        Message::user("Explain Rust ownership in one paragraph"),
    ];

    let tokens = estimate_tokens(&history);
    println!("History: {} messages", history.len());
    println!("Estimated tokens: {}", tokens);

    println!();
    println!("{}", "-".repeat(70));
    println!();
}

// ============================================================================
// Pattern 2: Manual Truncation at Natural Breakpoints
// ============================================================================
// Best for: Multi-turn conversations with clear task boundaries

fn pattern_2_manual_truncation() {
    println!("=== Pattern 2: Manual Truncation ===");
    println!("Best for: Multi-turn conversations with task boundaries");
    println!();

    let history = vec![
        Message::system("You are a helpful coding assistant"),
        Message::user("Analyze this: def add(a, b): return a + b"),
        Message::user("Write unit tests for the add function"),
        Message::user("Now refactor it to use type hints"),
        Message::user("Add docstrings too"),
    ];

    println!("Before truncation: {} messages", history.len());

    let truncated = truncate_messages(&history, 2, true);
    println!(
        "After truncation (keep last 2 + system): {} messages",
        truncated.len()
    );

    println!();
    println!("{}", "-".repeat(70));
    println!();
}

// ============================================================================
// Pattern 3: Token Budget Monitoring
// ============================================================================
// Best for: Long-running conversations with token limits

fn pattern_3_token_monitoring() {
    println!("=== Pattern 3: Token Budget Monitoring ===");
    println!("Best for: Long-running conversations with token limits");
    println!();

    let mut history = vec![Message::system("You are a helpful assistant")];

    let interactions = [
        "What is Rust?",
        "Explain ownership",
        "What are lifetimes?",
        "How do traits work?",
        "Explain async/await",
    ];

    let token_limit = 1000; // Example limit (much lower for demo)
    let margin = 0.8; // 80% threshold

    for (i, prompt) in interactions.iter().enumerate() {
        history.push(Message::user(*prompt));

        println!("Interaction {}: {}", i + 1, prompt);
        println!("  Current tokens: {}", estimate_tokens(&history));

        if is_approaching_limit(&history, token_limit, margin) {
            println!("  Approaching token limit! Truncating...");
            history = truncate_messages(&history, 3, true);
            println!("  After truncation: {} tokens", estimate_tokens(&history));
        }

        println!();
    }

    println!("Final history size: {} messages", history.len());
    println!("Final token count: {}", estimate_tokens(&history));

    println!();
    println!("{}", "-".repeat(70));
    println!();
}
