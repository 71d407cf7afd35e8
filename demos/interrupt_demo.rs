//! Interrupt Capability Demo
//!
//! This example demonstrates how to cancel an in-flight agent turn using a
//! `CancellationToken`:
//!
//! 1. Timeout-based cancellation
//! 2. Concurrent cancellation (simulated cancel button)
//! 3. Cancel and retry with a more specific prompt
//!
//! Note: This example uses Ollama. Make sure Ollama is running at
//! http://localhost:11434 with a model loaded before running.

use agent_core::{AgentLoop, AgentOutcome, Backend, ChainRole, Hooks, PermissionManager, ProviderChain, Session};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn build_agent() -> Result<AgentLoop, Box<dyn std::error::Error>> {
    let provider = agent_core::OpenAICompatibleProvider::new(
        "ollama",
        "http://localhost:11434/v1",
        "",
        "qwen3:8b",
        Backend::Ollama,
    )?;
    let mut chain = ProviderChain::new();
    chain.push(Box::new(provider), ChainRole::Main);

    Ok(AgentLoop::new(
        chain,
        Session::new(
            "You are a helpful assistant. Be verbose in your responses.",
            32_000,
        ),
        PermissionManager::new(),
        Hooks::new(),
    ))
}

// ============================================================================
// Example 1: Timeout-based Cancellation
// ============================================================================
async fn timeout_example() -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", "=".repeat(60));
    println!("Example 1: Timeout-based Cancellation");
    println!("{}", "=".repeat(60));
    println!();

    let agent = build_agent()?;
    let cancel = CancellationToken::new();

    let cancel_clone = cancel.clone();
    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(3)).await;
        cancel_clone.cancel();
    });

    println!("Starting turn (will be cancelled after 3 seconds)...\n");

    match agent
        .run(
            "Write a detailed 1000-word essay about quantum computing",
            &cancel,
        )
        .await
    {
        Ok(outcome) => println!("Turn completed before the timeout: {:?}", outcome),
        Err(e) => println!("Turn was interrupted: {}", e),
    }

    let _ = canceller.await;
    println!();

    Ok(())
}

// ============================================================================
// Example 2: Concurrent Cancellation (Simulated Cancel Button)
// ============================================================================
async fn concurrent_example() -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", "=".repeat(60));
    println!("Example 2: Concurrent Cancellation (Simulated User Cancel)");
    println!("{}", "=".repeat(60));
    println!();

    let agent = build_agent()?;
    let cancel = CancellationToken::new();

    let cancel_button = {
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            println!("User clicked cancel button!");
            cancel_clone.cancel();
        })
    };

    println!("Starting turn...\n");
    match agent
        .run("Explain artificial intelligence in detail", &cancel)
        .await
    {
        Ok(outcome) => println!("Turn completed before cancellation: {:?}", outcome),
        Err(e) => println!("Turn was interrupted: {}", e),
    }

    let _ = cancel_button.await;
    println!();

    Ok(())
}

// ============================================================================
// Example 3: Cancel and Retry
// ============================================================================
async fn retry_example() -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", "=".repeat(60));
    println!("Example 3: Cancel and Retry");
    println!("{}", "=".repeat(60));
    println!();

    let agent = build_agent()?;

    // First turn - cancelled almost immediately to simulate a bad prompt.
    println!("First turn (will be cancelled)...\n");
    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel_clone.cancel();
    });

    match agent
        .run("Tell me everything about the history of computing", &cancel)
        .await
    {
        Ok(AgentOutcome::Completed(_)) => println!("First turn unexpectedly completed"),
        _ => println!("First turn cancelled as expected.\n"),
    }

    // Retry with a more specific prompt, no cancellation this time.
    println!("Retrying with a more specific prompt...\n");
    match agent
        .run(
            "Tell me about Alan Turing in 2 sentences",
            &CancellationToken::new(),
        )
        .await
    {
        Ok(outcome) => println!("Success! Turn completed after retry: {:?}", outcome),
        Err(e) => println!("Retry failed: {}", e),
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("\n{}", "=".repeat(60));
    println!("INTERRUPT CAPABILITY DEMO");
    println!("{}", "=".repeat(60));
    println!();

    println!("This demo requires Ollama running at http://localhost:11434");
    println!("with a model loaded (e.g., qwen3:8b)\n");

    println!("Running examples...\n");

    if let Err(e) = timeout_example().await {
        eprintln!("Timeout example error: {}", e);
    }
    tokio::time::sleep(Duration::from_secs(1)).await;

    if let Err(e) = concurrent_example().await {
        eprintln!("Concurrent example error: {}", e);
    }
    tokio::time::sleep(Duration::from_secs(1)).await;

    if let Err(e) = retry_example().await {
        eprintln!("Retry example error: {}", e);
    }

    println!("{}", "=".repeat(60));
    println!("All examples completed!");
    println!("{}", "=".repeat(60));

    Ok(())
}
