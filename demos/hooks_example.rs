//! Hooks Example
//!
//! Demonstrates using hooks to monitor and control tool execution during an
//! agent turn. `AgentLoop` fires `PreToolUse` before a tool call runs and
//! `PostToolUse` after it completes; a `PreToolUse` hook returning
//! `continue_execution: false` stops the call from executing at all.

use agent_core::{
    tool, AgentLoop, Backend, ChainRole, HookDecision, Hooks, PermissionManager, ProviderChain,
    Session, ToolCategory,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", "=".repeat(70));
    println!("HOOKS EXAMPLE");
    println!("{}", "=".repeat(70));
    println!();

    // ============================================================================
    // Example: PreToolUse blocks a dangerous tool, PostToolUse logs results
    // ============================================================================
    println!("Registering a delete_file tool guarded by a PreToolUse hook");
    println!("{}", "-".repeat(70));

    let hooks = Hooks::new()
        .add_pre_tool_use(|event| async move {
            if event.tool_name == "delete_file" {
                println!("Hook: blocked call to delete_file ({})", event.tool_input);
                return Some(HookDecision::block("destructive tool calls are disabled"));
            }
            None
        })
        .add_post_tool_use(|event| async move {
            println!(
                "Hook: {} finished with result {}",
                event.tool_name, event.tool_result
            );
            None
        });

    let delete_tool = tool("delete_file", "Delete a file from disk")
        .param("path", "string")
        .build(|args| async move {
            let path = args["path"].as_str().unwrap_or_default();
            Ok(json!({"deleted": path}))
        });

    let provider = agent_core::OpenAICompatibleProvider::new(
        "ollama",
        "http://localhost:11434/v1",
        "",
        "qwen3:8b",
        Backend::Ollama,
    )?;
    let mut chain = ProviderChain::new();
    chain.push(Box::new(provider), ChainRole::Main);

    let mut agent = AgentLoop::new(
        chain,
        Session::new("You are a file management assistant.", 32_000),
        PermissionManager::new(),
        hooks,
    );
    agent.register_tool(delete_tool, ToolCategory::Dangerous);

    println!("\nUser: delete /tmp/scratch.txt");
    match agent
        .run("Delete the file /tmp/scratch.txt", &CancellationToken::new())
        .await
    {
        Ok(outcome) => println!("Turn finished: {:?}", outcome),
        Err(e) => println!("Turn errored: {}", e),
    }

    println!();
    println!("{}", "=".repeat(70));
    println!("Hooks example complete!");
    println!("{}", "=".repeat(70));

    Ok(())
}
