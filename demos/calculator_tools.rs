//! Calculator with Tools Example
//!
//! Demonstrates registering tools with `AgentLoop` so a local model can call
//! them as part of its turn. The loop dispatches tool calls itself; we just
//! read back the final answer.

use agent_core::{
    AgentLoop, AgentOutcome, Backend, ChainRole, ContentBlock, Hooks, PermissionManager,
    ProviderChain, Session, ToolCategory, tool,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let add_tool = tool("add", "Add two numbers")
        .param("a", "number")
        .param("b", "number")
        .build(|args| async move {
            let a = args["a"].as_f64().unwrap_or(0.0);
            let b = args["b"].as_f64().unwrap_or(0.0);
            Ok(json!({"result": a + b}))
        });

    let subtract_tool = tool("subtract", "Subtract two numbers")
        .param("a", "number")
        .param("b", "number")
        .build(|args| async move {
            let a = args["a"].as_f64().unwrap_or(0.0);
            let b = args["b"].as_f64().unwrap_or(0.0);
            Ok(json!({"result": a - b}))
        });

    let multiply_tool = tool("multiply", "Multiply two numbers")
        .param("a", "number")
        .param("b", "number")
        .build(|args| async move {
            let a = args["a"].as_f64().unwrap_or(0.0);
            let b = args["b"].as_f64().unwrap_or(0.0);
            Ok(json!({"result": a * b}))
        });

    let divide_tool = tool("divide", "Divide two numbers")
        .param("a", "number")
        .param("b", "number")
        .build(|args| async move {
            let a = args["a"].as_f64().unwrap_or(0.0);
            let b = args["b"].as_f64().unwrap_or(0.0);
            if b == 0.0 {
                return Ok(json!({"error": "Cannot divide by zero"}));
            }
            Ok(json!({"result": a / b}))
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
        Session::new(
            "You are a helpful calculator assistant. \
             Use the provided tools to perform calculations. \
             Always show your work and explain the result.",
            32_000,
        ),
        PermissionManager::new(),
        Hooks::new(),
    );

    agent.register_tool(add_tool, ToolCategory::Safe);
    agent.register_tool(subtract_tool, ToolCategory::Safe);
    agent.register_tool(multiply_tool, ToolCategory::Safe);
    agent.register_tool(divide_tool, ToolCategory::Safe);

    let queries = vec![
        "What is 25 plus 17?",
        "Calculate 144 divided by 12",
        "What's 7 times 8, then add 5?",
    ];

    println!("{}", "=".repeat(70));
    println!("CALCULATOR TOOLS EXAMPLE");
    println!("{}", "=".repeat(70));
    println!();

    for query in queries {
        println!("User: {}", query);
        println!("{}", "-".repeat(50));

        let outcome = agent.run(query, &CancellationToken::new()).await?;

        match outcome {
            AgentOutcome::Completed(blocks) => {
                for block in blocks {
                    if let ContentBlock::Text(text) = block {
                        if !text.text.trim().is_empty() {
                            println!("Assistant: {}", text.text);
                        }
                    }
                }
            }
            other => println!("Turn did not complete normally: {:?}", other),
        }

        println!();
    }

    println!("{}", "=".repeat(70));
    println!("Example complete!");

    Ok(())
}
