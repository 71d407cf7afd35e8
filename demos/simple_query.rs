//! Simple query example
//!
//! Demonstrates driving a single agent turn end to end: one provider, no
//! tools, just a question and a final answer.

use agent_core::{
    AgentLoop, AgentOutcome, Backend, ChainRole, ContentBlock, Hooks, PermissionManager,
    ProviderChain, Session,
};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let provider =
        agent_core::OpenAICompatibleProvider::new("ollama", "http://localhost:11434/v1", "", "qwen3:8b", Backend::Ollama)?;

    let mut chain = ProviderChain::new();
    chain.push(Box::new(provider), ChainRole::Main);

    let agent = AgentLoop::new(
        chain,
        Session::new("You are a helpful assistant", 32_000),
        PermissionManager::new(),
        Hooks::new(),
    );

    println!("Sending query to model...\n");

    let outcome = agent
        .run(
            "What's the capital of France? Please be brief.",
            &CancellationToken::new(),
        )
        .await?;

    match outcome {
        AgentOutcome::Completed(blocks) => {
            print!("Response: ");
            for block in blocks {
                if let ContentBlock::Text(text) = block {
                    print!("{}", text.text);
                }
            }
            println!();
        }
        other => println!("Query did not complete normally: {:?}", other),
    }

    println!("\nQuery complete!");

    Ok(())
}
