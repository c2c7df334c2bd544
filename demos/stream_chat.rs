//! Streams one answer from the chat backend, printing reasoning as it arrives.
//!
//! ```text
//! CHAT_EXCHANGE_BASE_URL=http://localhost:5001/api \
//! CHAT_EXCHANGE_AUTH_TOKEN=... \
//! RUST_LOG=chat_exchange=debug \
//!     cargo run --example stream_chat -- "Why is the sky blue?"
//! ```
//!
//! Press Ctrl-C while the answer is streaming to cancel the exchange.

use chat_exchange::{ExchangeConfig, ExchangeEvent, ExchangeManager, ExchangeOptions};
use futures::StreamExt;
use std::io::Write;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let query = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    let query = if query.trim().is_empty() {
        "Why is the sky blue?".to_string()
    } else {
        query
    };

    let manager = ExchangeManager::http(ExchangeConfig::from_env()?)?;
    let session = "demo-session";

    // Print reasoning deltas as they arrive
    let mut events = Box::pin(manager.event_stream());
    let printer = tokio::spawn(async move {
        while let Some(event) = events.next().await {
            match event {
                ExchangeEvent::PlaceholderCreated { .. } => println!("Thinking..."),
                ExchangeEvent::ReasoningDelta { delta, .. } => {
                    print!("{}", delta);
                    let _ = std::io::stdout().flush();
                }
                ExchangeEvent::Completed { .. } => {
                    println!();
                    break;
                }
            }
        }
    });

    let canceller = manager.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            canceller.cancel(session);
        }
    });

    let options = ExchangeOptions::new().with_reasoning_trace(true);
    let outcome = manager.submit(session, &query, options).await?;
    let _ = printer.await;

    println!("[{:?}] {}", outcome.state, outcome.message.text);
    if let Some(references) = &outcome.message.references {
        for reference in references {
            println!("  [{}] {}", reference.index, reference.source);
        }
    }
    if let Some(error) = &outcome.error {
        eprintln!("underlying error: {}", error);
    }

    Ok(())
}
