//! `taskloop replay` — Run a recorded transcript through the task loop.

use std::path::Path;
use std::sync::Arc;

use taskloop_agent::{TaskDriver, TaskLoop, TaskOutcome};
use taskloop_config::AppConfig;
use taskloop_core::event::TaskEvents;
use taskloop_core::message::{ContentBlock, Message, Role};
use taskloop_providers::ScriptedBackend;
use tokio::sync::broadcast::Receiver;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;

use crate::tools;

pub async fn run(
    config: AppConfig,
    transcript: &Path,
    message: String,
) -> Result<(), Box<dyn std::error::Error>> {
    let backend = Arc::new(ScriptedBackend::from_file(transcript)?);
    let workspace = Arc::new(tools::default_registry(&config.task.completion_tool));

    println!("▶ Replaying {}", transcript.display());
    println!("   Turns: {}", backend.remaining());
    println!();

    let events = TaskEvents::default();
    let printer = tokio::spawn(print_messages(events.subscribe_message_added()));

    let mut task = TaskLoop::new(backend.clone(), workspace, config.task).with_events(events);

    let handle = task.abort_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            handle.abort("Interrupted");
        }
    });

    let result = task.execute(vec![ContentBlock::text(message)]).await;
    // Closing the channels ends the printer
    drop(task);
    printer.await?;

    println!();
    match result? {
        TaskOutcome::Completed {
            result,
            usage,
            tool_usage,
        } => {
            println!("✅ Completed");
            if let Some(result) = result {
                println!("   Result: {result}");
            }
            println!(
                "   Tokens: {} in / {} out",
                usage.input_tokens, usage.output_tokens
            );
            for (tool, count) in &tool_usage {
                println!("   {tool}: {count}×");
            }
        }
        TaskOutcome::Aborted { reason } => {
            println!("⛔ Aborted: {reason}");
        }
    }

    let unused = backend.remaining();
    if unused > 0 {
        tracing::warn!(turns = unused, "Transcript has unplayed turns");
    }

    Ok(())
}

async fn print_messages(messages: Receiver<Message>) {
    let mut stream = BroadcastStream::new(messages);
    while let Some(item) = stream.next().await {
        match item {
            Ok(message) => print_message(&message),
            Err(e) => tracing::warn!(error = %e, "Message printer fell behind"),
        }
    }
}

fn print_message(message: &Message) {
    let speaker = match message.role {
        Role::User => "You",
        Role::Assistant => "Model",
        Role::System => {
            tracing::debug!(chars = message.text().len(), "Context snapshot recorded");
            return;
        }
    };

    for block in &message.content {
        match block {
            ContentBlock::Text { text } => println!("{speaker} > {text}"),
            ContentBlock::Reasoning { text } => println!("{speaker} (thinking) > {text}"),
            ContentBlock::ToolUse { name, input, .. } => println!("{speaker} → {name} {input}"),
            ContentBlock::ToolResult {
                content, is_error, ..
            } => {
                let marker = if *is_error { "✗" } else { "←" };
                println!("{speaker} {marker} {content}");
            }
        }
    }
}
