//! `canopy chat`: Send one message into a tree.
//!
//! Assistant text streams to stdout; tool activity goes to stderr. Ctrl+C
//! stops the turn before its next model call.

use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use canopy_agent::{EventSink, RunOptions, TurnEvent, TurnRequest};
use canopy_core::node::ToolCallStatus;
use tokio::sync::mpsc;
use tracing::warn;

use crate::runtime::{CliResult, Runtime, preview};

pub async fn run(
    tree_id: &str,
    message: &str,
    tools: Vec<String>,
    model: Option<String>,
    from: Option<String>,
) -> CliResult {
    let rt = Runtime::load().await?;
    if !rt.config.has_api_key() {
        eprintln!("No API key configured. Set CANOPY_API_KEY or add api_key to");
        eprintln!("  {}", canopy_config::AppConfig::config_dir().join("config.toml").display());
    }

    let mut ws = rt.workspace();
    ws.open_tree(tree_id).await?;
    if let Some(node_id) = from.as_deref() {
        ws.set_active_node(Some(node_id))?;
    }

    let registry = Arc::new(canopy_tools::build_registry(&rt.config.tool_settings()).await);
    let service = rt.chat_service(registry);

    let abort = Arc::new(AtomicBool::new(false));
    let flag = abort.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            flag.store(true, Ordering::SeqCst);
        }
    });

    let (tx, rx) = mpsc::channel(64);
    let printer = tokio::spawn(print_events(rx));

    let mut request = TurnRequest::new(message).with_tools(tools).with_options(RunOptions {
        abort: Some(abort),
        events: EventSink::new(tx),
    });
    if let Some(model) = model {
        request = request.with_model(model);
    }

    let result = service.send(&mut ws, request).await;
    let streamed = printer.await.unwrap_or(false);

    match result {
        Ok(outcome) => {
            if !streamed {
                println!("{}", outcome.assistant_node.content);
            }
            println!();
            eprintln!(
                "[{} step(s), {} context tokens{}]  node {}",
                outcome.steps,
                outcome.context_tokens,
                if outcome.hit_step_limit { ", step limit reached" } else { "" },
                outcome.assistant_node.id
            );
            if let Some(task) = outcome.memory_task {
                if let Err(e) = task.await {
                    warn!(error = %e, "Memory write task failed");
                }
            }
            Ok(())
        }
        Err(failure) => {
            if let Some(node_id) = &failure.user_node_id {
                eprintln!("Your message was saved as node {node_id}, but no reply was produced.");
            }
            Err(failure.into())
        }
    }
}

/// Render turn events as they arrive. Returns whether any assistant text
/// was printed.
async fn print_events(mut rx: mpsc::Receiver<TurnEvent>) -> bool {
    let mut streamed = false;
    let mut stdout = std::io::stdout();
    while let Some(event) = rx.recv().await {
        match event {
            TurnEvent::Delta { delta } => {
                streamed = true;
                print!("{delta}");
                let _ = stdout.flush();
            }
            TurnEvent::ToolCall { call } => {
                eprintln!("\n  -> {} {}", call.name, preview(&call.arguments.to_string(), 80));
            }
            TurnEvent::ToolResult { log } => {
                let status = match log.status {
                    ToolCallStatus::Success => "ok",
                    ToolCallStatus::Error => "error",
                };
                eprintln!("  <- {} {status} ({} ms)", log.tool_name, log.duration_ms);
            }
            TurnEvent::Error { message } => eprintln!("\n  error: {message}"),
            TurnEvent::StepStarted { .. } | TurnEvent::Done { .. } => {}
        }
    }
    streamed
}
