//! CLI entry points for the codescout binary.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::json;

use crate::agent::orchestrator::Orchestrator;
use crate::agent::storage::SessionStorage;
use crate::agent::tools::{ListDirTool, ReadFileTool, RipgrepTool, ThinkTool, ToolRegistry};
use crate::bus::events::{AgentEvent, EventBus};
use crate::config::loader;
use crate::config::schema::Config;
use crate::providers::factory;
use crate::utils::helpers;

fn storage_base(config: &Config) -> PathBuf {
    match &config.storage.base_dir {
        Some(dir) => helpers::expand_tilde(dir),
        None => helpers::get_data_path(),
    }
}

/// Run a query through the orchestrator. Returns the process exit code.
pub async fn run_ask(query: &str, dir: &str, json_output: bool, max_iterations: Option<u32>) -> i32 {
    let mut config = loader::load_config(None);
    if let Ok(key) = std::env::var("CODESCOUT_API_KEY") {
        if !key.is_empty() {
            config.provider.api_key = key;
        }
    }
    if let Some(n) = max_iterations {
        config.agent.max_iterations = n;
    }

    let working_dir = match std::fs::canonicalize(dir) {
        Ok(d) => d,
        Err(e) => {
            eprintln!("无法访问目录 {}: {}", dir, e);
            return 1;
        }
    };

    let bus = Arc::new(EventBus::new());
    if json_output {
        bus.set_buffering(true);
    } else {
        bus.subscribe(progress_printer);
    }

    let storage = match SessionStorage::new(storage_base(&config)) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("存储初始化失败: {}", e);
            return 1;
        }
    };

    let client = factory::create_client(&config.provider);
    let mut registry =
        ToolRegistry::with_filters(&config.tools.enabled_tools, &config.tools.disabled_tools);
    registry.register(Arc::new(ReadFileTool));
    registry.register(Arc::new(ListDirTool));
    registry.register(Arc::new(RipgrepTool::default()));
    registry.register(Arc::new(ThinkTool));

    let mut orchestrator = Orchestrator::new(
        client,
        Arc::new(registry),
        bus.clone(),
        &config,
        storage,
        working_dir,
    );

    // Ctrl-C aborts the run at its next suspension point.
    let cancel = orchestrator.cancellation_token();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        cancel.cancel();
    });

    let outcome = orchestrator.run(query).await;

    if json_output {
        let doc = json!({
            "success": outcome.success,
            "result": outcome.result,
            "iterations": outcome.iterations,
            "totalTokensUsed": outcome.total_tokens_used,
            "error": outcome.error,
            "events": bus.drain(),
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&doc).unwrap_or_else(|_| "{}".to_string())
        );
    } else if outcome.success {
        println!("{}", outcome.result);
    } else {
        eprintln!(
            "调查失败: {}",
            outcome.error.as_deref().unwrap_or("unknown error")
        );
    }

    if outcome.success {
        0
    } else {
        1
    }
}

/// Stderr progress lines for interactive runs.
fn progress_printer(event: &AgentEvent) {
    match event {
        AgentEvent::PhaseStart { phase } => eprintln!("[{}]", phase),
        AgentEvent::IterationStart {
            iteration,
            max_iterations,
            ..
        } => eprintln!("  iteration {}/{}", iteration, max_iterations),
        AgentEvent::ToolCall { name, arguments } => {
            let preview: String = arguments.to_string().chars().take(80).collect();
            eprintln!("  → {} {}", name, preview);
        }
        AgentEvent::ToolResult {
            name, duration_ms, ..
        } => eprintln!("  ← {} ({}ms)", name, duration_ms),
        AgentEvent::Compression {
            messages_compressed,
            tokens_freed,
            ..
        } => eprintln!(
            "  [压缩] {} 条消息，释放约 {} tokens",
            messages_compressed, tokens_freed
        ),
        AgentEvent::MessagesDiscarded { count, .. } => {
            eprintln!("  [丢弃] {} 条最旧消息", count)
        }
        AgentEvent::Error { error, .. } => eprintln!("  [错误] {}", error),
        _ => {}
    }
}

/// List stored sessions, newest first. Returns the process exit code.
pub fn run_sessions() -> i32 {
    let config = loader::load_config(None);
    let storage = match SessionStorage::new(storage_base(&config)) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("存储初始化失败: {}", e);
            return 1;
        }
    };

    let sessions = storage.list_sessions();
    if sessions.is_empty() {
        println!("没有已保存的会话");
        return 0;
    }
    for session in sessions {
        println!(
            "{}  {}  {}",
            session.id,
            session.started_at,
            helpers::truncate_string(&session.query, 60)
        );
    }
    0
}

/// Print the effective configuration. Returns the process exit code.
pub fn run_config() -> i32 {
    let config = loader::load_config(None);
    match serde_json::to_string_pretty(&config) {
        Ok(text) => {
            println!("{}", text);
            0
        }
        Err(e) => {
            eprintln!("无法序列化配置: {}", e);
            1
        }
    }
}
