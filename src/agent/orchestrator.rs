//! The orchestrator: Investigator → Synthesizer, with aggregated totals.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::agent::context::ContextManager;
use crate::agent::decision::Decision;
use crate::agent::investigator::Investigator;
use crate::agent::storage::SessionStorage;
use crate::agent::synthesizer::Synthesizer;
use crate::agent::tools::ToolRegistry;
use crate::bus::events::{AgentEvent, EventBus};
use crate::config::schema::Config;
use crate::providers::base::LLMClient;

/// Terminal result of a full run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOutcome {
    pub success: bool,
    pub result: String,
    pub iterations: u32,
    pub total_tokens_used: u64,
    pub decisions: Vec<Decision>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Two-phase pipeline over a single session.
pub struct Orchestrator {
    investigator: Investigator,
    synthesizer: Synthesizer,
    ctx: ContextManager,
    bus: Arc<EventBus>,
    working_dir: PathBuf,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        client: Arc<dyn LLMClient>,
        registry: Arc<ToolRegistry>,
        bus: Arc<EventBus>,
        config: &Config,
        storage: SessionStorage,
        working_dir: PathBuf,
    ) -> Self {
        let cancel = CancellationToken::new();
        let ctx = ContextManager::new(storage, config.budget.clone(), bus.clone());
        let investigator = Investigator::new(
            client.clone(),
            registry,
            bus.clone(),
            config.agent.clone(),
            cancel.clone(),
        )
        .with_sampling(config.provider.max_tokens, config.provider.temperature);
        let synthesizer = Synthesizer::new(client, bus.clone())
            .with_sampling(config.provider.max_tokens, config.provider.temperature);

        Self {
            investigator,
            synthesizer,
            ctx,
            bus,
            working_dir,
            cancel,
        }
    }

    /// Cancellation signal for this run. `cancel()` aborts the loop at its
    /// next suspension point.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn abort(&self) {
        self.cancel.cancel();
    }

    /// The session conversation, for inspection after a run.
    pub fn context(&self) -> &ContextManager {
        &self.ctx
    }

    /// Run the full pipeline. Never panics: all failures come back in the
    /// outcome.
    pub async fn run(&mut self, query: &str) -> RunOutcome {
        self.bus.emit(AgentEvent::OrchestratorStart {
            query: query.to_string(),
        });
        self.bus.emit(AgentEvent::PhaseStart {
            phase: "investigation".to_string(),
        });

        // Storage init failure is one of the few genuinely fatal errors.
        if let Err(e) = self.ctx.init_session(query, &self.working_dir) {
            let error = e.to_string();
            self.bus.emit(AgentEvent::OrchestratorError {
                error: error.clone(),
            });
            return RunOutcome {
                success: false,
                result: String::new(),
                iterations: 0,
                total_tokens_used: 0,
                decisions: Vec::new(),
                error: Some(error),
            };
        }

        let investigation = self.investigator.run(query, &mut self.ctx).await;

        if !investigation.success {
            let error = if self.cancel.is_cancelled() {
                "Aborted".to_string()
            } else {
                investigation
                    .error
                    .unwrap_or_else(|| "investigation failed".to_string())
            };
            self.bus.emit(AgentEvent::OrchestratorError {
                error: error.clone(),
            });
            return RunOutcome {
                success: false,
                result: String::new(),
                iterations: investigation.iterations,
                total_tokens_used: investigation.total_tokens,
                decisions: investigation.decisions,
                error: Some(error),
            };
        }

        self.bus.emit(AgentEvent::PhaseEnd {
            phase: "investigation".to_string(),
            detail: json!({
                "iterations": investigation.iterations,
                "tokensUsed": investigation.total_tokens,
            }),
        });
        self.bus.emit(AgentEvent::PhaseStart {
            phase: "synthesis".to_string(),
        });

        let synthesis_input = self.ctx.messages_for_synthesis();
        let mut total_tokens_used = investigation.total_tokens;

        // Synthesis failure is not fatal: fall back to the raw findings.
        let result = match self
            .synthesizer
            .run(query, &synthesis_input, &investigation.key_files, &mut self.ctx)
            .await
        {
            Ok(output) => {
                total_tokens_used += output.tokens_used;
                output.report
            }
            Err(e) => {
                warn!("synthesis failed, returning raw findings: {}", e);
                investigation.findings.clone()
            }
        };

        self.bus.emit(AgentEvent::PhaseEnd {
            phase: "synthesis".to_string(),
            detail: serde_json::Value::Null,
        });

        if let Err(e) = self.ctx.save() {
            warn!("failed to persist final session state: {}", e);
        }

        self.bus.emit(AgentEvent::OrchestratorComplete {
            iterations: investigation.iterations,
            total_tokens_used,
        });
        self.bus.emit(AgentEvent::Done {
            result: result.clone(),
        });

        RunOutcome {
            success: true,
            result,
            iterations: investigation.iterations,
            total_tokens_used,
            decisions: investigation.decisions,
            error: None,
        }
    }
}
