use std::sync::Arc;

use anyhow::{Context, Result};

use crate::agent::{LoopSettings, Orchestrator};
use crate::config::TriageConfig;
use crate::llm_client::LlmClient;
use crate::model::ModelCaller;
use crate::tools::invoker::HttpToolInvoker;
use crate::tools::ToolInvoker;

/// Long-lived backend state shared by every request.
pub struct BackendRuntime {
    pub config: TriageConfig,
    pub orchestrator: Orchestrator,
}

impl BackendRuntime {
    /// Wire the OpenAI-compatible model client and the pooled tool-server
    /// client from config.
    pub fn bootstrap(config: TriageConfig) -> Result<Self> {
        let model = LlmClient::from_config(&config).context("Failed to build model client")?;
        let tools =
            HttpToolInvoker::from_config(&config).context("Failed to build tool server client")?;

        tracing::info!(
            "Model {} at {} (tool calls: {}), tools at {}, max {} turn(s)",
            model.model(),
            config.llm_api_url,
            config.supports_tool_calls,
            tools.endpoint(),
            config.max_turns
        );

        Ok(Self::with_collaborators(
            config,
            Arc::new(model),
            Arc::new(tools),
        ))
    }

    /// Same as [`BackendRuntime::bootstrap`] with caller-supplied backends.
    pub fn with_collaborators(
        config: TriageConfig,
        model: Arc<dyn ModelCaller>,
        tools: Arc<dyn ToolInvoker>,
    ) -> Self {
        let orchestrator = Orchestrator::new(model, tools, LoopSettings::from_config(&config));
        Self {
            config,
            orchestrator,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_applies_config_to_loop_settings() {
        let config = TriageConfig {
            max_turns: 3,
            supports_tool_calls: false,
            ..TriageConfig::default()
        };
        let runtime = BackendRuntime::bootstrap(config).unwrap();
        let settings = runtime.orchestrator.settings();
        assert_eq!(settings.max_turns, 3);
        assert!(!settings.supports_tool_calls);
        assert!(settings.directive_channel());
    }
}
