pub mod builtin;
pub mod registry;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::sandbox::Engine;

/// Runtime context passed to tool execution.
pub struct ToolContext {
    /// Shared execution engine (bundle store, environment cache, runner).
    pub engine: Arc<Engine>,
}

/// Tool description in the shape agent frameworks expect
/// (`name`, `description`, `input_schema`).
#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// An operation a calling agent can invoke by name with JSON parameters.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique identifier, lowercase with underscores (e.g. "run_skill_script").
    fn name(&self) -> &str;

    /// Tells the caller when to use this tool.
    fn description(&self) -> &str;

    /// JSON Schema of the accepted parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Runs the tool and returns text for the caller.
    ///
    /// Missing or mistyped parameters are `Err`. Domain failures (unknown
    /// bundle, path escapes, failed scripts) come back as `Ok` text so the
    /// caller can read and react to them.
    async fn execute(
        &self,
        params: serde_json::Value,
        context: &ToolContext,
    ) -> anyhow::Result<String>;

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            input_schema: self.parameters_schema(),
        }
    }
}

pub use registry::ToolRegistry;
