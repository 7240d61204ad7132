//! Tool registry: name lookup and definitions for callers.

use tracing::{debug, warn};

use super::builtin::{ExecuteCodeTool, ListEnvKeysTool, ListScriptsTool, RunScriptTool};
use super::{Tool, ToolDefinition};

/// Ordered set of tools, unique by name.
pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: Vec::new() }
    }

    /// Registry holding every builtin tool.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(RunScriptTool));
        registry.register(Box::new(ExecuteCodeTool));
        registry.register(Box::new(ListEnvKeysTool));
        registry.register(Box::new(ListScriptsTool));
        registry
    }

    /// Adds a tool; a tool with the same name is replaced.
    pub fn register(&mut self, tool: Box<dyn Tool>) {
        if let Some(pos) = self.tools.iter().position(|t| t.name() == tool.name()) {
            warn!("Tool '{}' registered twice, replacing", tool.name());
            self.tools[pos] = tool;
        } else {
            debug!("Registered tool '{}'", tool.name());
            self.tools.push(tool);
        }
    }

    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools
            .iter()
            .find(|t| t.name() == name)
            .map(|t| t.as_ref())
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    pub fn tool_definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|t| t.definition()).collect()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::ToolContext;
    use async_trait::async_trait;
    use serde_json::{json, Value};

    struct EchoTool(&'static str);

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            self.0
        }

        fn parameters_schema(&self) -> Value {
            json!({"type": "object"})
        }

        async fn execute(&self, params: Value, _context: &ToolContext) -> anyhow::Result<String> {
            Ok(params.to_string())
        }
    }

    #[test]
    fn test_empty_registry() {
        let registry = ToolRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.get("echo").is_none());
        assert!(registry.tool_definitions().is_empty());
    }

    #[test]
    fn test_builtins_registered_in_order() {
        let registry = ToolRegistry::with_builtins();
        assert_eq!(
            registry.names(),
            vec![
                "run_skill_script",
                "execute_python_code",
                "list_skill_env_keys",
                "list_skill_scripts"
            ]
        );
        assert_eq!(registry.len(), 4);
    }

    #[test]
    fn test_register_replaces_same_name() {
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(EchoTool("first")));
        registry.register(Box::new(EchoTool("second")));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("echo").unwrap().description(), "second");
    }

    #[test]
    fn test_tool_definitions_shape() {
        let registry = ToolRegistry::with_builtins();
        let defs = registry.tool_definitions();
        for def in &defs {
            assert!(!def.description.is_empty());
            assert_eq!(def.input_schema["type"], "object");
        }
        let json = serde_json::to_value(&defs[0]).unwrap();
        assert_eq!(json["name"], "run_skill_script");
        assert!(json["input_schema"]["required"].is_array());
    }
}
