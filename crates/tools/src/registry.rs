use std::collections::HashMap;
use std::sync::Arc;

use hb_domain::ToolDef;

use crate::tool::{tool_def, Tool};

/// Central registry holding a session's available tools.
/// Built once from the agent config; immutable afterwards.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_owned(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Definitions for every registered tool, sorted by name so request
    /// payloads are stable across runs.
    pub fn defs(&self) -> Vec<ToolDef> {
        let mut defs: Vec<ToolDef> = self.tools.values().map(|t| tool_def(t.as_ref())).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::tool::{RiskLevel, ToolContext, ToolResult};
    use hb_domain::Result;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn label(&self) -> &str {
            "Echo back the given text"
        }
        fn category(&self) -> &str {
            "debug"
        }
        fn risk(&self) -> RiskLevel {
            RiskLevel::Low
        }
        fn parameters(&self) -> serde_json::Value {
            json!({ "type": "object", "properties": { "text": { "type": "string" } } })
        }
        async fn execute(
            &self,
            _call_id: &str,
            input: serde_json::Value,
            _ctx: &ToolContext,
        ) -> Result<ToolResult> {
            Ok(ToolResult::ok(
                input["text"].as_str().unwrap_or_default().to_owned(),
            ))
        }
    }

    #[test]
    fn register_and_lookup() {
        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(EchoTool));
        assert!(reg.get("echo").is_some());
        assert!(reg.get("missing").is_none());
        assert_eq!(reg.names(), vec!["echo"]);
    }

    #[test]
    fn defs_sorted_by_name() {
        struct Named(&'static str);
        #[async_trait]
        impl Tool for Named {
            fn name(&self) -> &str {
                self.0
            }
            fn label(&self) -> &str {
                "noop"
            }
            fn category(&self) -> &str {
                "debug"
            }
            fn risk(&self) -> RiskLevel {
                RiskLevel::Low
            }
            fn parameters(&self) -> serde_json::Value {
                json!({ "type": "object" })
            }
            async fn execute(
                &self,
                _call_id: &str,
                _input: serde_json::Value,
                _ctx: &ToolContext,
            ) -> Result<ToolResult> {
                Ok(ToolResult::ok(""))
            }
        }

        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(Named("zeta")));
        reg.register(Arc::new(Named("alpha")));
        let names: Vec<String> = reg.defs().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }
}
