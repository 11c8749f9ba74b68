//! Tool traits — the abstraction over side-effecting capabilities.
//!
//! Two seams live here:
//! - [`ToolExecutor`] is what the orchestrator calls: name + raw JSON in,
//!   result text out.
//! - [`Tool`] is a single capability; [`ToolRegistry`] collects tools and
//!   implements [`ToolExecutor`] on top of them, applying per-session
//!   enablement overrides and each tool's permission policy.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

use crate::error::ToolError;

/// A tool definition sent to the model so it knows what it can call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// The tool name
    pub name: String,

    /// Description of what the tool does
    pub description: String,

    /// JSON Schema describing the tool's parameters
    pub parameters: serde_json::Value,
}

/// How a tool may be invoked when no explicit override is set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionPolicy {
    /// Enabled unless switched off
    #[default]
    Auto,
    /// Disabled unless explicitly switched on
    Ask,
    /// Never runs
    Deny,
}

impl PermissionPolicy {
    pub fn enabled_by_default(&self) -> bool {
        matches!(self, Self::Auto)
    }
}

/// Per-session tool enablement overrides.
///
/// Three-state per tool: `Some(true)`, `Some(false)`, or unset (falls back to
/// the tool's own default).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ToolOverrides(BTreeMap<String, bool>);

impl ToolOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set an explicit override.
    pub fn set(&mut self, tool: impl Into<String>, enabled: bool) {
        self.0.insert(tool.into(), enabled);
    }

    /// Remove an override, reverting to the default.
    pub fn clear(&mut self, tool: &str) {
        self.0.remove(tool);
    }

    /// The explicit override for `tool`, if any.
    pub fn get(&self, tool: &str) -> Option<bool> {
        self.0.get(tool).copied()
    }

    /// Resolve enablement for `tool` against its default.
    pub fn is_enabled(&self, tool: &str, default: bool) -> bool {
        self.get(tool).unwrap_or(default)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, bool)> for ToolOverrides {
    fn from_iter<I: IntoIterator<Item = (String, bool)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// The executor seam used by the tool loop.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Definitions of the tools enabled under `overrides`.
    fn definitions(&self, overrides: &ToolOverrides) -> Vec<ToolDefinition>;

    /// Run `name` with the raw JSON argument string.
    async fn execute(
        &self,
        name: &str,
        arguments_json: &str,
        overrides: &ToolOverrides,
    ) -> std::result::Result<String, ToolError>;
}

/// A single capability the model can invoke.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool.
    fn name(&self) -> &str;

    /// A description of what this tool does (sent to the model).
    fn description(&self) -> &str;

    /// JSON Schema describing this tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Default invocation policy.
    fn permission_policy(&self) -> PermissionPolicy {
        PermissionPolicy::Auto
    }

    /// Execute the tool with parsed arguments.
    async fn execute(&self, arguments: serde_json::Value) -> std::result::Result<String, ToolError>;

    /// Convert this tool into a ToolDefinition for sending to the model.
    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

/// A registry of available tools.
pub struct ToolRegistry {
    tools: HashMap<String, Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool. Replaces any existing tool with the same name.
    pub fn register(&mut self, tool: Box<dyn Tool>) {
        let name = tool.name().to_string();
        self.tools.insert(name, tool);
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools.get(name).map(|t| t.as_ref())
    }

    /// List all registered tool names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    fn is_enabled(tool: &dyn Tool, overrides: &ToolOverrides) -> bool {
        let policy = tool.permission_policy();
        policy != PermissionPolicy::Deny
            && overrides.is_enabled(tool.name(), policy.enabled_by_default())
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolExecutor for ToolRegistry {
    fn definitions(&self, overrides: &ToolOverrides) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .values()
            .filter(|t| Self::is_enabled(t.as_ref(), overrides))
            .map(|t| t.to_definition())
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    async fn execute(
        &self,
        name: &str,
        arguments_json: &str,
        overrides: &ToolOverrides,
    ) -> std::result::Result<String, ToolError> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;

        if tool.permission_policy() == PermissionPolicy::Deny {
            return Err(ToolError::PermissionDenied {
                tool_name: name.to_string(),
                reason: "tool policy is deny".into(),
            });
        }
        if !Self::is_enabled(tool.as_ref(), overrides) {
            return Err(ToolError::Disabled(name.to_string()));
        }

        let arguments = if arguments_json.trim().is_empty() {
            serde_json::Value::Object(serde_json::Map::new())
        } else {
            serde_json::from_str(arguments_json)
                .map_err(|e| ToolError::InvalidArguments(format!("{name}: {e}")))?
        };

        debug!(tool = %name, "Executing tool");
        tool.execute(arguments).await
    }
}
