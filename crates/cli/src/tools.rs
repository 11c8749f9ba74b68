//! Built-in tools offered to the model.

use async_trait::async_trait;
use chatloop_core::error::ToolError;
use chatloop_core::tool::{Tool, ToolRegistry};

/// Registry with every built-in tool.
pub fn default_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Box::new(CurrentTimeTool));
    registry
}

/// Reports the current date and time.
pub struct CurrentTimeTool;

#[async_trait]
impl Tool for CurrentTimeTool {
    fn name(&self) -> &str {
        "current_time"
    }

    fn description(&self) -> &str {
        "Get the current date and time as an RFC 3339 timestamp. Local time unless utc is true."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "utc": {
                    "type": "boolean",
                    "description": "Return UTC instead of local time"
                }
            }
        })
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<String, ToolError> {
        let utc = match arguments.get("utc") {
            None | Some(serde_json::Value::Null) => false,
            Some(serde_json::Value::Bool(b)) => *b,
            Some(other) => {
                return Err(ToolError::InvalidArguments(format!(
                    "utc must be a boolean, got {other}"
                )));
            }
        };

        Ok(if utc {
            chrono::Utc::now().to_rfc3339()
        } else {
            chrono::Local::now().to_rfc3339()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatloop_core::tool::{ToolExecutor, ToolOverrides};

    #[tokio::test]
    async fn returns_parseable_timestamp() {
        let out = CurrentTimeTool
            .execute(serde_json::json!({"utc": true}))
            .await
            .unwrap();
        let parsed = chrono::DateTime::parse_from_rfc3339(&out).unwrap();
        assert_eq!(parsed.offset().local_minus_utc(), 0);
    }

    #[tokio::test]
    async fn rejects_non_boolean_flag() {
        let err = CurrentTimeTool
            .execute(serde_json::json!({"utc": "yes"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }

    #[tokio::test]
    async fn registry_offers_and_runs_current_time() {
        let registry = default_registry();
        let overrides = ToolOverrides::new();
        let defs = registry.definitions(&overrides);
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].name, "current_time");

        let out = registry.execute("current_time", "", &overrides).await.unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(&out).is_ok());
    }

    #[test]
    fn override_hides_current_time() {
        let registry = default_registry();
        let mut overrides = ToolOverrides::new();
        overrides.set("current_time", false);
        assert!(registry.definitions(&overrides).is_empty());
    }
}
