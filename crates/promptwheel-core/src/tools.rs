//! User-defined tool specs, loaded from `.promptwheel/tools.json` when
//! `PROMPTWHEEL_ENABLE_CUSTOM_TOOLS` is set. Specs are parse-then-validate;
//! whatever is dropped is reported, never silently ignored.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomToolSpec {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    pub tools: Vec<CustomToolSpec>,
    /// What was rejected and why; surfaced to the user once at startup.
    pub warnings: Vec<String>,
}

impl ToolRegistry {
    /// Empty registry: custom tools disabled or file absent.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn load(path: &Path) -> Self {
        let mut registry = Self::default();
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(_) => return registry,
        };
        let values: Vec<serde_json::Value> = match serde_json::from_str(&contents) {
            Ok(v) => v,
            Err(e) => {
                registry.warnings.push(format!("tools.json is not a JSON array: {e}"));
                return registry;
            }
        };

        for (i, value) in values.into_iter().enumerate() {
            match serde_json::from_value::<CustomToolSpec>(value) {
                Ok(spec) if spec.name.is_empty() || spec.command.is_empty() => {
                    registry.warnings.push(format!("tool #{i}: name and command are required"));
                }
                Ok(spec) if registry.tools.iter().any(|t| t.name == spec.name) => {
                    registry.warnings.push(format!("tool #{i}: duplicate name '{}'", spec.name));
                }
                Ok(spec) => registry.tools.push(spec),
                Err(e) => registry.warnings.push(format!("tool #{i}: {e}")),
            }
        }
        for w in &registry.warnings {
            warn!("custom tools: {w}");
        }
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_and_invalid_specs_are_separated() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("tools.json");
        std::fs::write(
            &path,
            r#"[
                {"name": "fmt", "command": "cargo", "args": ["fmt"]},
                {"name": "", "command": "x"},
                {"name": "fmt", "command": "duplicate"},
                {"name": "lint"}
            ]"#,
        )
        .expect("write");

        let registry = ToolRegistry::load(&path);
        assert_eq!(registry.tools.len(), 1);
        assert_eq!(registry.tools[0].name, "fmt");
        assert_eq!(registry.warnings.len(), 3);
    }

    #[test]
    fn absent_file_is_quietly_empty() {
        let registry = ToolRegistry::load(Path::new("/nonexistent/tools.json"));
        assert!(registry.tools.is_empty());
        assert!(registry.warnings.is_empty());
    }
}
