//! Tool catalog — typed metadata, parameter validation, prompt generation
//! for the fixed tool set (§4.5).

use crate::types::Error;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

// =============================================================================
// Parameter types
// =============================================================================

/// Parameter type for tool inputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    String,
    Int,
    Float,
    Bool,
    StringList,
    Enum(Vec<String>),
    Optional(Box<ParamType>),
}

impl ParamType {
    /// Validate a JSON value against this parameter type.
    pub fn validate(&self, value: &Value) -> Result<(), String> {
        match self {
            ParamType::String => {
                if value.is_string() {
                    Ok(())
                } else {
                    Err(format!("expected string, got {}", value_type_name(value)))
                }
            }
            ParamType::Int => {
                if value.is_i64() || value.is_u64() {
                    Ok(())
                } else {
                    Err(format!("expected integer, got {}", value_type_name(value)))
                }
            }
            ParamType::Float => {
                if value.is_number() {
                    Ok(())
                } else {
                    Err(format!("expected number, got {}", value_type_name(value)))
                }
            }
            ParamType::Bool => {
                if value.is_boolean() {
                    Ok(())
                } else {
                    Err(format!("expected boolean, got {}", value_type_name(value)))
                }
            }
            ParamType::StringList => {
                if let Some(arr) = value.as_array() {
                    for (i, item) in arr.iter().enumerate() {
                        if !item.is_string() {
                            return Err(format!(
                                "expected string at index {}, got {}",
                                i,
                                value_type_name(item)
                            ));
                        }
                    }
                    Ok(())
                } else {
                    Err(format!("expected array, got {}", value_type_name(value)))
                }
            }
            ParamType::Enum(variants) => {
                if let Some(s) = value.as_str() {
                    if variants.contains(&s.to_string()) {
                        Ok(())
                    } else {
                        Err(format!(
                            "invalid enum value '{}', expected one of: {}",
                            s,
                            variants.join(", ")
                        ))
                    }
                } else {
                    Err(format!("expected string for enum, got {}", value_type_name(value)))
                }
            }
            ParamType::Optional(inner) => {
                if value.is_null() {
                    Ok(())
                } else {
                    inner.validate(value)
                }
            }
        }
    }

    /// Human-readable type name for prompt generation.
    pub fn display_name(&self) -> String {
        match self {
            ParamType::String => "string".to_string(),
            ParamType::Int => "integer".to_string(),
            ParamType::Float => "number".to_string(),
            ParamType::Bool => "boolean".to_string(),
            ParamType::StringList => "string[]".to_string(),
            ParamType::Enum(variants) => format!("enum({})", variants.join("|")),
            ParamType::Optional(inner) => format!("{}?", inner.display_name()),
        }
    }
}

fn value_type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// =============================================================================
// Parameter definition
// =============================================================================

/// A single parameter definition for a tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamDef {
    pub name: String,
    pub param_type: ParamType,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl ParamDef {
    pub fn is_required(&self) -> bool {
        self.default.is_none() && !matches!(self.param_type, ParamType::Optional(_))
    }
}

fn required(name: &str, param_type: ParamType, description: &str) -> ParamDef {
    ParamDef {
        name: name.to_string(),
        param_type,
        description: description.to_string(),
        default: None,
    }
}

fn optional(name: &str, param_type: ParamType, description: &str, default: Value) -> ParamDef {
    ParamDef {
        name: name.to_string(),
        param_type: ParamType::Optional(Box::new(param_type)),
        description: description.to_string(),
        default: Some(default),
    }
}

// =============================================================================
// Tool groups and catalog
// =============================================================================

/// The semantic groups tools are partitioned into (§4.5). Hat profiles
/// (`access::ToolAccessPolicy`) grant or deny whole groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolGroup {
    FsRead,
    FsWrite,
    GitRead,
    GitWrite,
    Github,
    Web,
    Runtime,
    Quality,
    Completion,
    Mail,
    Calendar,
}

/// Complete tool metadata entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolEntry {
    pub id: String,
    pub description: String,
    pub parameters: Vec<ParamDef>,
    pub group: ToolGroup,
    pub read_only: bool,
}

impl ToolEntry {
    /// Generate a prompt line for this tool.
    ///
    /// Format: `- tool_id(param1: type, param2?: type): description`
    pub fn to_prompt_line(&self) -> String {
        let params: Vec<String> = self
            .parameters
            .iter()
            .map(|p| {
                let optional = if p.is_required() { "" } else { "?" };
                format!("{}{}: {}", p.name, optional, p.param_type.display_name())
            })
            .collect();

        format!("- {}({}): {}", self.id, params.join(", "), self.description)
    }
}

/// In-memory tool catalog. Owns metadata, not implementations — execution
/// lives in [`crate::tools::executor`].
#[derive(Debug)]
pub struct ToolCatalog {
    entries: HashMap<String, ToolEntry>,
}

impl Default for ToolCatalog {
    fn default() -> Self {
        Self::with_fixed_catalog()
    }
}

impl ToolCatalog {
    pub fn empty() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// The fixed tool catalog (§4.5): filesystem read/write, git read/write,
    /// GitHub, web, runtime, quality, and completion tools. Mail/calendar
    /// tools are registered as metadata only — their execution is delegated
    /// to an external collaborator, out of scope here.
    pub fn with_fixed_catalog() -> Self {
        let mut catalog = Self::empty();
        for entry in fixed_entries() {
            catalog
                .register(entry)
                .expect("fixed catalog entries have non-empty ids");
        }
        catalog
    }

    /// Register a tool entry.
    pub fn register(&mut self, entry: ToolEntry) -> crate::types::Result<()> {
        if entry.id.is_empty() {
            return Err(Error::validation("Tool id cannot be empty"));
        }
        self.entries.insert(entry.id.clone(), entry);
        Ok(())
    }

    /// Get a tool entry by id.
    pub fn get(&self, tool_id: &str) -> Option<&ToolEntry> {
        self.entries.get(tool_id)
    }

    /// Check if a tool exists.
    pub fn has_tool(&self, tool_id: &str) -> bool {
        self.entries.contains_key(tool_id)
    }

    /// List all tool ids.
    pub fn list_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// List all tool entries.
    pub fn list_entries(&self) -> Vec<&ToolEntry> {
        let mut entries: Vec<&ToolEntry> = self.entries.values().collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        entries
    }

    /// All tool ids belonging to a group.
    pub fn ids_in_group(&self, group: ToolGroup) -> Vec<String> {
        let mut ids: Vec<String> = self
            .entries
            .values()
            .filter(|e| e.group == group)
            .map(|e| e.id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Validate parameters against a tool's parameter definitions.
    ///
    /// Returns a list of validation errors (empty = valid).
    pub fn validate_params(
        &self,
        tool_id: &str,
        params: &Value,
    ) -> crate::types::Result<Vec<String>> {
        let entry = self
            .entries
            .get(tool_id)
            .ok_or_else(|| Error::not_found(format!("Unknown tool: {}", tool_id)))?;

        let param_map = params
            .as_object()
            .ok_or_else(|| Error::validation("Parameters must be a JSON object"))?;

        let mut errors = Vec::new();

        for param_def in &entry.parameters {
            if param_def.is_required() && !param_map.contains_key(&param_def.name) {
                errors.push(format!("Missing required parameter: {}", param_def.name));
            }
        }

        let known_names: HashMap<&str, &ParamDef> = entry
            .parameters
            .iter()
            .map(|p| (p.name.as_str(), p))
            .collect();

        for (key, value) in param_map {
            if let Some(param_def) = known_names.get(key.as_str()) {
                if let Err(e) = param_def.param_type.validate(value) {
                    errors.push(format!("Parameter '{}': {}", key, e));
                }
            } else {
                errors.push(format!("Unknown parameter: {}", key));
            }
        }

        Ok(errors)
    }

    /// Fill in default values for missing optional parameters.
    pub fn fill_defaults(&self, tool_id: &str, params: &mut Value) -> crate::types::Result<()> {
        let entry = self
            .entries
            .get(tool_id)
            .ok_or_else(|| Error::not_found(format!("Unknown tool: {}", tool_id)))?;

        if let Some(map) = params.as_object_mut() {
            for param_def in &entry.parameters {
                if !map.contains_key(&param_def.name) {
                    if let Some(default) = &param_def.default {
                        map.insert(param_def.name.clone(), default.clone());
                    }
                }
            }
        }

        Ok(())
    }

    /// Generate formatted prompt section for LLM consumption.
    ///
    /// If `allowed_tools` is Some, only include those tools.
    pub fn generate_prompt(&self, allowed_tools: Option<&[String]>) -> String {
        let entries: Vec<&ToolEntry> = if let Some(allowed) = allowed_tools {
            allowed
                .iter()
                .filter_map(|id| self.entries.get(id))
                .collect()
        } else {
            self.list_entries()
        };

        if entries.is_empty() {
            return String::new();
        }

        let mut lines = Vec::with_capacity(entries.len() + 1);
        lines.push("Available tools:".to_string());
        for entry in entries {
            lines.push(entry.to_prompt_line());
        }
        lines.join("\n")
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn fixed_entries() -> Vec<ToolEntry> {
    use ToolGroup::*;
    vec![
        ToolEntry {
            id: "read_file".to_string(),
            description: "Read the contents of a file in the working directory".to_string(),
            parameters: vec![required("path", ParamType::String, "path relative to the work directory")],
            group: FsRead,
            read_only: true,
        },
        ToolEntry {
            id: "list_files".to_string(),
            description: "List files in a directory".to_string(),
            parameters: vec![optional(
                "path",
                ParamType::String,
                "directory relative to the work directory",
                Value::String(".".to_string()),
            )],
            group: FsRead,
            read_only: true,
        },
        ToolEntry {
            id: "glob".to_string(),
            description: "Find files matching a glob pattern".to_string(),
            parameters: vec![required("pattern", ParamType::String, "glob pattern")],
            group: FsRead,
            read_only: true,
        },
        ToolEntry {
            id: "grep".to_string(),
            description: "Search file contents with a regular expression".to_string(),
            parameters: vec![
                required("pattern", ParamType::String, "regular expression"),
                optional(
                    "path",
                    ParamType::String,
                    "directory or file to search",
                    Value::String(".".to_string()),
                ),
            ],
            group: FsRead,
            read_only: true,
        },
        ToolEntry {
            id: "write_file".to_string(),
            description: "Write (creating or overwriting) a file in the working directory".to_string(),
            parameters: vec![
                required("path", ParamType::String, "path relative to the work directory"),
                required("content", ParamType::String, "file content"),
            ],
            group: FsWrite,
            read_only: false,
        },
        ToolEntry {
            id: "git_status".to_string(),
            description: "Show the working tree status".to_string(),
            parameters: vec![],
            group: GitRead,
            read_only: true,
        },
        ToolEntry {
            id: "git_diff".to_string(),
            description: "Show changes between commits, working tree, etc.".to_string(),
            parameters: vec![optional(
                "path",
                ParamType::String,
                "restrict the diff to this path",
                Value::Null,
            )],
            group: GitRead,
            read_only: true,
        },
        ToolEntry {
            id: "git_log".to_string(),
            description: "Show commit history".to_string(),
            parameters: vec![optional(
                "limit",
                ParamType::Int,
                "maximum number of commits",
                Value::from(20),
            )],
            group: GitRead,
            read_only: true,
        },
        ToolEntry {
            id: "git_init".to_string(),
            description: "Initialize a new git repository".to_string(),
            parameters: vec![],
            group: GitWrite,
            read_only: false,
        },
        ToolEntry {
            id: "git_commit".to_string(),
            description: "Commit staged changes".to_string(),
            parameters: vec![required("message", ParamType::String, "commit message")],
            group: GitWrite,
            read_only: false,
        },
        ToolEntry {
            id: "git_remote_add".to_string(),
            description: "Add a git remote".to_string(),
            parameters: vec![
                required("name", ParamType::String, "remote name"),
                required("url", ParamType::String, "remote url"),
            ],
            group: GitWrite,
            read_only: false,
        },
        ToolEntry {
            id: "git_push".to_string(),
            description: "Push a branch to a remote".to_string(),
            parameters: vec![
                optional("remote", ParamType::String, "remote name", Value::String("origin".to_string())),
                optional("branch", ParamType::String, "branch name", Value::Null),
            ],
            group: GitWrite,
            read_only: false,
        },
        ToolEntry {
            id: "github_create_repo".to_string(),
            description: "Create a GitHub repository".to_string(),
            parameters: vec![
                required("name", ParamType::String, "repository name"),
                optional("private", ParamType::Bool, "create as private", Value::Bool(true)),
            ],
            group: Github,
            read_only: false,
        },
        ToolEntry {
            id: "github_create_pr".to_string(),
            description: "Open a pull request".to_string(),
            parameters: vec![
                required("title", ParamType::String, "pull request title"),
                required("body", ParamType::String, "pull request description"),
                required("head", ParamType::String, "source branch"),
                optional("base", ParamType::String, "target branch", Value::String("main".to_string())),
            ],
            group: Github,
            read_only: false,
        },
        ToolEntry {
            id: "web_search".to_string(),
            description: "Search the web for information".to_string(),
            parameters: vec![required("query", ParamType::String, "search query")],
            group: Web,
            read_only: true,
        },
        ToolEntry {
            id: "web_fetch".to_string(),
            description: "Fetch the contents of a URL".to_string(),
            parameters: vec![required("url", ParamType::String, "URL to fetch")],
            group: Web,
            read_only: true,
        },
        ToolEntry {
            id: "bash".to_string(),
            description: "Run a shell command in the working directory".to_string(),
            parameters: vec![required("command", ParamType::String, "shell command")],
            group: Runtime,
            read_only: false,
        },
        ToolEntry {
            id: "list_runtimes".to_string(),
            description: "List detected language/runtime toolchains in the project".to_string(),
            parameters: vec![],
            group: Runtime,
            read_only: true,
        },
        ToolEntry {
            id: "run_tests".to_string(),
            description: "Run the project's test suite".to_string(),
            parameters: vec![],
            group: Quality,
            read_only: false,
        },
        ToolEntry {
            id: "run_lint".to_string(),
            description: "Run the project's linter".to_string(),
            parameters: vec![],
            group: Quality,
            read_only: false,
        },
        ToolEntry {
            id: "run_build".to_string(),
            description: "Run the project's build".to_string(),
            parameters: vec![],
            group: Quality,
            read_only: false,
        },
        ToolEntry {
            id: "task_complete".to_string(),
            description: "Declare the objective complete, triggering the quality gate".to_string(),
            parameters: vec![optional(
                "summary",
                ParamType::String,
                "summary of work done",
                Value::String(String::new()),
            )],
            group: Completion,
            read_only: false,
        },
        ToolEntry {
            id: "mail_send".to_string(),
            description: "Send an email (delegated to an external collaborator)".to_string(),
            parameters: vec![
                required("to", ParamType::String, "recipient address"),
                required("subject", ParamType::String, "subject line"),
                required("body", ParamType::String, "message body"),
            ],
            group: Mail,
            read_only: false,
        },
        ToolEntry {
            id: "calendar_create_event".to_string(),
            description: "Create a calendar event (delegated to an external collaborator)".to_string(),
            parameters: vec![
                required("title", ParamType::String, "event title"),
                required("start", ParamType::String, "start time, RFC 3339"),
                required("end", ParamType::String, "end time, RFC 3339"),
            ],
            group: Calendar,
            read_only: false,
        },
    ]
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entry() -> ToolEntry {
        ToolEntry {
            id: "search_web".to_string(),
            description: "Search the web for information".to_string(),
            parameters: vec![
                required("query", ParamType::String, "Search query"),
                optional("max_results", ParamType::Int, "Maximum results", Value::from(10)),
            ],
            group: ToolGroup::Web,
            read_only: true,
        }
    }

    #[test]
    fn test_register_and_get() {
        let mut catalog = ToolCatalog::empty();
        catalog.register(sample_entry()).unwrap();

        assert!(catalog.has_tool("search_web"));
        assert!(!catalog.has_tool("nonexistent"));
        assert_eq!(catalog.len(), 1);

        let entry = catalog.get("search_web").unwrap();
        assert_eq!(entry.description, "Search the web for information");
    }

    #[test]
    fn test_register_empty_id_fails() {
        let mut catalog = ToolCatalog::empty();
        let mut entry = sample_entry();
        entry.id = String::new();
        assert!(catalog.register(entry).is_err());
    }

    #[test]
    fn test_validate_params_valid() {
        let mut catalog = ToolCatalog::empty();
        catalog.register(sample_entry()).unwrap();

        let params = serde_json::json!({"query": "rust programming"});
        let errors = catalog.validate_params("search_web", &params).unwrap();
        assert!(errors.is_empty(), "Expected no errors, got: {:?}", errors);
    }

    #[test]
    fn test_validate_params_missing_required() {
        let mut catalog = ToolCatalog::empty();
        catalog.register(sample_entry()).unwrap();

        let params = serde_json::json!({});
        let errors = catalog.validate_params("search_web", &params).unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("Missing required parameter: query"));
    }

    #[test]
    fn test_validate_params_wrong_type() {
        let mut catalog = ToolCatalog::empty();
        catalog.register(sample_entry()).unwrap();

        let params = serde_json::json!({"query": 42});
        let errors = catalog.validate_params("search_web", &params).unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("expected string"));
    }

    #[test]
    fn test_validate_params_unknown_param() {
        let mut catalog = ToolCatalog::empty();
        catalog.register(sample_entry()).unwrap();

        let params = serde_json::json!({"query": "test", "bogus": true});
        let errors = catalog.validate_params("search_web", &params).unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("Unknown parameter: bogus"));
    }

    #[test]
    fn test_validate_params_unknown_tool() {
        let catalog = ToolCatalog::empty();
        let params = serde_json::json!({});
        assert!(catalog.validate_params("nonexistent", &params).is_err());
    }

    #[test]
    fn test_fill_defaults() {
        let mut catalog = ToolCatalog::empty();
        catalog.register(sample_entry()).unwrap();

        let mut params = serde_json::json!({"query": "test"});
        catalog.fill_defaults("search_web", &mut params).unwrap();

        assert_eq!(params["max_results"], 10);
    }

    #[test]
    fn test_fill_defaults_no_overwrite() {
        let mut catalog = ToolCatalog::empty();
        catalog.register(sample_entry()).unwrap();

        let mut params = serde_json::json!({"query": "test", "max_results": 5});
        catalog.fill_defaults("search_web", &mut params).unwrap();

        assert_eq!(params["max_results"], 5);
    }

    #[test]
    fn test_generate_prompt() {
        let mut catalog = ToolCatalog::empty();
        catalog.register(sample_entry()).unwrap();

        let prompt = catalog.generate_prompt(None);
        assert!(prompt.contains("Available tools:"));
        assert!(prompt.contains("search_web(query: string, max_results?: integer?): Search the web"));
    }

    #[test]
    fn test_generate_prompt_filtered() {
        let mut catalog = ToolCatalog::empty();
        catalog.register(sample_entry()).unwrap();

        let prompt = catalog.generate_prompt(Some(&["nonexistent".to_string()]));
        assert!(prompt.is_empty());
    }

    #[test]
    fn test_prompt_line_format() {
        let entry = sample_entry();
        let line = entry.to_prompt_line();
        assert_eq!(
            line,
            "- search_web(query: string, max_results?: integer?): Search the web for information"
        );
    }

    #[test]
    fn test_param_type_enum_validation() {
        let pt = ParamType::Enum(vec!["asc".to_string(), "desc".to_string()]);
        assert!(pt.validate(&serde_json::json!("asc")).is_ok());
        assert!(pt.validate(&serde_json::json!("bad")).is_err());
        assert!(pt.validate(&serde_json::json!(42)).is_err());
    }

    #[test]
    fn test_param_type_string_list_validation() {
        let pt = ParamType::StringList;
        assert!(pt.validate(&serde_json::json!(["a", "b"])).is_ok());
        assert!(pt.validate(&serde_json::json!([1, 2])).is_err());
        assert!(pt.validate(&serde_json::json!("not array")).is_err());
    }

    #[test]
    fn fixed_catalog_covers_every_spec_tool() {
        let catalog = ToolCatalog::with_fixed_catalog();
        for id in [
            "read_file", "list_files", "glob", "grep", "write_file", "git_status", "git_diff",
            "git_log", "git_init", "git_commit", "git_remote_add", "git_push",
            "github_create_repo", "github_create_pr", "web_search", "web_fetch", "bash",
            "list_runtimes", "run_tests", "run_lint", "run_build", "task_complete",
        ] {
            assert!(catalog.has_tool(id), "missing tool: {id}");
        }
    }

    #[test]
    fn ids_in_group_is_sorted_and_scoped() {
        let catalog = ToolCatalog::with_fixed_catalog();
        let fs_read = catalog.ids_in_group(ToolGroup::FsRead);
        assert_eq!(fs_read, vec!["glob", "grep", "list_files", "read_file"]);
    }
}
