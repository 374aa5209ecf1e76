//! Tool definitions: function tools the caller executes, provider-native
//! tools the vendor executes, and the executable-tool seam for the loop agent.

use serde::{Deserialize, Serialize};

use crate::cancel::CancellationToken;
use crate::error::Result;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Declarations
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A function tool exposed to the model. `parameters` is a JSON Schema
/// object describing the arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionTool {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

impl FunctionTool {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

/// A provider-native tool (web search, code execution, ...) identified by a
/// provider-namespaced id such as `"xai.web_search"`. The adapter serializes
/// it into the vendor's tool array; it is never executed locally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderTool {
    pub id: String,
    #[serde(default)]
    pub options: serde_json::Value,
}

impl ProviderTool {
    pub fn new(id: impl Into<String>, options: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            options,
        }
    }

    /// The provider namespace, i.e. everything before the first `.`.
    pub fn namespace(&self) -> &str {
        self.id.split('.').next().unwrap_or(&self.id)
    }

    /// The tool name within the namespace.
    pub fn tool_name(&self) -> &str {
        self.id.split_once('.').map(|(_, n)| n).unwrap_or(&self.id)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool choice
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// How the model may select tools for a turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolChoiceMode {
    /// The model decides whether to call tools.
    Auto,
    /// Tools are disabled for this turn.
    None,
    /// The model must call at least one tool.
    Required,
    /// The model must call the named tool.
    Specific(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolChoice {
    pub mode: ToolChoiceMode,
    /// When true, ask the provider not to issue parallel tool calls.
    #[serde(default)]
    pub disable_parallel: bool,
}

impl ToolChoice {
    pub fn auto() -> Self {
        Self {
            mode: ToolChoiceMode::Auto,
            disable_parallel: false,
        }
    }

    pub fn none() -> Self {
        Self {
            mode: ToolChoiceMode::None,
            disable_parallel: false,
        }
    }

    pub fn required() -> Self {
        Self {
            mode: ToolChoiceMode::Required,
            disable_parallel: false,
        }
    }

    pub fn specific(name: impl Into<String>) -> Self {
        Self {
            mode: ToolChoiceMode::Specific(name.into()),
            disable_parallel: false,
        }
    }

    pub fn without_parallel(mut self) -> Self {
        self.disable_parallel = true;
        self
    }
}

impl Default for ToolChoice {
    fn default() -> Self {
        Self::auto()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Executable tools
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A function tool paired with its local executor, as driven by the loop
/// agent. Executors receive parsed JSON arguments and the request's
/// cancellation token.
#[async_trait::async_trait]
pub trait ExecutableTool: Send + Sync {
    /// The schema advertised to the model.
    fn schema(&self) -> &FunctionTool;

    /// Run the tool. Errors are captured as error tool-results and fed back
    /// to the model; they do not abort the loop unless configured to.
    async fn execute(
        &self,
        arguments: serde_json::Value,
        cancel: CancellationToken,
    ) -> Result<serde_json::Value>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_tool_namespace_split() {
        let t = ProviderTool::new("xai.web_search", serde_json::json!({}));
        assert_eq!(t.namespace(), "xai");
        assert_eq!(t.tool_name(), "web_search");

        let bare = ProviderTool::new("search", serde_json::json!({}));
        assert_eq!(bare.namespace(), "search");
        assert_eq!(bare.tool_name(), "search");
    }

    #[test]
    fn tool_choice_constructors() {
        assert_eq!(ToolChoice::default().mode, ToolChoiceMode::Auto);
        let c = ToolChoice::specific("add").without_parallel();
        assert_eq!(c.mode, ToolChoiceMode::Specific("add".into()));
        assert!(c.disable_parallel);
    }
}
