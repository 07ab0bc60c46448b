//! Conversation primitives.
//!
//! A [`Conversation`] is an append-only list of [`Turn`]s. Assistant turns may
//! mix text with tool invocations; the user turn that follows carries the tool
//! results keyed by invocation id.

use serde::{Deserialize, Serialize};

/// Role in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// User message (prompts and tool results)
    User,
    /// Assistant response
    Assistant,
}

/// A single block of turn content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    /// Plain text
    #[serde(rename = "text")]
    Text { text: String },
    /// Tool invocation requested by the model
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    /// Result of a tool invocation, correlated by the invocation id
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
}

impl ContentBlock {
    /// Create a text block.
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Create a tool result block.
    pub fn tool_result(
        tool_use_id: impl Into<String>,
        content: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self::ToolResult {
            tool_use_id: tool_use_id.into(),
            content: content.into(),
            is_error,
        }
    }

    /// Get the text if this is a text block.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            _ => None,
        }
    }
}

/// One turn of a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    /// Who produced the turn
    pub role: Role,
    /// Ordered content blocks
    pub content: Vec<ContentBlock>,
}

impl Turn {
    /// Create a user turn containing plain text.
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentBlock::text(text)],
        }
    }

    /// Create an assistant turn from content blocks.
    pub fn assistant(content: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::Assistant,
            content,
        }
    }

    /// Create a user turn answering tool invocations.
    pub fn tool_results(results: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::User,
            content: results,
        }
    }

    /// Concatenate the text blocks of this turn.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(ContentBlock::as_text)
            .collect::<Vec<_>>()
            .join("")
    }

    /// Iterate over the tool invocations in this turn as `(id, name, input)`.
    pub fn tool_uses(&self) -> impl Iterator<Item = (&str, &str, &serde_json::Value)> {
        self.content.iter().filter_map(|block| match block {
            ContentBlock::ToolUse { id, name, input } => Some((id.as_str(), name.as_str(), input)),
            _ => None,
        })
    }
}

/// Append-only conversation history.
///
/// Serializes transparently as the array of turns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Conversation {
    turns: Vec<Turn>,
}

impl Conversation {
    /// Create an empty conversation.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a turn.
    pub fn push(&mut self, turn: Turn) {
        self.turns.push(turn);
    }

    /// All turns in order.
    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    /// The most recent turn.
    pub fn last(&self) -> Option<&Turn> {
        self.turns.last()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_turn_serialization_matches_wire_shape() {
        let turn = Turn::assistant(vec![
            ContentBlock::text("Let me check."),
            ContentBlock::ToolUse {
                id: "toolu_1".to_string(),
                name: "echo".to_string(),
                input: json!({"text": "hi"}),
            },
        ]);

        let value = serde_json::to_value(&turn).unwrap();
        assert_eq!(value["role"], "assistant");
        assert_eq!(value["content"][0]["type"], "text");
        assert_eq!(value["content"][1]["type"], "tool_use");
        assert_eq!(value["content"][1]["input"]["text"], "hi");
    }

    #[test]
    fn test_tool_result_omits_false_error_flag() {
        let block = ContentBlock::tool_result("toolu_1", "hi", false);
        let json = serde_json::to_string(&block).unwrap();
        assert!(!json.contains("is_error"));

        let block = ContentBlock::tool_result("toolu_1", "boom", true);
        let json = serde_json::to_string(&block).unwrap();
        assert!(json.contains("\"is_error\":true"));
    }

    #[test]
    fn test_conversation_serializes_as_array() {
        let mut conversation = Conversation::new();
        conversation.push(Turn::user("hello"));
        conversation.push(Turn::assistant(vec![ContentBlock::text("hi there")]));

        let value = serde_json::to_value(&conversation).unwrap();
        assert!(value.is_array());
        assert_eq!(value.as_array().unwrap().len(), 2);

        let restored: Conversation = serde_json::from_value(value).unwrap();
        assert_eq!(restored, conversation);
    }

    #[test]
    fn test_tool_uses_iterator() {
        let turn = Turn::assistant(vec![
            ContentBlock::text("two calls"),
            ContentBlock::ToolUse {
                id: "a".to_string(),
                name: "first".to_string(),
                input: json!({}),
            },
            ContentBlock::ToolUse {
                id: "b".to_string(),
                name: "second".to_string(),
                input: json!({"x": 1}),
            },
        ]);

        let names: Vec<&str> = turn.tool_uses().map(|(_, name, _)| name).collect();
        assert_eq!(names, vec!["first", "second"]);
        assert_eq!(turn.text(), "two calls");
    }
}
