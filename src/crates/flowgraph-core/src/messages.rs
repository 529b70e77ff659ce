//! Conversation message types.
//!
//! Messages carry a variant tag (`system`, `human`, `ai`, `tool`). An `ai`
//! message may request tool calls; every requested call is answered by a
//! `tool` message referencing the originating `call_id` before the next `ai`
//! turn. Chat state is an append-only sequence of these messages.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Role of the message sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// Instructions or context for the model.
    System,
    /// End-user input.
    Human,
    /// Model output, possibly carrying tool-call requests.
    Ai,
    /// Result of one tool execution.
    Tool,
}

/// A tool invocation requested by an `ai` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Correlates the eventual `tool` message back to this request.
    pub call_id: String,
    /// Tool name.
    pub name: String,
    /// Tool arguments.
    pub args: Value,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, args: Value) -> Self {
        Self {
            call_id: Uuid::new_v4().to_string(),
            name: name.into(),
            args,
        }
    }
}

/// One message in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Sender role.
    pub role: MessageRole,
    /// Text content. Tool messages carry the stringified tool result.
    pub content: String,
    /// Tool calls requested by an `ai` message.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// For `tool` messages: the `call_id` being answered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn human(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Human,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn ai(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Ai,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    /// An `ai` message carrying tool-call requests.
    pub fn ai_with_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: MessageRole::Ai,
            content: content.into(),
            tool_calls,
            tool_call_id: None,
        }
    }

    /// A `tool` message answering the given call.
    pub fn tool(content: impl Into<String>, call_id: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(call_id.into()),
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// Decode a state value into a message list.
pub fn messages_from_value(value: &Value) -> crate::Result<Vec<Message>> {
    if value.is_null() {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_value(value.clone())?)
}

/// Encode a message list into a state value.
pub fn messages_to_value(messages: &[Message]) -> crate::Result<Value> {
    Ok(serde_json::to_value(messages)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn roles_serialize_lowercase() {
        let msg = Message::ai("hallo");
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["role"], "ai");
        assert!(value.get("tool_calls").is_none());
    }

    #[test]
    fn tool_call_round_trip() {
        let call = ToolCall::new("get_procedure", json!({"id": "PR-AV-02"}));
        let msg = Message::ai_with_tool_calls("", vec![call.clone()]);
        let value = serde_json::to_value(&msg).unwrap();
        let decoded: Message = serde_json::from_value(value).unwrap();
        assert_eq!(decoded.tool_calls, vec![call]);
        assert!(decoded.has_tool_calls());
    }

    #[test]
    fn tool_message_references_call() {
        let msg = Message::tool("result text", "call-1");
        assert_eq!(msg.tool_call_id.as_deref(), Some("call-1"));
        assert_eq!(msg.role, MessageRole::Tool);
    }

    #[test]
    fn list_round_trip() {
        let msgs = vec![Message::human("vraag"), Message::ai("antwoord")];
        let value = messages_to_value(&msgs).unwrap();
        assert_eq!(messages_from_value(&value).unwrap(), msgs);
        assert!(messages_from_value(&Value::Null).unwrap().is_empty());
    }
}
