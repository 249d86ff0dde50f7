//! 出站消息构建器
//!
//! 一条消息由 ID 与有序的界面组件列表组成，每个组件是带 `type` 字段的 JSON 对象，
//! 例如 `{"type": "text", "text": "hello"}`。

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::protocol::DirectMessage;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub interface: Vec<Value>,
}

impl Message {
    pub fn new() -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string())
    }

    /// 沿用已有 ID（用于更新服务端已存在的消息）
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            interface: Vec::new(),
        }
    }

    /// 追加一个组件；`props` 为对象时其字段与 `type` 合并，否则存为 `value`
    pub fn add(&mut self, component_type: &str, props: Value) -> &mut Self {
        let mut component = Map::new();
        component.insert("type".to_string(), Value::String(component_type.to_string()));
        match props {
            Value::Object(fields) => {
                for (k, v) in fields {
                    if k != "type" {
                        component.insert(k, v);
                    }
                }
            }
            Value::Null => {}
            other => {
                component.insert("value".to_string(), other);
            }
        }
        self.interface.push(Value::Object(component));
        self
    }

    /// 快捷方式：文本组件
    pub fn text(&mut self, text: impl Into<String>) -> &mut Self {
        self.add("text", serde_json::json!({ "text": text.into() }))
    }

    pub fn is_empty(&self) -> bool {
        self.interface.is_empty()
    }

    pub fn clear(&mut self) {
        self.interface.clear();
    }

    pub fn to_direct_message(&self) -> DirectMessage {
        DirectMessage {
            message_id: self.id.clone(),
            interface: self.interface.clone(),
        }
    }
}

impl Default for Message {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_add_components_in_order() {
        let mut m = Message::new();
        m.text("hello").add(
            "chart",
            json!({"chart_type": "candlestick", "data": [[10, 15, 5, 12]], "type": "ignored"}),
        );
        assert_eq!(m.interface.len(), 2);
        assert_eq!(m.interface[0], json!({"type": "text", "text": "hello"}));
        assert_eq!(m.interface[1]["type"], "chart");
        assert_eq!(m.interface[1]["chart_type"], "candlestick");
    }

    #[test]
    fn test_scalar_props_stored_as_value() {
        let mut m = Message::with_id("m-1");
        m.add("divider", Value::Null).add("counter", json!(3));
        assert_eq!(m.interface[0], json!({"type": "divider"}));
        assert_eq!(m.interface[1], json!({"type": "counter", "value": 3}));
    }

    #[test]
    fn test_direct_message_keeps_id() {
        let mut m = Message::with_id("m-1");
        m.text("hi");
        let dm = m.to_direct_message();
        assert_eq!(dm.message_id, "m-1");
        assert_eq!(dm.interface, m.interface);
    }

    #[test]
    fn test_new_ids_are_unique() {
        assert_ne!(Message::new().id, Message::new().id);
    }
}
