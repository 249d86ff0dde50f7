//! 智能体目录条目

use std::fmt::Write;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// 服务端登记的智能体描述；输入/输出 schema 保留原始 JSON
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub properties_schema: Map<String, Value>,
    #[serde(default)]
    pub properties_required: Vec<String>,
    #[serde(default)]
    pub return_schema: Map<String, Value>,
}

impl Agent {
    pub fn is_online(&self) -> bool {
        self.status == "online"
    }

    /// 适合放进 LLM 提示词的纯文本描述
    pub fn llm_string(&self) -> String {
        let properties = format_schema(&self.properties_schema);
        let returns = format_schema(&self.return_schema);
        let required = if self.properties_required.is_empty() {
            "None".to_string()
        } else {
            self.properties_required.join(", ")
        };

        format!(
            "\nAgent ID: {}\nName: {}\nDescription: {}\nStatus: {}\nProperties Schema: {}\nProperties Required: {}\nReturn Schema: {}\n",
            self.id, self.name, self.description, self.status, properties, required, returns
        )
    }
}

fn format_schema(schema: &Map<String, Value>) -> String {
    if schema.is_empty() {
        return "None".to_string();
    }
    let mut out = String::new();
    write_map(&mut out, schema, 0);
    format!("\n{}", out.trim_end_matches('\n'))
}

fn write_map(out: &mut String, map: &Map<String, Value>, indent: usize) {
    let pad = "  ".repeat(indent);
    for (key, value) in map {
        match value {
            Value::Object(inner) => {
                let _ = writeln!(out, "{pad}- {key}:");
                write_map(out, inner, indent + 1);
            }
            Value::Array(items) => {
                let _ = writeln!(out, "{pad}- {key}:");
                for item in items {
                    match item {
                        Value::Object(inner) => write_map(out, inner, indent + 1),
                        other => {
                            let _ = writeln!(out, "{pad}  - {}", scalar(other));
                        }
                    }
                }
            }
            other => {
                let _ = writeln!(out, "{pad}- {key}: {}", scalar(other));
            }
        }
    }
}

fn scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
