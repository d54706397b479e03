use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Scratchpad threaded through one workflow run.
///
/// `step_outputs` is the only channel between steps. Keys are added or
/// overwritten, never removed.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WorkflowState {
    pub messages: Vec<String>,
    pub current_step: u32,
    pub step_outputs: Map<String, Value>,
    pub final_output: Option<Value>,
    pub error: Option<String>,
}

impl WorkflowState {
    /// Seed `step_outputs` from an execution's input data.
    ///
    /// Non-object input is kept under the `input` key.
    pub fn seeded(input: Value) -> Self {
        let step_outputs = match input {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("input".to_string(), other);
                map
            }
        };
        Self {
            step_outputs,
            ..Self::default()
        }
    }

    /// Build a step's input object from its `input_mapping`.
    pub fn resolve_inputs(&self, mapping: &BTreeMap<String, String>) -> Value {
        let resolved: Map<String, Value> = mapping
            .iter()
            .map(|(key, path)| (key.clone(), resolve_path(&self.step_outputs, path)))
            .collect();
        Value::Object(resolved)
    }

    /// Write the whole output under each captured key.
    pub fn capture(&mut self, keys: &[String], output: &Value) {
        for key in keys {
            self.step_outputs.insert(key.clone(), output.clone());
        }
    }

    /// `output_data` persisted for the execution: `output` is `final_output`
    /// when set, otherwise the whole `step_outputs` map.
    pub fn output_data(&self) -> Value {
        let output = match &self.final_output {
            Some(value) if !value.is_null() => value.clone(),
            _ => Value::Object(self.step_outputs.clone()),
        };
        json!({
            "output": output,
            "messages": self.messages,
        })
    }
}

/// Resolve a state path against `step_outputs`.
///
/// A plain key yields its value or `null`. A dotted path walks nested
/// objects and yields `{}` as soon as a segment is missing or lands on a
/// non-object.
pub fn resolve_path(step_outputs: &Map<String, Value>, path: &str) -> Value {
    if !path.contains('.') {
        return step_outputs.get(path).cloned().unwrap_or(Value::Null);
    }

    let mut segments = path.split('.');
    let mut current = match segments.next().and_then(|first| step_outputs.get(first)) {
        Some(value) => value,
        None => return json!({}),
    };
    for segment in segments {
        current = match current.as_object().and_then(|obj| obj.get(segment)) {
            Some(value) => value,
            None => return json!({}),
        };
    }
    current.clone()
}
