use serde_json::{Map, Value};

use agentflow_core::workflow::{Condition, ConditionOperator};

/// An unconditional transition between two nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    pub from: String,
    pub to: String,
}

impl Edge {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

/// Evaluate a branch condition against `step_outputs[condition.field]`.
///
/// - `equals`: exact JSON equality (a missing field is `null`)
/// - `contains`: the value's text appears in the field's text
pub fn evaluate_condition(condition: &Condition, step_outputs: &Map<String, Value>) -> bool {
    let field = step_outputs.get(&condition.field).unwrap_or(&Value::Null);

    match condition.operator {
        ConditionOperator::Equals => *field == condition.value,
        ConditionOperator::Contains => {
            if field.is_null() {
                return false;
            }
            text_of(field).contains(&text_of(&condition.value))
        }
    }
}

/// Strings as-is, everything else as compact JSON.
pub(crate) fn text_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cond(field: &str, operator: ConditionOperator, value: Value) -> Condition {
        Condition {
            field: field.into(),
            operator,
            value,
        }
    }

    fn outputs(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[test]
    fn test_equals() {
        let c = cond("x", ConditionOperator::Equals, json!("yes"));
        assert!(evaluate_condition(&c, &outputs(json!({"x": "yes"}))));
        assert!(!evaluate_condition(&c, &outputs(json!({"x": "no"}))));
        assert!(!evaluate_condition(&c, &outputs(json!({}))));
    }

    #[test]
    fn test_equals_non_string() {
        let c = cond("score", ConditionOperator::Equals, json!(3));
        assert!(evaluate_condition(&c, &outputs(json!({"score": 3}))));
        assert!(!evaluate_condition(&c, &outputs(json!({"score": "3"}))));
    }

    #[test]
    fn test_contains() {
        let c = cond("report", ConditionOperator::Contains, json!("urgent"));
        assert!(evaluate_condition(
            &c,
            &outputs(json!({"report": "this is urgent news"}))
        ));
        assert!(!evaluate_condition(&c, &outputs(json!({"report": "calm"}))));
    }

    #[test]
    fn test_contains_structured_field() {
        let c = cond("tags", ConditionOperator::Contains, json!("rust"));
        assert!(evaluate_condition(
            &c,
            &outputs(json!({"tags": ["go", "rust"]}))
        ));
    }

    #[test]
    fn test_contains_missing_field() {
        let c = cond("absent", ConditionOperator::Contains, json!(""));
        assert!(!evaluate_condition(&c, &outputs(json!({}))));
    }
}
