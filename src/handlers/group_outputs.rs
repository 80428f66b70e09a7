//! Output of group placeholders.
//!
//! With empty `data` the task outputs its dependency outputs ordered by
//! dependency id. Otherwise `data` is a shape whose selector strings are
//! replaced by those outputs:
//!
//! - `"$"` - array of all dependency outputs
//! - `"$[12]"` - output of dependency 12
//! - `"$[12].files[0].name"` - path into that output

use crate::orchestration::TaskHandlerContext;
use crate::registry::TaskHandler;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ShapeError {
    #[error("Not a valid path selector : {0}")]
    InvalidSelector(String),
    #[error("No input task with id {0}")]
    UnknownInput(i64),
    #[error("{0} is not a valid path")]
    InvalidPath(String),
    #[error("Cannot read properties of null (reading '{0}')")]
    NullAccess(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Key(String),
    Index(usize),
}

impl std::fmt::Display for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Segment::Key(key) => f.write_str(key),
            Segment::Index(index) => write!(f, "{index}"),
        }
    }
}

/// Replace every selector string in `shape` with the matching input.
pub fn map_shape(shape: &Value, inputs: &BTreeMap<i64, Value>) -> Result<Value, ShapeError> {
    match shape {
        Value::String(s) if s.starts_with('$') => resolve_selector(s, inputs),
        Value::Array(items) => items
            .iter()
            .map(|item| map_shape(item, inputs))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(fields) => fields
            .iter()
            .map(|(key, value)| Ok((key.clone(), map_shape(value, inputs)?)))
            .collect::<Result<Map<String, Value>, _>>()
            .map(Value::Object),
        other => Ok(other.clone()),
    }
}

fn resolve_selector(selector: &str, inputs: &BTreeMap<i64, Value>) -> Result<Value, ShapeError> {
    if selector == "$" {
        return Ok(Value::Array(inputs.values().cloned().collect()));
    }

    let invalid = || ShapeError::InvalidSelector(selector.to_string());
    let rest = selector.strip_prefix("$[").ok_or_else(invalid)?;
    let end = rest.find(']').ok_or_else(invalid)?;
    let id_text = &rest[..end];
    if id_text.is_empty() || !id_text.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    let task_id: i64 = id_text.parse().map_err(|_| invalid())?;
    let input = inputs.get(&task_id).ok_or(ShapeError::UnknownInput(task_id))?;

    let path = &rest[end + 1..];
    if path.is_empty() {
        return Ok(input.clone());
    }
    walk_path(path, input)
}

fn parse_path(path: &str) -> Result<Vec<Segment>, ShapeError> {
    let invalid = || ShapeError::InvalidPath(path.to_string());
    let mut segments = Vec::new();
    let mut rest = path;

    while !rest.is_empty() {
        let unprefixed = rest.strip_prefix('.').unwrap_or(rest);
        if let Some(bracketed) = unprefixed.strip_prefix('[') {
            let end = bracketed.find(']').ok_or_else(invalid)?;
            let inner = bracketed[..end].trim();
            let segment = if inner.len() >= 2
                && ((inner.starts_with('"') && inner.ends_with('"'))
                    || (inner.starts_with('\'') && inner.ends_with('\'')))
            {
                Segment::Key(inner[1..inner.len() - 1].to_string())
            } else if let Ok(index) = inner.parse::<usize>() {
                Segment::Index(index)
            } else if inner.is_empty() || inner.contains('$') {
                return Err(invalid());
            } else {
                Segment::Key(inner.to_string())
            };
            segments.push(segment);
            rest = &bracketed[end + 1..];
        } else {
            let end = unprefixed
                .find(['.', '['])
                .unwrap_or(unprefixed.len());
            let name = &unprefixed[..end];
            if name.is_empty() || name.contains(['$', ']']) {
                return Err(invalid());
            }
            segments.push(Segment::Key(name.to_string()));
            rest = &unprefixed[end..];
        }
    }
    Ok(segments)
}

/// Follow `path` into `input`. A missing property yields `null`; reading
/// through `null` fails.
fn walk_path(path: &str, input: &Value) -> Result<Value, ShapeError> {
    let mut ptr = Some(input);
    for segment in parse_path(path)? {
        let current = match ptr {
            None | Some(Value::Null) => return Err(ShapeError::NullAccess(segment.to_string())),
            Some(value) => value,
        };
        ptr = match (current, &segment) {
            (Value::Object(fields), Segment::Key(key)) => fields.get(key),
            (Value::Object(fields), Segment::Index(index)) => fields.get(&index.to_string()),
            (Value::Array(items), Segment::Index(index)) => items.get(*index),
            _ => None,
        };
    }
    Ok(ptr.cloned().unwrap_or(Value::Null))
}

/// Collects the outputs of all dependencies once they have completed
pub struct GroupOutputsTask;

#[async_trait]
impl TaskHandler for GroupOutputsTask {
    async fn handle(&self, ctx: TaskHandlerContext) -> anyhow::Result<Value> {
        ctx.logger
            .debug(format!("Group outputs for tasks {:?}", ctx.task.after))
            .await;
        let shape = &ctx.task.data;
        let empty = match shape {
            Value::Null => true,
            Value::Object(fields) => fields.is_empty(),
            _ => false,
        };
        if empty {
            return Ok(Value::Array(ctx.input_values()));
        }
        ctx.logger.debug(format!("Use schema {shape}")).await;
        Ok(map_shape(shape, &ctx.inputs)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn inputs() -> BTreeMap<i64, Value> {
        BTreeMap::from([(1, json!("value"))])
    }

    #[test]
    fn test_maps_identity() {
        assert_eq!(map_shape(&json!("$"), &inputs()).unwrap(), json!(["value"]));
    }

    #[test]
    fn test_maps_outputs_to_a_shape() {
        assert_eq!(
            map_shape(&json!({"foo": "bar", "out": "$"}), &inputs()).unwrap(),
            json!({"foo": "bar", "out": ["value"]})
        );
    }

    #[test]
    fn test_maps_single_output() {
        assert_eq!(
            map_shape(&json!({"foo": "$[1]"}), &inputs()).unwrap(),
            json!({"foo": "value"})
        );
    }

    #[test]
    fn test_maps_output_properties() {
        let mut m = inputs();
        m.insert(2, json!({"foo": "foo"}));
        m.insert(4, json!({"bar": "bar"}));
        assert_eq!(
            map_shape(&json!({"foo": "$[2].foo", "bar": "$[4].bar", "baz": "baz"}), &m).unwrap(),
            json!({"foo": "foo", "bar": "bar", "baz": "baz"})
        );
    }

    #[test]
    fn test_nested_paths_and_arrays() {
        let m = BTreeMap::from([(7, json!({"files": [{"name": "a.glb"}, {"name": "b.glb"}]}))]);
        assert_eq!(
            map_shape(&json!(["$[7].files[1].name", "$[7]['files'][0].name"]), &m).unwrap(),
            json!(["b.glb", "a.glb"])
        );
        assert_eq!(map_shape(&json!("$[7].missing"), &m).unwrap(), Value::Null);
    }

    #[test]
    fn test_rejects_bad_selectors() {
        let m = inputs();
        assert_eq!(
            map_shape(&json!("$foo"), &m),
            Err(ShapeError::InvalidSelector("$foo".to_string()))
        );
        assert_eq!(map_shape(&json!("$[9]"), &m), Err(ShapeError::UnknownInput(9)));
        assert!(matches!(map_shape(&json!("$[1].."), &m), Err(ShapeError::InvalidPath(_))));
        assert_eq!(
            map_shape(&json!("$[1].a.b"), &BTreeMap::from([(1, json!({"a": null}))])),
            Err(ShapeError::NullAccess("b".to_string()))
        );
    }

    #[test]
    fn test_plain_values_pass_through() {
        assert_eq!(
            map_shape(&json!({"n": 3, "s": "a$", "l": [true, null]}), &inputs()).unwrap(),
            json!({"n": 3, "s": "a$", "l": [true, null]})
        );
    }
}
