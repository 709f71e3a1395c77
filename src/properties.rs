// Copyright 2025 Cornell University
// released under MIT License

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{CompileResult, StructuralError};

/// A correctness property, passed through to the output untouched
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Property {
    pub name: String,
    pub expression: Value,
}

/// Keys whose string values are keywords rather than variable names
const KEYWORD_KEYS: [&str; 6] = ["op", "fun", "name", "comment", "kind", "type"];

impl Property {
    /// Variable names referenced by the expression, in document order
    pub fn referenced_names(&self) -> Vec<&str> {
        let mut out = vec![];
        collect_names(&self.expression, &mut out);
        out
    }

    /// Fails on the first referenced name `is_known` rejects
    pub fn check_names(&self, is_known: impl Fn(&str) -> bool) -> CompileResult<()> {
        match self.referenced_names().into_iter().find(|n| !is_known(n)) {
            Some(unknown) => Err(StructuralError::unresolved(unknown).into()),
            None => Ok(()),
        }
    }
}

fn collect_names<'a>(value: &'a Value, out: &mut Vec<&'a str>) {
    match value {
        Value::String(name) => out.push(name),
        Value::Array(items) => {
            for item in items {
                collect_names(item, out);
            }
        }
        Value::Object(map) => {
            for (key, item) in map {
                let keyword = KEYWORD_KEYS.contains(&key.as_str()) && item.is_string();
                // reward accumulation lists `steps` and `time`
                if keyword || key == "accumulate" {
                    continue;
                }
                collect_names(item, out);
            }
        }
        Value::Null | Value::Bool(_) | Value::Number(_) => {}
    }
}
