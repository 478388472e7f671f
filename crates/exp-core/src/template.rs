use std::collections::BTreeSet;

use serde_json::{Map, Value};

use crate::error::{CoreError, CoreResult};
use crate::params::ParameterSet;

/// A config template: literal JSON with `"__NAME__"` string leaves standing
/// for grid parameters. Substitution descends through nested objects only;
/// arrays and other values are literals.
#[derive(Debug, Clone, PartialEq)]
pub enum TemplateNode {
    Literal(Value),
    ParamRef(String),
    Map(Vec<(String, TemplateNode)>),
}

fn placeholder_name(raw: &str) -> Option<&str> {
    if raw.len() < 4 || !raw.starts_with("__") || !raw.ends_with("__") {
        return None;
    }
    let name = raw.trim_matches('_');
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

impl TemplateNode {
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::String(s) => match placeholder_name(s) {
                Some(name) => TemplateNode::ParamRef(name.to_string()),
                None => TemplateNode::Literal(value.clone()),
            },
            Value::Object(map) => TemplateNode::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), TemplateNode::from_json(v)))
                    .collect(),
            ),
            other => TemplateNode::Literal(other.clone()),
        }
    }

    pub fn resolve(&self, params: &ParameterSet) -> CoreResult<Value> {
        match self {
            TemplateNode::Literal(v) => Ok(v.clone()),
            TemplateNode::ParamRef(name) => params
                .get(name)
                .map(|v| v.to_json())
                .ok_or_else(|| CoreError::UnknownParameter(name.clone())),
            TemplateNode::Map(entries) => {
                let mut out = Map::new();
                for (key, node) in entries {
                    out.insert(key.clone(), node.resolve(params)?);
                }
                Ok(Value::Object(out))
            }
        }
    }

    pub fn param_refs(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_refs(&mut out);
        out
    }

    fn collect_refs(&self, out: &mut BTreeSet<String>) {
        match self {
            TemplateNode::Literal(_) => {}
            TemplateNode::ParamRef(name) => {
                out.insert(name.clone());
            }
            TemplateNode::Map(entries) => {
                for (_, node) in entries {
                    node.collect_refs(out);
                }
            }
        }
    }
}

/// A named template; `name` becomes the job's config name.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    pub name: String,
    pub root: TemplateNode,
}

impl Template {
    pub fn from_json(value: &Value) -> CoreResult<Self> {
        let name = value
            .get("name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| CoreError::InvalidTemplate("missing string field 'name'".to_string()))?;
        if name.is_empty() || name.contains('_') {
            return Err(CoreError::InvalidTemplate(format!(
                "template name '{}' must be non-empty and free of '_'",
                name
            )));
        }
        Ok(Template {
            name: name.to_string(),
            root: TemplateNode::from_json(value),
        })
    }

    pub fn resolve(&self, params: &ParameterSet) -> CoreResult<Value> {
        self.root.resolve(params)
    }
}
