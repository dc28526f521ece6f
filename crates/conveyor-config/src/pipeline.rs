//! Pipeline configuration parsing.
//!
//! ```kdl
//! resource "repo" type="git" {
//!     source {
//!         uri "https://example.com/app.git"
//!     }
//! }
//!
//! job "unit" {
//!     get "repo" trigger=#true
//! }
//!
//! job "deploy" serial=#true {
//!     serial-groups "prod"
//!     get "app" resource="repo" trigger=#true {
//!         passed "unit"
//!     }
//!     put "repo" {
//!         perform-on "success" "failure"
//!     }
//! }
//! ```

use crate::validate::validate_config;
use crate::{ConfigError, ConfigResult};
use conveyor_core::{
    Config, GroupConfig, InputConfig, JobConfig, OutputCondition, OutputConfig, ResourceConfig,
    ResourceType,
};
use kdl::{KdlDocument, KdlNode, KdlValue};
use serde_json::{Map, Value};

/// Parse and validate a pipeline configuration from KDL text.
pub fn parse_config(kdl: &str) -> ConfigResult<Config> {
    let doc: KdlDocument = kdl.parse()?;

    let mut config = Config::default();

    for node in doc.nodes() {
        match node.name().value() {
            "resource" => {
                config.resources.push(parse_resource(node)?);
            }
            "resource-type" | "resource_type" => {
                config.resource_types.push(parse_resource_type(node)?);
            }
            "job" => {
                config.jobs.push(parse_job(node)?);
            }
            "group" => {
                config.groups.push(parse_group(node)?);
            }
            _ => {} // Ignore unknown nodes
        }
    }

    validate_config(&config)?;

    Ok(config)
}

fn parse_resource(node: &KdlNode) -> ConfigResult<ResourceConfig> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("resource name".to_string()))?;
    let resource_type = get_string_prop(node, "type")
        .ok_or_else(|| ConfigError::MissingField(format!("type for resource '{}'", name)))?;

    Ok(ResourceConfig {
        name,
        resource_type,
        source: get_object_child(node, "source"),
    })
}

fn parse_resource_type(node: &KdlNode) -> ConfigResult<ResourceType> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("resource type name".to_string()))?;
    let resource_type = get_string_prop(node, "type")
        .ok_or_else(|| ConfigError::MissingField(format!("type for resource type '{}'", name)))?;

    Ok(ResourceType {
        name,
        resource_type,
        source: get_object_child(node, "source"),
    })
}

fn parse_group(node: &KdlNode) -> ConfigResult<GroupConfig> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("group name".to_string()))?;

    Ok(GroupConfig {
        name,
        jobs: get_string_list_prop(node, "jobs"),
        resources: get_string_list_prop(node, "resources"),
    })
}

fn parse_job(node: &KdlNode) -> ConfigResult<JobConfig> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("job name".to_string()))?;

    let max_in_flight = match node.get("max-in-flight").and_then(|v| v.as_integer()) {
        Some(n) => Some(u32::try_from(n).map_err(|_| ConfigError::InvalidValue {
            field: format!("max-in-flight for job '{}'", name),
            message: format!("{} is out of range", n),
        })?),
        None => None,
    };

    let mut job = JobConfig {
        public: get_bool_prop(node, "public").unwrap_or(false),
        serial: get_bool_prop(node, "serial").unwrap_or(false),
        serial_groups: get_string_list_prop(node, "serial-groups"),
        max_in_flight,
        name,
        ..Default::default()
    };

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "get" => {
                    job.inputs.push(parse_input(child, &job.name)?);
                }
                "put" => {
                    job.outputs.push(parse_output(child, &job.name)?);
                }
                _ => {}
            }
        }
    }

    Ok(job)
}

fn parse_input(node: &KdlNode, job: &str) -> ConfigResult<InputConfig> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField(format!("get name in job '{}'", job)))?;

    // `get "app" resource="repo"` names the input separately from its resource.
    let (raw_name, resource) = match get_string_prop(node, "resource") {
        Some(resource) => (Some(name), resource),
        None => (None, name),
    };

    Ok(InputConfig {
        raw_name,
        resource,
        params: get_object_child(node, "params"),
        passed: get_string_list_prop(node, "passed"),
        trigger: get_bool_prop(node, "trigger").unwrap_or(false),
    })
}

fn parse_output(node: &KdlNode, job: &str) -> ConfigResult<OutputConfig> {
    let resource = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField(format!("put resource in job '{}'", job)))?;

    let mut raw_perform_on = Vec::new();
    for condition in get_string_list_prop(node, "perform-on") {
        raw_perform_on.push(match condition.as_str() {
            "success" => OutputCondition::Success,
            "failure" => OutputCondition::Failure,
            other => {
                return Err(ConfigError::InvalidValue {
                    field: format!("perform-on for put '{}' in job '{}'", resource, job),
                    message: format!("unknown condition: {}", other),
                });
            }
        });
    }

    Ok(OutputConfig {
        params: get_object_child(node, "params"),
        resource,
        raw_perform_on,
    })
}

// Helper functions for extracting values from KDL nodes

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn get_all_string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

fn get_bool_prop(node: &KdlNode, name: &str) -> Option<bool> {
    node.get(name).and_then(|v| v.as_bool())
}

fn get_string_list_prop(node: &KdlNode, name: &str) -> Vec<String> {
    let mut result = Vec::new();

    // Repeated properties: passed="a" passed="b"
    for entry in node.entries() {
        if let Some(entry_name) = entry.name() {
            if entry_name.value() == name {
                if let Some(s) = entry.value().as_string() {
                    result.push(s.to_string());
                }
            }
        }
    }

    if !result.is_empty() {
        return result;
    }

    // Block syntax: a child node carrying the values as arguments
    if let Some(children) = node.children() {
        for child in children.nodes() {
            if child.name().value() == name {
                return get_all_string_args(child);
            }
        }
    }

    Vec::new()
}

/// Read a child block such as `source { ... }` as an opaque JSON object.
fn get_object_child(node: &KdlNode, name: &str) -> Map<String, Value> {
    node.children()
        .and_then(|children| children.nodes().iter().find(|c| c.name().value() == name))
        .map(node_to_object)
        .unwrap_or_default()
}

fn node_to_object(node: &KdlNode) -> Map<String, Value> {
    let mut object = Map::new();
    if let Some(children) = node.children() {
        for child in children.nodes() {
            object.insert(child.name().value().to_string(), node_to_value(child));
        }
    }
    object
}

fn node_to_value(node: &KdlNode) -> Value {
    if node.children().is_some() {
        return Value::Object(node_to_object(node));
    }

    let mut args: Vec<Value> = node
        .entries()
        .iter()
        .filter(|e| e.name().is_none())
        .map(|e| kdl_to_json(e.value()))
        .collect();

    match args.len() {
        0 => Value::Null,
        1 => args.remove(0),
        _ => Value::Array(args),
    }
}

fn kdl_to_json(value: &KdlValue) -> Value {
    match value {
        KdlValue::String(s) => Value::String(s.clone()),
        KdlValue::Integer(i) => i64::try_from(*i)
            .map(Value::from)
            .unwrap_or_else(|_| Value::String(i.to_string())),
        KdlValue::Float(f) => serde_json::Number::from_f64(*f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        KdlValue::Bool(b) => Value::Bool(*b),
        KdlValue::Null => Value::Null,
    }
}
