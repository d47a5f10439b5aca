//! Reap apply: manifest reading, change set construction and server-side apply.

#![forbid(unsafe_code)]

use anyhow::{anyhow, bail, Context, Result};
use reap_core::{Action, ChangeSet, Entry, ObjectId};
use serde::Deserialize;
use serde_json::Value as Json;

mod ssa;

pub use ssa::KubeApply;

/// Size guards for manifest input. Defaults: 1,000,000 bytes per stream, 100,000 nodes per document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadLimits {
    pub max_bytes: usize,
    pub max_nodes: usize,
}

impl Default for ReadLimits {
    fn default() -> Self { Self { max_bytes: 1_000_000, max_nodes: 100_000 } }
}

impl ReadLimits {
    /// Defaults overridden by `REAP_MAX_YAML_BYTES` / `REAP_MAX_YAML_NODES`; unparsable values are ignored.
    pub fn from_env() -> Self {
        let env = |key: &str| std::env::var(key).ok().and_then(|s| s.parse::<usize>().ok());
        let d = Self::default();
        Self { max_bytes: env("REAP_MAX_YAML_BYTES").unwrap_or(d.max_bytes), max_nodes: env("REAP_MAX_YAML_NODES").unwrap_or(d.max_nodes) }
    }
}

/// True when `doc` has more than `max` JSON nodes. Counting stops at the first node past the limit.
fn exceeds_nodes(doc: &Json, max: usize) -> bool {
    let mut pending = vec![doc];
    let mut seen = 0usize;
    while let Some(node) = pending.pop() {
        seen += 1;
        if seen > max {
            return true;
        }
        match node {
            Json::Object(map) => pending.extend(map.values()),
            Json::Array(items) => pending.extend(items.iter()),
            _ => {}
        }
    }
    false
}

/// Read a multi-document YAML stream into JSON objects.
///
/// Empty documents are skipped and `v1` `*List` documents are flattened into their items.
pub fn read_objects(yaml: &str) -> Result<Vec<Json>> { read_objects_with(yaml, &ReadLimits::from_env()) }

pub fn read_objects_with(yaml: &str, limits: &ReadLimits) -> Result<Vec<Json>> {
    if yaml.len() > limits.max_bytes {
        bail!("YAML payload too large ({} > {} bytes)", yaml.len(), limits.max_bytes);
    }
    let mut out = Vec::new();
    for (i, doc) in serde_yaml::Deserializer::from_str(yaml).enumerate() {
        let val = serde_yaml::Value::deserialize(doc).with_context(|| format!("parsing YAML document {}", i))?;
        if val.is_null() {
            continue;
        }
        let json = serde_json::to_value(val).context("converting YAML to JSON")?;
        if exceeds_nodes(&json, limits.max_nodes) {
            bail!("YAML document {} too complex (>{} nodes)", i, limits.max_nodes);
        }
        flatten_into(json, &mut out).with_context(|| format!("reading YAML document {}", i))?;
    }
    Ok(out)
}

fn flatten_into(doc: Json, out: &mut Vec<Json>) -> Result<()> {
    if !doc.is_object() {
        bail!("manifest document is not an object");
    }
    let is_list = doc.get("apiVersion").and_then(|v| v.as_str()) == Some("v1")
        && doc.get("kind").and_then(|v| v.as_str()).map(|k| k.ends_with("List")).unwrap_or(false);
    if !is_list {
        out.push(doc);
        return Ok(());
    }
    match doc.get("items") {
        Some(Json::Array(items)) => {
            for item in items {
                flatten_into(item.clone(), out)?;
            }
            Ok(())
        }
        Some(Json::Null) | None => Ok(()),
        Some(_) => Err(anyhow!("list items must be an array")),
    }
}

/// Identity and version of a manifest object.
pub fn object_id(obj: &Json) -> Result<(ObjectId, String)> {
    let api_version = obj.get("apiVersion").and_then(|v| v.as_str()).ok_or_else(|| anyhow!("object missing apiVersion"))?;
    let kind = obj.get("kind").and_then(|v| v.as_str()).ok_or_else(|| anyhow!("object missing kind"))?;
    let meta = obj.get("metadata");
    let name = meta
        .and_then(|m| m.get("name"))
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow!("object missing metadata.name"))?;
    let namespace = meta.and_then(|m| m.get("namespace")).and_then(|v| v.as_str()).unwrap_or("");
    let (group, version) = match api_version.split_once('/') {
        Some((g, v)) => (g, v),
        None => ("", api_version),
    };
    Ok((ObjectId::new(namespace, name, group, kind), version.to_string()))
}

/// Build a change set from manifest objects, tagging every entry with `action`.
pub fn change_set_from_objects(objects: &[Json], action: Action) -> Result<ChangeSet> {
    objects
        .iter()
        .map(|o| {
            let (id, version) = object_id(o)?;
            Ok(Entry::new(id, version, action))
        })
        .collect()
}

/// Kinds other objects depend on being served or present.
pub fn is_cluster_definition(obj: &Json) -> bool {
    let kind = obj.get("kind").and_then(|v| v.as_str()).unwrap_or("");
    let api_version = obj.get("apiVersion").and_then(|v| v.as_str()).unwrap_or("");
    match kind {
        "CustomResourceDefinition" => api_version.starts_with("apiextensions.k8s.io/"),
        "Namespace" => api_version == "v1",
        _ => false,
    }
}

/// Split objects into cluster definitions and the rest, each in input order.
pub fn split_stages(objects: Vec<Json>) -> (Vec<Json>, Vec<Json>) { objects.into_iter().partition(is_cluster_definition) }

/// Order objects for apply: cluster definitions first, otherwise input order.
pub fn stage(objects: Vec<Json>) -> Vec<Json> {
    let (mut first, rest) = split_stages(objects);
    first.extend(rest);
    first
}
