//! Object to YAML rendering with excluded fields removed

use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::DynamicObject;
use serde_json::Value;

use crate::fieldpath::{is_valid_excluded_field, remove_fields};
use crate::Error;

/// ConfigMap key holding a YAML list of extra excluded fields
pub const EXCLUDED_FIELDS_KEY: &str = "excludedFields";

/// Excluded fields listed in a ConfigMap's [`EXCLUDED_FIELDS_KEY`] entry
pub fn config_map_excluded_fields(config_map: &ConfigMap) -> Result<Vec<String>, Error> {
    let Some(raw) = config_map
        .data
        .as_ref()
        .and_then(|d| d.get(EXCLUDED_FIELDS_KEY))
    else {
        return Ok(Vec::new());
    };
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    let fields: Vec<String> = serde_yaml::from_str::<Option<Vec<String>>>(raw)?.unwrap_or_default();
    let invalid: Vec<&str> = fields
        .iter()
        .map(String::as_str)
        .filter(|f| !is_valid_excluded_field(f))
        .collect();
    if !invalid.is_empty() {
        return Err(Error::serialization(format!(
            "invalid excluded field(s) in {EXCLUDED_FIELDS_KEY}: {}",
            invalid.join(", ")
        )));
    }
    Ok(fields)
}

/// Serialize `object` to YAML after removing every path in `excluded`
///
/// A path that does not parse fails the render, so an object is never
/// committed with a field the syncer meant to keep out of Git.
pub fn render_yaml(object: &DynamicObject, excluded: &[String]) -> Result<String, Error> {
    let mut tree: Value = serde_json::to_value(object)?;
    let errors = remove_fields(&mut tree, excluded);
    if !errors.is_empty() {
        let listed: Vec<String> = errors.iter().map(ToString::to_string).collect();
        return Err(Error::serialization(format!(
            "invalid excluded field(s): {}",
            listed.join("; ")
        )));
    }
    Ok(serde_yaml::to_string(&tree)?)
}
