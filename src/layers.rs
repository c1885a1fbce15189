//! Optional content group (layer) inspection.
//!
//! qpdf dumps the object table as JSON; this module only walks that JSON
//! looking for `/OCG` dictionaries. Both the v2 layout (qpdf 11+) and the
//! older v1 layout are understood.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::tools::{Invocation, Tool, ToolPaths};

/// A named optional content group in the template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layer {
    /// Indirect object reference, e.g. `12 0 R`.
    pub object: String,
    pub name: String,
}

/// Layers found in a template and whether the target layer is among them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerReport {
    pub layers: Vec<Layer>,
    pub target: String,
    pub target_found: bool,
}

impl LayerReport {
    pub fn new(layers: Vec<Layer>, target: &str) -> Self {
        let target_found = find_layer(&layers, target).is_some();
        Self {
            layers,
            target: target.to_string(),
            target_found,
        }
    }
}

#[derive(Debug, Error)]
pub enum LayerError {
    #[error("qpdf JSON could not be parsed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("qpdf JSON has no object table")]
    MissingObjects,
}

/// Case-insensitive layer lookup by name.
pub fn find_layer<'a>(layers: &'a [Layer], name: &str) -> Option<&'a Layer> {
    let wanted = name.trim().to_uppercase();
    layers
        .iter()
        .find(|layer| layer.name.trim().to_uppercase() == wanted)
}

/// qpdf invocations that dump the object table, newest JSON format first.
pub fn dump_invocations(paths: &ToolPaths, template: &Path, timeout: Duration) -> Vec<Invocation> {
    vec![
        Invocation::new(Tool::Qpdf, paths.program(Tool::Qpdf), timeout)
            .arg("--json=2")
            .arg("--json-key=qpdf")
            .arg(template),
        Invocation::new(Tool::Qpdf, paths.program(Tool::Qpdf), timeout)
            .arg("--json")
            .arg("--json-key=objects")
            .arg(template),
    ]
}

/// Extracts optional content groups from a qpdf JSON dump.
pub fn parse_qpdf_json(json: &str) -> Result<Vec<Layer>, LayerError> {
    let root: Value = serde_json::from_str(json)?;

    let mut layers = if let Some(objects) = v2_objects(&root) {
        objects
            .iter()
            .filter_map(|(key, entry)| {
                let reference = key.strip_prefix("obj:")?;
                let dict = entry.get("value")?.as_object()?;
                ocg_name(dict, decode_v2_string).map(|name| Layer {
                    object: reference.to_string(),
                    name,
                })
            })
            .collect::<Vec<_>>()
    } else if let Some(objects) = root.get("objects").and_then(Value::as_object) {
        objects
            .iter()
            .filter_map(|(key, entry)| {
                let dict = entry.as_object()?;
                ocg_name(dict, |s| Some(s.to_string())).map(|name| Layer {
                    object: key.clone(),
                    name,
                })
            })
            .collect()
    } else {
        return Err(LayerError::MissingObjects);
    };

    layers.sort_by_key(|layer| object_number(&layer.object));
    Ok(layers)
}

/// The object map in a v2 dump: second element of the `qpdf` array.
fn v2_objects(root: &Value) -> Option<&Map<String, Value>> {
    root.get("qpdf")?
        .as_array()?
        .iter()
        .filter_map(Value::as_object)
        .find(|map| map.keys().any(|k| k.starts_with("obj:")))
}

fn ocg_name(dict: &Map<String, Value>, decode: impl Fn(&str) -> Option<String>) -> Option<String> {
    if dict.get("/Type").and_then(Value::as_str) != Some("/OCG") {
        return None;
    }
    let raw = dict.get("/Name").and_then(Value::as_str)?;
    decode(raw)
}

/// v2 strings are tagged: `u:` for text, `b:` for hex-encoded bytes.
fn decode_v2_string(raw: &str) -> Option<String> {
    if let Some(text) = raw.strip_prefix("u:") {
        return Some(text.to_string());
    }
    let hex = raw.strip_prefix("b:")?;
    let bytes = decode_hex(hex)?;
    Some(decode_pdf_text(&bytes))
}

fn decode_hex(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok())
        .collect()
}

/// PDF text strings are UTF-16BE with a BOM, otherwise byte-per-char.
fn decode_pdf_text(bytes: &[u8]) -> String {
    if let Some(utf16) = bytes.strip_prefix(&[0xFE, 0xFF]) {
        let units: Vec<u16> = utf16
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();
        return String::from_utf16_lossy(&units);
    }
    bytes.iter().map(|&b| char::from(b)).collect()
}

fn object_number(reference: &str) -> u64 {
    reference
        .split_whitespace()
        .next()
        .and_then(|n| n.parse().ok())
        .unwrap_or(u64::MAX)
}
