//! Lossless model-name rewrite for JSON request payloads.
//!
//! Only the top-level object is decoded, and every member value is kept as raw
//! JSON text. Unknown fields, number formatting and nested structure therefore
//! reach the provider exactly as the client sent them.
use std::fmt;

use bytes::Bytes;
use serde::{
    Deserialize, Deserializer,
    de::{MapAccess, Visitor},
};
use serde_json::value::RawValue;
use thiserror::Error;

const MODEL_FIELD: &str = "model";

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RewriteError {
    #[error("request body is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("request body is not a JSON object")]
    NotAnObject,
}

/// Top-level object members in document order.
struct Members(Vec<(String, Box<RawValue>)>);

impl<'de> Deserialize<'de> for Members {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct MembersVisitor;

        impl<'de> Visitor<'de> for MembersVisitor {
            type Value = Members;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a JSON object")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Members, A::Error> {
                let mut members = Vec::with_capacity(map.size_hint().unwrap_or(8));
                while let Some(entry) = map.next_entry::<String, Box<RawValue>>()? {
                    members.push(entry);
                }
                Ok(Members(members))
            }
        }

        deserializer.deserialize_map(MembersVisitor)
    }
}

fn parse_members(body: &[u8]) -> Result<Members, RewriteError> {
    let raw: &RawValue = serde_json::from_slice(body)?;
    if !raw.get().starts_with('{') {
        return Err(RewriteError::NotAnObject);
    }
    Ok(serde_json::from_str(raw.get())?)
}

/// Replaces every top-level `model` member with `target`, appending one when absent.
pub fn rewrite_model(body: &[u8], target: &str) -> Result<Bytes, RewriteError> {
    let Members(members) = parse_members(body)?;
    let model_value = serde_json::to_string(target)?;

    let mut out = String::with_capacity(body.len() + target.len());
    out.push('{');
    let mut replaced = false;
    for (index, (key, value)) in members.iter().enumerate() {
        if index > 0 {
            out.push(',');
        }
        out.push_str(&serde_json::to_string(key)?);
        out.push(':');
        if key == MODEL_FIELD {
            out.push_str(&model_value);
            replaced = true;
        } else {
            out.push_str(value.get());
        }
    }
    if !replaced {
        if !members.is_empty() {
            out.push(',');
        }
        out.push_str(&serde_json::to_string(MODEL_FIELD)?);
        out.push(':');
        out.push_str(&model_value);
    }
    out.push('}');

    Ok(Bytes::from(out))
}

/// Reads the requested model name, if the body is an object with a string `model`.
pub fn extract_model(body: &[u8]) -> Option<String> {
    let Members(members) = parse_members(body).ok()?;
    members
        .into_iter()
        .find(|(key, _)| key == MODEL_FIELD)
        .and_then(|(_, value)| serde_json::from_str::<String>(value.get()).ok())
}
