//! Inbound side: turns a `{"<type>Request": [...]}` body into Pending requests.

use crate::mappings::RequestType;
use crate::models::{Cbsd, RowId};
use crate::store::Session;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, PartialEq)]
pub enum EnvelopeError {
    #[error("request body must be a JSON object with exactly one key")]
    NotSingleKey,

    #[error("unknown request envelope key '{0}'")]
    UnknownKey(String),

    #[error("'{0}' must hold a non-empty array")]
    EmptyOrNotArray(String),

    #[error("entry {index} of '{key}' is not an object")]
    EntryNotObject { key: String, index: usize },

    #[error("entry {index} of '{key}' is missing '{field}'")]
    MissingField { key: String, index: usize, field: &'static str },

    #[error("entry {index} of '{key}' references unknown cbsdId '{cbsd_id}'")]
    UnknownCbsd { key: String, index: usize, cbsd_id: String },
}

/// Validates an inbound bulk body and persists one Pending request per entry.
///
/// Registration entries are matched to a CBSD by `(fccId, cbsdSerialNumber)`,
/// creating the CBSD row for devices seen for the first time. Every other type
/// must name an already registered `cbsdId`.
pub fn enqueue_bulk(session: &mut Session<'_>, body: &Value) -> Result<Vec<RowId>, EnvelopeError> {
    let (key, entries) = single_key_array(body)?;
    let request_type = RequestType::from_request_key(key).ok_or_else(|| EnvelopeError::UnknownKey(key.to_string()))?;

    let mut ids = Vec::with_capacity(entries.len());
    for (index, entry) in entries.iter().enumerate() {
        let fields = entry.as_object().ok_or_else(|| EnvelopeError::EntryNotObject {
            key: key.to_string(),
            index,
        })?;
        let cbsd = locate_cbsd(session, request_type, key, index, fields)?;
        let id = session.insert_request(request_type, cbsd, json!({ key: entry }));
        ids.push(id);
    }

    debug!("Enqueued {} {} requests", ids.len(), request_type);
    Ok(ids)
}

fn single_key_array(body: &Value) -> Result<(&str, &Vec<Value>), EnvelopeError> {
    let object = body.as_object().ok_or(EnvelopeError::NotSingleKey)?;
    if object.len() != 1 {
        return Err(EnvelopeError::NotSingleKey);
    }
    let (key, value) = object.iter().next().ok_or(EnvelopeError::NotSingleKey)?;
    match value.as_array() {
        Some(entries) if !entries.is_empty() => Ok((key.as_str(), entries)),
        _ => Err(EnvelopeError::EmptyOrNotArray(key.clone())),
    }
}

fn locate_cbsd(
    session: &mut Session<'_>,
    request_type: RequestType,
    key: &str,
    index: usize,
    fields: &Map<String, Value>,
) -> Result<RowId, EnvelopeError> {
    let text = |field: &str| fields.get(field).and_then(Value::as_str).map(str::to_string);
    let missing = |field: &'static str| EnvelopeError::MissingField {
        key: key.to_string(),
        index,
        field,
    };

    if request_type == RequestType::Registration {
        let fcc_id = text("fccId").ok_or_else(|| missing("fccId"))?;
        let serial = text("cbsdSerialNumber").ok_or_else(|| missing("cbsdSerialNumber"))?;
        if let Some(id) = session.find_cbsd_by_serial(&fcc_id, &serial) {
            return Ok(id);
        }
        return Ok(session.insert_cbsd(Cbsd::new(Some(fcc_id), text("userId"), Some(serial))));
    }

    let cbsd_id = text("cbsdId").ok_or_else(|| missing("cbsdId"))?;
    session
        .find_cbsd_by_cbsd_id(&cbsd_id)
        .ok_or(EnvelopeError::UnknownCbsd {
            key: key.to_string(),
            index,
            cbsd_id,
        })
}
