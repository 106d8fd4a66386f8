use crate::mappings::RequestType;
use crate::models::Request;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum MergeError {
    #[error("a bulk envelope carries one request type, got {0}")]
    MultipleRequestTypes(usize),
}

/// Ordered per-CBSD bodies under one request type. Entry order is the only
/// link between a request and its SAS response.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkEnvelope {
    pub request_type: RequestType,
    pub entries: Vec<Value>,
}

impl BulkEnvelope {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `{"<type>Request": [entry, ...]}`
    pub fn to_json(&self) -> Value {
        let mut object = Map::with_capacity(1);
        object.insert(
            self.request_type.request_key().to_string(),
            Value::Array(self.entries.clone()),
        );
        Value::Object(object)
    }
}

/// Builds the single bulk envelope for one tick. `Ok(None)` means nothing to send.
pub fn merge_requests(requests_by_type: &BTreeMap<RequestType, Vec<Value>>) -> Result<Option<BulkEnvelope>, MergeError> {
    if requests_by_type.len() > 1 {
        return Err(MergeError::MultipleRequestTypes(requests_by_type.len()));
    }
    Ok(requests_by_type
        .iter()
        .next()
        .filter(|(_, bodies)| !bodies.is_empty())
        .map(|(request_type, bodies)| BulkEnvelope {
            request_type: *request_type,
            entries: bodies.clone(),
        }))
}

/// Strips stored payload envelopes down to the bodies the merger expects.
pub fn request_bodies(requests_by_type: &BTreeMap<RequestType, Vec<Request>>) -> BTreeMap<RequestType, Vec<Value>> {
    requests_by_type
        .iter()
        .map(|(t, requests)| (*t, requests.iter().map(|r| r.body().clone()).collect()))
        .collect()
}
