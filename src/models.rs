//! Rows held by the request/response store.

use crate::mappings::{CbsdState, GrantState, RequestType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub type RowId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestState {
    Pending,
    Processed,
}

/// One CBSD action waiting for (or done with) its SAS round-trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: RowId,
    pub request_type: RequestType,
    pub cbsd: RowId,
    /// Single-key envelope, e.g. `{"registrationRequest": {...}}`.
    pub payload: Value,
    pub state: RequestState,
    pub created_at: DateTime<Utc>,
}

impl Request {
    /// The per-CBSD body inside the single-key payload envelope.
    pub fn body(&self) -> &Value {
        self.payload
            .get(self.request_type.request_key())
            .unwrap_or(&Value::Null)
    }

    pub fn is_pending(&self) -> bool {
        self.state == RequestState::Pending
    }
}

/// SAS answer for exactly one Request. Never mutated once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: RowId,
    pub request_id: RowId,
    pub response_code: Option<i64>,
    /// Single-key envelope, e.g. `{"registrationResponse": {...}}`.
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub low_frequency: u64,
    pub high_frequency: u64,
    pub channel_type: Option<String>,
    pub rule_applied: Option<String>,
    pub max_eirp: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cbsd {
    pub id: RowId,
    /// Identifier assigned by the SAS on successful registration.
    pub cbsd_id: Option<String>,
    pub fcc_id: Option<String>,
    pub user_id: Option<String>,
    pub cbsd_serial_number: Option<String>,
    pub state: CbsdState,
    pub channels: Vec<Channel>,
    /// One bitmask word per bandwidth (5, 10, 15, 20 MHz).
    pub available_frequencies: Option<Vec<u32>>,
}

impl Cbsd {
    pub fn new(fcc_id: Option<String>, user_id: Option<String>, cbsd_serial_number: Option<String>) -> Self {
        Self {
            id: 0,
            cbsd_id: None,
            fcc_id,
            user_id,
            cbsd_serial_number,
            state: CbsdState::Unregistered,
            channels: Vec::new(),
            available_frequencies: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Grant {
    pub id: RowId,
    pub cbsd: RowId,
    pub grant_id: String,
    pub state: GrantState,
    pub low_frequency: Option<u64>,
    pub high_frequency: Option<u64>,
    pub max_eirp: Option<f64>,
    pub heartbeat_interval: Option<u64>,
    pub transmit_expire_time: Option<DateTime<Utc>>,
    pub grant_expire_time: Option<DateTime<Utc>>,
    pub channel_type: Option<String>,
}

impl Grant {
    pub fn new(cbsd: RowId, grant_id: impl Into<String>, state: GrantState) -> Self {
        Self {
            id: 0,
            cbsd,
            grant_id: grant_id.into(),
            state,
            low_frequency: None,
            high_frequency: None,
            max_eirp: None,
            heartbeat_interval: None,
            transmit_expire_time: None,
            grant_expire_time: None,
            channel_type: None,
        }
    }
}
