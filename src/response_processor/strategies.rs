//! One state-mutation strategy per request type.

use crate::mappings::{CbsdState, GrantState, RequestType, ResponseCode};
use crate::models::{Channel, Grant, Request, RowId};
use crate::store::Session;
use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_MAX_EIRP: f64 = 37.0;

const CBRS_LOW_HZ: u64 = 3_550_000_000;
const BANDWIDTH_STEP_HZ: u64 = 5_000_000;

#[derive(Debug, Error, PartialEq)]
pub enum StrategyError {
    #[error("request references unknown cbsd row {0}")]
    UnknownCbsd(RowId),

    #[error("response entry is missing '{0}'")]
    MissingField(&'static str),

    #[error("no grant '{grant_id}' for cbsd row {cbsd}")]
    UnknownGrant { cbsd: RowId, grant_id: String },

    #[error("malformed '{field}': {reason}")]
    Malformed { field: &'static str, reason: String },
}

/// One element of a `<type>Response` array.
#[derive(Debug, Clone, PartialEq)]
pub struct SasResponseEntry {
    pub response_code: Option<i64>,
    pub response_data: Option<Vec<String>>,
    pub raw: Value,
}

impl SasResponseEntry {
    pub fn from_value(raw: Value) -> Self {
        let response = raw.get("response");
        let response_code = response.and_then(|r| r.get("responseCode")).and_then(Value::as_i64);
        let response_data = response
            .and_then(|r| r.get("responseData"))
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(Value::as_str).map(str::to_string).collect());
        Self {
            response_code,
            response_data,
            raw,
        }
    }

    pub fn code(&self) -> Option<ResponseCode> {
        self.response_code.map(ResponseCode::from_code)
    }

    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.raw.get(name).and_then(Value::as_str)
    }

    fn time_field(&self, name: &'static str) -> Result<Option<DateTime<Utc>>, StrategyError> {
        self.str_field(name).map(|s| parse_time(name, s)).transpose()
    }

    /// DEREGISTER, or INVALID_VALUE blaming the cbsdId/grantId (or nothing in particular).
    fn demands_unregister(&self) -> bool {
        match self.code() {
            Some(ResponseCode::Deregister) => true,
            Some(ResponseCode::InvalidValue) => match &self.response_data {
                None => true,
                Some(data) => data.is_empty() || data.iter().any(|d| d == "cbsdId" || d == "grantId"),
            },
            _ => false,
        }
    }
}

fn parse_time(field: &'static str, value: &str) -> Result<DateTime<Utc>, StrategyError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StrategyError::Malformed {
            field,
            reason: e.to_string(),
        })
}

pub trait ResponseStrategy: Send + Sync {
    fn process(&self, session: &mut Session<'_>, request: &Request, entry: &SasResponseEntry) -> Result<(), StrategyError>;
}

pub fn strategy_for(request_type: RequestType) -> &'static dyn ResponseStrategy {
    match request_type {
        RequestType::Registration => &RegistrationStrategy,
        RequestType::SpectrumInquiry => &SpectrumInquiryStrategy,
        RequestType::Grant => &GrantStrategy,
        RequestType::Heartbeat => &HeartbeatStrategy,
        RequestType::Relinquishment => &RelinquishmentStrategy,
        RequestType::Deregistration => &DeregistrationStrategy,
    }
}

/// Clears the bit a grant's channel held in the per-bandwidth availability masks.
///
/// Word index is `bandwidth / 5 MHz - 1`; bit is `(mid - 3550 MHz) / 5 MHz`.
/// Ranges that do not map onto the mask leave it unchanged.
pub fn unset_frequency(available: Option<Vec<u32>>, low_frequency: u64, high_frequency: u64) -> Option<Vec<u32>> {
    let mut words = available?;
    let bandwidth = high_frequency.saturating_sub(low_frequency);
    let mid = (low_frequency + high_frequency) / 2;

    let index = (bandwidth / BANDWIDTH_STEP_HZ).checked_sub(1);
    let bit = mid.checked_sub(CBRS_LOW_HZ).map(|offset| offset / BANDWIDTH_STEP_HZ);
    if let (Some(index), Some(bit)) = (index, bit) {
        if bandwidth % BANDWIDTH_STEP_HZ == 0 && bit < 32 {
            if let Some(word) = words.get_mut(index as usize) {
                *word &= !(1u32 << bit);
            }
        }
    }
    Some(words)
}

fn remove_grant(session: &mut Session<'_>, grant_row: RowId) {
    let Some(grant) = session.remove_grant(grant_row) else {
        return;
    };
    if let (Some(low), Some(high)) = (grant.low_frequency, grant.high_frequency) {
        if let Some(cbsd) = session.cbsd_mut(grant.cbsd) {
            cbsd.available_frequencies = unset_frequency(cbsd.available_frequencies.take(), low, high);
        }
    }
    debug!("Removed grant {} of cbsd row {}", grant.grant_id, grant.cbsd);
}

fn unregister(session: &mut Session<'_>, cbsd: RowId) -> Result<(), StrategyError> {
    let grant_rows: Vec<RowId> = session.grants_for(cbsd).iter().map(|g| g.id).collect();
    for row in grant_rows {
        session.remove_grant(row);
    }
    let row = session.cbsd_mut(cbsd).ok_or(StrategyError::UnknownCbsd(cbsd))?;
    row.state = CbsdState::Unregistered;
    row.channels.clear();
    row.available_frequencies = None;
    debug!("Unregistered cbsd row {}", cbsd);
    Ok(())
}

/// Grant id named by the response, falling back to the one the request sent.
fn grant_id_of<'a>(request: &'a Request, entry: &'a SasResponseEntry) -> Option<&'a str> {
    entry
        .str_field("grantId")
        .or_else(|| request.body().get("grantId").and_then(Value::as_str))
}

fn known_grant(session: &Session<'_>, request: &Request, entry: &SasResponseEntry) -> Result<RowId, StrategyError> {
    let grant_id = grant_id_of(request, entry).ok_or(StrategyError::MissingField("grantId"))?;
    session
        .find_grant(request.cbsd, grant_id)
        .ok_or_else(|| StrategyError::UnknownGrant {
            cbsd: request.cbsd,
            grant_id: grant_id.to_string(),
        })
}

/// Applies the shared DEREGISTER / INVALID_VALUE handling. `true` means the entry is fully handled.
fn unregistered_by(session: &mut Session<'_>, request: &Request, entry: &SasResponseEntry) -> Result<bool, StrategyError> {
    if entry.demands_unregister() {
        unregister(session, request.cbsd)?;
        return Ok(true);
    }
    Ok(false)
}

pub struct RegistrationStrategy;

impl ResponseStrategy for RegistrationStrategy {
    fn process(&self, session: &mut Session<'_>, request: &Request, entry: &SasResponseEntry) -> Result<(), StrategyError> {
        match entry.code() {
            Some(ResponseCode::Success) => {
                let cbsd_id = entry.str_field("cbsdId").ok_or(StrategyError::MissingField("cbsdId"))?;
                let cbsd = session
                    .cbsd_mut(request.cbsd)
                    .ok_or(StrategyError::UnknownCbsd(request.cbsd))?;
                cbsd.cbsd_id = Some(cbsd_id.to_string());
                cbsd.state = CbsdState::Registered;
                Ok(())
            }
            Some(ResponseCode::Deregister) => unregister(session, request.cbsd),
            _ => {
                let cbsd = session
                    .cbsd_mut(request.cbsd)
                    .ok_or(StrategyError::UnknownCbsd(request.cbsd))?;
                cbsd.state = CbsdState::Unregistered;
                Ok(())
            }
        }
    }
}

pub struct SpectrumInquiryStrategy;

impl SpectrumInquiryStrategy {
    fn channel(value: &Value) -> Result<Channel, StrategyError> {
        let malformed = |reason: &str| StrategyError::Malformed {
            field: "availableChannel",
            reason: reason.to_string(),
        };
        let range = value.get("frequencyRange").ok_or_else(|| malformed("missing frequencyRange"))?;
        let bound = |name: &str| {
            range
                .get(name)
                .and_then(Value::as_u64)
                .ok_or_else(|| malformed(&format!("missing {}", name)))
        };
        Ok(Channel {
            low_frequency: bound("lowFrequency")?,
            high_frequency: bound("highFrequency")?,
            channel_type: value.get("channelType").and_then(Value::as_str).map(str::to_string),
            rule_applied: value.get("ruleApplied").and_then(Value::as_str).map(str::to_string),
            max_eirp: value.get("maxEirp").and_then(Value::as_f64).unwrap_or(DEFAULT_MAX_EIRP),
        })
    }
}

impl ResponseStrategy for SpectrumInquiryStrategy {
    fn process(&self, session: &mut Session<'_>, request: &Request, entry: &SasResponseEntry) -> Result<(), StrategyError> {
        if unregistered_by(session, request, entry)? {
            return Ok(());
        }
        if entry.code() != Some(ResponseCode::Success) {
            return Ok(());
        }

        let channels = match entry.raw.get("availableChannel").and_then(Value::as_array) {
            Some(items) => items.iter().map(Self::channel).collect::<Result<Vec<_>, _>>()?,
            None => Vec::new(),
        };
        let cbsd = session
            .cbsd_mut(request.cbsd)
            .ok_or(StrategyError::UnknownCbsd(request.cbsd))?;
        cbsd.channels = channels;
        cbsd.available_frequencies = None;
        Ok(())
    }
}

pub struct GrantStrategy;

impl GrantStrategy {
    fn granted(session: &mut Session<'_>, request: &Request, entry: &SasResponseEntry) -> Result<(), StrategyError> {
        let grant_id = entry.str_field("grantId").ok_or(StrategyError::MissingField("grantId"))?;
        let grant_expire_time = entry.time_field("grantExpireTime")?;
        let heartbeat_interval = entry.raw.get("heartbeatInterval").and_then(Value::as_u64);
        let channel_type = entry.str_field("channelType").map(str::to_string);

        let operation = request.body().get("operationParam");
        let range = operation.and_then(|op| op.get("operationFrequencyRange"));
        let low_frequency = range.and_then(|r| r.get("lowFrequency")).and_then(Value::as_u64);
        let high_frequency = range.and_then(|r| r.get("highFrequency")).and_then(Value::as_u64);
        let max_eirp = operation.and_then(|op| op.get("maxEirp")).and_then(Value::as_f64);

        let row = match session.find_grant(request.cbsd, grant_id) {
            Some(row) => row,
            None => session.insert_grant(Grant::new(request.cbsd, grant_id, GrantState::Granted)),
        };
        if let Some(grant) = session.grant_mut(row) {
            grant.state = GrantState::Granted;
            grant.low_frequency = low_frequency;
            grant.high_frequency = high_frequency;
            grant.max_eirp = max_eirp;
            grant.heartbeat_interval = heartbeat_interval;
            grant.grant_expire_time = grant_expire_time;
            grant.channel_type = channel_type;
        }
        Ok(())
    }
}

impl ResponseStrategy for GrantStrategy {
    fn process(&self, session: &mut Session<'_>, request: &Request, entry: &SasResponseEntry) -> Result<(), StrategyError> {
        if unregistered_by(session, request, entry)? {
            return Ok(());
        }
        match entry.code() {
            Some(ResponseCode::Success) => Self::granted(session, request, entry),
            Some(ResponseCode::GrantConflict) => {
                for grant_id in entry.response_data.iter().flatten() {
                    if session.find_grant(request.cbsd, grant_id).is_none() {
                        session.insert_grant(Grant::new(request.cbsd, grant_id.as_str(), GrantState::Unsync));
                    }
                }
                Ok(())
            }
            _ => {
                let existing = grant_id_of(request, entry).and_then(|id| session.find_grant(request.cbsd, id));
                if let Some(row) = existing {
                    remove_grant(session, row);
                }
                Ok(())
            }
        }
    }
}

pub struct HeartbeatStrategy;

impl ResponseStrategy for HeartbeatStrategy {
    fn process(&self, session: &mut Session<'_>, request: &Request, entry: &SasResponseEntry) -> Result<(), StrategyError> {
        if unregistered_by(session, request, entry)? {
            return Ok(());
        }

        let next_state = match entry.code() {
            Some(ResponseCode::Success) => GrantState::Authorized,
            Some(ResponseCode::SuspendedGrant) => GrantState::Granted,
            Some(ResponseCode::UnsyncOpParam) => GrantState::Unsync,
            Some(ResponseCode::TerminatedGrant) => {
                let existing = grant_id_of(request, entry).and_then(|id| session.find_grant(request.cbsd, id));
                if let Some(row) = existing {
                    remove_grant(session, row);
                }
                return Ok(());
            }
            _ => return Ok(()),
        };

        let grant_id = grant_id_of(request, entry).ok_or(StrategyError::MissingField("grantId"))?;
        let transmit_expire_time = entry.time_field("transmitExpireTime")?;
        let grant_expire_time = entry.time_field("grantExpireTime")?;
        let heartbeat_interval = entry.raw.get("heartbeatInterval").and_then(Value::as_u64);

        // The SAS is authoritative: a grant it still heartbeats is recreated here.
        let row = match session.find_grant(request.cbsd, grant_id) {
            Some(row) => row,
            None => {
                debug!("Creating grant {} of cbsd row {} from heartbeat", grant_id, request.cbsd);
                session.insert_grant(Grant::new(request.cbsd, grant_id, next_state))
            }
        };

        if let Some(grant) = session.grant_mut(row) {
            grant.state = next_state;
            if next_state == GrantState::Authorized {
                grant.transmit_expire_time = transmit_expire_time;
                if grant_expire_time.is_some() {
                    grant.grant_expire_time = grant_expire_time;
                }
                if heartbeat_interval.is_some() {
                    grant.heartbeat_interval = heartbeat_interval;
                }
            }
        }
        Ok(())
    }
}

pub struct RelinquishmentStrategy;

impl ResponseStrategy for RelinquishmentStrategy {
    fn process(&self, session: &mut Session<'_>, request: &Request, entry: &SasResponseEntry) -> Result<(), StrategyError> {
        if unregistered_by(session, request, entry)? {
            return Ok(());
        }
        if entry.code() == Some(ResponseCode::Success) {
            let row = known_grant(session, request, entry)?;
            remove_grant(session, row);
        }
        Ok(())
    }
}

pub struct DeregistrationStrategy;

impl ResponseStrategy for DeregistrationStrategy {
    fn process(&self, session: &mut Session<'_>, request: &Request, _entry: &SasResponseEntry) -> Result<(), StrategyError> {
        unregister(session, request.cbsd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Cbsd;
    use crate::store::Store;
    use serde_json::json;

    const CBSD_ID: &str = "some_fcc_id/some_serial_number";

    /// Registered CBSD plus one pending request of `request_type` carrying `body`.
    fn setup(session: &mut Session<'_>, request_type: RequestType, body: Value) -> Request {
        let mut cbsd = Cbsd::new(Some("some_fcc_id".into()), None, Some("some_serial_number".into()));
        cbsd.cbsd_id = Some(CBSD_ID.into());
        cbsd.state = CbsdState::Registered;
        let cbsd = session.insert_cbsd(cbsd);
        let id = session.insert_request(request_type, cbsd, json!({ request_type.request_key(): body }));
        session.request(id).unwrap()
    }

    fn entry(code: i64, data: Option<Vec<&str>>, extra: Value) -> SasResponseEntry {
        let mut raw = json!({"cbsdId": CBSD_ID, "response": {"responseCode": code}});
        if let Some(data) = data {
            raw["response"]["responseData"] = json!(data);
        }
        if let Value::Object(fields) = extra {
            for (k, v) in fields {
                raw[k] = v;
            }
        }
        SasResponseEntry::from_value(raw)
    }

    fn add_grant(session: &mut Session<'_>, cbsd: RowId, grant_id: &str, state: GrantState) -> RowId {
        let mut grant = Grant::new(cbsd, grant_id, state);
        grant.low_frequency = Some(3_560_000_000);
        grant.high_frequency = Some(3_580_000_000);
        grant.max_eirp = Some(15.0);
        session.insert_grant(grant)
    }

    fn grant_states(session: &Session<'_>, cbsd: RowId) -> Vec<GrantState> {
        session.grants_for(cbsd).iter().map(|g| g.state).collect()
    }

    #[test]
    fn test_registration_outcomes() {
        let store = Store::in_memory();
        let mut session = store.session().unwrap();

        let req = setup(&mut session, RequestType::Registration, json!({"fccId": "some_fcc_id"}));
        session.cbsd_mut(req.cbsd).unwrap().state = CbsdState::Unregistered;
        RegistrationStrategy
            .process(&mut session, &req, &entry(0, None, json!({"cbsdId": "new_id"})))
            .unwrap();
        let cbsd = session.cbsd(req.cbsd).unwrap();
        assert_eq!(cbsd.state, CbsdState::Registered);
        assert_eq!(cbsd.cbsd_id.as_deref(), Some("new_id"));

        for code in [300, 400, 105, 104, 401, 500, 501] {
            let req = setup(&mut session, RequestType::Registration, json!({}));
            RegistrationStrategy.process(&mut session, &req, &entry(code, None, json!({}))).unwrap();
            assert_eq!(session.cbsd(req.cbsd).unwrap().state, CbsdState::Unregistered, "code {}", code);
        }
    }

    #[test]
    fn test_registration_success_without_cbsd_id() {
        let store = Store::in_memory();
        let mut session = store.session().unwrap();
        let req = setup(&mut session, RequestType::Registration, json!({}));
        let raw = json!({"response": {"responseCode": 0}});
        let err = RegistrationStrategy
            .process(&mut session, &req, &SasResponseEntry::from_value(raw))
            .unwrap_err();
        assert_eq!(err, StrategyError::MissingField("cbsdId"));
    }

    #[test]
    fn test_unregister_pre_step_for_every_non_registration_type() {
        let cases = [
            (105, None),
            (103, Some(vec!["cbsdId"])),
            (103, Some(vec!["grantId"])),
            (103, None),
        ];
        for request_type in RequestType::ALL.into_iter().skip(1) {
            for (code, data) in cases.clone() {
                let store = Store::in_memory();
                let mut session = store.session().unwrap();
                let req = setup(&mut session, request_type, json!({"cbsdId": CBSD_ID, "grantId": "g1"}));
                add_grant(&mut session, req.cbsd, "g1", GrantState::Authorized);
                session.cbsd_mut(req.cbsd).unwrap().available_frequencies = Some(vec![1, 2, 3, 4]);

                strategy_for(request_type)
                    .process(&mut session, &req, &entry(code, data, json!({})))
                    .unwrap();

                let cbsd = session.cbsd(req.cbsd).unwrap();
                assert_eq!(cbsd.state, CbsdState::Unregistered, "{} code {}", request_type, code);
                assert!(cbsd.available_frequencies.is_none());
                assert!(session.grants_for(req.cbsd).is_empty());
            }
        }
    }

    #[test]
    fn test_invalid_value_for_other_parameter_keeps_registration() {
        let store = Store::in_memory();
        let mut session = store.session().unwrap();
        let req = setup(&mut session, RequestType::Heartbeat, json!({"grantId": "g1"}));
        add_grant(&mut session, req.cbsd, "g1", GrantState::Authorized);

        HeartbeatStrategy
            .process(&mut session, &req, &entry(103, Some(vec!["measReport"]), json!({})))
            .unwrap();
        assert_eq!(session.cbsd(req.cbsd).unwrap().state, CbsdState::Registered);
        assert_eq!(grant_states(&session, req.cbsd), vec![GrantState::Authorized]);
    }

    #[test]
    fn test_spectrum_inquiry_replaces_channels() {
        let store = Store::in_memory();
        let mut session = store.session().unwrap();
        let req = setup(&mut session, RequestType::SpectrumInquiry, json!({"cbsdId": CBSD_ID}));
        {
            let cbsd = session.cbsd_mut(req.cbsd).unwrap();
            cbsd.available_frequencies = Some(vec![1, 1, 1, 1]);
            cbsd.channels.push(Channel {
                low_frequency: 1,
                high_frequency: 2,
                channel_type: None,
                rule_applied: None,
                max_eirp: 1.0,
            });
        }

        let available = json!({"availableChannel": [
            {"frequencyRange": {"lowFrequency": 3620000000u64, "highFrequency": 3630000000u64},
             "channelType": "GAA", "ruleApplied": "FCC_PART_96", "maxEirp": 20.5},
            {"frequencyRange": {"lowFrequency": 3630000000u64, "highFrequency": 3640000000u64},
             "channelType": "GAA", "ruleApplied": "FCC_PART_96"},
        ]});
        SpectrumInquiryStrategy.process(&mut session, &req, &entry(0, None, available)).unwrap();

        let cbsd = session.cbsd(req.cbsd).unwrap();
        assert_eq!(cbsd.channels.len(), 2);
        assert_eq!(cbsd.channels[0].max_eirp, 20.5);
        assert_eq!(cbsd.channels[1].max_eirp, DEFAULT_MAX_EIRP);
        assert_eq!(cbsd.channels[1].channel_type.as_deref(), Some("GAA"));
        assert!(cbsd.available_frequencies.is_none());

        SpectrumInquiryStrategy
            .process(&mut session, &req, &entry(0, None, json!({"availableChannel": []})))
            .unwrap();
        assert!(session.cbsd(req.cbsd).unwrap().channels.is_empty());
    }

    #[test]
    fn test_spectrum_inquiry_rejects_channel_without_range() {
        let store = Store::in_memory();
        let mut session = store.session().unwrap();
        let req = setup(&mut session, RequestType::SpectrumInquiry, json!({}));
        let err = SpectrumInquiryStrategy
            .process(&mut session, &req, &entry(0, None, json!({"availableChannel": [{"maxEirp": 1}]})))
            .unwrap_err();
        assert!(matches!(err, StrategyError::Malformed { field: "availableChannel", .. }));
    }

    #[test]
    fn test_grant_success_stores_operation_params() {
        let store = Store::in_memory();
        let mut session = store.session().unwrap();
        let body = json!({"cbsdId": CBSD_ID, "operationParam": {
            "maxEirp": 35.0,
            "operationFrequencyRange": {"lowFrequency": 3560000000u64, "highFrequency": 3580000000u64},
        }});
        let req = setup(&mut session, RequestType::Grant, body);
        let extra = json!({
            "grantId": "g1",
            "heartbeatInterval": 60,
            "grantExpireTime": "2030-01-01T00:00:00Z",
            "channelType": "GAA",
        });
        GrantStrategy.process(&mut session, &req, &entry(0, None, extra)).unwrap();

        let row = session.find_grant(req.cbsd, "g1").unwrap();
        let grant = session.grant(row).unwrap();
        assert_eq!(grant.state, GrantState::Granted);
        assert_eq!(grant.low_frequency, Some(3_560_000_000));
        assert_eq!(grant.high_frequency, Some(3_580_000_000));
        assert_eq!(grant.max_eirp, Some(35.0));
        assert_eq!(grant.heartbeat_interval, Some(60));
        assert_eq!(grant.channel_type.as_deref(), Some("GAA"));
        assert_eq!(grant.grant_expire_time.unwrap().to_rfc3339(), "2030-01-01T00:00:00+00:00");
    }

    #[test]
    fn test_grant_conflict_adds_unknown_grants_as_unsync() {
        let store = Store::in_memory();
        let mut session = store.session().unwrap();
        let req = setup(&mut session, RequestType::Grant, json!({"cbsdId": CBSD_ID}));
        add_grant(&mut session, req.cbsd, "known", GrantState::Granted);

        GrantStrategy
            .process(&mut session, &req, &entry(401, Some(vec!["known", "other"]), json!({})))
            .unwrap();
        assert_eq!(grant_states(&session, req.cbsd), vec![GrantState::Granted, GrantState::Unsync]);
    }

    #[test]
    fn test_grant_failure_removes_existing_grant() {
        for code in [400, 500] {
            let store = Store::in_memory();
            let mut session = store.session().unwrap();
            let req = setup(&mut session, RequestType::Grant, json!({"cbsdId": CBSD_ID}));
            add_grant(&mut session, req.cbsd, "g1", GrantState::Granted);

            GrantStrategy
                .process(&mut session, &req, &entry(code, None, json!({"grantId": "g1"})))
                .unwrap();
            assert!(session.grants_for(req.cbsd).is_empty(), "code {}", code);
        }
    }

    #[test]
    fn test_heartbeat_transitions() {
        let cases = [
            (0, vec![GrantState::Authorized]),
            (500, vec![]),
            (501, vec![GrantState::Granted]),
            (502, vec![GrantState::Unsync]),
            (400, vec![GrantState::Granted]),
        ];
        for (code, expected) in cases {
            let store = Store::in_memory();
            let mut session = store.session().unwrap();
            let req = setup(&mut session, RequestType::Heartbeat, json!({"cbsdId": CBSD_ID, "grantId": "g1"}));
            add_grant(&mut session, req.cbsd, "g1", GrantState::Granted);

            let extra = json!({"grantId": "g1", "transmitExpireTime": "2030-01-01T00:05:00Z"});
            HeartbeatStrategy.process(&mut session, &req, &entry(code, None, extra)).unwrap();
            assert_eq!(grant_states(&session, req.cbsd), expected, "code {}", code);
        }
    }

    #[test]
    fn test_heartbeat_success_updates_transmit_expire_time() {
        let store = Store::in_memory();
        let mut session = store.session().unwrap();
        let req = setup(&mut session, RequestType::Heartbeat, json!({"grantId": "g1"}));
        let row = add_grant(&mut session, req.cbsd, "g1", GrantState::Granted);

        let extra = json!({"grantId": "g1", "transmitExpireTime": "2030-01-01T00:05:00Z", "heartbeatInterval": 30});
        HeartbeatStrategy.process(&mut session, &req, &entry(0, None, extra)).unwrap();
        let grant = session.grant(row).unwrap();
        assert!(grant.transmit_expire_time.is_some());
        assert_eq!(grant.heartbeat_interval, Some(30));
    }

    #[test]
    fn test_heartbeat_creates_grant_missing_locally() {
        for (code, expected) in [(0, GrantState::Authorized), (501, GrantState::Granted), (502, GrantState::Unsync)] {
            let store = Store::in_memory();
            let mut session = store.session().unwrap();
            let req = setup(&mut session, RequestType::Heartbeat, json!({"grantId": "g7"}));

            let extra = json!({"transmitExpireTime": "2030-01-01T00:05:00Z"});
            HeartbeatStrategy.process(&mut session, &req, &entry(code, None, extra)).unwrap();

            let row = session.find_grant(req.cbsd, "g7").unwrap();
            let grant = session.grant(row).unwrap();
            assert_eq!(grant.state, expected, "code {}", code);
            assert_eq!(grant.transmit_expire_time.is_some(), code == 0);
        }
    }

    #[test]
    fn test_heartbeat_terminated_for_missing_grant_is_noop() {
        let store = Store::in_memory();
        let mut session = store.session().unwrap();
        let req = setup(&mut session, RequestType::Heartbeat, json!({"grantId": "gone"}));
        add_grant(&mut session, req.cbsd, "other", GrantState::Authorized);

        HeartbeatStrategy.process(&mut session, &req, &entry(500, None, json!({}))).unwrap();
        assert_eq!(grant_states(&session, req.cbsd), vec![GrantState::Authorized]);
    }

    #[test]
    fn test_heartbeat_without_grant_id_is_row_error() {
        let store = Store::in_memory();
        let mut session = store.session().unwrap();
        let req = setup(&mut session, RequestType::Heartbeat, json!({"cbsdId": CBSD_ID}));
        let err = HeartbeatStrategy
            .process(&mut session, &req, &entry(0, None, json!({})))
            .unwrap_err();
        assert_eq!(err, StrategyError::MissingField("grantId"));
        assert!(session.grants_for(req.cbsd).is_empty());
    }

    #[test]
    fn test_heartbeat_rejects_bad_timestamp() {
        let store = Store::in_memory();
        let mut session = store.session().unwrap();
        let req = setup(&mut session, RequestType::Heartbeat, json!({"grantId": "g1"}));
        add_grant(&mut session, req.cbsd, "g1", GrantState::Granted);
        let err = HeartbeatStrategy
            .process(&mut session, &req, &entry(0, None, json!({"transmitExpireTime": "tomorrow"})))
            .unwrap_err();
        assert!(matches!(err, StrategyError::Malformed { field: "transmitExpireTime", .. }));
    }

    #[test]
    fn test_relinquishment_success_removes_grant_and_frees_frequency() {
        let store = Store::in_memory();
        let mut session = store.session().unwrap();
        let req = setup(&mut session, RequestType::Relinquishment, json!({"grantId": "g1"}));
        add_grant(&mut session, req.cbsd, "g1", GrantState::Authorized);
        session.cbsd_mut(req.cbsd).unwrap().available_frequencies = Some(vec![0, 0b110, 0b1111100, 0b10101]);

        RelinquishmentStrategy
            .process(&mut session, &req, &entry(0, None, json!({"grantId": "g1"})))
            .unwrap();
        assert!(session.grants_for(req.cbsd).is_empty());
        assert_eq!(
            session.cbsd(req.cbsd).unwrap().available_frequencies,
            Some(vec![0, 0b110, 0b1111100, 0b00101])
        );
    }

    #[test]
    fn test_relinquishment_of_unknown_grant_is_row_error() {
        let store = Store::in_memory();
        let mut session = store.session().unwrap();
        let req = setup(&mut session, RequestType::Relinquishment, json!({"grantId": "missing"}));
        let err = RelinquishmentStrategy
            .process(&mut session, &req, &entry(0, None, json!({})))
            .unwrap_err();
        assert!(matches!(err, StrategyError::UnknownGrant { grant_id, .. } if grant_id == "missing"));
    }

    #[test]
    fn test_deregistration_always_unregisters() {
        for code in [0, 400] {
            let store = Store::in_memory();
            let mut session = store.session().unwrap();
            let req = setup(&mut session, RequestType::Deregistration, json!({"cbsdId": CBSD_ID}));
            DeregistrationStrategy.process(&mut session, &req, &entry(code, None, json!({}))).unwrap();
            assert_eq!(session.cbsd(req.cbsd).unwrap().state, CbsdState::Unregistered);
        }
    }

    #[test]
    fn test_unset_frequency() {
        let cases: [(Option<Vec<u32>>, u64, u64, Option<Vec<u32>>); 5] = [
            (None, 3560000000, 3580000000, None),
            (Some(vec![0b1111, 0b110, 0b1100, 0b1010]), 3562500000, 3567500000, Some(vec![0b0111, 0b110, 0b1100, 0b1010])),
            (Some(vec![0b0, 0b110, 0b1100, 0b1010]), 3550000000, 3560000000, Some(vec![0b0, 0b100, 0b1100, 0b1010])),
            (Some(vec![0b0, 0b110, 0b1111100, 0b1010]), 3572500000, 3587500000, Some(vec![0b0, 0b110, 0b0111100, 0b1010])),
            (Some(vec![0b0, 0b110, 0b1111100, 0b10101]), 3560000000, 3580000000, Some(vec![0b0, 0b110, 0b1111100, 0b00101])),
        ];
        for (available, low, high, expected) in cases {
            assert_eq!(unset_frequency(available, low, high), expected);
        }
    }

    #[test]
    fn test_unset_frequency_ignores_out_of_band_ranges() {
        let words = Some(vec![u32::MAX; 4]);
        assert_eq!(unset_frequency(words.clone(), 3400000000, 3410000000), words);
        assert_eq!(unset_frequency(words.clone(), 3560000000, 3563000000), words);
        assert_eq!(unset_frequency(words.clone(), 3560000000, 3660000000), words);
    }
}
