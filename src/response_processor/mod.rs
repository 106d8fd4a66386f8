//! Maps a bulk SAS response back onto the requests that produced it.
//!
//! Correlation is positional: entry `i` of the `<type>Response` array answers
//! request `i` of the bulk envelope. The whole body is validated before any row
//! is written, so a malformed or mismatched response leaves the session untouched.

pub mod strategies;

pub use strategies::{strategy_for, unset_frequency, ResponseStrategy, SasResponseEntry, StrategyError};

use crate::mappings::RequestType;
use crate::models::Request;
use crate::router::SasResponse;
use crate::store::{Session, StoreError};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, error, warn};

#[derive(Debug, Error)]
pub enum CorrelationError {
    #[error("SAS answered {request_type} with HTTP {status}")]
    HttpStatus { request_type: RequestType, status: u16 },

    #[error("{request_type} response body is not JSON: {reason}")]
    MalformedBody { request_type: RequestType, reason: String },

    #[error("{request_type} response has no '{key}' array")]
    MissingEnvelope { request_type: RequestType, key: &'static str },

    #[error("{request_type}: {responses} response entries for {requests} requests")]
    LengthMismatch {
        request_type: RequestType,
        requests: usize,
        responses: usize,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ProcessingSummary {
    pub processed: usize,
    pub strategy_failures: usize,
}

pub struct ResponseProcessor {
    request_type: RequestType,
    strategy: &'static dyn ResponseStrategy,
}

impl ResponseProcessor {
    pub fn new(request_type: RequestType) -> Self {
        Self {
            request_type,
            strategy: strategy_for(request_type),
        }
    }

    pub fn request_type(&self) -> RequestType {
        self.request_type
    }

    /// Splits the bulk body into per-request entries, checking shape and length.
    pub fn correlate(&self, requests: &[Request], response: &SasResponse) -> Result<Vec<SasResponseEntry>, CorrelationError> {
        let request_type = self.request_type;
        if !response.is_success() {
            return Err(CorrelationError::HttpStatus {
                request_type,
                status: response.status,
            });
        }

        let body: Value = serde_json::from_str(&response.body).map_err(|e| CorrelationError::MalformedBody {
            request_type,
            reason: e.to_string(),
        })?;
        let key = request_type.response_key();
        let entries = match body.get(key) {
            Some(Value::Array(entries)) => entries,
            _ => return Err(CorrelationError::MissingEnvelope { request_type, key }),
        };

        if entries.len() != requests.len() {
            return Err(CorrelationError::LengthMismatch {
                request_type,
                requests: requests.len(),
                responses: entries.len(),
            });
        }

        Ok(entries.iter().cloned().map(SasResponseEntry::from_value).collect())
    }

    /// Persists one Response per request, applies its strategy and marks the request Processed.
    /// A failing strategy affects only its own row.
    pub fn process_response(
        &self,
        requests: &[Request],
        response: &SasResponse,
        session: &mut Session<'_>,
    ) -> Result<ProcessingSummary, CorrelationError> {
        let entries = match self.correlate(requests, response) {
            Ok(entries) => entries,
            Err(e) => {
                error!("Dropping {} response: {}", self.request_type, e);
                return Err(e);
            }
        };

        let mut summary = ProcessingSummary::default();
        for (request, entry) in requests.iter().zip(entries) {
            let payload = json!({ self.request_type.response_key(): entry.raw.clone() });
            session.insert_response(request.id, entry.response_code, payload);

            if let Err(e) = self.strategy.process(session, request, &entry) {
                warn!(
                    "{} strategy failed for request {} (code {:?}): {}",
                    self.request_type, request.id, entry.response_code, e
                );
                summary.strategy_failures += 1;
            }

            session.mark_processed(request.id)?;
            debug!(
                "Processed {} request {} with response code {:?}",
                self.request_type, request.id, entry.response_code
            );
            summary.processed += 1;
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mappings::CbsdState;
    use crate::models::Cbsd;
    use crate::store::Store;

    fn registration_requests(session: &mut Session<'_>, n: usize) -> Vec<Request> {
        (0..n)
            .map(|i| {
                let serial = format!("sn{}", i);
                let cbsd = session.insert_cbsd(Cbsd::new(Some("fcc".into()), None, Some(serial.clone())));
                let id = session.insert_request(
                    RequestType::Registration,
                    cbsd,
                    json!({"registrationRequest": {"fccId": "fcc", "cbsdSerialNumber": serial}}),
                );
                session.request(id).unwrap()
            })
            .collect()
    }

    fn ok(body: Value) -> SasResponse {
        SasResponse {
            status: 200,
            body: body.to_string(),
        }
    }

    #[test]
    fn test_every_request_gets_one_response_and_is_processed() {
        let store = Store::in_memory();
        let mut session = store.session().unwrap();
        let requests = registration_requests(&mut session, 2);

        let body = json!({"registrationResponse": [
            {"cbsdId": "id0", "response": {"responseCode": 0}},
            {"response": {"responseCode": 0}},
        ]});
        let summary = ResponseProcessor::new(RequestType::Registration)
            .process_response(&requests, &ok(body), &mut session)
            .unwrap();

        assert_eq!(summary, ProcessingSummary { processed: 2, strategy_failures: 1 });
        for request in &requests {
            assert!(!session.request(request.id).unwrap().is_pending());
            let responses = session.responses_for(request.id);
            assert_eq!(responses.len(), 1);
            assert_eq!(responses[0].response_code, Some(0));
            assert!(responses[0].payload.get("registrationResponse").is_some());
        }
        assert_eq!(session.cbsd(requests[0].cbsd).unwrap().state, CbsdState::Registered);
    }

    #[test]
    fn test_failed_middle_row_does_not_shift_neighbours() {
        let store = Store::in_memory();
        let mut session = store.session().unwrap();
        let requests = registration_requests(&mut session, 3);

        let body = json!({"registrationResponse": [
            {"cbsdId": "id0", "response": {"responseCode": 0}},
            {"response": {"responseCode": 0}},
            {"cbsdId": "id2", "response": {"responseCode": 0}},
        ]});
        let summary = ResponseProcessor::new(RequestType::Registration)
            .process_response(&requests, &ok(body), &mut session)
            .unwrap();

        assert_eq!(summary, ProcessingSummary { processed: 3, strategy_failures: 1 });
        assert!(requests.iter().all(|r| !session.request(r.id).unwrap().is_pending()));

        let first = session.cbsd(requests[0].cbsd).unwrap();
        assert_eq!(first.state, CbsdState::Registered);
        assert_eq!(first.cbsd_id.as_deref(), Some("id0"));
        let middle = session.cbsd(requests[1].cbsd).unwrap();
        assert_eq!(middle.state, CbsdState::Unregistered);
        assert!(middle.cbsd_id.is_none());
        let last = session.cbsd(requests[2].cbsd).unwrap();
        assert_eq!(last.state, CbsdState::Registered);
        assert_eq!(last.cbsd_id.as_deref(), Some("id2"));
    }

    #[test]
    fn test_length_mismatch_changes_nothing() {
        let store = Store::in_memory();
        let mut session = store.session().unwrap();
        let requests = registration_requests(&mut session, 3);

        let body = json!({"registrationResponse": [
            {"cbsdId": "a", "response": {"responseCode": 0}},
            {"cbsdId": "b", "response": {"responseCode": 0}},
        ]});
        let err = ResponseProcessor::new(RequestType::Registration)
            .process_response(&requests, &ok(body), &mut session)
            .unwrap_err();

        assert!(matches!(err, CorrelationError::LengthMismatch { requests: 3, responses: 2, .. }));
        for request in &requests {
            assert!(session.request(request.id).unwrap().is_pending());
            assert!(session.responses_for(request.id).is_empty());
            assert_eq!(session.cbsd(request.cbsd).unwrap().state, CbsdState::Unregistered);
        }
    }

    #[test]
    fn test_rejects_wrong_envelope_and_bad_status() {
        let store = Store::in_memory();
        let mut session = store.session().unwrap();
        let requests = registration_requests(&mut session, 1);
        let processor = ResponseProcessor::new(RequestType::Registration);

        let err = processor
            .process_response(&requests, &ok(json!({"grantResponse": [{}]})), &mut session)
            .unwrap_err();
        assert!(matches!(err, CorrelationError::MissingEnvelope { key: "registrationResponse", .. }));

        let not_json = SasResponse {
            status: 200,
            body: "<html>".into(),
        };
        assert!(matches!(
            processor.process_response(&requests, &not_json, &mut session),
            Err(CorrelationError::MalformedBody { .. })
        ));

        let unavailable = SasResponse {
            status: 503,
            body: String::new(),
        };
        assert!(matches!(
            processor.process_response(&requests, &unavailable, &mut session),
            Err(CorrelationError::HttpStatus { status: 503, .. })
        ));
        assert!(session.request(requests[0].id).unwrap().is_pending());
    }
}
