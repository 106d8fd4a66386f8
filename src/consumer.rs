use crate::mappings::RequestType;
use crate::models::Request;
use crate::store::Session;
use std::collections::BTreeMap;

/// Pulls a bounded, oldest-first batch of Pending requests of one type.
///
/// Reading never changes a request's state; rows stay Pending until the
/// response processor handles the SAS answer and the tick commits.
pub struct RequestConsumer {
    request_processing_limit: usize,
}

impl RequestConsumer {
    pub fn new(request_processing_limit: usize) -> Self {
        Self { request_processing_limit }
    }

    pub fn get_pending_requests(
        &self,
        session: &Session<'_>,
        request_type: RequestType,
    ) -> BTreeMap<RequestType, Vec<Request>> {
        let requests = session.pending_requests(request_type, self.request_processing_limit);
        BTreeMap::from([(request_type, requests)])
    }
}
