use crate::consumer::RequestConsumer;
use crate::mappings::RequestType;
use crate::merger::{merge_requests, request_bodies, MergeError};
use crate::monitor::PipelineMonitor;
use crate::response_processor::{CorrelationError, ProcessingSummary, ResponseProcessor};
use crate::router::{RouterError, SasRouter};
use crate::store::{Store, StoreError};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum TickError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error("router error: {0}")]
    Router(#[from] RouterError),

    #[error("correlation error: {0}")]
    Correlation(#[from] CorrelationError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// No pending requests; nothing was sent or committed.
    Idle,
    Processed(ProcessingSummary),
}

/// One tick per call: Consumer, Merger, Router, Processor, then a single commit.
///
/// Any error drops the session uncommitted, so the fetched requests stay
/// Pending and are picked up again on the next tick.
pub struct Pipeline {
    store: Arc<Store>,
    consumer: RequestConsumer,
    router: Arc<dyn SasRouter>,
    monitor: Arc<PipelineMonitor>,
}

impl Pipeline {
    pub fn new(
        store: Arc<Store>,
        request_processing_limit: usize,
        router: Arc<dyn SasRouter>,
        monitor: Arc<PipelineMonitor>,
    ) -> Self {
        Self {
            store,
            consumer: RequestConsumer::new(request_processing_limit),
            router,
            monitor,
        }
    }

    pub fn monitor(&self) -> &Arc<PipelineMonitor> {
        &self.monitor
    }

    pub fn process_requests(&self, request_type: RequestType) -> Result<TickOutcome, TickError> {
        self.monitor.record_tick(request_type);
        let mut session = self.store.session()?;

        let pending = self.consumer.get_pending_requests(&session, request_type);
        let requests = pending.get(&request_type).cloned().unwrap_or_default();
        debug!("{} pending {} requests", requests.len(), request_type);

        let Some(envelope) = merge_requests(&request_bodies(&pending))? else {
            return Ok(TickOutcome::Idle);
        };

        info!("Sending {} {} requests to SAS", envelope.len(), request_type);
        self.monitor.record_sent(request_type, envelope.len());
        let response = self.router.post_to_sas(&envelope).map_err(|e| {
            self.monitor.record_router_error(request_type);
            e
        })?;
        info!("SAS answered {} with HTTP {}", request_type, response.status);

        let processor = ResponseProcessor::new(request_type);
        let summary = processor
            .process_response(&requests, &response, &mut session)
            .map_err(|e| {
                match &e {
                    // Non-2xx is a transport outcome, not a malformed answer.
                    CorrelationError::HttpStatus { .. } => self.monitor.record_router_error(request_type),
                    _ => self.monitor.record_correlation_error(request_type),
                }
                e
            })?;

        if let Err(e) = session.commit() {
            if let StoreError::Conflict(row) = &e {
                warn!(
                    "{} tick conflicted on row {}; requests stay pending for the next tick",
                    request_type, row
                );
            }
            return Err(e.into());
        }
        self.monitor
            .record_processed(request_type, summary.processed, summary.strategy_failures);
        info!(
            "Processed {} {} responses ({} strategy failures)",
            summary.processed, request_type, summary.strategy_failures
        );
        Ok(TickOutcome::Processed(summary))
    }
}
