//! Event sink fan-out
//!
//! Every decoded event is offered to a list of sinks: the in-memory
//! engine and, when configured, the columnar analytics store. Sinks are
//! infallible from the caller's point of view; they log their own
//! failures and never block ingest on each other.

pub mod clickhouse;

use crate::engine::TrackingEngine;
use crate::events::TrackingEvent;
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn handle(&self, event: &TrackingEvent);

    /// Sink label for logging.
    fn sink_type(&self) -> &'static str;
}

#[async_trait]
impl EventSink for TrackingEngine {
    async fn handle(&self, event: &TrackingEvent) {
        self.handle_tracking_event(event);
    }

    fn sink_type(&self) -> &'static str {
        "memory"
    }
}

/// Offers each event to every attached sink in order.
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        FanoutSink { sinks }
    }
}

#[async_trait]
impl EventSink for FanoutSink {
    async fn handle(&self, event: &TrackingEvent) {
        for sink in &self.sinks {
            sink.handle(event).await;
        }
    }

    fn sink_type(&self) -> &'static str {
        "fanout"
    }
}
