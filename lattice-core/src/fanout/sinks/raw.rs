//! Raw-event sink: the outbox backstop for writes whose synchronous
//! raw-store persist failed at ingest time.

use std::sync::Arc;

use async_trait::async_trait;

use crate::event::MemoryEvent;
use crate::outbox::{FanoutTarget, OutboxJob};
use crate::raw_store::RawStore;

use super::{FanoutSink, SinkError};

#[derive(Debug)]
pub struct RawEventSink {
    store: Arc<RawStore>,
}

impl RawEventSink {
    pub fn new(store: Arc<RawStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl FanoutSink for RawEventSink {
    fn target(&self) -> FanoutTarget {
        FanoutTarget::Raw
    }

    async fn deliver(&self, jobs: &[OutboxJob]) -> Result<(), SinkError> {
        for job in jobs {
            let event: MemoryEvent = serde_json::from_value(job.payload.clone())
                .map_err(|err| {
                    SinkError::permanent(format!("raw payload unreadable: {err}"))
                })?;
            self.store
                .persist_event(&event)
                .await
                .map_err(|err| SinkError::transient(format!("raw persist failed: {err}")))?;
        }
        Ok(())
    }
}
