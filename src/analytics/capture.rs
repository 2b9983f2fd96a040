//! Event capture queue
//!
//! Request handlers hand events to a bounded channel and never wait on it: when
//! the queue is full the event is dropped and counted. A single background
//! consumer drains the queue in order, appending each event to the raw log and
//! folding it into the real-time counters. Both side effects are best effort.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::counters::RealtimeCounters;
use super::diagnostics::Diagnostics;
use super::raw_log::DailyLogWriter;
use crate::events::RequestEvent;

/// Producer handle; cheap to clone into request handlers
#[derive(Clone)]
pub struct EventCapture {
    tx: mpsc::Sender<RequestEvent>,
    diagnostics: Arc<Diagnostics>,
}

/// Receiving end of the capture queue, consumed by [`spawn_consumer`]
pub struct EventQueue {
    rx: mpsc::Receiver<RequestEvent>,
}

impl EventQueue {
    #[cfg(test)]
    pub(crate) fn try_recv(&mut self) -> Option<RequestEvent> {
        self.rx.try_recv().ok()
    }
}

/// Where the consumer sends each event
pub struct CaptureSinks {
    pub raw_log: Option<Arc<DailyLogWriter>>,
    pub counters: Arc<RealtimeCounters>,
    pub diagnostics: Arc<Diagnostics>,
}

/// Create the bounded queue
pub fn channel(capacity: usize, diagnostics: Arc<Diagnostics>) -> (EventCapture, EventQueue) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (EventCapture { tx, diagnostics }, EventQueue { rx })
}

impl EventCapture {
    /// Enqueue an event without blocking. Returns false if it was dropped.
    pub fn capture(&self, event: RequestEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => {
                self.diagnostics.event_captured();
                true
            }
            Err(mpsc::error::TrySendError::Full(event)) => {
                self.diagnostics.event_dropped();
                warn!(method = %event.method, path = %event.path, "analytics queue full, dropping event");
                false
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                self.diagnostics.event_dropped();
                warn!(method = %event.method, path = %event.path, "analytics consumer stopped, dropping event");
                false
            }
        }
    }
}

/// Start the background consumer. It exits once every [`EventCapture`] is dropped
/// and the queue is drained.
pub fn spawn_consumer(queue: EventQueue, sinks: CaptureSinks) -> JoinHandle<()> {
    tokio::spawn(consume(queue, sinks))
}

async fn consume(mut queue: EventQueue, sinks: CaptureSinks) {
    info!(raw_log = sinks.raw_log.is_some(), "Analytics consumer started");

    while let Some(mut event) = queue.rx.recv().await {
        if let Some(writer) = &sinks.raw_log {
            let writer = writer.clone();
            // File I/O stays off the runtime workers
            let appended = tokio::task::spawn_blocking(move || {
                let result = writer.append(&event);
                (event, result)
            })
            .await;
            match appended {
                Ok((returned, result)) => {
                    event = returned;
                    if let Err(e) = result {
                        sinks.diagnostics.raw_log_error();
                        warn!(error = %e, "write raw log failed");
                    }
                }
                Err(e) => {
                    sinks.diagnostics.raw_log_error();
                    warn!(error = %e, "raw log task failed, dropping event");
                    continue;
                }
            }
        }

        if let Err(e) = sinks.counters.record(&event).await {
            sinks.diagnostics.counter_error();
            warn!(error = %e, "update realtime counters failed");
        }
    }

    info!("Analytics consumer shutting down");
}
