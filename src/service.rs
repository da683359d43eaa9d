use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::endpoint::{InvocationError, InvocationLogs, InvocationResult, ServiceEndpoint};

/// A container callback received by an executor endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutorEvent {
    Ready { executor_id: String },
    StatusError { executor_id: String, details: Bytes },
    Result(InvocationResult),
    Error(InvocationError),
    Logs(InvocationLogs),
}

/// [`ServiceEndpoint`] forwarding every callback into a channel.
pub struct ChannelServiceEndpoint {
    events: mpsc::UnboundedSender<ExecutorEvent>,
}

impl ChannelServiceEndpoint {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ExecutorEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { events: tx }, rx)
    }

    fn send(&self, event: ExecutorEvent) {
        if self.events.send(event).is_err() {
            debug!("Executor event dropped, receiver is gone");
        }
    }
}

#[async_trait]
impl ServiceEndpoint for ChannelServiceEndpoint {
    async fn invocation_result(&self, result: InvocationResult) {
        info!(
            invocation_id = %result.invocation_id,
            size = result.payload.len(),
            "Invocation result received"
        );
        self.send(ExecutorEvent::Result(result));
    }

    async fn invocation_error(&self, error: InvocationError) {
        warn!(invocation_id = %error.invocation_id, "Invocation error received");
        self.send(ExecutorEvent::Error(error));
    }

    async fn invocation_logs(&self, logs: InvocationLogs) {
        debug!(invocation_id = %logs.invocation_id, "Invocation logs received");
        self.send(ExecutorEvent::Logs(logs));
    }

    async fn status_ready(&self, executor_id: &str) {
        info!(executor_id = %executor_id, "Executor ready");
        self.send(ExecutorEvent::Ready {
            executor_id: executor_id.to_string(),
        });
    }

    async fn status_error(&self, executor_id: &str, details: Bytes) {
        warn!(executor_id = %executor_id, "Executor reported a startup error");
        self.send(ExecutorEvent::StatusError {
            executor_id: executor_id.to_string(),
            details,
        });
    }
}
