use std::sync::Arc;

use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::errors::ForecastError;
use crate::orchestrator::{RetrainOrchestrator, RetrainRequest, RetrainResult};

/// Handle to a submitted run.
pub struct RetrainHandle {
    pub run_id: String,
    device_id: String,
    cancel: CancellationToken,
    receiver: oneshot::Receiver<RetrainResult>,
}

impl RetrainHandle {
    /// Ask the run to stop at its next stage boundary.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for the run to finish. A worker that died without reporting
    /// yields a failed result for the same run id.
    pub async fn wait(self) -> RetrainResult {
        match self.receiver.await {
            Ok(result) => result,
            Err(_) => {
                let err = ForecastError::internal("retrain worker exited without a result");
                error!(run_id = %self.run_id, device_id = %self.device_id, "retrain worker lost");
                RetrainResult::aborted(&self.run_id, &self.device_id, &err)
            }
        }
    }
}

/// Executes retrains off the async runtime and reports every completion.
#[derive(Clone)]
pub struct RetrainSupervisor {
    orchestrator: Arc<RetrainOrchestrator>,
    completions: Option<broadcast::Sender<RetrainResult>>,
}

impl RetrainSupervisor {
    pub fn new(orchestrator: Arc<RetrainOrchestrator>) -> Self {
        Self {
            orchestrator,
            completions: None,
        }
    }

    /// Also publish each finished result on a broadcast channel.
    pub fn with_completions(orchestrator: Arc<RetrainOrchestrator>, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            orchestrator,
            completions: Some(tx),
        }
    }

    pub fn subscribe(&self) -> Option<broadcast::Receiver<RetrainResult>> {
        self.completions.as_ref().map(|tx| tx.subscribe())
    }

    pub fn orchestrator(&self) -> &Arc<RetrainOrchestrator> {
        &self.orchestrator
    }

    /// Start a run on the blocking pool and return immediately.
    ///
    /// Must be called from within a tokio runtime.
    pub fn submit(&self, request: RetrainRequest) -> RetrainHandle {
        let ticket = self.orchestrator.begin();
        let run_id = ticket.run_id.clone();
        let device_id = request.device_id.clone();
        let cancel = CancellationToken::new();
        let (tx, rx) = oneshot::channel();

        let orchestrator = Arc::clone(&self.orchestrator);
        let completions = self.completions.clone();
        let token = cancel.clone();
        tokio::task::spawn_blocking(move || {
            let result = orchestrator.retrain_ticket(ticket, &request, &token);
            if let Some(tx) = completions {
                // no subscribers is fine
                let _ = tx.send(result.clone());
            }
            if tx.send(result).is_err() {
                debug!(device_id = %request.device_id, "retrain handle dropped before completion");
            }
        });

        RetrainHandle {
            run_id,
            device_id,
            cancel,
            receiver: rx,
        }
    }

    /// Run on the calling thread and return the result.
    pub fn run_blocking(&self, request: &RetrainRequest) -> RetrainResult {
        let result = self.orchestrator.retrain(request);
        if let Some(tx) = &self.completions {
            let _ = tx.send(result.clone());
        }
        result
    }
}
