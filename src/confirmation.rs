//! Confirmation bus between the scheduler and an external approver.
//!
//! The scheduler publishes a [`ConfirmationRequest`] and waits for exactly one
//! [`ConfirmationResponse`] with the same `call_id`. Many requests may be
//! outstanding at once. The approver side (usually a UI) receives requests
//! from [`ApproverHandle`] and answers through a [`Responder`]; how it asks the
//! user is its own business.
//!
//! ```rust,no_run
//! use turnwise::{ConfirmationBus, ConfirmationDecision, ConfirmationResponse};
//!
//! # async fn example() {
//! let (bus, mut approver) = ConfirmationBus::new();
//! tokio::spawn(async move {
//!     while let Some(request) = approver.next_request().await {
//!         let _ = approver.responder().respond(ConfirmationResponse {
//!             call_id: request.call_id,
//!             decision: ConfirmationDecision::Approved,
//!         });
//!     }
//! });
//! # drop(bus);
//! # }
//! ```

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

/// What the approver is asked
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmationRequest {
    pub call_id: String,
    pub tool_name: String,
    pub arguments: Value,
    /// Human-readable summary of what will happen
    pub proposed_action: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationDecision {
    Approved,
    Denied,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmationResponse {
    pub call_id: String,
    pub decision: ConfirmationDecision,
}

/// How a confirmation request ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmationOutcome {
    Approved,
    Denied,
    /// The owning turn was aborted while waiting
    Cancelled,
    /// The approver went away without answering
    Unavailable,
}

type Pending = Arc<Mutex<HashMap<String, oneshot::Sender<ConfirmationDecision>>>>;

fn lock(pending: &Pending) -> MutexGuard<'_, HashMap<String, oneshot::Sender<ConfirmationDecision>>> {
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Scheduler side of the bus. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ConfirmationBus {
    requests: mpsc::UnboundedSender<ConfirmationRequest>,
    pending: Pending,
}

/// Approver side of the bus: the single consumer of requests.
#[derive(Debug)]
pub struct ApproverHandle {
    requests: mpsc::UnboundedReceiver<ConfirmationRequest>,
    responder: Responder,
}

/// Answers pending requests. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Responder {
    pending: Pending,
}

impl ConfirmationBus {
    pub fn new() -> (ConfirmationBus, ApproverHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        (
            ConfirmationBus {
                requests: tx,
                pending: pending.clone(),
            },
            ApproverHandle {
                requests: rx,
                responder: Responder { pending },
            },
        )
    }

    /// Number of requests still waiting for an answer.
    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Publishes a request and waits for its answer or for `abort`.
    ///
    /// A `call_id` that is already pending is rejected.
    pub async fn request(
        &self,
        request: ConfirmationRequest,
        abort: &CancellationToken,
    ) -> Result<ConfirmationOutcome> {
        let call_id = request.call_id.clone();
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = lock(&self.pending);
            if pending.contains_key(&call_id) {
                return Err(Error::invalid_input(format!(
                    "confirmation already pending for call '{}'",
                    call_id
                )));
            }
            pending.insert(call_id.clone(), tx);
        }

        if self.requests.send(request).is_err() {
            lock(&self.pending).remove(&call_id);
            return Ok(ConfirmationOutcome::Unavailable);
        }
        log::debug!("Awaiting confirmation for call {}", call_id);

        let outcome = tokio::select! {
            biased;
            _ = abort.cancelled() => ConfirmationOutcome::Cancelled,
            reply = rx => match reply {
                Ok(ConfirmationDecision::Approved) => ConfirmationOutcome::Approved,
                Ok(ConfirmationDecision::Denied) => ConfirmationOutcome::Denied,
                Err(_) => ConfirmationOutcome::Unavailable,
            },
        };

        // Cancelled or abandoned requests must not linger
        lock(&self.pending).remove(&call_id);
        Ok(outcome)
    }
}

impl ApproverHandle {
    /// Next request, or `None` once every bus clone is dropped.
    pub async fn next_request(&mut self) -> Option<ConfirmationRequest> {
        self.requests.recv().await
    }

    pub fn responder(&self) -> Responder {
        self.responder.clone()
    }

    /// Splits into a request stream and a responder.
    pub fn into_parts(self) -> (UnboundedReceiverStream<ConfirmationRequest>, Responder) {
        (UnboundedReceiverStream::new(self.requests), self.responder)
    }
}

impl Responder {
    /// Resolves a pending request. Each request resolves at most once.
    pub fn respond(&self, response: ConfirmationResponse) -> Result<()> {
        let sender = lock(&self.pending)
            .remove(&response.call_id)
            .ok_or_else(|| {
                Error::invalid_input(format!(
                    "no pending confirmation for call '{}'",
                    response.call_id
                ))
            })?;
        // The waiter may have been cancelled in the meantime
        let _ = sender.send(response.decision);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;

    fn request(id: &str) -> ConfirmationRequest {
        ConfirmationRequest {
            call_id: id.to_string(),
            tool_name: "write_file".to_string(),
            arguments: json!({"path": "/tmp/x"}),
            proposed_action: "Write /tmp/x".to_string(),
        }
    }

    #[tokio::test]
    async fn test_round_trip_correlated_by_call_id() {
        let (bus, approver) = ConfirmationBus::new();
        let (mut requests, responder) = approver.into_parts();

        let approver_task = tokio::spawn(async move {
            let mut seen = Vec::new();
            for _ in 0..2 {
                let req = requests.next().await.unwrap();
                seen.push(req.call_id.clone());
            }
            // answer in reverse order
            for id in seen.iter().rev() {
                let decision = if id == "a" {
                    ConfirmationDecision::Approved
                } else {
                    ConfirmationDecision::Denied
                };
                responder
                    .respond(ConfirmationResponse {
                        call_id: id.clone(),
                        decision,
                    })
                    .unwrap();
            }
        });

        let token = CancellationToken::new();
        let (a, b) = tokio::join!(
            bus.request(request("a"), &token),
            bus.request(request("b"), &token)
        );
        approver_task.await.unwrap();

        assert_eq!(a.unwrap(), ConfirmationOutcome::Approved);
        assert_eq!(b.unwrap(), ConfirmationOutcome::Denied);
        assert_eq!(bus.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_cancellation_resolves_and_clears_pending() {
        let (bus, mut approver) = ConfirmationBus::new();
        let token = CancellationToken::new();

        let waiter = {
            let bus = bus.clone();
            let token = token.clone();
            tokio::spawn(async move { bus.request(request("c"), &token).await })
        };

        let received = approver.next_request().await.unwrap();
        assert_eq!(received.call_id, "c");
        token.cancel();
        token.cancel(); // idempotent

        assert_eq!(waiter.await.unwrap().unwrap(), ConfirmationOutcome::Cancelled);
        assert_eq!(bus.pending_count(), 0);

        // late answer is rejected, not delivered twice
        let late = approver.responder().respond(ConfirmationResponse {
            call_id: "c".into(),
            decision: ConfirmationDecision::Approved,
        });
        assert!(late.is_err());
    }

    #[tokio::test]
    async fn test_dropped_approver_is_unavailable() {
        let (bus, approver) = ConfirmationBus::new();
        drop(approver);
        let outcome = bus
            .request(request("d"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, ConfirmationOutcome::Unavailable);
    }

    #[tokio::test]
    async fn test_duplicate_call_id_rejected() {
        let (bus, mut approver) = ConfirmationBus::new();
        let token = CancellationToken::new();
        let first = {
            let bus = bus.clone();
            let token = token.clone();
            tokio::spawn(async move { bus.request(request("dup"), &token).await })
        };
        approver.next_request().await.unwrap();

        let second = bus.request(request("dup"), &token).await;
        assert!(matches!(second, Err(Error::InvalidInput(_))));

        approver
            .responder()
            .respond(ConfirmationResponse {
                call_id: "dup".into(),
                decision: ConfirmationDecision::Approved,
            })
            .unwrap();
        assert_eq!(first.await.unwrap().unwrap(), ConfirmationOutcome::Approved);
    }
}
