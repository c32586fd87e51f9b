//! The approval gate.
//!
//! Every disk mutation passes through here first. The gate blocks the
//! orchestrator on a single-slot queue until the UI side posts a decision,
//! the 300-second timer expires, or the run is cancelled. Headless runs may
//! auto-approve, but only when explicitly configured — and the decision is
//! logged either way.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender};
use std::time::{Duration, Instant};

/// Upper bound on how long one approval may block the run.
pub const APPROVAL_TIMEOUT: Duration = Duration::from_secs(300);

/// Poll interval while waiting, so cancellation stays responsive.
const WAIT_TICK: Duration = Duration::from_secs(1);

/// What the gate is asking about.
#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    pub action: String,
    pub file: String,
    pub search: String,
    pub replace: String,
    pub summary: String,
}

/// The user's answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Approved,
    Rejected,
}

/// Gate verdict handed back to the edit pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalOutcome {
    Approved,
    Rejected { reason: String },
}

impl ApprovalOutcome {
    pub fn is_approved(&self) -> bool {
        matches!(self, ApprovalOutcome::Approved)
    }

    fn rejected(reason: &str) -> Self {
        ApprovalOutcome::Rejected {
            reason: reason.to_string(),
        }
    }
}

/// A request in flight: the UI answers by sending on `respond`.
pub struct PendingApproval {
    pub request: ApprovalRequest,
    pub respond: SyncSender<Decision>,
}

enum GateMode {
    /// Forward requests to a consumer (UI thread) and wait.
    Interactive(SyncSender<PendingApproval>),
    /// No consumer. Approve everything iff explicitly configured.
    Headless { auto_approve: bool },
}

/// The approval sink handle. Constructed by the caller and passed into the
/// orchestrator; nothing here is process-global.
pub struct ApprovalGate {
    mode: GateMode,
}

impl ApprovalGate {
    /// An interactive gate plus the consumer end the UI must drain.
    pub fn interactive() -> (Self, Receiver<PendingApproval>) {
        // Single-slot: at most one request may be pending.
        let (tx, rx) = sync_channel(1);
        (
            Self {
                mode: GateMode::Interactive(tx),
            },
            rx,
        )
    }

    pub fn headless(auto_approve: bool) -> Self {
        Self {
            mode: GateMode::Headless { auto_approve },
        }
    }

    /// Block until the user decides, the timeout fires, or `cancel` is set.
    ///
    /// Empty search *and* empty replace is rejected immediately as
    /// "no content" — there is nothing to show a reviewer.
    pub fn ask(&self, request: ApprovalRequest, cancel: &AtomicBool) -> ApprovalOutcome {
        if request.search.trim().is_empty() && request.replace.trim().is_empty() {
            let outcome = ApprovalOutcome::rejected("no content");
            self.log_decision(&request, &outcome);
            return outcome;
        }

        let outcome = match &self.mode {
            GateMode::Headless { auto_approve } => {
                if *auto_approve {
                    ApprovalOutcome::Approved
                } else {
                    ApprovalOutcome::rejected("headless run without auto-approve")
                }
            }
            GateMode::Interactive(tx) => self.wait_for_decision(tx, &request, cancel),
        };

        self.log_decision(&request, &outcome);
        outcome
    }

    fn wait_for_decision(
        &self,
        tx: &SyncSender<PendingApproval>,
        request: &ApprovalRequest,
        cancel: &AtomicBool,
    ) -> ApprovalOutcome {
        let (reply_tx, reply_rx) = sync_channel(1);
        let pending = PendingApproval {
            request: request.clone(),
            respond: reply_tx,
        };
        if tx.try_send(pending).is_err() {
            // Consumer gone or slot occupied; either way nobody can approve.
            return ApprovalOutcome::rejected("approval queue unavailable");
        }

        let started = Instant::now();
        loop {
            if cancel.load(Ordering::Relaxed) {
                return ApprovalOutcome::rejected("cancelled");
            }
            match reply_rx.recv_timeout(WAIT_TICK) {
                Ok(Decision::Approved) => return ApprovalOutcome::Approved,
                Ok(Decision::Rejected) => return ApprovalOutcome::rejected("rejected by user"),
                Err(RecvTimeoutError::Timeout) => {
                    if started.elapsed() >= APPROVAL_TIMEOUT {
                        return ApprovalOutcome::rejected("approval_timeout");
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return ApprovalOutcome::rejected("approval channel closed");
                }
            }
        }
    }

    fn log_decision(&self, request: &ApprovalRequest, outcome: &ApprovalOutcome) {
        match outcome {
            ApprovalOutcome::Approved => {
                tracing::info!(
                    action = %request.action,
                    file = %request.file,
                    "approval accepted"
                );
            }
            ApprovalOutcome::Rejected { reason } => {
                tracing::info!(
                    action = %request.action,
                    file = %request.file,
                    reason = %reason,
                    "approval rejected"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    fn request() -> ApprovalRequest {
        ApprovalRequest {
            action: "rewrite_function".to_string(),
            file: "app.py".to_string(),
            search: "x = 1".to_string(),
            replace: "x = 2".to_string(),
            summary: "bump x".to_string(),
        }
    }

    #[test]
    fn test_empty_payload_rejected_immediately() {
        let gate = ApprovalGate::headless(true);
        let cancel = AtomicBool::new(false);
        let mut req = request();
        req.search = String::new();
        req.replace = "   ".to_string();
        match gate.ask(req, &cancel) {
            ApprovalOutcome::Rejected { reason } => assert_eq!(reason, "no content"),
            ApprovalOutcome::Approved => panic!("empty payload must not be approved"),
        }
    }

    #[test]
    fn test_headless_auto_approve_configured() {
        let gate = ApprovalGate::headless(true);
        let cancel = AtomicBool::new(false);
        assert!(gate.ask(request(), &cancel).is_approved());
    }

    #[test]
    fn test_headless_without_auto_approve_rejects() {
        let gate = ApprovalGate::headless(false);
        let cancel = AtomicBool::new(false);
        assert!(!gate.ask(request(), &cancel).is_approved());
    }

    #[test]
    fn test_interactive_round_trip() {
        let (gate, rx) = ApprovalGate::interactive();
        let cancel = AtomicBool::new(false);

        let ui = std::thread::spawn(move || {
            let pending = rx.recv().unwrap();
            assert_eq!(pending.request.file, "app.py");
            pending.respond.send(Decision::Approved).unwrap();
        });

        assert!(gate.ask(request(), &cancel).is_approved());
        ui.join().unwrap();
    }

    #[test]
    fn test_interactive_rejection() {
        let (gate, rx) = ApprovalGate::interactive();
        let cancel = AtomicBool::new(false);

        let ui = std::thread::spawn(move || {
            let pending = rx.recv().unwrap();
            pending.respond.send(Decision::Rejected).unwrap();
        });

        match gate.ask(request(), &cancel) {
            ApprovalOutcome::Rejected { reason } => assert_eq!(reason, "rejected by user"),
            ApprovalOutcome::Approved => panic!("expected rejection"),
        }
        ui.join().unwrap();
    }

    #[test]
    fn test_cancel_during_wait_rejects() {
        let (gate, _rx) = ApprovalGate::interactive();
        let cancel = AtomicBool::new(true);
        match gate.ask(request(), &cancel) {
            ApprovalOutcome::Rejected { reason } => assert_eq!(reason, "cancelled"),
            ApprovalOutcome::Approved => panic!("cancelled run must not approve"),
        }
    }

    #[test]
    fn test_dropped_consumer_rejects() {
        let (gate, rx) = ApprovalGate::interactive();
        drop(rx);
        let cancel = AtomicBool::new(false);
        assert!(!gate.ask(request(), &cancel).is_approved());
    }
}
