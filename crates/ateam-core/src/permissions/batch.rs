//! Pending batch of tool requests awaiting one bulk decision

use serde::Serialize;
use tracing::{info, warn};

use super::{ConfirmationPort, PermissionEngine, PermissionOutcome};
use crate::tools::{ToolExecutor, ToolRequest};

/// A queued request and who asked for it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingOperation {
    pub agent: String,
    pub request: ToolRequest,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchChoice {
    ApproveAll,
    DenyAll,
    Review,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "detail")]
pub enum BatchItemStatus {
    Executed(String),
    Failed(String),
    Denied(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchItemResult {
    pub agent: String,
    pub request: ToolRequest,
    pub status: BatchItemStatus,
}

/// Per-item outcome of a batch resolution
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub choice: BatchChoice,
    pub items: Vec<BatchItemResult>,
}

impl BatchReport {
    fn count(&self, f: impl Fn(&BatchItemStatus) -> bool) -> usize {
        self.items.iter().filter(|item| f(&item.status)).count()
    }

    pub fn executed(&self) -> usize {
        self.count(|s| matches!(s, BatchItemStatus::Executed(_)))
    }

    pub fn failed(&self) -> usize {
        self.count(|s| matches!(s, BatchItemStatus::Failed(_)))
    }

    pub fn denied(&self) -> usize {
        self.count(|s| matches!(s, BatchItemStatus::Denied(_)))
    }

    /// One line per item, for the transcript
    pub fn render(&self) -> String {
        let mut out = format!(
            "Batch {:?}: {} executed, {} failed, {} denied",
            self.choice,
            self.executed(),
            self.failed(),
            self.denied()
        );
        for item in &self.items {
            let (label, detail) = match &item.status {
                BatchItemStatus::Executed(d) => ("ok", d),
                BatchItemStatus::Failed(d) => ("failed", d),
                BatchItemStatus::Denied(d) => ("denied", d),
            };
            out.push_str(&format!("\n- @{} {}: {} ({})", item.agent, item.request, label, detail));
        }
        out
    }
}

impl PermissionEngine {
    /// Queue a request for the next batch decision
    pub fn enqueue(&mut self, agent: &str, request: ToolRequest, reason: impl Into<String>) -> usize {
        info!("Queued @{} {} for batch approval", agent, request);
        self.pending.push(PendingOperation {
            agent: agent.to_string(),
            request,
            reason: reason.into(),
        });
        self.pending.len()
    }

    pub fn pending(&self) -> &[PendingOperation] {
        &self.pending
    }

    /// Settle the whole queue. The queue is empty afterwards whatever happens
    /// to individual items.
    pub async fn resolve_batch(
        &mut self,
        choice: BatchChoice,
        executor: &dyn ToolExecutor,
        confirm: &dyn ConfirmationPort,
    ) -> BatchReport {
        let queue = std::mem::take(&mut self.pending);
        info!("Resolving batch of {} with {:?}", queue.len(), choice);

        let mut items = Vec::with_capacity(queue.len());
        for op in queue {
            let status = match choice {
                BatchChoice::DenyAll => BatchItemStatus::Denied("denied by user".to_string()),
                BatchChoice::ApproveAll => match self.contain(&op.request) {
                    Ok(_) => run(executor, &op.request).await,
                    Err(denied) => BatchItemStatus::Denied(denied.reason),
                },
                BatchChoice::Review => {
                    let decision = self.authorize(&op.agent, &op.request);
                    match decision.outcome {
                        PermissionOutcome::Allow => run(executor, &op.request).await,
                        PermissionOutcome::Deny => BatchItemStatus::Denied(decision.reason),
                        PermissionOutcome::NeedsConfirmation => {
                            if confirm.confirm(&op.agent, &op.request, &decision.reason).await {
                                run(executor, &op.request).await
                            } else {
                                BatchItemStatus::Denied("denied by user".to_string())
                            }
                        }
                    }
                }
            };
            items.push(BatchItemResult {
                agent: op.agent,
                request: op.request,
                status,
            });
        }

        BatchReport { choice, items }
    }

    /// Discard the queue at session end. Returns how many were dropped.
    pub fn shutdown(&mut self) -> usize {
        let dropped = self.pending.len();
        if dropped > 0 {
            warn!("Session ended with {} unresolved batch operations, denying all", dropped);
            self.pending.clear();
        }
        dropped
    }
}

impl Drop for PermissionEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn run(executor: &dyn ToolExecutor, request: &ToolRequest) -> BatchItemStatus {
    match executor.execute(request).await {
        Ok(output) => BatchItemStatus::Executed(output),
        Err(e) => BatchItemStatus::Failed(format!("{e:#}")),
    }
}
