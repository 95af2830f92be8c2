//! Per-record processing contract.

mod chat;

pub use chat::ChatArchiveProcessor;

use crate::error::ProcessingError;
use crate::record::Record;
use crate::shutdown::Shutdown;
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;
use tracing::Span;

/// Result of handling one record.
#[derive(Debug)]
pub enum ProcessingOutcome {
    /// Side effect applied; the record may be committed.
    Success,
    /// Transient failure; re-dispatch after backoff.
    Retryable(ProcessingError),
    /// Permanent failure; halts the owning partition.
    Fatal(ProcessingError),
}

impl ProcessingOutcome {
    /// Whether the outcome lets the commit cursor advance.
    pub fn is_success(&self) -> bool {
        matches!(self, ProcessingOutcome::Success)
    }
}

/// Per-dispatch context handed to a [`Processor`].
///
/// Carries the deadline for this attempt, the cancellation signal that fires
/// when in-flight work is being abandoned, and the record span.
#[derive(Debug, Clone)]
pub struct ProcessContext {
    cancel: Shutdown,
    deadline: Instant,
    attempt: u32,
    span: Span,
}

impl ProcessContext {
    /// Create a context for one attempt.
    pub fn new(cancel: Shutdown, timeout: Duration, attempt: u32, span: Span) -> Self {
        Self {
            cancel,
            deadline: Instant::now() + timeout,
            attempt,
            span,
        }
    }

    /// A context that never cancels, for direct calls outside the consumer.
    pub fn background(timeout: Duration) -> Self {
        Self::new(Shutdown::never(), timeout, 1, Span::current())
    }

    /// Absolute deadline of this attempt.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Time left before the deadline.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// 1-based attempt number.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Span of the record being handled.
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Whether the work is being abandoned.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolve once the work is being abandoned.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

/// A pluggable record handler that owns its side effects.
///
/// Side effects must be idempotent or keyed by [`Record::dedup_key`]: a
/// record is redelivered when the process stops between the side effect and
/// the offset commit.
#[async_trait]
pub trait Processor: Send + Sync + 'static {
    /// Handle one record.
    async fn handle(&self, ctx: &ProcessContext, record: &Record) -> ProcessingOutcome;

    /// Release resources held by the processor. Called once on shutdown.
    async fn close(&self) -> crate::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_context_deadline_and_cancel() {
        let (trigger, cancel) = crate::shutdown::channel();
        let ctx = ProcessContext::new(cancel, Duration::from_secs(5), 2, Span::none());

        assert_eq!(ctx.attempt(), 2);
        assert!(ctx.remaining() <= Duration::from_secs(5));
        assert!(ctx.remaining() > Duration::from_secs(4));
        assert!(!ctx.is_cancelled());

        trigger.trigger();
        tokio::time::timeout(Duration::from_millis(50), ctx.cancelled())
            .await
            .unwrap();
        assert!(ctx.is_cancelled());
    }

    #[test]
    fn test_outcome_success() {
        assert!(ProcessingOutcome::Success.is_success());
        assert!(!ProcessingOutcome::Retryable(ProcessingError::Timeout(1)).is_success());
    }
}
