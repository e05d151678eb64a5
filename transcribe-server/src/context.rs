//! Per-request deadline and cancellation
//!
//! One [`RequestContext`] is created when a request arrives and passed by
//! reference through ingestion, admission and inference. Every layer waits
//! against the same deadline instant, so time spent in one stage is already
//! subtracted from the next.

use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Deadline used when a budget would overflow the clock
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

#[derive(Debug, Clone)]
pub struct RequestContext {
    id: Uuid,
    received_at: Instant,
    deadline: Instant,
    cancel: CancellationToken,
}

impl RequestContext {
    /// Start the clock for a new request with the given end-to-end budget
    pub fn new(budget: Duration) -> Self {
        let received_at = Instant::now();
        let deadline = received_at
            .checked_add(budget)
            .unwrap_or_else(|| received_at + FAR_FUTURE);
        Self {
            id: Uuid::new_v4(),
            received_at,
            deadline,
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn elapsed(&self) -> Duration {
        self.received_at.elapsed()
    }

    /// Time left before the deadline (zero once passed)
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Token cancelled when the whole request is abandoned
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Token for one downstream call; cancelling it leaves the request token alone
    pub fn child_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }
}
