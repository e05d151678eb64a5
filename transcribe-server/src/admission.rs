//! Admission control
//!
//! A counting semaphore bounded at the configured ceiling. Waiters are served
//! first-come-first-served (tokio's semaphore is fair) and give up when the
//! request deadline passes.
//!
//! A slot is represented by an [`AdmissionTicket`]. The ticket is released
//! exactly once: either explicitly through [`AdmissionController::release`]
//! or, on any early-return, panic or cancelled future, when it is dropped.
//! Releasing an already released ticket is a no-op.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Why a slot could not be acquired
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("Admission deadline elapsed after waiting {waited:?}")]
    Timeout { waited: Duration },

    #[error("Admission controller is shut down")]
    Closed,
}

struct AdmissionInner {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    in_flight: AtomicUsize,
    waiting: AtomicUsize,
    acquired_total: AtomicU64,
    released_total: AtomicU64,
}

impl AdmissionInner {
    fn release_slot(&self, ticket: &mut AdmissionTicket) {
        let Some(permit) = ticket.permit.take() else {
            return;
        };

        // Decrement before the permit returns to the semaphore so the next
        // holder never observes in_flight above capacity.
        let previous = self.in_flight.fetch_sub(1, Ordering::AcqRel);
        if previous == 0 {
            error!(
                request_id = %ticket.request_id,
                "Admission accounting corrupted: release with no slot in flight"
            );
            std::process::abort();
        }
        self.released_total.fetch_add(1, Ordering::Relaxed);
        drop(permit);

        debug!(
            request_id = %ticket.request_id,
            held_ms = ticket.acquired_at.elapsed().as_millis() as u64,
            in_flight = previous - 1,
            "Admission slot released"
        );
    }
}

/// Decrements the waiter gauge however the acquire future ends
struct WaitingGuard<'a>(&'a AtomicUsize);

impl<'a> WaitingGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Gate limiting how many requests are admitted at once
#[derive(Clone)]
pub struct AdmissionController {
    inner: Arc<AdmissionInner>,
}

impl AdmissionController {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "admission capacity must be at least 1");
        Self {
            inner: Arc::new(AdmissionInner {
                semaphore: Arc::new(Semaphore::new(capacity)),
                capacity,
                in_flight: AtomicUsize::new(0),
                waiting: AtomicUsize::new(0),
                acquired_total: AtomicU64::new(0),
                released_total: AtomicU64::new(0),
            }),
        }
    }

    /// Wait for a slot until `deadline`.
    ///
    /// Returns immediately when a slot is free. Queued callers are admitted
    /// in arrival order.
    pub async fn acquire(
        &self,
        request_id: Uuid,
        deadline: Instant,
    ) -> Result<AdmissionTicket, AdmissionError> {
        let started = Instant::now();
        if started >= deadline {
            return Err(AdmissionError::Timeout {
                waited: Duration::ZERO,
            });
        }

        let permit = {
            let _waiting = WaitingGuard::enter(&self.inner.waiting);
            match timeout_at(deadline, self.inner.semaphore.clone().acquire_owned()).await {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => return Err(AdmissionError::Closed),
                Err(_) => {
                    let waited = started.elapsed();
                    warn!(
                        request_id = %request_id,
                        waited_ms = waited.as_millis() as u64,
                        "Admission timed out waiting for a slot"
                    );
                    return Err(AdmissionError::Timeout { waited });
                }
            }
        };

        let in_flight = self.inner.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.inner.acquired_total.fetch_add(1, Ordering::Relaxed);
        debug!(
            request_id = %request_id,
            waited_ms = started.elapsed().as_millis() as u64,
            in_flight,
            "Admission slot acquired"
        );

        Ok(AdmissionTicket {
            request_id,
            acquired_at: Instant::now(),
            permit: Some(permit),
            controller: Arc::clone(&self.inner),
        })
    }

    /// Return a ticket's slot. Calling this again for the same ticket does nothing.
    pub fn release(&self, ticket: &mut AdmissionTicket) {
        debug_assert!(
            Arc::ptr_eq(&self.inner, &ticket.controller),
            "ticket released through a foreign controller"
        );
        ticket.controller.clone().release_slot(ticket);
    }

    /// Stop admitting. Queued and future acquisitions fail with [`AdmissionError::Closed`];
    /// tickets already issued stay valid.
    pub fn close(&self) {
        self.inner.semaphore.close();
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Tickets currently held
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    /// Free slots
    pub fn available(&self) -> usize {
        self.inner.semaphore.available_permits()
    }

    /// Callers queued in [`acquire`](Self::acquire)
    pub fn waiting(&self) -> usize {
        self.inner.waiting.load(Ordering::Acquire)
    }

    pub fn acquired_total(&self) -> u64 {
        self.inner.acquired_total.load(Ordering::Relaxed)
    }

    pub fn released_total(&self) -> u64 {
        self.inner.released_total.load(Ordering::Relaxed)
    }
}

/// One request's claim on an admission slot
pub struct AdmissionTicket {
    request_id: Uuid,
    acquired_at: Instant,
    permit: Option<OwnedSemaphorePermit>,
    controller: Arc<AdmissionInner>,
}

impl AdmissionTicket {
    pub fn is_released(&self) -> bool {
        self.permit.is_none()
    }
}

impl Drop for AdmissionTicket {
    fn drop(&mut self) {
        if self.permit.is_some() {
            self.controller.clone().release_slot(self);
        }
    }
}

impl std::fmt::Debug for AdmissionTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionTicket")
            .field("request_id", &self.request_id)
            .field("acquired_at", &self.acquired_at)
            .field("released", &self.is_released())
            .finish()
    }
}
