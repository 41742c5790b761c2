//! Bounded admission of concurrent tool executions.
//!
//! An [`AdmissionGate`] hands out at most `capacity` slots. Executions beyond
//! that wait in line, bounded by a queue size and an optional wait timeout.
//! Slots are released when dropped, so a cancelled execution frees its slot
//! (or its place in line) immediately.
//!
//! The gate is resized in place. Shrinking below the number of slots in use
//! retires the surplus as those slots are released, so the cap holds across
//! a resize.

use crate::metrics::AdmissionMetrics;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Why admission was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionRejected {
    /// `queue_size` executions were already waiting
    QueueFull {
        /// Queue bound that applied
        queue_size: usize,
    },
    /// No slot became free within the wait timeout
    Timeout {
        /// Wait timeout that applied
        after: Duration,
    },
}

#[derive(Debug, Default)]
struct Occupancy {
    in_flight: AtomicUsize,
    // Permits to retire instead of release after a shrink.
    surplus: AtomicUsize,
}

impl Occupancy {
    fn take_surplus(&self) -> bool {
        self.surplus
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Concurrency limit shared by the executions of one manager.
#[derive(Debug)]
pub struct AdmissionGate {
    capacity: Mutex<usize>,
    semaphore: Arc<Semaphore>,
    waiting: AtomicUsize,
    occupancy: Arc<Occupancy>,
}

/// An admitted execution's slot. Dropping it frees the slot.
#[derive(Debug)]
pub struct AdmissionSlot {
    permit: Option<OwnedSemaphorePermit>,
    occupancy: Arc<Occupancy>,
}

impl Drop for AdmissionSlot {
    fn drop(&mut self) {
        if let Some(permit) = self.permit.take() {
            if self.occupancy.take_surplus() {
                permit.forget();
            }
        }
        let remaining = self
            .occupancy
            .in_flight
            .fetch_sub(1, Ordering::Relaxed)
            .saturating_sub(1);
        AdmissionMetrics::record_in_flight(remaining);
    }
}

struct WaitingGuard<'a>(&'a AtomicUsize);

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        let remaining = self.0.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
        AdmissionMetrics::record_waiting(remaining);
    }
}

impl AdmissionGate {
    /// Gate with `capacity` slots; zero is treated as one.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity: Mutex::new(capacity),
            semaphore: Arc::new(Semaphore::new(capacity)),
            waiting: AtomicUsize::new(0),
            occupancy: Arc::new(Occupancy::default()),
        }
    }

    /// Number of slots.
    #[must_use]
    pub fn capacity(&self) -> usize {
        *self.capacity.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Executions holding a slot. Exceeds the capacity only while slots
    /// taken before a shrink are still held.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.occupancy.in_flight.load(Ordering::Relaxed)
    }

    /// Executions waiting for a slot.
    #[must_use]
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::Relaxed)
    }

    /// Change the number of slots; zero is treated as one.
    ///
    /// Slots already held are kept. After a shrink, new executions are
    /// admitted only once the number held drops below the new capacity.
    pub fn resize(&self, capacity: usize) {
        let capacity = capacity.max(1);
        let mut current = self.capacity.lock().unwrap_or_else(PoisonError::into_inner);
        if capacity > *current {
            let grow = capacity - *current;
            let mut cancelled = 0;
            let _ = self
                .occupancy
                .surplus
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |surplus| {
                    cancelled = surplus.min(grow);
                    Some(surplus - cancelled)
                });
            self.semaphore.add_permits(grow - cancelled);
        } else if capacity < *current {
            let shrink = *current - capacity;
            let retired = self.semaphore.forget_permits(shrink);
            self.occupancy
                .surplus
                .fetch_add(shrink - retired, Ordering::AcqRel);
        }
        tracing::info!(from = *current, to = capacity, "Resized admission gate");
        *current = capacity;
    }

    fn slot(&self, permit: OwnedSemaphorePermit) -> AdmissionSlot {
        let now = self.occupancy.in_flight.fetch_add(1, Ordering::Relaxed) + 1;
        AdmissionMetrics::record_in_flight(now);
        AdmissionSlot {
            permit: Some(permit),
            occupancy: Arc::clone(&self.occupancy),
        }
    }

    /// Wait for a slot.
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionRejected::QueueFull`] if `queue_size` executions are
    /// already waiting, and [`AdmissionRejected::Timeout`] if `wait_timeout`
    /// elapses first. `None` waits indefinitely.
    pub async fn acquire(
        &self,
        queue_size: usize,
        wait_timeout: Option<Duration>,
    ) -> Result<AdmissionSlot, AdmissionRejected> {
        if let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() {
            return Ok(self.slot(permit));
        }

        let waiting = self.waiting.fetch_add(1, Ordering::Relaxed) + 1;
        let _guard = WaitingGuard(&self.waiting);
        if waiting > queue_size {
            AdmissionMetrics::record_rejection("queue_full");
            return Err(AdmissionRejected::QueueFull { queue_size });
        }
        AdmissionMetrics::record_waiting(waiting);
        tracing::debug!(waiting, capacity = self.capacity(), "Waiting for an execution slot");

        let acquire = Arc::clone(&self.semaphore).acquire_owned();
        let acquired = match wait_timeout {
            Some(after) => match tokio::time::timeout(after, acquire).await {
                Ok(acquired) => acquired,
                Err(_) => {
                    AdmissionMetrics::record_rejection("timeout");
                    return Err(AdmissionRejected::Timeout { after });
                }
            },
            None => acquire.await,
        };
        // The semaphore is never closed.
        acquired
            .map(|permit| self.slot(permit))
            .map_err(|_| AdmissionRejected::QueueFull { queue_size })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_slots_up_to_capacity() {
        let gate = AdmissionGate::new(2);
        let a = gate.acquire(0, None).await.expect("first slot");
        let _b = gate.acquire(0, None).await.expect("second slot");
        assert_eq!(gate.in_flight(), 2);

        assert_eq!(
            gate.acquire(0, None).await.expect_err("no queue"),
            AdmissionRejected::QueueFull { queue_size: 0 }
        );
        assert_eq!(gate.waiting(), 0);

        drop(a);
        assert_eq!(gate.in_flight(), 1);
        assert!(gate.acquire(0, None).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_timeout() {
        let gate = AdmissionGate::new(1);
        let _held = gate.acquire(10, None).await.expect("slot");

        let err = gate
            .acquire(10, Some(Duration::from_millis(100)))
            .await
            .expect_err("times out");
        assert_eq!(err, AdmissionRejected::Timeout { after: Duration::from_millis(100) });
        assert_eq!(gate.waiting(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_is_admitted_when_slot_frees() {
        let gate = Arc::new(AdmissionGate::new(1));
        let held = gate.acquire(10, None).await.expect("slot");

        let waiter = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move { gate.acquire(10, None).await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(gate.waiting(), 1);

        drop(held);
        assert!(waiter.await.expect("task completes").is_ok());
        assert_eq!(gate.waiting(), 0);
    }

    #[tokio::test]
    async fn test_grow_admits_more() {
        let gate = AdmissionGate::new(1);
        let _a = gate.acquire(0, None).await.expect("slot");
        assert!(gate.acquire(0, None).await.is_err());

        gate.resize(3);
        assert_eq!(gate.capacity(), 3);
        let _b = gate.acquire(0, None).await.expect("grown slot");
        let _c = gate.acquire(0, None).await.expect("grown slot");
        assert!(gate.acquire(0, None).await.is_err());
    }

    #[tokio::test]
    async fn test_shrink_below_held_slots_keeps_the_cap() {
        let gate = AdmissionGate::new(3);
        let a = gate.acquire(0, None).await.expect("slot");
        let b = gate.acquire(0, None).await.expect("slot");
        let c = gate.acquire(0, None).await.expect("slot");

        gate.resize(1);
        assert_eq!(gate.capacity(), 1);
        assert_eq!(gate.in_flight(), 3);

        drop(a);
        assert!(gate.acquire(0, None).await.is_err(), "two slots still held");
        drop(b);
        assert!(gate.acquire(0, None).await.is_err(), "one slot still held");
        drop(c);
        let d = gate.acquire(0, None).await.expect("back under the cap");
        assert!(gate.acquire(0, None).await.is_err());
        drop(d);
        assert_eq!(gate.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_grow_after_shrink_cancels_pending_retirement() {
        let gate = AdmissionGate::new(2);
        let a = gate.acquire(0, None).await.expect("slot");
        let b = gate.acquire(0, None).await.expect("slot");

        gate.resize(1);
        gate.resize(2);
        drop(a);
        let _c = gate.acquire(0, None).await.expect("capacity restored");
        assert!(gate.acquire(0, None).await.is_err());
        drop(b);
        assert!(gate.acquire(0, None).await.is_ok());
    }

    #[test]
    fn test_zero_capacity_is_one() {
        assert_eq!(AdmissionGate::new(0).capacity(), 1);
    }
}
