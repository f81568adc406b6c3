//! Admission queue with capacity-based backpressure.

use std::collections::VecDeque;

use slotpool_core::JobId;

use crate::error::DispatchError;

/// FIFO of jobs waiting for a slot.
///
/// Capacity bounds every admitted job that has not reached a terminal
/// state, whether it is waiting here, backing off before a retry, or
/// running on a slot.
#[derive(Debug)]
pub struct JobQueue {
    pending: VecDeque<JobId>,
    capacity: usize,
    in_flight: usize,
}

impl JobQueue {
    /// Create a queue admitting at most `capacity` unfinished jobs.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            pending: VecDeque::with_capacity(capacity),
            capacity,
            in_flight: 0,
        }
    }

    /// Admit a new job at the back of the queue.
    ///
    /// # Errors
    /// Returns `DispatchError::QueueFull` when pending + running jobs
    /// already reach capacity.
    pub fn admit(&mut self, id: JobId) -> Result<(), DispatchError> {
        if self.in_flight >= self.capacity {
            return Err(DispatchError::QueueFull {
                capacity: self.capacity,
            });
        }
        self.in_flight += 1;
        self.pending.push_back(id);
        Ok(())
    }

    /// Put an already-admitted job back at the front (retry/failover).
    pub fn requeue_front(&mut self, id: JobId) {
        if !self.pending.contains(&id) {
            self.pending.push_front(id);
        }
    }

    /// Next job in line.
    #[must_use]
    pub fn front(&self) -> Option<JobId> {
        self.pending.front().copied()
    }

    /// Take the next job in line.
    pub fn pop_front(&mut self) -> Option<JobId> {
        self.pending.pop_front()
    }

    /// Remove a waiting job. Returns whether it was waiting.
    pub fn remove(&mut self, id: JobId) -> bool {
        if let Some(pos) = self.pending.iter().position(|j| *j == id) {
            self.pending.remove(pos);
            true
        } else {
            false
        }
    }

    /// Record that an admitted job reached a terminal state.
    pub const fn complete(&mut self) {
        self.in_flight = self.in_flight.saturating_sub(1);
    }

    /// Jobs waiting for a slot.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether no job is waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Admitted jobs not yet terminal.
    #[must_use]
    pub const fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Configured capacity.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    #[test]
    fn test_fifo_order() {
        let mut queue = JobQueue::new(4);
        let ids: Vec<JobId> = (0..3).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            queue.admit(*id).unwrap();
        }
        assert_eq!(queue.pop_front(), Some(ids[0]));
        assert_eq!(queue.pop_front(), Some(ids[1]));
        assert_eq!(queue.pop_front(), Some(ids[2]));
        assert!(queue.is_empty());
        // Still running, so still counted.
        assert_eq!(queue.in_flight(), 3);
    }

    #[test]
    fn test_capacity_counts_running_jobs() {
        let mut queue = JobQueue::new(2);
        queue.admit(Uuid::new_v4()).unwrap();
        queue.admit(Uuid::new_v4()).unwrap();
        queue.pop_front();

        let err = queue.admit(Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, DispatchError::QueueFull { capacity: 2 }));

        queue.complete();
        queue.admit(Uuid::new_v4()).unwrap();
    }

    #[test]
    fn test_requeue_front_jumps_the_line() {
        let mut queue = JobQueue::new(4);
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        queue.admit(first).unwrap();
        queue.admit(second).unwrap();

        let retried = queue.pop_front().unwrap();
        queue.requeue_front(retried);
        queue.requeue_front(retried);

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.front(), Some(first));
    }

    #[test]
    fn test_remove() {
        let mut queue = JobQueue::new(4);
        let id = Uuid::new_v4();
        queue.admit(id).unwrap();
        assert!(queue.remove(id));
        assert!(!queue.remove(id));
        assert_eq!(queue.in_flight(), 1);
    }
}
