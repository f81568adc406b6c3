//! Session slots, their health, and the acquisition policy.
//!
//! The pool is plain data; the dispatcher owns it behind its monitor lock
//! and is the only caller that mutates it.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use slotpool_core::{AccountId, SlotId, SlotStatus, job::unix_now};

/// Health effect of a finished execution on its slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthUpdate {
    /// Reset the failure counter.
    Success,
    /// Count toward the failure threshold.
    Failure,
    /// Mark unhealthy immediately.
    Fatal,
    /// Leave the counter alone.
    Neutral,
}

/// Result of releasing a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Release {
    pub from: SlotStatus,
    pub to: SlotStatus,
    pub failures: u32,
    /// The slot crossed into `Unhealthy` and must be recycled.
    pub recycle: bool,
}

/// One session slot.
#[derive(Debug, Clone)]
pub struct SlotEntry {
    pub id: SlotId,
    pub account: AccountId,
    /// Backend driving the slot.
    pub backend: String,
    /// Window index within the account.
    pub window: usize,
    pub status: SlotStatus,
    /// Consecutive failures since the last success or relaunch.
    pub failures: u32,
    /// Unix epoch seconds of the last assignment.
    pub last_used: Option<i64>,
    /// The account is being removed; never hand out again.
    pub retiring: bool,
}

/// Point-in-time view of a slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotSnapshot {
    pub id: SlotId,
    pub account: AccountId,
    pub backend: String,
    pub window: usize,
    pub status: SlotStatus,
    pub failures: u32,
    pub last_used: Option<i64>,
}

impl From<&SlotEntry> for SlotSnapshot {
    fn from(slot: &SlotEntry) -> Self {
        Self {
            id: slot.id,
            account: slot.account.clone(),
            backend: slot.backend.clone(),
            window: slot.window,
            status: slot.status,
            failures: slot.failures,
            last_used: slot.last_used,
        }
    }
}

/// The set of slots across all accounts.
#[derive(Debug)]
pub struct SessionPool {
    slots: BTreeMap<SlotId, SlotEntry>,
    next_id: u32,
    /// Last slot handed out, for round-robin.
    cursor: Option<SlotId>,
    failure_threshold: u32,
}

impl SessionPool {
    /// Create an empty pool.
    #[must_use]
    pub const fn new(failure_threshold: u32) -> Self {
        Self {
            slots: BTreeMap::new(),
            next_id: 0,
            cursor: None,
            failure_threshold,
        }
    }

    /// Add a cold slot for `account`.
    pub fn add_slot(&mut self, account: &str, backend: &str, window: usize) -> SlotId {
        let id = SlotId(self.next_id);
        self.next_id += 1;
        self.slots.insert(
            id,
            SlotEntry {
                id,
                account: account.to_string(),
                backend: backend.to_string(),
                window,
                status: SlotStatus::Cold,
                failures: 0,
                last_used: None,
                retiring: false,
            },
        );
        id
    }

    /// Drop a slot entirely.
    pub fn remove(&mut self, id: SlotId) -> Option<SlotEntry> {
        self.slots.remove(&id)
    }

    #[must_use]
    pub fn get(&self, id: SlotId) -> Option<&SlotEntry> {
        self.slots.get(&id)
    }

    /// Pick the slot for the next job, or `None` if nothing is eligible.
    ///
    /// Eligible: `Idle`, not retiring, and its account not serving another
    /// job. Among eligible slots the choice prefers, in order: a slot away
    /// from `avoid` (another account first, then another slot of the same
    /// account), a slot not yet visited in the current round-robin pass
    /// after the last slot handed out, then the lowest consecutive-failure
    /// count.
    #[must_use]
    pub fn select(&self, busy_accounts: &HashSet<AccountId>, avoid: Option<SlotId>) -> Option<SlotId> {
        let avoid_account = avoid.and_then(|id| self.slots.get(&id)).map(|s| &s.account);
        let cursor = self.cursor;

        self.slots
            .values()
            .filter(|s| s.status.is_acquirable() && !s.retiring && !busy_accounts.contains(&s.account))
            .min_by_key(|s| {
                let penalty = if avoid == Some(s.id) {
                    2
                } else if avoid_account == Some(&s.account) {
                    1
                } else {
                    0
                };
                let wrapped = cursor.is_some_and(|c| s.id <= c);
                (penalty, wrapped, s.failures, s.id)
            })
            .map(|s| s.id)
    }

    /// Hand `id` to a job.
    pub fn mark_busy(&mut self, id: SlotId) {
        if let Some(slot) = self.slots.get_mut(&id) {
            slot.status = SlotStatus::Busy;
            slot.last_used = Some(unix_now());
            self.cursor = Some(id);
        }
    }

    /// Return a busy slot, applying the health effect of its last job.
    pub fn release(&mut self, id: SlotId, health: HealthUpdate) -> Option<Release> {
        let threshold = self.failure_threshold;
        let slot = self.slots.get_mut(&id)?;
        let from = slot.status;

        let to = match health {
            HealthUpdate::Success => {
                slot.failures = 0;
                SlotStatus::Idle
            }
            HealthUpdate::Failure => {
                slot.failures += 1;
                if slot.failures >= threshold {
                    SlotStatus::Unhealthy
                } else {
                    SlotStatus::Idle
                }
            }
            HealthUpdate::Fatal => {
                slot.failures += 1;
                SlotStatus::Unhealthy
            }
            HealthUpdate::Neutral => SlotStatus::Idle,
        };
        slot.status = to;

        Some(Release {
            from,
            to,
            failures: slot.failures,
            recycle: to == SlotStatus::Unhealthy && from != SlotStatus::Unhealthy,
        })
    }

    /// Set a slot's status directly (launch/recycle lifecycle).
    ///
    /// Returns the previous status.
    pub fn set_status(&mut self, id: SlotId, status: SlotStatus) -> Option<SlotStatus> {
        let slot = self.slots.get_mut(&id)?;
        let from = slot.status;
        slot.status = status;
        if status == SlotStatus::Idle && from == SlotStatus::Launching {
            slot.failures = 0;
        }
        Some(from)
    }

    /// Stop handing out the given account's slots. Returns their ids.
    pub fn retire_account(&mut self, account: &str) -> Vec<SlotId> {
        self.slots
            .values_mut()
            .filter(|s| s.account == account)
            .map(|s| {
                s.retiring = true;
                s.id
            })
            .collect()
    }

    /// Whether any slot could still take work.
    #[must_use]
    pub fn has_serving_slots(&self) -> bool {
        self.slots.values().any(|s| !s.retiring)
    }

    /// Slots that are idle and not retiring.
    #[must_use]
    pub fn healthy_count(&self) -> usize {
        self.slots
            .values()
            .filter(|s| matches!(s.status, SlotStatus::Idle | SlotStatus::Busy) && !s.retiring)
            .count()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Snapshots of every slot, in id order.
    #[must_use]
    pub fn snapshots(&self) -> Vec<SlotSnapshot> {
        self.slots.values().map(SlotSnapshot::from).collect()
    }
}
