//! The dispatcher: one serializing monitor over the queue, the pool and
//! every live job.
//!
//! Callers (`enqueue`, `cancel`, `await_job`) and slot workers meet here.
//! Every read-then-write of slot or job state happens under a single
//! `parking_lot::Mutex`, which is never held across an `.await`.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Weak},
    time::Duration,
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use slotpool_core::{
    AccountConfig, AccountId, Adapter, AdapterError, Artifact, ErrorKind, EventStore, Job,
    JobArchive, JobContext, JobId, JobRecord, JobRequest, JobResult, JobStatus, LifecycleEvent,
    PhaseSink, PoolConfig, SlotId, SlotStatus, job::unix_now,
};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::Instant,
};
use tokio_util::sync::CancellationToken;

use crate::{
    backoff::delay_for_attempt,
    bridge::{BridgeConnector, BridgeRegistry, PassthroughBridge},
    error::DispatchError,
    pool::{HealthUpdate, SessionPool, SlotSnapshot},
    queue::JobQueue,
    storage::MemoryArchive,
    worker::{Assignment, SlotCommand, SlotWorker},
};

/// Time past a job's timeout before its worker abandons the adapter call.
pub(crate) const HARD_GRACE: Duration = Duration::from_secs(5);

/// Time past the hard backstop that shutdown waits for each worker.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

struct JobEntry {
    job: Job,
    result_tx: watch::Sender<Option<JobResult>>,
    /// Cancel requested after interaction began; the result is discarded.
    soft_cancelled: bool,
}

struct WorkerHandle {
    tx: mpsc::UnboundedSender<SlotCommand>,
    task: Option<JoinHandle<()>>,
}

struct State {
    jobs: HashMap<JobId, JobEntry>,
    queue: JobQueue,
    pool: SessionPool,
    /// Accounts with an active (Assigned or later) job.
    busy_accounts: HashSet<AccountId>,
    accounts: HashMap<AccountId, AccountConfig>,
    workers: HashMap<SlotId, WorkerHandle>,
    /// Terminal jobs whose record has not reached the archive yet.
    archiving: HashMap<JobId, JobRecord>,
    shutting_down: bool,
}

enum Decision {
    Finish(JobResult),
    Retry {
        reason: String,
        delay: Option<Duration>,
    },
}

/// State shared between the dispatcher handle, job handles and workers.
pub(crate) struct Shared {
    this: Weak<Shared>,
    pub(crate) config: PoolConfig,
    state: Mutex<State>,
    pub(crate) events: Arc<EventStore>,
    archive: Arc<dyn JobArchive>,
    pub(crate) bridges: BridgeRegistry,
    shutdown: CancellationToken,
    models: HashSet<String>,
    backend: String,
}

/// Counters describing the dispatcher at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchStats {
    /// Jobs waiting for a slot, including those backing off before a retry.
    pub queued: usize,
    /// Jobs holding a slot.
    pub active: usize,
    /// Admitted jobs not yet terminal.
    pub in_flight: usize,
    pub capacity: usize,
    pub slots: usize,
    /// Slots that are idle or busy and not being retired.
    pub healthy_slots: usize,
}

impl Shared {
    fn admit(self: &Arc<Self>, request: JobRequest) -> Result<JobId, DispatchError> {
        if let Some(model) = &request.model {
            if !self.models.is_empty() && !self.models.contains(model) {
                return Err(DispatchError::UnsupportedModel(model.clone()));
            }
        }

        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.shutting_down {
            return Err(DispatchError::ShuttingDown);
        }
        if !state.pool.has_serving_slots() {
            return Err(DispatchError::NoCapacity);
        }

        let job = Job::new(request, self.config.max_retries);
        let id = job.id;
        let deadline = job.deadline;
        state.queue.admit(id)?;

        let (result_tx, _) = watch::channel(None);
        state.jobs.insert(
            id,
            JobEntry {
                job,
                result_tx,
                soft_cancelled: false,
            },
        );
        tracing::info!(job_id = %id, waiting = state.queue.len(), "Job admitted");
        self.events.push(LifecycleEvent::JobAdmitted { job_id: id });

        if let Some(deadline) = deadline {
            self.watch_deadline(id, deadline);
        }
        self.pump(state);
        Ok(id)
    }

    fn watch_deadline(self: &Arc<Self>, id: JobId, deadline: Instant) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(shared) = weak.upgrade() {
                shared.expire(id);
            }
        });
    }

    /// Time out a job whose deadline passed before it got a slot.
    fn expire(&self, id: JobId) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(entry) = state.jobs.get(&id) else {
            return;
        };
        if entry.job.status != JobStatus::Queued {
            return;
        }
        let attempts = entry.job.attempts;
        state.queue.remove(id);
        self.finalize(
            state,
            id,
            JobResult::timed_out("deadline passed while queued", attempts),
        );
    }

    /// Hand waiting jobs to eligible slots until one side runs out.
    fn pump(&self, state: &mut State) {
        if state.shutting_down {
            return;
        }
        let now = Instant::now();

        while let Some(job_id) = state.queue.front() {
            let (avoid, expired, attempts) = match state.jobs.get(&job_id) {
                Some(entry) if entry.job.status == JobStatus::Queued => (
                    entry.job.slot,
                    entry.job.is_expired(now),
                    entry.job.attempts,
                ),
                _ => {
                    state.queue.pop_front();
                    continue;
                }
            };

            if expired {
                state.queue.pop_front();
                self.finalize(
                    state,
                    job_id,
                    JobResult::timed_out("deadline passed while queued", attempts),
                );
                continue;
            }

            let Some(slot) = state.pool.select(&state.busy_accounts, avoid) else {
                break;
            };
            state.queue.pop_front();
            self.assign(state, job_id, slot);
        }
    }

    fn assign(&self, state: &mut State, job_id: JobId, slot: SlotId) {
        let Some(account) = state.pool.get(slot).map(|s| s.account.clone()) else {
            return;
        };
        let account_model = state
            .accounts
            .get(&account)
            .and_then(|a| a.default_model.clone());
        let Some(entry) = state.jobs.get_mut(&job_id) else {
            return;
        };
        if let Err(e) = entry.job.transition(JobStatus::Assigned) {
            tracing::warn!(error = %e, "Skipping assignment");
            return;
        }

        let job = &mut entry.job;
        job.attempts += 1;
        job.slot = Some(slot);
        job.account = Some(account.clone());

        let hard = self.config.hard_timeout();
        let timeout = job
            .remaining(Instant::now())
            .map_or(hard, |left| left.min(hard));
        let context = JobContext {
            job_id,
            prompt: job.request.prompt.clone(),
            images: job.request.images.clone(),
            model: job
                .request
                .model
                .clone()
                .or(account_model)
                .or_else(|| self.config.default_model.clone()),
            attempt: job.attempts,
        };
        let attempt = job.attempts;

        state.pool.mark_busy(slot);
        state.busy_accounts.insert(account.clone());

        let command = SlotCommand::Execute(Assignment {
            job_id,
            context,
            timeout,
        });
        let sent = state
            .workers
            .get(&slot)
            .is_some_and(|w| w.tx.send(command).is_ok());

        if !sent {
            tracing::error!(job_id = %job_id, slot = %slot, "Slot worker unavailable; requeueing");
            if let Some(entry) = state.jobs.get_mut(&job_id) {
                entry.job.attempts = entry.job.attempts.saturating_sub(1);
                if let Err(e) = entry.job.transition(JobStatus::Queued) {
                    tracing::warn!(error = %e, "Cannot requeue job");
                }
            }
            state.queue.requeue_front(job_id);
            self.release_slot(state, slot, HealthUpdate::Fatal);
            return;
        }

        tracing::info!(
            job_id = %job_id,
            slot = %slot,
            account = %account,
            attempt,
            timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            "Job assigned"
        );
        self.events.push(LifecycleEvent::JobAssigned {
            job_id,
            slot,
            account,
            attempt,
        });
    }

    /// Return a slot to the pool. The only place a busy slot changes state.
    fn release_slot(&self, state: &mut State, slot: SlotId, health: HealthUpdate) -> bool {
        let Some(release) = state.pool.release(slot, health) else {
            return false;
        };
        if let Some(entry) = state.pool.get(slot) {
            state.busy_accounts.remove(&entry.account);
        }

        if release.to != SlotStatus::Idle {
            tracing::warn!(
                slot = %slot,
                failures = release.failures,
                status = %release.to,
                "Slot marked unhealthy"
            );
            self.events.push(LifecycleEvent::SlotHealth {
                slot,
                from: release.from,
                to: release.to,
            });
        }
        release.recycle
    }

    /// A worker is about to drive `job_id`. Returns false if the assignment
    /// was withdrawn (cancelled while queued on the worker).
    pub(crate) fn begin_interacting(&self, job_id: JobId, slot: SlotId) -> bool {
        let mut state = self.state.lock();
        let Some(entry) = state.jobs.get_mut(&job_id) else {
            return false;
        };
        if entry.job.slot != Some(slot) || entry.job.status != JobStatus::Assigned {
            return false;
        }
        if entry.job.transition(JobStatus::Interacting).is_err() {
            return false;
        }
        self.events.push(LifecycleEvent::JobPhase {
            job_id,
            phase: JobStatus::Interacting,
        });
        true
    }

    /// Record the outcome of one execution, release the slot and decide
    /// whether the job retries. Returns whether the slot must be recycled.
    ///
    /// `abandoned` means the worker gave up on an adapter that overran its
    /// own timeout; the session is then treated as broken.
    pub(crate) fn complete_execution(
        self: &Arc<Self>,
        slot: SlotId,
        job_id: JobId,
        outcome: Result<Artifact, AdapterError>,
        abandoned: bool,
    ) -> bool {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let Some(entry) = state.jobs.get(&job_id) else {
            return self.release_slot(state, slot, HealthUpdate::Neutral);
        };
        let attempts = entry.job.attempts;
        let expired = entry.job.is_expired(Instant::now());
        let can_retry =
            entry.job.retries_left() && !entry.soft_cancelled && !state.shutting_down;

        let (health, decision) = self.classify(outcome, attempts, can_retry);
        let health = if abandoned { HealthUpdate::Fatal } else { health };
        let decision = match decision {
            Decision::Retry { .. } if expired => {
                Decision::Finish(JobResult::timed_out("deadline passed", attempts))
            }
            other => other,
        };

        let recycle = self.release_slot(state, slot, health);
        match decision {
            Decision::Finish(result) => self.finalize(state, job_id, result),
            Decision::Retry { reason, delay } => {
                self.schedule_retry(state, job_id, attempts, reason, delay);
            }
        }
        self.pump(state);
        recycle
    }

    fn classify(
        &self,
        outcome: Result<Artifact, AdapterError>,
        attempts: u32,
        can_retry: bool,
    ) -> (HealthUpdate, Decision) {
        let err = match outcome {
            Ok(artifact) => {
                return (
                    HealthUpdate::Success,
                    Decision::Finish(JobResult::succeeded(artifact, attempts)),
                );
            }
            Err(err) => err,
        };
        let reason = err.to_string();

        match err {
            AdapterError::Transient(message) => {
                let decision = if can_retry {
                    Decision::Retry {
                        reason,
                        delay: None,
                    }
                } else {
                    Decision::Finish(JobResult::failed(ErrorKind::Transient, message, attempts))
                };
                (HealthUpdate::Failure, decision)
            }
            AdapterError::TimedOut(window) => {
                let health = if self.config.timeout_counts_as_failure {
                    HealthUpdate::Failure
                } else {
                    HealthUpdate::Neutral
                };
                let decision = if can_retry && self.config.retry_timeouts {
                    Decision::Retry {
                        reason,
                        delay: None,
                    }
                } else {
                    Decision::Finish(JobResult::timed_out(
                        format!("no completion signal within {}s", window.as_secs()),
                        attempts,
                    ))
                };
                (health, decision)
            }
            AdapterError::Fatal(message) => (
                HealthUpdate::Fatal,
                Decision::Finish(JobResult::failed(ErrorKind::Fatal, message, attempts)),
            ),
            AdapterError::Upstream { code, message } => {
                let policy = self.config.upstream_policy(&code);
                let decision = if can_retry && policy.retry {
                    let delay = policy.backoff_ms.map_or_else(
                        || delay_for_attempt(attempts, &self.config.retry_backoff),
                        Duration::from_millis,
                    );
                    Decision::Retry {
                        reason,
                        delay: Some(delay),
                    }
                } else {
                    Decision::Finish(JobResult::upstream(code, message, attempts))
                };
                (HealthUpdate::Neutral, decision)
            }
            AdapterError::Extraction(message) => (
                HealthUpdate::Failure,
                Decision::Finish(JobResult::failed(ErrorKind::Extraction, message, attempts)),
            ),
        }
    }

    fn schedule_retry(
        self: &Arc<Self>,
        state: &mut State,
        job_id: JobId,
        attempt: u32,
        reason: String,
        delay: Option<Duration>,
    ) {
        let Some(entry) = state.jobs.get_mut(&job_id) else {
            return;
        };
        if let Err(e) = entry.job.transition(JobStatus::Queued) {
            tracing::warn!(error = %e, "Cannot requeue job");
            return;
        }
        tracing::warn!(job_id = %job_id, attempt, reason = %reason, ?delay, "Retrying job");
        self.events.push(LifecycleEvent::JobRetried {
            job_id,
            attempt,
            reason,
        });

        match delay {
            None => state.queue.requeue_front(job_id),
            Some(delay) => {
                let weak = Arc::downgrade(self);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(shared) = weak.upgrade() {
                        shared.requeue(job_id);
                    }
                });
            }
        }
    }

    /// Put a job that finished backing off at the front of the queue.
    fn requeue(&self, job_id: JobId) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let waiting = state
            .jobs
            .get(&job_id)
            .is_some_and(|e| e.job.status == JobStatus::Queued);
        if waiting {
            state.queue.requeue_front(job_id);
            self.pump(state);
        }
    }

    /// Move a job to its terminal status, publish the result and hand the
    /// job over to the archive.
    fn finalize(&self, state: &mut State, id: JobId, result: JobResult) {
        let Some(entry) = state.jobs.get_mut(&id) else {
            return;
        };
        let status = JobStatus::from(result.outcome);
        if let Err(e) = entry.job.transition(status) {
            tracing::warn!(error = %e, "Dropping terminal result");
            return;
        }
        state.queue.complete();

        tracing::info!(
            job_id = %id,
            outcome = ?result.outcome,
            attempts = result.attempts,
            "Job finished"
        );
        self.events.push(LifecycleEvent::JobTerminal {
            job_id: id,
            outcome: result.outcome,
            attempts: result.attempts,
        });

        let delivered = if entry.soft_cancelled {
            self.events.push(LifecycleEvent::JobResultDiscarded {
                job_id: id,
                outcome: result.outcome,
            });
            JobResult::cancelled(
                "cancelled after interaction began; result discarded",
                result.attempts,
            )
        } else {
            result
        };
        entry.result_tx.send_replace(Some(delivered.clone()));

        // Subscribed waiters keep the published value; later ones read the record.
        let record = JobRecord {
            id,
            status,
            result: delivered,
            account: entry.job.account.clone(),
            created_at: entry.job.created_at,
            archived_at: unix_now(),
        };
        state.jobs.remove(&id);
        state.archiving.insert(id, record);
        self.spawn_archive(id);
    }

    fn spawn_archive(&self, id: JobId) {
        let weak = Weak::clone(&self.this);
        tokio::spawn(async move {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            if let Err(e) = shared.flush_archive(id).await {
                tracing::error!(job_id = %id, error = %e, "Failed to archive job");
            }
        });
    }

    /// Write a finished job's record to the archive. Idempotent.
    async fn flush_archive(&self, id: JobId) -> Result<(), DispatchError> {
        let record = self.state.lock().archiving.get(&id).cloned();
        let Some(record) = record else {
            return Ok(());
        };
        self.archive.put(record).await?;
        self.state.lock().archiving.remove(&id);
        tracing::debug!(job_id = %id, "Job archived");
        Ok(())
    }

    /// Record of a finished job, whether or not it reached the archive yet.
    async fn record(&self, id: JobId) -> Result<Option<JobRecord>, DispatchError> {
        let pending = self.state.lock().archiving.get(&id).cloned();
        if pending.is_some() {
            return Ok(pending);
        }
        Ok(self.archive.get(id).await?)
    }

    fn cancel_locked(&self, state: &mut State, id: JobId, reason: &str) -> Result<(), DispatchError> {
        let Some(entry) = state.jobs.get_mut(&id) else {
            return Err(DispatchError::NotFound(id));
        };
        let status = entry.job.status;
        if status.is_terminal() {
            return Ok(());
        }
        if !status.is_cancellable() {
            entry.soft_cancelled = true;
            tracing::info!(job_id = %id, %status, "Cancel after interaction began; result will be discarded");
            return Err(DispatchError::AlreadyRunning(id));
        }

        let attempts = entry.job.attempts;
        let slot = entry.job.slot;
        if status == JobStatus::Assigned {
            if let Some(slot) = slot {
                self.release_slot(state, slot, HealthUpdate::Neutral);
            }
        } else {
            state.queue.remove(id);
        }
        self.finalize(state, id, JobResult::cancelled(reason, attempts));
        self.pump(state);
        Ok(())
    }

    async fn cancel(&self, id: JobId) -> Result<(), DispatchError> {
        let live = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.jobs.contains_key(&id) {
                Some(self.cancel_locked(state, id, "cancelled by caller"))
            } else {
                None
            }
        };
        if let Some(result) = live {
            return result;
        }

        // Already finished: cancelling is a no-op.
        match self.record(id).await? {
            Some(_) => Ok(()),
            None => Err(DispatchError::NotFound(id)),
        }
    }

    async fn await_result(&self, id: JobId) -> Result<JobResult, DispatchError> {
        let rx = self
            .state
            .lock()
            .jobs
            .get(&id)
            .map(|e| e.result_tx.subscribe());

        if let Some(mut rx) = rx {
            let published = match rx.wait_for(Option::is_some).await {
                Ok(value) => (*value).clone(),
                Err(_) => None,
            };
            if let Some(result) = published {
                // Re-awaiting must find the archived record.
                self.flush_archive(id).await?;
                return Ok(result);
            }
        }

        self.record(id)
            .await?
            .map(|record| record.result)
            .ok_or(DispatchError::NotFound(id))
    }

    async fn status(&self, id: JobId) -> Result<JobStatus, DispatchError> {
        let live = self.state.lock().jobs.get(&id).map(|e| e.job.status);
        if let Some(status) = live {
            return Ok(status);
        }
        self.record(id)
            .await?
            .map(|record| record.status)
            .ok_or(DispatchError::NotFound(id))
    }

    pub(crate) fn set_slot_status(&self, slot: SlotId, status: SlotStatus) {
        let mut state = self.state.lock();
        self.apply_slot_status(&mut state, slot, status);
    }

    fn apply_slot_status(&self, state: &mut State, slot: SlotId, status: SlotStatus) {
        // Only release may move a busy slot.
        if state
            .pool
            .get(slot)
            .is_some_and(|s| s.status == SlotStatus::Busy)
        {
            tracing::debug!(slot = %slot, to = %status, "Slot is running a job; status change ignored");
            return;
        }
        if let Some(from) = state.pool.set_status(slot, status) {
            if from != status {
                tracing::debug!(slot = %slot, %from, to = %status, "Slot status changed");
                self.events.push(LifecycleEvent::SlotHealth {
                    slot,
                    from,
                    to: status,
                });
            }
        }
    }

    /// Whether a recycle sent to `slot` still applies. A slot that went back
    /// into rotation since the request was sent keeps its session.
    pub(crate) fn recycle_pending(&self, slot: SlotId) -> bool {
        self.state
            .lock()
            .pool
            .get(slot)
            .is_some_and(|s| matches!(s.status, SlotStatus::Closing | SlotStatus::Unhealthy))
    }

    /// A slot finished launching.
    pub(crate) fn slot_ready(&self, slot: SlotId) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        self.apply_slot_status(state, slot, SlotStatus::Idle);
        self.pump(state);
    }

    /// A slot worker exited; forget the slot.
    pub(crate) fn slot_retired(&self, slot: SlotId) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.pool.remove(slot);
        state.workers.remove(&slot);
        tracing::info!(slot = %slot, remaining = state.pool.len(), "Slot retired");
        if !state.pool.has_serving_slots() && !state.shutting_down {
            self.fail_waiting(state, "no session slots remain");
        }
    }

    /// Fail every job still waiting for a slot.
    fn fail_waiting(&self, state: &mut State, message: &str) {
        let waiting: Vec<(JobId, u32)> = state
            .jobs
            .values()
            .filter(|e| e.job.status == JobStatus::Queued)
            .map(|e| (e.job.id, e.job.attempts))
            .collect();
        for (id, attempts) in waiting {
            state.queue.remove(id);
            self.finalize(
                state,
                id,
                JobResult::failed(ErrorKind::NoCapacity, message, attempts),
            );
        }
    }

    fn request_recycle(&self, slot: SlotId) -> Result<(), DispatchError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let status = state
            .pool
            .get(slot)
            .map(|s| s.status)
            .ok_or(DispatchError::UnknownSlot(slot))?;

        match status {
            SlotStatus::Busy => return Err(DispatchError::SlotBusy(slot)),
            SlotStatus::Cold | SlotStatus::Launching | SlotStatus::Closing => return Ok(()),
            SlotStatus::Idle | SlotStatus::Unhealthy => {
                // Out of rotation before the worker sees the command.
                self.apply_slot_status(state, slot, SlotStatus::Closing);
            }
        }
        if let Some(worker) = state.workers.get(&slot) {
            if worker.tx.send(SlotCommand::Recycle).is_err() {
                tracing::warn!(slot = %slot, "Slot worker gone; recycle dropped");
            }
        }
        Ok(())
    }

    fn stats(&self) -> DispatchStats {
        let state = self.state.lock();
        DispatchStats {
            queued: state
                .jobs
                .values()
                .filter(|e| e.job.status == JobStatus::Queued)
                .count(),
            active: state.jobs.values().filter(|e| e.job.status.is_active()).count(),
            in_flight: state.queue.in_flight(),
            capacity: state.queue.capacity(),
            slots: state.pool.len(),
            healthy_slots: state.pool.healthy_count(),
        }
    }
}

impl PhaseSink for Shared {
    fn enter_phase(&self, job_id: JobId, phase: JobStatus) {
        let mut state = self.state.lock();
        let Some(entry) = state.jobs.get_mut(&job_id) else {
            return;
        };
        match entry.job.transition(phase) {
            Ok(()) => {
                tracing::debug!(job_id = %job_id, %phase, "Job phase");
                self.events.push(LifecycleEvent::JobPhase { job_id, phase });
            }
            Err(e) => tracing::debug!(error = %e, "Ignoring phase report"),
        }
    }
}

/// Handle returned by [`Dispatcher::enqueue`].
#[derive(Clone)]
pub struct JobHandle {
    id: JobId,
    shared: Arc<Shared>,
}

impl JobHandle {
    #[must_use]
    pub const fn id(&self) -> JobId {
        self.id
    }

    /// Wait for the job's terminal result.
    ///
    /// # Errors
    /// Returns `DispatchError::NotFound` if the job is unknown, or a storage
    /// error if archiving fails.
    pub async fn wait(&self) -> Result<JobResult, DispatchError> {
        self.shared.await_result(self.id).await
    }

    /// Cancel the job.
    ///
    /// # Errors
    /// Returns `DispatchError::AlreadyRunning` once interaction has begun.
    pub async fn cancel(&self) -> Result<(), DispatchError> {
        self.shared.cancel(self.id).await
    }

    /// Current status.
    ///
    /// # Errors
    /// Returns `DispatchError::NotFound` if the job is unknown.
    pub async fn status(&self) -> Result<JobStatus, DispatchError> {
        self.shared.status(self.id).await
    }
}

impl std::fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle").field("id", &self.id).finish()
    }
}

/// Builder for [`Dispatcher`].
pub struct DispatcherBuilder<A: Adapter> {
    config: PoolConfig,
    adapter: A,
    archive: Option<Arc<dyn JobArchive>>,
    connector: Option<Arc<dyn BridgeConnector>>,
    events: Option<Arc<EventStore>>,
}

impl<A: Adapter> DispatcherBuilder<A> {
    /// Archive delivered jobs here instead of in memory.
    #[must_use]
    pub fn archive(mut self, archive: Arc<dyn JobArchive>) -> Self {
        self.archive = Some(archive);
        self
    }

    /// Open proxy bridges with `connector` instead of passing upstreams through.
    #[must_use]
    pub fn bridge_connector(mut self, connector: Arc<dyn BridgeConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Publish lifecycle events to an existing store.
    #[must_use]
    pub fn events(mut self, events: Arc<EventStore>) -> Self {
        self.events = Some(events);
        self
    }

    /// Create the pool and launch one worker per slot.
    ///
    /// Must be called within a Tokio runtime.
    ///
    /// # Errors
    /// Returns `DispatchError::Config` for an invalid config and
    /// `DispatchError::NoCapacity` if it defines no slots.
    pub fn start(self) -> Result<Dispatcher<A>, DispatchError> {
        self.config.validate()?;
        if self.config.slot_count() == 0 {
            return Err(DispatchError::NoCapacity);
        }

        let events = self.events.unwrap_or_default();
        let archive = self
            .archive
            .unwrap_or_else(|| Arc::new(MemoryArchive::new()) as Arc<dyn JobArchive>);
        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(PassthroughBridge) as Arc<dyn BridgeConnector>);
        let adapter = Arc::new(self.adapter);

        let state = State {
            jobs: HashMap::new(),
            queue: JobQueue::new(self.config.queue_capacity),
            pool: SessionPool::new(self.config.failure_threshold),
            busy_accounts: HashSet::new(),
            accounts: HashMap::new(),
            workers: HashMap::new(),
            archiving: HashMap::new(),
            shutting_down: false,
        };
        let accounts = self.config.accounts.clone();
        let shared = Arc::new_cyclic(|this| Shared {
            this: Weak::clone(this),
            bridges: BridgeRegistry::new(connector, Arc::clone(&events)),
            config: self.config,
            state: Mutex::new(state),
            events,
            archive,
            shutdown: CancellationToken::new(),
            models: adapter.supported_models(),
            backend: adapter.name().to_string(),
        });

        let dispatcher = Dispatcher { shared, adapter };
        {
            let mut state = dispatcher.shared.state.lock();
            for account in accounts {
                dispatcher.register(&mut state, account);
            }
            tracing::info!(
                backend = %dispatcher.shared.backend,
                slots = state.pool.len(),
                capacity = dispatcher.shared.config.queue_capacity,
                "Dispatcher started"
            );
        }
        Ok(dispatcher)
    }
}

/// Matches queued jobs to session slots driven by adapter `A`.
pub struct Dispatcher<A: Adapter> {
    shared: Arc<Shared>,
    adapter: Arc<A>,
}

impl<A: Adapter> Clone for Dispatcher<A> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            adapter: Arc::clone(&self.adapter),
        }
    }
}

impl<A: Adapter> std::fmt::Debug for Dispatcher<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("backend", &self.shared.backend)
            .finish_non_exhaustive()
    }
}

impl<A: Adapter> Dispatcher<A> {
    /// Start configuring a dispatcher.
    #[must_use]
    pub fn builder(config: PoolConfig, adapter: A) -> DispatcherBuilder<A> {
        DispatcherBuilder {
            config,
            adapter,
            archive: None,
            connector: None,
            events: None,
        }
    }

    /// Start a dispatcher with default archive, bridge and event store.
    ///
    /// # Errors
    /// See [`DispatcherBuilder::start`].
    pub fn start(config: PoolConfig, adapter: A) -> Result<Self, DispatchError> {
        Self::builder(config, adapter).start()
    }

    fn register(&self, state: &mut State, account: AccountConfig) -> Vec<SlotId> {
        let mut slots = Vec::with_capacity(account.windows);
        for window in 0..account.windows {
            let slot = state.pool.add_slot(&account.id, &self.shared.backend, window);
            let (tx, rx) = mpsc::unbounded_channel();
            let worker = SlotWorker::new(
                slot,
                account.account(),
                account.launch_config(window, &self.shared.config),
                account.proxy.clone(),
                Arc::clone(&self.adapter),
                Arc::clone(&self.shared),
                self.shared.shutdown.child_token(),
            );
            let task = tokio::spawn(worker.run(rx));
            state.workers.insert(
                slot,
                WorkerHandle {
                    tx,
                    task: Some(task),
                },
            );
            slots.push(slot);
        }
        tracing::info!(account = %account.id, slots = slots.len(), "Account registered");
        state.accounts.insert(account.id.clone(), account);
        slots
    }

    /// Admit a job.
    ///
    /// # Errors
    /// Returns `DispatchError::QueueFull` at capacity, `NoCapacity` if the
    /// pool has no slots, `UnsupportedModel` for a model the backend does
    /// not accept, and `ShuttingDown` after [`Dispatcher::shutdown`].
    pub fn enqueue(&self, request: JobRequest) -> Result<JobHandle, DispatchError> {
        let id = self.shared.admit(request)?;
        Ok(JobHandle {
            id,
            shared: Arc::clone(&self.shared),
        })
    }

    /// Cancel a job that has not begun interacting.
    ///
    /// Cancelling a terminal job is a no-op. Once interaction has begun the
    /// job runs to completion and its caller receives a `Cancelled` result.
    ///
    /// # Errors
    /// Returns `DispatchError::AlreadyRunning` once interaction has begun,
    /// `NotFound` for an unknown id.
    pub async fn cancel(&self, id: JobId) -> Result<(), DispatchError> {
        self.shared.cancel(id).await
    }

    /// Wait for a job's terminal result. Re-awaiting returns the same result.
    ///
    /// # Errors
    /// Returns `DispatchError::NotFound` for an unknown id.
    pub async fn await_job(&self, id: JobId) -> Result<JobResult, DispatchError> {
        self.shared.await_result(id).await
    }

    /// Status of a live or archived job.
    ///
    /// # Errors
    /// Returns `DispatchError::NotFound` for an unknown id.
    pub async fn job_status(&self, id: JobId) -> Result<JobStatus, DispatchError> {
        self.shared.status(id).await
    }

    #[must_use]
    pub fn stats(&self) -> DispatchStats {
        self.shared.stats()
    }

    /// Snapshots of every slot.
    #[must_use]
    pub fn slots(&self) -> Vec<SlotSnapshot> {
        self.shared.state.lock().pool.snapshots()
    }

    #[must_use]
    pub fn events(&self) -> Arc<EventStore> {
        Arc::clone(&self.shared.events)
    }

    #[must_use]
    pub fn archive(&self) -> Arc<dyn JobArchive> {
        Arc::clone(&self.shared.archive)
    }

    #[must_use]
    pub fn bridges(&self) -> &BridgeRegistry {
        &self.shared.bridges
    }

    /// Models accepted by the backend. Empty means any.
    #[must_use]
    pub fn supported_models(&self) -> &HashSet<String> {
        &self.shared.models
    }

    /// Add an account and launch its slots.
    ///
    /// # Errors
    /// Returns `DispatchError::DuplicateAccount` if the id is taken,
    /// `Config` for an invalid entry and `ShuttingDown` after shutdown.
    pub fn add_account(&self, account: AccountConfig) -> Result<Vec<SlotId>, DispatchError> {
        account.validate()?;
        let mut state = self.shared.state.lock();
        if state.shutting_down {
            return Err(DispatchError::ShuttingDown);
        }
        if state.accounts.contains_key(&account.id) {
            return Err(DispatchError::DuplicateAccount(account.id));
        }
        Ok(self.register(&mut state, account))
    }

    /// Retire an account's slots. A busy slot finishes its job first.
    ///
    /// # Errors
    /// Returns `DispatchError::UnknownAccount` if no such account exists.
    pub fn remove_account(&self, id: &str) -> Result<(), DispatchError> {
        let mut guard = self.shared.state.lock();
        let state = &mut *guard;
        if state.accounts.remove(id).is_none() {
            return Err(DispatchError::UnknownAccount(id.to_string()));
        }

        let slots = state.pool.retire_account(id);
        for slot in &slots {
            if let Some(worker) = state.workers.get(slot) {
                if worker.tx.send(SlotCommand::Retire).is_err() {
                    tracing::warn!(slot = %slot, "Slot worker already gone");
                }
            }
        }
        tracing::info!(account = id, slots = slots.len(), "Account removed");

        if !state.pool.has_serving_slots() {
            self.shared.fail_waiting(state, "no session slots remain");
        }
        Ok(())
    }

    /// Close and relaunch a slot's session.
    ///
    /// # Errors
    /// Returns `DispatchError::UnknownSlot` or `SlotBusy`.
    pub fn recycle_slot(&self, slot: SlotId) -> Result<(), DispatchError> {
        self.shared.request_recycle(slot)
    }

    /// Stop accepting jobs, cancel those not yet interacting, let running
    /// jobs finish and close every session.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down dispatcher");
        let tasks: Vec<(SlotId, JoinHandle<()>)> = {
            let mut guard = self.shared.state.lock();
            let state = &mut *guard;
            state.shutting_down = true;

            let cancellable: Vec<JobId> = state
                .jobs
                .values()
                .filter(|e| e.job.status.is_cancellable())
                .map(|e| e.job.id)
                .collect();
            for id in cancellable {
                if let Err(e) = self.shared.cancel_locked(state, id, "dispatcher shutting down") {
                    tracing::debug!(job_id = %id, error = %e, "Job not cancelled");
                }
            }

            state
                .workers
                .iter_mut()
                .filter_map(|(slot, w)| w.task.take().map(|t| (*slot, t)))
                .collect()
        };
        self.shared.shutdown.cancel();

        let limit = self.shared.config.hard_timeout() + HARD_GRACE + SHUTDOWN_GRACE;
        for (slot, mut task) in tasks {
            match tokio::time::timeout(limit, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!(slot = %slot, error = %e, "Slot worker failed"),
                Err(_) => {
                    tracing::warn!(slot = %slot, "Slot worker did not stop in time; aborting");
                    task.abort();
                }
            }
        }
        tracing::info!("Dispatcher shut down");
    }
}

#[cfg(test)]
mod tests {
    use slotpool_adapters::{ScriptedAdapter, Step};
    use slotpool_core::{Outcome, RecordFilter};

    use super::*;

    fn one_slot(capacity: usize) -> PoolConfig {
        PoolConfig {
            queue_capacity: capacity,
            soft_timeout_secs: 60,
            hard_timeout_secs: 120,
            init_attempts: 1,
            accounts: vec![AccountConfig::new("a", "/profiles/a")],
            ..PoolConfig::default()
        }
    }

    async fn idle(dispatcher: &Dispatcher<ScriptedAdapter>) {
        for _ in 0..1_000 {
            if dispatcher.slots().iter().all(|s| s.status == SlotStatus::Idle) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("slot never became idle");
    }

    fn live_jobs(dispatcher: &Dispatcher<ScriptedAdapter>) -> usize {
        dispatcher.shared.state.lock().jobs.len()
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_jobs_leave_the_live_set() {
        let adapter = ScriptedAdapter::new();
        adapter.push_steps([Step::Succeed {
            delay: Duration::from_secs(30),
        }]);
        let dispatcher = Dispatcher::start(one_slot(256), adapter).unwrap();
        idle(&dispatcher).await;

        let _running = dispatcher.enqueue(JobRequest::prompt("long")).unwrap();
        for i in 0..200 {
            let job = dispatcher
                .enqueue(JobRequest::prompt(format!("dropped {i}")))
                .unwrap();
            job.cancel().await.unwrap();
        }
        drop(dispatcher.enqueue(JobRequest::prompt("never awaited")).unwrap());
        assert_eq!(live_jobs(&dispatcher), 2);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(live_jobs(&dispatcher), 0);
        assert!(dispatcher.shared.state.lock().archiving.is_empty());
        assert_eq!(dispatcher.stats().in_flight, 0);

        let records = dispatcher
            .archive()
            .list(RecordFilter::default())
            .await
            .unwrap();
        assert_eq!(records.len(), 202);
        let cancelled = records
            .iter()
            .filter(|r| r.result.outcome == Outcome::Cancelled)
            .count();
        assert_eq!(cancelled, 200);

        dispatcher.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_job_is_readable_before_archiving() {
        let dispatcher = Dispatcher::start(one_slot(4), ScriptedAdapter::new()).unwrap();

        let job = dispatcher.enqueue(JobRequest::prompt("queued")).unwrap();
        job.cancel().await.unwrap();

        // No yield since the cancel: the record is still on its way.
        assert!(dispatcher.shared.state.lock().archiving.contains_key(&job.id()));
        assert_eq!(job.status().await.unwrap(), JobStatus::Cancelled);
        assert_eq!(job.wait().await.unwrap().outcome, Outcome::Cancelled);

        dispatcher.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_slot_ignores_lifecycle_updates() {
        let adapter = ScriptedAdapter::new();
        adapter.push_steps([Step::Succeed {
            delay: Duration::from_secs(10),
        }]);
        let dispatcher = Dispatcher::start(one_slot(4), adapter).unwrap();
        idle(&dispatcher).await;

        let job = dispatcher.enqueue(JobRequest::prompt("busy")).unwrap();
        let slot = SlotId(0);
        dispatcher.shared.set_slot_status(slot, SlotStatus::Closing);
        assert_eq!(dispatcher.slots()[0].status, SlotStatus::Busy);
        assert!(!dispatcher.shared.recycle_pending(slot));

        assert!(job.wait().await.unwrap().is_success());
        dispatcher.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_recycle_keeps_assigned_session() {
        let adapter = ScriptedAdapter::new();
        let dispatcher = Dispatcher::start(one_slot(4), adapter.clone()).unwrap();
        idle(&dispatcher).await;

        // A recycle that was overtaken by a relaunch, queued ahead of the
        // next assignment.
        {
            let state = dispatcher.shared.state.lock();
            let sent = state
                .workers
                .get(&SlotId(0))
                .is_some_and(|w| w.tx.send(SlotCommand::Recycle).is_ok());
            assert!(sent);
        }
        let job = dispatcher.enqueue(JobRequest::prompt("next")).unwrap();

        assert!(job.wait().await.unwrap().is_success());
        assert_eq!(adapter.closes(), 0);
        assert_eq!(adapter.inits(), 1);
        assert_eq!(adapter.executions()[0].session, 1);
        assert!(!dispatcher
            .events()
            .history()
            .iter()
            .any(|e| matches!(e, LifecycleEvent::RecycleStarted { .. })));

        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_dispatcher_debug() {
        let dispatcher = Dispatcher::start(one_slot(4), ScriptedAdapter::new()).unwrap();
        assert!(format!("{dispatcher:?}").contains("scripted"));
        dispatcher.shutdown().await;
    }
}
