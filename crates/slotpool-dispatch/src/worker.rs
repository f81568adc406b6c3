//! One task per session slot.
//!
//! The worker owns the slot's adapter session exclusively, so `execute_job`
//! can never run twice at once on the same session. It launches the
//! session, runs assignments one at a time, recycles the session when the
//! dispatcher says so, and closes it on retirement or shutdown.

use std::{sync::Arc, time::Duration};

use slotpool_core::{
    Account, Adapter, AdapterError, JobContext, JobId, JobProgress, LaunchConfig, LifecycleEvent,
    PhaseSink, SlotId, SlotStatus,
};
use tokio::{sync::mpsc, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::{
    backoff::Backoff,
    bridge::BridgeLease,
    dispatcher::{HARD_GRACE, Shared},
};

/// A job handed to a slot.
pub(crate) struct Assignment {
    pub job_id: JobId,
    pub context: JobContext,
    /// Execution timeout passed to the adapter.
    pub timeout: Duration,
}

pub(crate) enum SlotCommand {
    Execute(Assignment),
    Recycle,
    Retire,
}

pub(crate) struct SlotWorker<A: Adapter> {
    slot: SlotId,
    account: Account,
    launch: LaunchConfig,
    proxy: Option<String>,
    adapter: Arc<A>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    session: Option<A::Session>,
    lease: Option<BridgeLease>,
    backoff: Backoff,
    /// When to retry a failed launch.
    retry_at: Option<Instant>,
}

impl<A: Adapter> SlotWorker<A> {
    pub(crate) fn new(
        slot: SlotId,
        account: Account,
        launch: LaunchConfig,
        proxy: Option<String>,
        adapter: Arc<A>,
        shared: Arc<Shared>,
        cancel: CancellationToken,
    ) -> Self {
        let backoff = Backoff::new(shared.config.retry_backoff.clone());
        Self {
            slot,
            account,
            launch,
            proxy,
            adapter,
            shared,
            cancel,
            session: None,
            lease: None,
            backoff,
            retry_at: None,
        }
    }

    pub(crate) async fn run(mut self, mut rx: mpsc::UnboundedReceiver<SlotCommand>) {
        tracing::debug!(slot = %self.slot, account = %self.account.id, "Slot worker started");
        self.launch().await;

        loop {
            let relaunch_at = self.retry_at;
            tokio::select! {
                () = self.cancel.cancelled() => break,
                command = rx.recv() => match command {
                    Some(SlotCommand::Execute(assignment)) => self.execute(assignment).await,
                    Some(SlotCommand::Recycle) => {
                        if self.shared.recycle_pending(self.slot) {
                            self.recycle().await;
                        } else {
                            tracing::debug!(slot = %self.slot, "Stale recycle request dropped");
                        }
                    }
                    Some(SlotCommand::Retire) | None => break,
                },
                () = tokio::time::sleep_until(relaunch_at.unwrap_or_else(Instant::now)), if relaunch_at.is_some() => {
                    self.retry_at = None;
                    self.launch().await;
                }
            }
        }

        self.retire().await;
    }

    async fn execute(&mut self, assignment: Assignment) {
        let Assignment {
            job_id,
            context,
            timeout,
        } = assignment;
        let slot = self.slot;

        if !self.shared.begin_interacting(job_id, slot) {
            tracing::debug!(job_id = %job_id, slot = %slot, "Assignment withdrawn");
            return;
        }

        let Some(session) = self.session.as_mut() else {
            let recycle = self.shared.complete_execution(
                slot,
                job_id,
                Err(AdapterError::Transient("slot has no live session".into())),
                false,
            );
            if recycle {
                self.recycle().await;
            }
            return;
        };

        let progress = JobProgress::new(job_id, Arc::clone(&self.shared) as Arc<dyn PhaseSink>);
        let soft = self.shared.config.soft_timeout();
        let backstop = timeout + HARD_GRACE;
        let started = Instant::now();
        let mut abandoned = false;

        let outcome = {
            let execution = self
                .adapter
                .execute_job(session, &context, timeout, &progress);
            tokio::pin!(execution);
            let soft_timer = tokio::time::sleep(soft);
            tokio::pin!(soft_timer);
            let hard_timer = tokio::time::sleep(backstop);
            tokio::pin!(hard_timer);
            let mut warned = false;

            loop {
                tokio::select! {
                    result = &mut execution => break result,
                    () = &mut soft_timer, if !warned => {
                        warned = true;
                        let elapsed = started.elapsed();
                        tracing::warn!(
                            job_id = %job_id,
                            slot = %slot,
                            elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                            "Job still running past soft timeout"
                        );
                        self.shared.events.push(LifecycleEvent::soft_timeout(job_id, slot, elapsed));
                    }
                    () = &mut hard_timer => {
                        abandoned = true;
                        tracing::error!(
                            job_id = %job_id,
                            slot = %slot,
                            "Adapter overran its timeout; abandoning execution"
                        );
                        break Err(AdapterError::TimedOut(timeout));
                    }
                }
            }
        };

        match &outcome {
            Ok(_) => tracing::debug!(job_id = %job_id, slot = %slot, "Execution succeeded"),
            Err(e) => tracing::info!(job_id = %job_id, slot = %slot, error = %e, "Execution failed"),
        }

        if self
            .shared
            .complete_execution(slot, job_id, outcome, abandoned)
        {
            self.recycle().await;
        }
    }

    /// Close the session and launch a fresh one in its place.
    async fn recycle(&mut self) {
        let slot = self.slot;
        tracing::info!(slot = %slot, account = %self.account.id, "Recycling slot");
        self.shared
            .events
            .push(LifecycleEvent::RecycleStarted { slot });

        self.shared.set_slot_status(slot, SlotStatus::Closing);
        if let Some(session) = self.session.take() {
            self.adapter.close_session(session).await;
        }
        let ok = self.launch().await;

        self.shared
            .events
            .push(LifecycleEvent::RecycleFinished { slot, ok });
    }

    /// Cold-launch the session. On failure the slot stays unhealthy and a
    /// relaunch is scheduled with backoff.
    async fn launch(&mut self) -> bool {
        let slot = self.slot;
        self.shared.set_slot_status(slot, SlotStatus::Cold);
        self.shared.set_slot_status(slot, SlotStatus::Launching);

        let mut launch = self.launch.clone();
        match self.bridge_endpoint().await {
            Ok(endpoint) => launch.proxy_endpoint = endpoint,
            Err(e) => {
                self.launch_failed(&e);
                return false;
            }
        }

        match self.adapter.init_session(&self.account, &launch).await {
            Ok(session) => {
                self.session = Some(session);
                self.backoff.reset();
                self.retry_at = None;
                tracing::info!(
                    slot = %slot,
                    account = %self.account.id,
                    window = launch.window,
                    "Slot ready"
                );
                self.shared.slot_ready(slot);
                true
            }
            Err(e) => {
                self.launch_failed(&e);
                false
            }
        }
    }

    async fn bridge_endpoint(&mut self) -> Result<Option<String>, AdapterError> {
        let Some(proxy) = self.proxy.as_deref() else {
            return Ok(None);
        };
        if self.lease.is_none() {
            self.lease = Some(self.shared.bridges.acquire(proxy).await?);
        }
        Ok(self.lease.as_ref().map(|l| l.endpoint().to_string()))
    }

    fn launch_failed(&mut self, err: &AdapterError) {
        let delay = self.backoff.next_delay();
        self.retry_at = Some(Instant::now() + delay);
        tracing::warn!(
            slot = %self.slot,
            account = %self.account.id,
            error = %err,
            retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "Slot launch failed"
        );
        self.shared.set_slot_status(self.slot, SlotStatus::Unhealthy);
    }

    async fn retire(mut self) {
        self.shared.set_slot_status(self.slot, SlotStatus::Closing);
        if let Some(session) = self.session.take() {
            self.adapter.close_session(session).await;
        }
        // Last lease on an upstream closes its bridge.
        drop(self.lease.take());
        self.shared.slot_retired(self.slot);
        tracing::debug!(slot = %self.slot, "Slot worker stopped");
    }
}
