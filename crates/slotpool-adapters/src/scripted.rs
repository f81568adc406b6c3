//! A backend that replays scripted outcomes.
//!
//! Each account (or the whole backend) gets a queue of [`Step`]s; every
//! `execute_job` call consumes one step, and an exhausted script succeeds.
//! The adapter also records what it observed so tests can check the
//! dispatcher's exclusivity guarantees.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use slotpool_core::{
    Account, AccountId, Adapter, AdapterError, Artifact, JobContext, JobId, JobProgress,
    LaunchConfig, ResponseBus,
};

/// One scripted execution.
#[derive(Debug, Clone)]
pub enum Step {
    /// Complete after `delay` with a text artifact.
    Succeed { delay: Duration },
    /// Fail after `delay`.
    Fail { delay: Duration, error: AdapterError },
    /// Submit, then never observe a completion.
    Hang,
}

impl Step {
    /// Immediate success.
    #[must_use]
    pub const fn ok() -> Self {
        Self::Succeed {
            delay: Duration::ZERO,
        }
    }

    /// Immediate failure.
    #[must_use]
    pub const fn fail(error: AdapterError) -> Self {
        Self::Fail {
            delay: Duration::ZERO,
            error,
        }
    }

    /// Immediate transient failure.
    #[must_use]
    pub fn transient(message: &str) -> Self {
        Self::fail(AdapterError::Transient(message.to_string()))
    }
}

/// One observed execution.
#[derive(Debug, Clone)]
pub struct Execution {
    pub job_id: JobId,
    pub account: AccountId,
    pub window: usize,
    pub session: u64,
    pub attempt: u32,
}

#[derive(Default)]
struct State {
    default_script: VecDeque<Step>,
    account_scripts: HashMap<AccountId, VecDeque<Step>>,
    init_failures: HashMap<AccountId, u32>,
    executions: Vec<Execution>,
    in_flight_accounts: HashMap<AccountId, usize>,
    in_flight_sessions: HashSet<u64>,
    violations: Vec<String>,
    next_session: u64,
    inits: u32,
    closes: u32,
}

/// Scripted backend.
#[derive(Clone, Default)]
pub struct ScriptedAdapter {
    state: Arc<Mutex<State>>,
    models: HashSet<String>,
}

/// Session state of the scripted backend.
pub struct ScriptedSession {
    pub account: AccountId,
    pub window: usize,
    /// Unique per launch; changes when a slot is recycled.
    pub serial: u64,
    responses: Arc<ResponseBus<JobId>>,
}

impl ScriptedAdapter {
    /// Create a backend whose every job succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict the accepted models.
    #[must_use]
    pub fn with_models<I>(mut self, models: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.models = models.into_iter().map(Into::into).collect();
        self
    }

    /// Append steps consumed by any account without its own script.
    pub fn push_steps(&self, steps: impl IntoIterator<Item = Step>) {
        self.state.lock().default_script.extend(steps);
    }

    /// Append steps consumed by `account` only.
    pub fn push_account_steps(&self, account: &str, steps: impl IntoIterator<Item = Step>) {
        self.state
            .lock()
            .account_scripts
            .entry(account.to_string())
            .or_default()
            .extend(steps);
    }

    /// Make the next `count` launches for `account` fail fatally.
    pub fn fail_inits(&self, account: &str, count: u32) {
        *self
            .state
            .lock()
            .init_failures
            .entry(account.to_string())
            .or_default() += count;
    }

    /// Executions observed so far, in start order.
    #[must_use]
    pub fn executions(&self) -> Vec<Execution> {
        self.state.lock().executions.clone()
    }

    /// Exclusivity violations observed so far.
    #[must_use]
    pub fn violations(&self) -> Vec<String> {
        self.state.lock().violations.clone()
    }

    /// Number of successful `init_session` calls.
    #[must_use]
    pub fn inits(&self) -> u32 {
        self.state.lock().inits
    }

    /// Number of `close_session` calls.
    #[must_use]
    pub fn closes(&self) -> u32 {
        self.state.lock().closes
    }

    fn begin(&self, session: &ScriptedSession, job: &JobContext) -> Step {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        if !state.in_flight_sessions.insert(session.serial) {
            state
                .violations
                .push(format!("session {} ran two jobs at once", session.serial));
        }
        let running = state
            .in_flight_accounts
            .entry(session.account.clone())
            .or_default();
        *running += 1;
        if *running > Account::CONCURRENCY {
            let msg = format!("account {} ran {} jobs at once", session.account, *running);
            state.violations.push(msg);
        }

        state.executions.push(Execution {
            job_id: job.job_id,
            account: session.account.clone(),
            window: session.window,
            session: session.serial,
            attempt: job.attempt,
        });

        let step = state
            .account_scripts
            .get_mut(&session.account)
            .and_then(VecDeque::pop_front);
        step.or_else(|| state.default_script.pop_front())
            .unwrap_or_else(Step::ok)
    }

    fn finish(&self, session: &ScriptedSession) {
        let mut state = self.state.lock();
        state.in_flight_sessions.remove(&session.serial);
        if let Some(running) = state.in_flight_accounts.get_mut(&session.account) {
            *running = running.saturating_sub(1);
        }
    }
}

/// Marks the execution finished on every exit path.
struct InFlight<'a> {
    adapter: &'a ScriptedAdapter,
    session: &'a ScriptedSession,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.adapter.finish(self.session);
    }
}

#[async_trait]
impl Adapter for ScriptedAdapter {
    type Session = ScriptedSession;

    fn name(&self) -> &str {
        "scripted"
    }

    fn supported_models(&self) -> HashSet<String> {
        self.models.clone()
    }

    async fn init_session(
        &self,
        account: &Account,
        config: &LaunchConfig,
    ) -> Result<ScriptedSession, AdapterError> {
        let mut state = self.state.lock();
        if let Some(left) = state.init_failures.get_mut(&account.id) {
            if *left > 0 {
                *left -= 1;
                return Err(AdapterError::Fatal(format!(
                    "account {} surface never became ready",
                    account.id
                )));
            }
        }
        state.inits += 1;
        state.next_session += 1;
        Ok(ScriptedSession {
            account: account.id.clone(),
            window: config.window,
            serial: state.next_session,
            responses: ResponseBus::new(),
        })
    }

    async fn execute_job(
        &self,
        session: &mut ScriptedSession,
        job: &JobContext,
        timeout: Duration,
        progress: &JobProgress,
    ) -> Result<Artifact, AdapterError> {
        let step = self.begin(session, job);
        let _in_flight = InFlight {
            adapter: self,
            session: &*session,
        };

        let job_id = job.job_id;
        let watcher = session.responses.watch(move |id: &JobId| *id == job_id);
        progress.awaiting_upstream();

        match step {
            Step::Succeed { delay } => {
                tokio::time::sleep(delay).await;
                session.responses.publish(&job_id);
            }
            Step::Fail { delay, error } => {
                tokio::time::sleep(delay).await;
                return Err(error);
            }
            Step::Hang => {}
        }

        watcher.wait(timeout).await?;
        progress.extracting();
        Ok(Artifact::text(format!(
            "{}#{} {}",
            session.account,
            session.window,
            job.prompt.as_deref().unwrap_or_default()
        )))
    }

    async fn close_session(&self, session: ScriptedSession) {
        tracing::debug!(account = %session.account, serial = session.serial, "Closing scripted session");
        self.state.lock().closes += 1;
    }
}

#[cfg(test)]
mod tests {
    use slotpool_core::{NoopPhaseSink, PhaseSink};
    use uuid::Uuid;

    use super::*;

    fn context() -> JobContext {
        JobContext {
            job_id: Uuid::new_v4(),
            prompt: Some("p".into()),
            images: Vec::new(),
            model: None,
            attempt: 1,
        }
    }

    fn progress(job: &JobContext) -> JobProgress {
        JobProgress::new(job.job_id, Arc::new(NoopPhaseSink) as Arc<dyn PhaseSink>)
    }

    #[tokio::test]
    async fn test_account_script_wins_over_default() {
        let adapter = ScriptedAdapter::new();
        adapter.push_steps([Step::transient("default")]);
        adapter.push_account_steps("alpha", [Step::ok()]);

        let mut alpha = adapter
            .init_session(&Account::new("alpha", "/a"), &LaunchConfig::default())
            .await
            .unwrap();
        let mut beta = adapter
            .init_session(&Account::new("beta", "/b"), &LaunchConfig::default())
            .await
            .unwrap();

        let job = context();
        let ok = adapter
            .execute_job(&mut alpha, &job, Duration::from_secs(1), &progress(&job))
            .await;
        assert!(ok.is_ok());

        let job = context();
        let err = adapter
            .execute_job(&mut beta, &job, Duration::from_secs(1), &progress(&job))
            .await
            .unwrap_err();
        assert_eq!(err, AdapterError::Transient("default".into()));

        assert_eq!(adapter.executions().len(), 2);
        assert!(adapter.violations().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hang_times_out() {
        let adapter = ScriptedAdapter::new();
        adapter.push_steps([Step::Hang]);
        let mut session = adapter
            .init_session(&Account::new("alpha", "/a"), &LaunchConfig::default())
            .await
            .unwrap();

        let job = context();
        let err = adapter
            .execute_job(&mut session, &job, Duration::from_secs(120), &progress(&job))
            .await
            .unwrap_err();
        assert_eq!(err, AdapterError::TimedOut(Duration::from_secs(120)));
    }

    #[tokio::test]
    async fn test_init_failures() {
        let adapter = ScriptedAdapter::new();
        adapter.fail_inits("alpha", 1);
        let account = Account::new("alpha", "/a");

        let first = adapter.init_session(&account, &LaunchConfig::default()).await;
        assert!(matches!(first, Err(AdapterError::Fatal(_))));
        let second = adapter.init_session(&account, &LaunchConfig::default()).await;
        assert_eq!(second.unwrap().serial, 1);
        assert_eq!(adapter.inits(), 1);
    }
}
