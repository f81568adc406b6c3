//! A backend that answers every prompt with a text artifact.
//!
//! The remote side is simulated by a task that publishes a completion on
//! the session's response feed after a fixed latency; extraction goes
//! through a scoped watcher exactly as a browser-backed adapter would.

use std::{collections::HashSet, sync::Arc, time::Duration};

use async_trait::async_trait;
use slotpool_core::{
    Account, AccountId, Adapter, AdapterError, Artifact, JobContext, JobId, JobProgress,
    LaunchConfig, ResponseBus,
};

use crate::readiness::wait_until_ready;

/// A completion observed on the simulated network feed.
#[derive(Debug, Clone)]
pub struct Completion {
    pub job_id: JobId,
    pub text: String,
}

/// Echo backend.
pub struct EchoAdapter {
    latency: Duration,
    models: HashSet<String>,
}

/// Session state of the echo backend.
pub struct EchoSession {
    pub account: AccountId,
    pub window: usize,
    /// Jobs completed on this session since launch.
    pub turns: u32,
    responses: Arc<ResponseBus<Completion>>,
}

impl EchoAdapter {
    /// Create an echo backend that answers after `latency`.
    #[must_use]
    pub fn new(latency: Duration) -> Self {
        Self {
            latency,
            models: HashSet::new(),
        }
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
}

impl Default for EchoAdapter {
    fn default() -> Self {
        Self::new(Duration::from_millis(250))
    }
}

#[async_trait]
impl Adapter for EchoAdapter {
    type Session = EchoSession;

    fn name(&self) -> &str {
        "echo"
    }

    fn supported_models(&self) -> HashSet<String> {
        self.models.clone()
    }

    async fn init_session(
        &self,
        account: &Account,
        config: &LaunchConfig,
    ) -> Result<EchoSession, AdapterError> {
        wait_until_ready(
            config.init_attempts,
            Duration::from_millis(config.init_retry_interval_ms),
            |_| async { Ok(true) },
        )
        .await?;

        tracing::info!(
            account = %account.id,
            window = config.window,
            proxy = ?config.proxy_endpoint,
            "Echo session ready"
        );

        Ok(EchoSession {
            account: account.id.clone(),
            window: config.window,
            turns: 0,
            responses: ResponseBus::new(),
        })
    }

    async fn execute_job(
        &self,
        session: &mut EchoSession,
        job: &JobContext,
        timeout: Duration,
        progress: &JobProgress,
    ) -> Result<Artifact, AdapterError> {
        let job_id = job.job_id;
        let watcher = session.responses.watch(move |c: &Completion| c.job_id == job_id);

        let text = match (&job.model, &job.prompt) {
            (Some(model), Some(prompt)) => format!("[{model}] {prompt}"),
            (None, Some(prompt)) => prompt.clone(),
            (_, None) => format!("{} reference image(s) received", job.images.len()),
        };

        let responses = Arc::clone(&session.responses);
        let latency = self.latency;
        tokio::spawn(async move {
            tokio::time::sleep(latency).await;
            responses.publish(&Completion { job_id, text });
        });
        progress.awaiting_upstream();

        let completion = watcher.wait(timeout).await?;
        progress.extracting();

        session.turns += 1;
        Ok(Artifact::text(completion.text))
    }
}

#[cfg(test)]
mod tests {
    use slotpool_core::{NoopPhaseSink, PhaseSink};
    use uuid::Uuid;

    use super::*;

    fn context(prompt: &str) -> JobContext {
        JobContext {
            job_id: Uuid::new_v4(),
            prompt: Some(prompt.to_string()),
            images: Vec::new(),
            model: Some("echo-1".to_string()),
            attempt: 1,
        }
    }

    fn launch() -> LaunchConfig {
        LaunchConfig {
            init_attempts: 1,
            ..LaunchConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_echoes_prompt() {
        let adapter = EchoAdapter::default();
        let mut session = adapter
            .init_session(&Account::new("alpha", "/tmp/alpha"), &launch())
            .await
            .unwrap();
        let job = context("a lighthouse at dusk");
        let progress = JobProgress::new(job.job_id, Arc::new(NoopPhaseSink) as Arc<dyn PhaseSink>);

        let artifact = adapter
            .execute_job(&mut session, &job, Duration::from_secs(5), &progress)
            .await
            .unwrap();

        assert_eq!(artifact, Artifact::text("[echo-1] a lighthouse at dusk"));
        assert_eq!(session.turns, 1);
        assert_eq!(session.responses.listener_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_surface_times_out() {
        let adapter = EchoAdapter::new(Duration::from_secs(300));
        let mut session = adapter
            .init_session(&Account::new("alpha", "/tmp/alpha"), &launch())
            .await
            .unwrap();
        let job = context("too slow");
        let progress = JobProgress::new(job.job_id, Arc::new(NoopPhaseSink) as Arc<dyn PhaseSink>);

        let err = adapter
            .execute_job(&mut session, &job, Duration::from_secs(120), &progress)
            .await
            .unwrap_err();

        assert_eq!(err, AdapterError::TimedOut(Duration::from_secs(120)));
        assert_eq!(session.responses.listener_count(), 0);
    }
}
