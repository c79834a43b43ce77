//! The circuit runner: initialization, the running phase and shutdown.

use std::collections::HashSet;
use std::future::Future;

use chrono::Utc;
use futures::future::join_all;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::error::{AggregateError, CircuitError, CircuitResult, ErrorKind};
use crate::init;
use crate::unit::{Block, PersistenceMode};

use super::supervisor::{shield, ServiceFuture};
use super::{Circuit, CircuitPhase};

const CHECKPOINT_SERVICE: &str = "checkpoints";

/// A long-running job supervised together with the circuit.
///
/// Jobs start right away, run while the circuit runs and are cancelled as
/// soon as the shutdown begins. A job that ends earlier aborts the circuit.
pub struct Job {
    name: String,
    run: Box<dyn FnOnce(CancellationToken) -> ServiceFuture + Send>,
}

impl Job {
    /// Creates a job; `run` receives the token cancelled at shutdown.
    pub fn new<F, Fut>(name: impl Into<String>, run: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = CircuitResult<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            run: Box::new(move |token| run(token).boxed()),
        }
    }

    /// Returns the job name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job").field("name", &self.name).finish_non_exhaustive()
    }
}

impl Circuit {
    /// Runs the circuit until it is shut down, then cleans up.
    ///
    /// `jobs` run alongside the circuit under the same supervision.
    ///
    /// # Errors
    /// Every distinct error recorded during the circuit's life, including
    /// a refusal to run a circuit that is closed, started or empty.
    pub async fn run(&self, jobs: impl IntoIterator<Item = Job>) -> Result<(), AggregateError> {
        if let Err(err) = self.check_runnable() {
            return Err(AggregateError { errors: vec![err] });
        }
        tracing::debug!(circuit = ?self, "runner started");

        let jobs_token = self.inner.root.child_token();
        for job in jobs {
            let token = jobs_token.child_token();
            if let Err(err) = self.spawn_watched(job.name, token, job.run, true, false) {
                self.abort(err);
            }
        }

        if !self.is_shut_down() {
            if let Err(err) = self.check_persistent_storage() {
                self.abort(err);
            }
        }

        if !self.is_shut_down() {
            tokio::select! {
                result = self.init_sequence() => {
                    if let Err(err) = result {
                        self.abort(err);
                    }
                }
                _ = self.wait_for(CircuitPhase::ShuttingDown) => {
                    tracing::debug!("initialization interrupted");
                }
            }
        }

        self.wait_for(CircuitPhase::ShuttingDown).await;
        jobs_token.cancel();
        self.shutdown_sequence().await;

        self.set_phase(CircuitPhase::Closed);
        self.close_services().await;

        let errors = self.errors();
        if errors.is_empty() {
            tracing::debug!("runner finished");
            Ok(())
        } else {
            tracing::debug!(errors = errors.len(), "runner finished with errors");
            Err(AggregateError { errors })
        }
    }

    fn check_runnable(&self) -> CircuitResult<()> {
        let refuse = |reason: &str| {
            Err(CircuitError::new(ErrorKind::PhaseViolation {
                phase: self.phase().to_string(),
                reason: reason.to_string(),
            }))
        };
        if self.phase() == CircuitPhase::Closed {
            return refuse("the circuit was closed");
        }
        if !self.mark_started() {
            return refuse("the runner was already started");
        }
        if self.units().is_empty() {
            return refuse("the circuit is empty");
        }
        Ok(())
    }

    fn persisted_blocks(&self) -> Vec<Block> {
        self.blocks()
            .into_iter()
            .filter(|b| b.persistence().is_enabled())
            .collect()
    }

    /// Disables persistence without a store, otherwise drops stale keys and
    /// starts the interval checkpoints.
    fn check_persistent_storage(&self) -> CircuitResult<()> {
        let persisted = self.persisted_blocks();
        let Some(store) = self.storage() else {
            if !persisted.is_empty() {
                tracing::warn!("no persistent storage set; state persistence disabled");
                for block in &persisted {
                    block.disable_persistence();
                }
            }
            return Ok(());
        };

        let used: HashSet<&str> = persisted.iter().map(Block::key).collect();
        for key in store.keys()? {
            if !used.contains(key.as_str()) {
                tracing::debug!(key = %key, "removing unused persistent state");
                store.remove(&key)?;
            }
        }

        let interval_blocks: Vec<Block> = persisted
            .into_iter()
            .filter(|b| b.persistence() == PersistenceMode::Interval)
            .collect();
        if !interval_blocks.is_empty() {
            let circuit = self.clone();
            self.create_service(
                CHECKPOINT_SERVICE,
                move |token| circuit.checkpoint_service(token, interval_blocks),
                false,
                true,
            )?;
        }
        Ok(())
    }

    async fn checkpoint_service(
        self,
        token: CancellationToken,
        blocks: Vec<Block>,
    ) -> CircuitResult<()> {
        let interval = self.checkpoint_interval();
        tracing::debug!(?interval, blocks = blocks.len(), "interval checkpoints started");
        loop {
            tokio::select! {
                () = token.cancelled() => return Ok(()),
                () = tokio::time::sleep(interval) => {}
            }
            if self.phase() != CircuitPhase::Running {
                continue;
            }
            let saved = shield(&token, async {
                let now = Utc::now();
                for block in &blocks {
                    self.save_state(block, now);
                }
            })
            .await;
            if saved.was_cancelled() {
                return Ok(());
            }
        }
    }

    async fn init_sequence(&self) -> CircuitResult<()> {
        self.set_phase(CircuitPhase::InitCircuit);
        // let services created so far reach their first await
        tokio::task::yield_now().await;
        if self.is_shut_down() {
            return Ok(());
        }

        tracing::debug!("pre-initializing units");
        for block in self.blocks() {
            if let Err(err) = block.pre_init() {
                self.abort(err.with_context(format!("Pre-initialization of {block} failed")));
            }
        }
        for formula in self.formulas() {
            if let Err(err) = formula.pre_init(self) {
                self.abort(err.with_context(format!("Pre-initialization of {formula} failed")));
            }
        }
        for trigger in self.triggers() {
            if let Err(err) = trigger.pre_init(self) {
                self.abort(err.with_context(format!("Pre-initialization of {trigger} failed")));
            }
        }
        if self.is_shut_down() {
            return Ok(());
        }

        self.set_phase(CircuitPhase::InitUnits);
        // blocks registered during pre-init (e.g. `_phase`) are included
        init::init_blocks(&self.blocks()).await?;

        tracing::debug!("starting units");
        for formula in self.formulas() {
            formula
                .start()
                .map_err(|err| err.with_context(format!("Start of {formula} failed")))?;
        }
        for trigger in self.triggers() {
            trigger
                .start()
                .map_err(|err| err.with_context(format!("Start of {trigger} failed")))?;
        }
        for block in self.blocks() {
            block
                .start()
                .map_err(|err| err.with_context(format!("Start of {block} failed")))?;
        }

        let now = Utc::now();
        for block in self.blocks() {
            if block.persistence().has_checkpoints() {
                self.save_state(&block, now);
            }
        }

        self.set_phase(CircuitPhase::Running);
        Ok(())
    }

    async fn shutdown_sequence(&self) {
        tracing::debug!("shutdown sequence started");
        let blocks = self.blocks();

        let now = Utc::now();
        for block in blocks.iter().filter(|b| b.persistence().is_enabled()) {
            self.save_state(block, now);
        }

        for block in &blocks {
            if let Err(err) = block.stop() {
                self.abort(err.with_context(format!("Stop of {block} failed")));
            }
        }
        for trigger in self.triggers() {
            trigger.stop();
        }

        if self.cancel_auto_services() > 0 {
            tokio::task::yield_now().await;
            self.report_lingering_services();
        }

        let async_stops = blocks
            .iter()
            .filter(|b| b.has_async_stop())
            .map(|block| self.stop_async(block));
        join_all(async_stops).await;

        for block in &blocks {
            if let Err(err) = block.close() {
                self.abort(err.with_context(format!("Close of {block} failed")));
            }
        }
    }

    async fn stop_async(&self, block: &Block) {
        let deadline = block
            .stop_timeout()
            .unwrap_or(self.config().default_stop_timeout);
        match tokio::time::timeout(deadline, block.astop()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => self.abort(err.with_context(format!("Async stop of {block} failed"))),
            Err(_) => {
                tracing::warn!(unit = %block, timeout = ?deadline, "async stop timed out and was cancelled");
            }
        }
    }
}
