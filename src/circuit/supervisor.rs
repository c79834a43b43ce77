//! Supervision: abort, shutdown and watched services.
//!
//! Services are cooperative: each receives a `CancellationToken` and is
//! expected to return once the token is cancelled. The watchdog around a
//! service classifies its termination:
//!
//! | How it ended                 | Before shutdown       | After shutdown |
//! |------------------------------|-----------------------|----------------|
//! | returned `Ok`, not cancelled | `ServiceTerminated`   | normal         |
//! | returned `Ok`, cancelled     | `ServiceCancelled`    | normal         |
//! | returned `Err`               | recorded              | recorded       |
//!
//! Every recorded error goes through [`Circuit::abort`].

use std::future::Future;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::error::{CircuitError, CircuitResult, ErrorKind};

use super::{lock, Circuit, CircuitPhase};

pub(crate) type ServiceFuture = BoxFuture<'static, CircuitResult<()>>;

pub(crate) struct ServiceEntry {
    pub(crate) name: String,
    pub(crate) token: CancellationToken,
    pub(crate) task: JoinHandle<()>,
    pub(crate) auto_cancel: bool,
}

/// Handle to a supervised service.
#[derive(Debug)]
pub struct ServiceHandle {
    name: String,
    token: CancellationToken,
    abort: AbortHandle,
}

impl ServiceHandle {
    /// Returns the service name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Requests cancellation. Before shutdown this is treated as a failure.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Returns true once the service task has ended.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.abort.is_finished()
    }
}

/// Outcome of a [`shield`]ed section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shielded<T> {
    /// No cancellation arrived during the section.
    Completed(T),
    /// A cancellation arrived and was deferred; the caller should stop now.
    Deferred(T),
}

impl<T> Shielded<T> {
    /// Returns true if a cancellation was deferred.
    #[must_use]
    pub const fn was_cancelled(&self) -> bool {
        matches!(self, Self::Deferred(_))
    }

    /// Returns the section's output.
    pub fn into_inner(self) -> T {
        match self {
            Self::Completed(v) | Self::Deferred(v) => v,
        }
    }
}

/// Runs `fut` to completion regardless of `token`, then reports whether a
/// cancellation arrived meanwhile.
///
/// The token stays cancelled, so the cancellation is delivered again at the
/// caller's next check.
pub async fn shield<F: Future>(token: &CancellationToken, fut: F) -> Shielded<F::Output> {
    let out = fut.await;
    if token.is_cancelled() {
        tracing::debug!("cancellation deferred until the end of a shielded section");
        Shielded::Deferred(out)
    } else {
        Shielded::Completed(out)
    }
}

impl Circuit {
    /// Records `err` and requests shutdown.
    ///
    /// An error already recorded is ignored. During shutdown the error is
    /// only recorded and logged.
    pub fn abort(&self, err: CircuitError) {
        let message = err.to_string();
        if !self.record_error(err) {
            return;
        }
        if self.is_shut_down() {
            tracing::error!(error = %message, "unhandled error during shutdown");
        } else {
            tracing::warn!(error = %message, "aborting due to an error");
            self.shutdown();
        }
    }

    /// Stops the runner if it was started, or prevents it from starting.
    ///
    /// Idempotent.
    pub fn shutdown(&self) {
        if self.is_shut_down() {
            return;
        }
        if self.phase() == CircuitPhase::UnderConstruction {
            self.set_phase(CircuitPhase::Closed);
            return;
        }
        self.set_phase(CircuitPhase::ShuttingDown);
    }

    /// Spawns a supervised service.
    ///
    /// `service` receives a cancellation token and must return once it is
    /// cancelled. Unless `immediate_start` is set, the service starts only
    /// when the circuit reaches `Running`, and never starts if shutdown
    /// comes first. `auto_cancel` services are cancelled early in the
    /// shutdown; the others when the circuit closes.
    ///
    /// # Errors
    /// - `CircuitShutDown` after shutdown
    /// - `Internal` outside a tokio runtime
    pub fn create_service<F, Fut>(
        &self,
        name: impl Into<String>,
        service: F,
        immediate_start: bool,
        auto_cancel: bool,
    ) -> CircuitResult<ServiceHandle>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = CircuitResult<()>> + Send + 'static,
    {
        let token = self.inner.root.child_token();
        let handle = self.spawn_watched(
            name.into(),
            token,
            Box::new(move |t| service(t).boxed()),
            immediate_start,
            auto_cancel,
        )?;
        Ok(handle)
    }

    pub(crate) fn spawn_watched(
        &self,
        name: String,
        token: CancellationToken,
        service: Box<dyn FnOnce(CancellationToken) -> ServiceFuture + Send>,
        immediate_start: bool,
        auto_cancel: bool,
    ) -> CircuitResult<ServiceHandle> {
        if self.is_shut_down() {
            return Err(CircuitError::new(ErrorKind::CircuitShutDown)
                .with_context(format!("cannot create service '{name}' after shutdown")));
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| CircuitError::internal("services require a tokio runtime"))?;

        let watchdog = self
            .clone()
            .watchdog(name.clone(), token.clone(), service, immediate_start);
        let task = runtime.spawn(watchdog);
        let abort = task.abort_handle();
        lock(&self.inner.services).push(ServiceEntry {
            name: name.clone(),
            token: token.clone(),
            task,
            auto_cancel,
        });
        Ok(ServiceHandle { name, token, abort })
    }

    async fn watchdog(
        self,
        name: String,
        token: CancellationToken,
        service: Box<dyn FnOnce(CancellationToken) -> ServiceFuture + Send>,
        immediate_start: bool,
    ) {
        if !immediate_start {
            tracing::debug!(service = %name, "waiting for the running phase");
            let started = tokio::select! {
                reached = self.wait_for(CircuitPhase::Running) => reached,
                () = token.cancelled() => false,
            };
            if !started {
                // a consequence of an earlier failure, not an error
                tracing::debug!(service = %name, "not started");
                return;
            }
        }
        tracing::debug!(service = %name, "started");

        let result = service(token.clone()).await;
        let shut_down = self.is_shut_down();
        let failure = match result {
            Err(err) => Some(err.with_context(format!("Error occurred in service '{name}'"))),
            Ok(()) if shut_down => {
                tracing::debug!(service = %name, cancelled = token.is_cancelled(), "terminated");
                None
            }
            Ok(()) if token.is_cancelled() => Some(CircuitError::new(ErrorKind::ServiceCancelled {
                service: format!("Service '{name}'"),
            })),
            Ok(()) => Some(CircuitError::new(ErrorKind::ServiceTerminated {
                service: format!("Service '{name}'"),
            })),
        };
        if let Some(err) = failure {
            self.abort(err);
        }
    }

    /// Cancels the auto-cancel services; returns how many were still running.
    pub(crate) fn cancel_auto_services(&self) -> usize {
        let services = lock(&self.inner.services);
        let mut running = 0;
        for entry in services.iter().filter(|s| s.auto_cancel) {
            if !entry.task.is_finished() {
                running += 1;
                entry.token.cancel();
            }
        }
        running
    }

    /// Warns about cancelled services that are still running.
    pub(crate) fn report_lingering_services(&self) {
        let services = lock(&self.inner.services);
        for entry in services.iter().filter(|s| s.auto_cancel) {
            if !entry.task.is_finished() {
                tracing::warn!(service = %entry.name, "cancelled service did not terminate yet");
            }
        }
    }

    /// Cancels everything still running once the circuit is closed and
    /// waits until every service task is gone.
    pub(crate) async fn close_services(&self) {
        self.inner.root.cancel();
        let services = std::mem::take(&mut *lock(&self.inner.services));
        if services.is_empty() {
            return;
        }
        tokio::task::yield_now().await;
        for entry in services {
            if !entry.task.is_finished() {
                tracing::debug!(service = %entry.name, "service still running at close, aborting");
                entry.task.abort();
            }
            // the service either ended or was aborted, its outcome is already recorded
            let _ = entry.task.await;
        }
    }
}
