//! Reconciliation scheduler.
//!
//! Drives provider calls level by level. Within a level every ready
//! resource is dispatched concurrently (bounded by a semaphore); the next
//! level starts only after the current one has fully settled. Only the
//! coordinating task touches the graph and the state store, and the store
//! is saved after every transition so an interrupted run resumes cleanly.

use super::config::EngineConfig;
use super::error::{EngineError, FailureCause, GraphError, ProviderError, StateError};
use super::planner;
use super::resolver;
use super::state::StateStore;
use super::types::*;
use crate::providers::{Provider, ProviderRegistry};
use crate::tripwire::eventlog::{self, Journal};
use rustc_hash::FxHashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// One provider call handed to a task.
struct Job {
    reference: ResourceRef,
    resource: Resource,
    provider: Arc<dyn Provider>,
}

struct Completion {
    reference: ResourceRef,
    result: Result<(), ProviderError>,
    elapsed: Duration,
}

/// Schedules create and destroy calls over a resource graph.
#[derive(Debug)]
pub struct Scheduler {
    registry: Arc<ProviderRegistry>,
    permits: Arc<Semaphore>,
    journal: Journal,
    cancel: CancellationToken,
}

impl Scheduler {
    pub fn new(config: &EngineConfig, registry: Arc<ProviderRegistry>) -> Self {
        let journal = if config.journal {
            Journal::new(Some(config.journal_file()))
        } else {
            Journal::disabled()
        };
        Self {
            registry,
            permits: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
            journal,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Reconcile `desired` against the store: tear down what is gone or
    /// changed (reverse previous order), then create what is new or changed
    /// (ascending levels).
    ///
    /// Provider failures are contained: the returned report carries them.
    /// Errors are reserved for unsupported types and state persistence.
    pub async fn apply(
        &self,
        desired: &mut ResourceGraph,
        store: &mut StateStore,
    ) -> Result<RunReport, EngineError> {
        let started = Instant::now();
        let mut report = RunReport::new(eventlog::generate_run_id());
        let previous = store.graph();
        let diff = planner::diff(desired, store.snapshot());

        let mut teardown: FxHashSet<ResourceRef> = diff.to_destroy.iter().cloned().collect();
        teardown.extend(diff.to_update.iter().cloned());

        resolver::ensure_supported(desired.resources(), &self.registry)?;
        resolver::ensure_supported(
            previous.resources().filter(|r| teardown.contains(&r.reference())),
            &self.registry,
        )?;

        self.begin(&report, Operation::Apply);
        tracing::info!(
            run_id = %report.run_id,
            create = diff.to_create.len(),
            update = diff.to_update.len(),
            destroy = diff.to_destroy.len(),
            unchanged = diff.unchanged.len(),
            "apply started"
        );

        let mut blocked = FxHashSet::default();
        self.teardown(&previous, &teardown, store, &mut report, &mut blocked)
            .await?;

        report.unchanged = u32::try_from(diff.unchanged.len()).unwrap_or(u32::MAX);
        if !report.interrupted {
            let mut creates: FxHashSet<ResourceRef> = diff.to_create.iter().cloned().collect();
            creates.extend(diff.to_update.iter().cloned());
            self.settle_untouched(desired, &diff.unchanged, &blocked, store)?;
            self.create(desired, &creates, &blocked, store, &mut report)
                .await?;
        }

        self.finish(&mut report, started);
        Ok(report)
    }

    /// Tear down every recorded resource in reverse dependency order.
    ///
    /// Best-effort: a failed removal keeps its record and the records of
    /// everything it depends on, while independent branches proceed.
    pub async fn destroy(&self, store: &mut StateStore) -> Result<RunReport, EngineError> {
        let started = Instant::now();
        let mut report = RunReport::new(eventlog::generate_run_id());
        let previous = store.graph();
        resolver::ensure_supported(previous.resources(), &self.registry)?;

        self.begin(&report, Operation::Destroy);
        tracing::info!(run_id = %report.run_id, resources = previous.len(), "destroy started");

        let everything: FxHashSet<ResourceRef> = previous.order().into_iter().collect();
        let mut blocked = FxHashSet::default();
        self.teardown(&previous, &everything, store, &mut report, &mut blocked)
            .await?;

        self.finish(&mut report, started);
        Ok(report)
    }

    fn begin(&self, report: &RunReport, operation: Operation) {
        self.journal.record(RunEvent::RunStarted {
            run_id: report.run_id.clone(),
            operation,
            drydock_version: env!("CARGO_PKG_VERSION").to_string(),
        });
    }

    fn finish(&self, report: &mut RunReport, started: Instant) {
        report.total_duration = started.elapsed();
        self.journal.record(RunEvent::RunCompleted {
            run_id: report.run_id.clone(),
            created: report.created(),
            destroyed: report.destroyed(),
            failed: report.failed(),
            interrupted: report.interrupted,
            total_seconds: report.total_duration.as_secs_f64(),
        });
        if report.is_success() {
            tracing::info!(
                run_id = %report.run_id,
                created = report.created(),
                destroyed = report.destroyed(),
                unchanged = report.unchanged,
                "run completed"
            );
        } else {
            tracing::warn!(
                run_id = %report.run_id,
                failed = report.failed(),
                interrupted = report.interrupted,
                "run completed with failures"
            );
        }
    }

    fn cancelled(&self, report: &mut RunReport) -> bool {
        if self.cancel.is_cancelled() {
            tracing::warn!(run_id = %report.run_id, "interrupted, no further levels will start");
            report.interrupted = true;
        }
        report.interrupted
    }

    /// Destroy `targets` from `previous`, highest level first. References
    /// whose removal failed or was skipped are added to `blocked`.
    async fn teardown(
        &self,
        previous: &ResourceGraph,
        targets: &FxHashSet<ResourceRef>,
        store: &mut StateStore,
        report: &mut RunReport,
        blocked: &mut FxHashSet<ResourceRef>,
    ) -> Result<(), EngineError> {
        for level in previous.levels().iter().rev() {
            if !level.iter().any(|id| targets.contains(id)) {
                continue;
            }
            if self.cancelled(report) {
                return Ok(());
            }

            let mut jobs = Vec::new();
            for id in level.iter().filter(|id| targets.contains(*id)) {
                let Some(resource) = previous.get(id) else {
                    continue;
                };
                if resource.disabled {
                    tracing::debug!(resource = %id, "forgetting disabled record");
                    store.forget(id);
                    continue;
                }
                // A dependent that could not be removed still needs this one.
                if let Some(dependent) = previous
                    .dependents(id)
                    .into_iter()
                    .find(|d| blocked.contains(d))
                {
                    self.skip(report, id, Operation::Destroy, &dependent);
                    blocked.insert(id.clone());
                    continue;
                }
                let provider = self.provider_for(resource)?;
                store.set_status(id, ResourceStatus::PendingDestroy);
                self.started(id, Operation::Destroy);
                let mut resource = resource.clone();
                resource.status = ResourceStatus::PendingDestroy;
                jobs.push(Job {
                    reference: id.clone(),
                    resource,
                    provider,
                });
            }
            store.save()?;

            for done in self.dispatch(jobs, Operation::Destroy).await {
                match done.result {
                    Ok(()) => {
                        store.forget(&done.reference);
                        tracing::info!(
                            resource = %done.reference,
                            seconds = done.elapsed.as_secs_f64(),
                            "destroyed"
                        );
                        self.journal.record(RunEvent::ResourceDestroyed {
                            resource: done.reference.to_string(),
                            duration_seconds: done.elapsed.as_secs_f64(),
                        });
                        report.outcomes.push(ResourceOutcome {
                            reference: done.reference,
                            operation: Operation::Destroy,
                            status: ResourceStatus::Destroyed,
                            failure: None,
                        });
                    }
                    Err(e) => {
                        store.set_status(&done.reference, ResourceStatus::Failed);
                        blocked.insert(done.reference.clone());
                        self.fail(report, done.reference, Operation::Destroy, e);
                    }
                }
                store.save()?;
            }
        }
        Ok(())
    }

    /// Record disabled resources and mark unchanged ones as converged so
    /// their dependents can start.
    fn settle_untouched(
        &self,
        desired: &mut ResourceGraph,
        unchanged: &[ResourceRef],
        blocked: &FxHashSet<ResourceRef>,
        store: &mut StateStore,
    ) -> Result<(), StateError> {
        let mut dirty = false;
        let disabled: Vec<ResourceRef> = desired
            .resources()
            .filter(|r| r.disabled)
            .map(Resource::reference)
            .collect();
        for id in disabled {
            // Still exists if its teardown failed; keep that record.
            if blocked.contains(&id) {
                continue;
            }
            let recorded = store.get(&id).is_some_and(|r| r.disabled);
            if let (false, Some(resource)) = (recorded, desired.get(&id)) {
                store.record(resource, desired.dependencies(&id));
                dirty = true;
            }
        }
        for id in unchanged {
            if desired.get(id).is_some_and(|r| !r.disabled) {
                desired.set_status(id, ResourceStatus::Created);
            }
        }
        if dirty {
            store.save()?;
        }
        Ok(())
    }

    /// Create `targets`, lowest level first. A resource whose dependency
    /// did not converge is failed without a provider call.
    async fn create(
        &self,
        desired: &mut ResourceGraph,
        targets: &FxHashSet<ResourceRef>,
        blocked: &FxHashSet<ResourceRef>,
        store: &mut StateStore,
        report: &mut RunReport,
    ) -> Result<(), EngineError> {
        let levels = desired.levels().to_vec();
        for level in &levels {
            if !level.iter().any(|id| targets.contains(id)) {
                continue;
            }
            if self.cancelled(report) {
                return Ok(());
            }

            let mut jobs = Vec::new();
            for id in level.iter().filter(|id| targets.contains(*id)) {
                if blocked.contains(id) {
                    // Teardown failed and was already reported.
                    desired.set_status(id, ResourceStatus::Failed);
                    continue;
                }
                let unsatisfied = desired
                    .dependencies(id)
                    .iter()
                    .find(|dep| {
                        !desired
                            .get(dep)
                            .is_some_and(|r| r.status.satisfies_dependents())
                    })
                    .cloned();
                if let Some(dependency) = unsatisfied {
                    desired.set_status(id, ResourceStatus::Failed);
                    self.skip(report, id, Operation::Create, &dependency);
                    continue;
                }

                desired.set_status(id, ResourceStatus::PendingCreation);
                let Some(resource) = desired.get(id).cloned() else {
                    continue;
                };
                let provider = self.provider_for(&resource)?;
                store.record(&resource, desired.dependencies(id));
                self.started(id, Operation::Create);
                jobs.push(Job {
                    reference: id.clone(),
                    resource,
                    provider,
                });
            }
            store.save()?;

            for done in self.dispatch(jobs, Operation::Create).await {
                match done.result {
                    Ok(()) => {
                        desired.set_status(&done.reference, ResourceStatus::Created);
                        let handle = done.reference.handle();
                        tracing::info!(
                            resource = %done.reference,
                            handle = %handle,
                            seconds = done.elapsed.as_secs_f64(),
                            "created"
                        );
                        self.journal.record(RunEvent::ResourceCreated {
                            resource: done.reference.to_string(),
                            handle,
                            duration_seconds: done.elapsed.as_secs_f64(),
                        });
                        report.outcomes.push(ResourceOutcome {
                            reference: done.reference.clone(),
                            operation: Operation::Create,
                            status: ResourceStatus::Created,
                            failure: None,
                        });
                    }
                    Err(e) => {
                        desired.set_status(&done.reference, ResourceStatus::Failed);
                        self.fail(report, done.reference.clone(), Operation::Create, e);
                    }
                }
                if let Some(resource) = desired.get(&done.reference) {
                    store.record(resource, desired.dependencies(&done.reference));
                }
                store.save()?;
            }
        }
        Ok(())
    }

    fn provider_for(&self, resource: &Resource) -> Result<Arc<dyn Provider>, GraphError> {
        self.registry.get(resource)
    }

    fn started(&self, id: &ResourceRef, operation: Operation) {
        tracing::debug!(resource = %id, %operation, "dispatching");
        self.journal.record(RunEvent::ResourceStarted {
            resource: id.to_string(),
            operation,
        });
    }

    fn skip(
        &self,
        report: &mut RunReport,
        id: &ResourceRef,
        operation: Operation,
        dependency: &ResourceRef,
    ) {
        tracing::warn!(resource = %id, dependency = %dependency, "skipped, dependency did not converge");
        self.journal.record(RunEvent::ResourceSkipped {
            resource: id.to_string(),
            dependency: dependency.to_string(),
        });
        report.outcomes.push(ResourceOutcome {
            reference: id.clone(),
            operation,
            status: ResourceStatus::Failed,
            failure: Some(FailureCause::SkippedDueToDependency {
                dependency: dependency.to_string(),
            }),
        });
    }

    fn fail(
        &self,
        report: &mut RunReport,
        id: ResourceRef,
        operation: Operation,
        error: ProviderError,
    ) {
        tracing::warn!(resource = %id, %operation, error = %error, "provider call failed");
        self.journal.record(RunEvent::ResourceFailed {
            resource: id.to_string(),
            operation,
            error: error.to_string(),
        });
        report.outcomes.push(ResourceOutcome {
            reference: id,
            operation,
            status: ResourceStatus::Failed,
            failure: Some(FailureCause::Provider(error)),
        });
    }

    /// Run one level's provider calls concurrently and wait for all of them.
    async fn dispatch(&self, jobs: Vec<Job>, operation: Operation) -> Vec<Completion> {
        let mut tasks = JoinSet::new();
        let mut pending: FxHashSet<ResourceRef> = FxHashSet::default();

        for job in jobs {
            pending.insert(job.reference.clone());
            let permits = Arc::clone(&self.permits);
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await;
                let started = Instant::now();
                let result = match operation {
                    Operation::Destroy => job.provider.destroy(&job.resource).await,
                    Operation::Create | Operation::Apply => {
                        job.provider.create(&job.resource).await
                    }
                };
                Completion {
                    reference: job.reference,
                    result: accept_idempotent(operation, result),
                    elapsed: started.elapsed(),
                }
            });
        }

        let mut completions = Vec::with_capacity(pending.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(done) => {
                    pending.remove(&done.reference);
                    completions.push(done);
                }
                Err(e) => tracing::error!(error = %e, "provider task aborted"),
            }
        }
        // Tasks that panicked never reported back.
        for reference in pending {
            completions.push(Completion {
                reference,
                result: Err(ProviderError::Failed("provider task aborted".to_string())),
                elapsed: Duration::ZERO,
            });
        }
        completions
    }
}

/// A create that finds the object already present, or a destroy that finds
/// it already gone, has reached the desired outcome.
fn accept_idempotent(
    operation: Operation,
    result: Result<(), ProviderError>,
) -> Result<(), ProviderError> {
    match (operation, result) {
        (Operation::Create, Err(ProviderError::AlreadyExists(id))) => {
            tracing::debug!(resource = %id, "already exists");
            Ok(())
        }
        (Operation::Destroy, Err(ProviderError::NotFound(id))) => {
            tracing::debug!(resource = %id, "already gone");
            Ok(())
        }
        (_, result) => result,
    }
}

/// Build the graph, reconcile it against the persisted state and fail if
/// any resource did not converge.
pub async fn apply(
    config: &EngineConfig,
    registry: Arc<ProviderRegistry>,
    declarations: &[Declaration],
    cancel: CancellationToken,
) -> Result<RunReport, EngineError> {
    config.validate()?;
    let mut desired = resolver::build_graph(declarations, &registry)?;
    let mut store = StateStore::open(config)?;
    let report = Scheduler::new(config, registry)
        .with_cancellation(cancel)
        .apply(&mut desired, &mut store)
        .await?;
    Ok(report.into_result()?)
}

/// Tear down everything recorded in the persisted state.
pub async fn destroy(
    config: &EngineConfig,
    registry: Arc<ProviderRegistry>,
    cancel: CancellationToken,
) -> Result<RunReport, EngineError> {
    config.validate()?;
    let mut store = StateStore::open(config)?;
    let report = Scheduler::new(config, registry)
        .with_cancellation(cancel)
        .destroy(&mut store)
        .await?;
    Ok(report.into_result()?)
}

/// Cancel `token` on Ctrl-C. The listener exits once the token is cancelled
/// by anyone.
pub fn cancel_on_interrupt(token: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => match signal {
                Ok(()) => {
                    tracing::warn!("interrupt received, letting in-flight calls finish");
                    token.cancel();
                }
                Err(e) => tracing::warn!(error = %e, "cannot listen for interrupts"),
            },
            _ = token.cancelled() => {}
        }
    })
}
