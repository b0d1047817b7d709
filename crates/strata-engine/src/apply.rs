use std::collections::{BTreeMap, HashMap};
use std::sync::mpsc;

use strata_domain::{
    ApplyReport, OperationOutcome, OperationResult, Outputs, PlanAction, PlanReport,
    PlannedOperation, ResourceName, ResourceState, StateSnapshot, TypeTag,
};
use tracing::{debug, info};

use crate::error::{ApplyError, ProviderError};
use crate::providers::{ControlPlane, ProviderRegistry, ResourceRequest};
use crate::resolve::resolve_properties;
use crate::retry::{Attempted, CancellationToken, RetryPolicy, RetryStop, with_retry};

pub const DEFAULT_JOBS: usize = 4;

#[derive(Debug, Clone)]
pub struct ApplyOptions {
    /// Maximum number of operations in flight.
    pub jobs: usize,
    pub retry: RetryPolicy,
    pub cancel: CancellationToken,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            jobs: DEFAULT_JOBS,
            retry: RetryPolicy::default(),
            cancel: CancellationToken::new(),
        }
    }
}

/// Progress callbacks, invoked on the scheduling thread.
pub trait ApplyObserver {
    fn on_operation_start(&self, _operation: &PlannedOperation) {}

    fn on_operation_complete(&self, _result: &OperationResult) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl ApplyObserver for NoopObserver {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Pending,
    Running,
    /// Replacement whose old instance is gone; the new one is not built yet.
    TornDown,
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

/// Which half of an operation a job performs. Only replacements are split.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Whole,
    Teardown,
    Rebuild,
}

#[derive(Debug)]
enum Effect {
    Applied(Outputs),
    Removed,
    TornDown,
    Failed { error: String, transient: bool },
    Cancelled,
}

#[derive(Debug)]
struct Completion {
    position: usize,
    attempts: u32,
    inputs: Outputs,
    effect: Effect,
}

/// Work handed to a pool thread: everything it needs, owned or borrowed
/// from outside the scope.
struct Job<'a> {
    position: usize,
    step: Step,
    operation: &'a PlannedOperation,
    request: Option<ResourceRequest>,
    current: Outputs,
    provider: &'a dyn ControlPlane,
    /// Provider owning the resource before a type-changing replacement.
    previous_provider: &'a dyn ControlPlane,
    previous_type: TypeTag,
}

struct Scheduler<'a> {
    plan: &'a PlanReport,
    prior: &'a StateSnapshot,
    providers: &'a ProviderRegistry,
    observer: &'a dyn ApplyObserver,
    cancel: &'a CancellationToken,
    positions: HashMap<usize, usize>,
    status: Vec<Status>,
    /// Old instance removed, by a delete or the first half of a replacement.
    torn_down: Vec<bool>,
    teardown_attempts: Vec<u32>,
    results: Vec<Option<OperationResult>>,
    errors: Vec<String>,
    snapshot: StateSnapshot,
    available: BTreeMap<ResourceName, Outputs>,
    running: usize,
}

/// Execute `plan` against the control planes, starting from `prior`.
///
/// Independent operations run concurrently on a pool of `options.jobs`
/// threads; an operation starts only once every operation it depends on has
/// succeeded. A replacement runs in two steps: its old instance is deleted
/// once the old instances of its former dependents are gone, and the new one
/// is created once its dependencies have succeeded. Failures skip their
/// dependents and leave unrelated branches running. Returns the report and the snapshot reflecting everything that
/// actually happened; the caller persists it.
///
/// # Errors
///
/// Returns an error only when the worker pool cannot be started. Operation
/// failures are reported in the [`ApplyReport`].
pub fn execute_plan(
    plan: &PlanReport,
    prior: &StateSnapshot,
    providers: &ProviderRegistry,
    options: &ApplyOptions,
    observer: &dyn ApplyObserver,
) -> Result<(ApplyReport, StateSnapshot), ApplyError> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(options.jobs.max(1))
        .thread_name(|index| format!("strata-apply-{index}"))
        .build()
        .map_err(|source| ApplyError::WorkerPool { source })?;

    let mut snapshot = prior.clone();
    snapshot.stack.clone_from(&plan.stack);

    let mut scheduler = Scheduler {
        plan,
        prior,
        providers,
        observer,
        cancel: &options.cancel,
        positions: plan
            .operations
            .iter()
            .enumerate()
            .map(|(position, op)| (op.id, position))
            .collect(),
        status: vec![Status::Pending; plan.operations.len()],
        torn_down: vec![false; plan.operations.len()],
        teardown_attempts: vec![0; plan.operations.len()],
        results: vec![None; plan.operations.len()],
        errors: Vec::new(),
        snapshot,
        available: BTreeMap::new(),
        running: 0,
    };

    let policy = options.retry;
    let cancel = &options.cancel;

    pool.in_place_scope(|scope| {
        let (sender, receiver) = mpsc::channel::<Completion>();

        loop {
            for job in scheduler.schedule_ready() {
                let sender = sender.clone();
                scope.spawn(move |_| {
                    let completion = run_job(&job, &policy, cancel);
                    let _ = sender.send(completion);
                });
            }

            if scheduler.running == 0 {
                break;
            }

            match receiver.recv() {
                Ok(completion) => scheduler.complete(completion),
                Err(_) => break,
            }
        }
    });
    scheduler.settle_stranded();

    let Scheduler {
        results,
        errors,
        snapshot,
        ..
    } = scheduler;

    let report = ApplyReport {
        plan: plan.clone(),
        results: results.into_iter().flatten().collect(),
        errors,
    };
    info!(
        operations = report.results.len(),
        failed = report.failed_count(),
        "apply finished"
    );
    Ok((report, snapshot))
}

/// Turn a report with failed, skipped or cancelled operations into an error.
///
/// # Errors
///
/// Returns [`ApplyError::Aborted`] with per-outcome counts.
pub fn ensure_applied(report: &ApplyReport) -> Result<(), ApplyError> {
    if !report.has_failures() {
        return Ok(());
    }
    let count = |predicate: fn(&OperationOutcome) -> bool| {
        report
            .results
            .iter()
            .filter(|result| predicate(&result.outcome))
            .count()
    };
    Err(ApplyError::Aborted {
        failed: count(|outcome| matches!(outcome, OperationOutcome::Failed { .. })),
        skipped: count(|outcome| matches!(outcome, OperationOutcome::Skipped { .. })),
        cancelled: count(|outcome| matches!(outcome, OperationOutcome::Cancelled)),
        errors: report.errors.len(),
    })
}

impl<'a> Scheduler<'a> {
    /// Settle every pending operation that can be decided now and return
    /// the ones that need a provider call.
    fn schedule_ready(&mut self) -> Vec<Job<'a>> {
        let plan: &'a PlanReport = self.plan;
        let mut jobs = Vec::new();
        let mut progressed = true;

        while progressed {
            progressed = false;
            for (position, operation) in plan.operations.iter().enumerate() {
                let status = self.status[position];
                if !matches!(status, Status::Pending | Status::TornDown) {
                    continue;
                }

                if self.cancel.is_cancelled() {
                    self.finish(position, OperationOutcome::Cancelled, 0, Status::Cancelled);
                    progressed = true;
                    continue;
                }

                let step = match (operation.action, status) {
                    (PlanAction::Replace, Status::Pending) => Step::Teardown,
                    (PlanAction::Replace, _) => Step::Rebuild,
                    _ => Step::Whole,
                };

                match self.blocking_dependency(operation, step) {
                    Some(Blocked::Waiting) => continue,
                    Some(Blocked::Broken(reason)) => {
                        self.finish(
                            position,
                            OperationOutcome::Skipped { reason },
                            0,
                            Status::Skipped,
                        );
                        progressed = true;
                        continue;
                    }
                    None => {}
                }

                if status == Status::Pending {
                    self.observer.on_operation_start(operation);
                }
                if let Some(job) = self.prepare(position, step) {
                    info!(operation = operation.id, step = ?step, summary = %operation.summary, "starting");
                    self.status[position] = Status::Running;
                    self.running += 1;
                    jobs.push(job);
                } else {
                    progressed = true;
                }
            }
        }

        debug!(spawned = jobs.len(), running = self.running, "scheduled operations");
        jobs
    }

    /// Removals (deletes and the first half of a replacement) wait for the
    /// old instances of former dependents to be gone; everything else waits
    /// for its dependencies to be fully applied.
    fn blocking_dependency(&self, operation: &PlannedOperation, step: Step) -> Option<Blocked> {
        let (ids, removal) = match (operation.action, step) {
            (PlanAction::Delete, _) => (&operation.depends_on, true),
            (_, Step::Teardown) => (&operation.teardown_after, true),
            _ => (&operation.depends_on, false),
        };

        let mut waiting = false;
        for id in ids {
            let Some(position) = self.positions.get(id) else {
                continue;
            };
            if removal && self.torn_down[*position] {
                continue;
            }
            let dependency = &self.plan.operations[*position].resource;
            match self.status[*position] {
                Status::Succeeded => {}
                Status::Pending | Status::Running | Status::TornDown => waiting = true,
                Status::Failed => {
                    return Some(Blocked::Broken(format!("dependency {dependency} failed")));
                }
                Status::Skipped => {
                    return Some(Blocked::Broken(format!(
                        "dependency {dependency} was skipped"
                    )));
                }
                Status::Cancelled => {
                    return Some(Blocked::Broken(format!(
                        "dependency {dependency} was cancelled"
                    )));
                }
            }
        }
        waiting.then_some(Blocked::Waiting)
    }

    /// Build the job for `position`, or settle it inline when no provider
    /// call is needed (no-ops, unresolvable inputs, missing providers).
    fn prepare(&mut self, position: usize, step: Step) -> Option<Job<'a>> {
        let plan: &'a PlanReport = self.plan;
        let prior: &'a StateSnapshot = self.prior;
        let providers: &'a ProviderRegistry = self.providers;
        let operation = &plan.operations[position];
        let prior_state = prior.get(&operation.resource);

        if operation.action == PlanAction::NoOp {
            self.complete_noop(position, prior_state);
            return None;
        }

        let Some(provider) = providers.select(&operation.type_tag) else {
            let error = ProviderError::UnsupportedType {
                provider: "registry".to_string(),
                type_tag: operation.type_tag.clone(),
            };
            self.fail_inline(position, &error.to_string(), false);
            return None;
        };

        let previous_type = prior_state.map_or_else(
            || operation.type_tag.clone(),
            |state| state.spec.type_tag.clone(),
        );
        let previous_provider = providers.select(&previous_type).unwrap_or(provider);

        let request = match (&operation.action, &operation.spec) {
            (PlanAction::Delete, _) => None,
            _ if step == Step::Teardown => None,
            (_, Some(spec)) => match resolve_properties(&spec.properties, &self.available) {
                Ok(inputs) => Some(ResourceRequest {
                    name: spec.name.clone(),
                    type_tag: spec.type_tag.clone(),
                    inputs,
                }),
                Err(error) => {
                    self.fail_inline(position, &error.to_string(), false);
                    return None;
                }
            },
            (_, None) => {
                self.fail_inline(position, "operation has no desired spec", false);
                return None;
            }
        };

        Some(Job {
            position,
            step,
            operation,
            request,
            current: prior_state
                .map(|state| state.outputs.clone())
                .unwrap_or_default(),
            provider,
            previous_provider,
            previous_type,
        })
    }

    fn complete_noop(&mut self, position: usize, prior_state: Option<&ResourceState>) {
        let operation = &self.plan.operations[position];
        let (Some(state), Some(spec)) = (prior_state, &operation.spec) else {
            self.fail_inline(position, "no prior state to carry forward", false);
            return;
        };
        self.available
            .insert(operation.resource.clone(), state.outputs.clone());
        self.snapshot.resources.insert(
            operation.resource.clone(),
            ResourceState {
                spec: spec.clone(),
                inputs: state.inputs.clone(),
                outputs: state.outputs.clone(),
            },
        );
        self.finish(position, OperationOutcome::Unchanged, 0, Status::Succeeded);
    }

    fn fail_inline(&mut self, position: usize, error: &str, transient: bool) {
        let operation = &self.plan.operations[position];
        self.errors.push(format!(
            "operation {} ({}) failed: {error}",
            operation.id, operation.resource
        ));
        self.finish(
            position,
            OperationOutcome::Failed {
                error: error.to_string(),
                transient,
            },
            0,
            Status::Failed,
        );
    }

    fn complete(&mut self, completion: Completion) {
        self.running = self.running.saturating_sub(1);
        let Completion {
            position,
            attempts,
            inputs,
            effect,
        } = completion;
        let operation = &self.plan.operations[position];
        let name = operation.resource.clone();

        match effect {
            Effect::Applied(outputs) => {
                if let Some(spec) = &operation.spec {
                    self.snapshot.resources.insert(
                        name.clone(),
                        ResourceState {
                            spec: spec.clone(),
                            inputs,
                            outputs: outputs.clone(),
                        },
                    );
                }
                self.available.insert(name, outputs);
                let outcome = match operation.action {
                    PlanAction::Update => OperationOutcome::Updated,
                    PlanAction::Replace => OperationOutcome::Replaced,
                    _ => OperationOutcome::Created,
                };
                self.finish(position, outcome, attempts, Status::Succeeded);
            }
            Effect::Removed => {
                self.snapshot.resources.remove(&name);
                self.torn_down[position] = true;
                self.finish(position, OperationOutcome::Deleted, attempts, Status::Succeeded);
            }
            Effect::TornDown => {
                self.snapshot.resources.remove(&name);
                self.torn_down[position] = true;
                self.teardown_attempts[position] = attempts;
                self.status[position] = Status::TornDown;
                debug!(operation = operation.id, resource = %name, "old instance removed");
            }
            Effect::Failed { error, transient } => {
                self.errors.push(format!(
                    "operation {} ({name}) failed: {error}",
                    operation.id
                ));
                self.finish(
                    position,
                    OperationOutcome::Failed { error, transient },
                    attempts,
                    Status::Failed,
                );
            }
            Effect::Cancelled => {
                self.finish(
                    position,
                    OperationOutcome::Cancelled,
                    attempts,
                    Status::Cancelled,
                );
            }
        }
    }

    /// Give every operation that never became runnable a result. Only
    /// reachable when the plan's dependency ids form a cycle.
    fn settle_stranded(&mut self) {
        for position in 0..self.plan.operations.len() {
            if matches!(self.status[position], Status::Pending | Status::TornDown) {
                self.finish(
                    position,
                    OperationOutcome::Skipped {
                        reason: "waits on an operation that never became ready".to_string(),
                    },
                    0,
                    Status::Skipped,
                );
            }
        }
    }

    fn finish(&mut self, position: usize, outcome: OperationOutcome, attempts: u32, status: Status) {
        let operation = &self.plan.operations[position];
        let attempts = attempts + self.teardown_attempts[position];
        let result = OperationResult {
            operation_id: operation.id,
            resource: operation.resource.clone(),
            action: operation.action,
            outcome,
            attempts,
        };
        info!(
            operation = operation.id,
            resource = %operation.resource,
            outcome = ?result.outcome,
            attempts,
            "finished"
        );
        self.observer.on_operation_complete(&result);
        self.status[position] = status;
        self.results[position] = Some(result);
    }
}

enum Blocked {
    Waiting,
    Broken(String),
}

fn run_job(job: &Job<'_>, policy: &RetryPolicy, cancel: &CancellationToken) -> Completion {
    let label = job.operation.summary.as_str();
    let name = &job.operation.resource;
    let inputs = job
        .request
        .as_ref()
        .map(|request| request.inputs.clone())
        .unwrap_or_default();

    let attempted = match (job.step, job.operation.action, &job.request) {
        (Step::Teardown, ..) | (_, PlanAction::Delete, _) => {
            with_retry(policy, cancel, label, |_| {
                job.previous_provider
                    .delete(name, &job.previous_type, &job.current)
                    .map(|()| Outputs::new())
            })
        }
        (_, PlanAction::Update, Some(request)) => with_retry(policy, cancel, label, |_| {
            job.provider.update(request, &job.current)
        }),
        (_, _, Some(request)) => create_or_adopt(job.provider, request, policy, cancel, label),
        (_, _, None) => Attempted {
            result: Err(RetryStop::Failed(ProviderError::non_transient(
                job.provider.name(),
                "missing request",
            ))),
            attempts: 0,
        },
    };

    let effect = match attempted.result {
        Ok(_) if job.step == Step::Teardown => Effect::TornDown,
        Ok(_) if job.operation.action == PlanAction::Delete => Effect::Removed,
        Ok(outputs) => Effect::Applied(outputs),
        Err(RetryStop::Failed(error)) => Effect::Failed {
            transient: error.is_transient(),
            error: error.to_string(),
        },
        Err(RetryStop::Cancelled) => Effect::Cancelled,
    };

    Completion {
        position: job.position,
        attempts: attempted.attempts,
        inputs,
        effect,
    }
}

/// Create with retries. Before every retry the control plane is asked
/// whether an earlier attempt already produced the resource; if so it is
/// adopted instead of created twice.
fn create_or_adopt(
    provider: &dyn ControlPlane,
    request: &ResourceRequest,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    label: &str,
) -> Attempted<Outputs> {
    with_retry(policy, cancel, label, |attempt| {
        if attempt > 1
            && let Some(existing) = provider.describe(&request.name, &request.type_tag)?
        {
            info!(resource = %request.name, "adopting resource created by an earlier attempt");
            return Ok(existing);
        }
        provider.create(request)
    })
}

#[cfg(test)]
mod tests;
