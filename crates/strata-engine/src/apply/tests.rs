#![allow(clippy::expect_used)]

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use serde_json::json;
use strata_domain::{
    OperationOutcome, OperationResult, OutputRef, Outputs, PlanAction, PlannedOperation,
    PropertyValue, ResourceName, ResourceSpec, ResourceState, StateSnapshot, TypeTag,
};

use super::{ApplyObserver, ApplyOptions, NoopObserver, ensure_applied, execute_plan};
use crate::error::{ApplyError, ProviderError};
use crate::graph::ResourceGraph;
use crate::plan::build_plan;
use crate::providers::{ControlPlane, ProviderRegistry, ResourceRequest};
use crate::retry::{CancellationToken, RetryPolicy};

/// Control plane that answers from per-call scripts and records every call.
#[derive(Default)]
struct ScriptedCloud {
    scripts: Mutex<HashMap<String, VecDeque<Result<Outputs, ProviderError>>>>,
    existing: Mutex<HashMap<String, Outputs>>,
    calls: Mutex<Vec<String>>,
    cancel_on: Option<(String, CancellationToken)>,
    delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedCloud {
    fn script(&self, call: &str, responses: Vec<Result<Outputs, ProviderError>>) {
        self.scripts
            .lock()
            .expect("scripts lock")
            .insert(call.to_string(), responses.into());
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls lock").clone()
    }

    fn call(&self, label: String, default: Outputs) -> Result<Outputs, ProviderError> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        self.calls.lock().expect("calls lock").push(label.clone());
        if let Some((trigger, token)) = &self.cancel_on
            && *trigger == label
        {
            token.cancel();
        }
        let scripted = self
            .scripts
            .lock()
            .expect("scripts lock")
            .get_mut(&label)
            .and_then(VecDeque::pop_front);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        scripted.unwrap_or(Ok(default))
    }
}

fn echo(request: &ResourceRequest) -> Outputs {
    let mut outputs = request.inputs.clone();
    outputs.insert("id".to_string(), json!(format!("{}-id", request.name)));
    outputs
}

impl ControlPlane for ScriptedCloud {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn handles(&self, type_tag: &TypeTag) -> bool {
        type_tag.provider() == "aws"
    }

    fn create(&self, request: &ResourceRequest) -> Result<Outputs, ProviderError> {
        self.call(format!("create {}", request.name), echo(request))
    }

    fn update(
        &self,
        request: &ResourceRequest,
        current: &Outputs,
    ) -> Result<Outputs, ProviderError> {
        let mut outputs = echo(request);
        if let Some(id) = current.get("id") {
            outputs.insert("id".to_string(), id.clone());
        }
        self.call(format!("update {}", request.name), outputs)
    }

    fn delete(
        &self,
        name: &ResourceName,
        _type_tag: &TypeTag,
        _current: &Outputs,
    ) -> Result<(), ProviderError> {
        self.call(format!("delete {name}"), Outputs::new()).map(|_| ())
    }

    fn describe(
        &self,
        name: &ResourceName,
        _type_tag: &TypeTag,
    ) -> Result<Option<Outputs>, ProviderError> {
        self.calls
            .lock()
            .expect("calls lock")
            .push(format!("describe {name}"));
        Ok(self
            .existing
            .lock()
            .expect("existing lock")
            .get(name.as_str())
            .cloned())
    }
}

/// Shares one scripted cloud between the registry and the assertions.
struct Shared(&'static ScriptedCloud);

impl ControlPlane for Shared {
    fn name(&self) -> &'static str {
        self.0.name()
    }

    fn handles(&self, type_tag: &TypeTag) -> bool {
        self.0.handles(type_tag)
    }

    fn create(&self, request: &ResourceRequest) -> Result<Outputs, ProviderError> {
        self.0.create(request)
    }

    fn update(
        &self,
        request: &ResourceRequest,
        current: &Outputs,
    ) -> Result<Outputs, ProviderError> {
        self.0.update(request, current)
    }

    fn delete(
        &self,
        name: &ResourceName,
        type_tag: &TypeTag,
        current: &Outputs,
    ) -> Result<(), ProviderError> {
        self.0.delete(name, type_tag, current)
    }

    fn describe(
        &self,
        name: &ResourceName,
        type_tag: &TypeTag,
    ) -> Result<Option<Outputs>, ProviderError> {
        self.0.describe(name, type_tag)
    }

    fn requires_replacement(&self, _type_tag: &TypeTag, changed: &[&str]) -> bool {
        changed.contains(&"cidr_block")
    }
}

fn registry(cloud: &'static ScriptedCloud) -> ProviderRegistry {
    ProviderRegistry::from_providers(vec![Box::new(Shared(cloud))])
}

fn leak(cloud: ScriptedCloud) -> &'static ScriptedCloud {
    Box::leak(Box::new(cloud))
}

fn name(raw: &str) -> ResourceName {
    ResourceName::try_from(raw).expect("name")
}

fn spec(raw: &str, tag: &str) -> ResourceSpec {
    ResourceSpec::new(name(raw), TypeTag::try_from(tag).expect("tag"))
}

fn output(resource: &str, property: &str) -> PropertyValue {
    PropertyValue::from(OutputRef::new(name(resource), property.to_string()).expect("ref"))
}

fn network_stack() -> Vec<ResourceSpec> {
    vec![
        spec("vpc", "aws:ec2/vpc").with_property("cidr_block", PropertyValue::literal("10.0.0.0/16")),
        spec("cluster", "aws:ecs/cluster").with_property("vpc_id", output("vpc", "id")),
        spec("service", "aws:ecs/fargate_service").with_property("cluster", output("cluster", "id")),
        spec("bucket", "aws:s3/bucket"),
    ]
}

fn fast_options() -> ApplyOptions {
    ApplyOptions {
        jobs: 4,
        retry: RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            multiplier: 2.0,
        },
        cancel: CancellationToken::new(),
    }
}

fn apply(
    specs: Vec<ResourceSpec>,
    prior: &StateSnapshot,
    providers: &ProviderRegistry,
    options: &ApplyOptions,
) -> (strata_domain::ApplyReport, StateSnapshot) {
    let graph = ResourceGraph::from_specs(specs).expect("graph");
    let plan = build_plan(&graph, prior, providers).expect("plan");
    execute_plan(&plan, prior, providers, options, &NoopObserver).expect("execute")
}

fn outcome<'a>(report: &'a strata_domain::ApplyReport, resource: &str) -> &'a OperationOutcome {
    &report.result_for(resource).expect("result").outcome
}

fn position(calls: &[String], call: &str) -> usize {
    calls
        .iter()
        .position(|entry| entry == call)
        .unwrap_or_else(|| unreachable!("missing call {call}: {calls:?}"))
}

#[test]
fn creates_in_dependency_order_and_resolves_outputs() {
    let cloud = leak(ScriptedCloud::default());
    let providers = registry(cloud);
    let (report, snapshot) = apply(
        network_stack(),
        &StateSnapshot::empty("dev"),
        &providers,
        &fast_options(),
    );

    ensure_applied(&report).expect("success");
    assert_eq!(snapshot.resources.len(), 4);
    assert_eq!(
        snapshot.get("cluster").expect("cluster").inputs.get("vpc_id"),
        Some(&json!("vpc-id"))
    );
    assert_eq!(
        snapshot.get("service").expect("service").inputs.get("cluster"),
        Some(&json!("cluster-id"))
    );

    let calls = cloud.calls();
    assert!(position(&calls, "create vpc") < position(&calls, "create cluster"));
    assert!(position(&calls, "create cluster") < position(&calls, "create service"));
}

#[test]
fn failure_skips_dependents_but_not_independent_branches() {
    let cloud = leak(ScriptedCloud::default());
    cloud.script(
        "create vpc",
        vec![Err(ProviderError::non_transient("scripted", "invalid cidr"))],
    );
    let providers = registry(cloud);
    let (report, snapshot) = apply(
        network_stack(),
        &StateSnapshot::empty("dev"),
        &providers,
        &fast_options(),
    );

    assert!(matches!(
        outcome(&report, "vpc"),
        OperationOutcome::Failed { transient: false, .. }
    ));
    assert_eq!(
        outcome(&report, "cluster"),
        &OperationOutcome::Skipped {
            reason: "dependency vpc failed".to_string()
        }
    );
    assert_eq!(
        outcome(&report, "service"),
        &OperationOutcome::Skipped {
            reason: "dependency cluster was skipped".to_string()
        }
    );
    assert_eq!(outcome(&report, "bucket"), &OperationOutcome::Created);

    assert!(snapshot.get("vpc").is_none());
    assert!(snapshot.get("bucket").is_some());
    assert!(!cloud.calls().contains(&"create cluster".to_string()));

    let error = ensure_applied(&report).expect_err("must abort");
    assert!(matches!(
        error,
        ApplyError::Aborted {
            failed: 1,
            skipped: 2,
            cancelled: 0,
            ..
        }
    ));
    assert_eq!(report.errors.len(), 1);
}

#[test]
fn transient_errors_are_retried() {
    let cloud = leak(ScriptedCloud::default());
    cloud.script(
        "create bucket",
        vec![
            Err(ProviderError::transient("scripted", "throttled")),
            Err(ProviderError::transient("scripted", "throttled")),
        ],
    );
    let providers = registry(cloud);
    let (report, _snapshot) = apply(
        vec![spec("bucket", "aws:s3/bucket")],
        &StateSnapshot::empty("dev"),
        &providers,
        &fast_options(),
    );

    let result = report.result_for("bucket").expect("result");
    assert_eq!(result.outcome, OperationOutcome::Created);
    assert_eq!(result.attempts, 3);
}

#[test]
fn retry_adopts_resource_left_by_failed_attempt() {
    let cloud = leak(ScriptedCloud::default());
    cloud.script(
        "create bucket",
        vec![Err(ProviderError::transient("scripted", "connection reset"))],
    );
    cloud.existing.lock().expect("existing lock").insert(
        "bucket".to_string(),
        [("id".to_string(), json!("bucket-adopted"))]
            .into_iter()
            .collect(),
    );
    let providers = registry(cloud);
    let (report, snapshot) = apply(
        vec![spec("bucket", "aws:s3/bucket")],
        &StateSnapshot::empty("dev"),
        &providers,
        &fast_options(),
    );

    assert_eq!(outcome(&report, "bucket"), &OperationOutcome::Created);
    assert_eq!(
        snapshot.outputs_of("bucket").expect("outputs").get("id"),
        Some(&json!("bucket-adopted"))
    );
    assert_eq!(cloud.calls(), vec!["create bucket", "describe bucket"]);
}

#[test]
fn exhausted_retries_report_transient_failure() {
    let cloud = leak(ScriptedCloud::default());
    cloud.script(
        "create bucket",
        vec![
            Err(ProviderError::transient("scripted", "throttled")),
            Err(ProviderError::transient("scripted", "throttled")),
            Err(ProviderError::transient("scripted", "throttled")),
        ],
    );
    let providers = registry(cloud);
    let (report, _snapshot) = apply(
        vec![spec("bucket", "aws:s3/bucket")],
        &StateSnapshot::empty("dev"),
        &providers,
        &fast_options(),
    );
    let result = report.result_for("bucket").expect("result");
    assert!(matches!(
        result.outcome,
        OperationOutcome::Failed { transient: true, .. }
    ));
    assert_eq!(result.attempts, 3);
}

#[test]
fn cancelled_run_never_calls_providers() {
    let cloud = leak(ScriptedCloud::default());
    let providers = registry(cloud);
    let options = fast_options();
    options.cancel.cancel();

    let (report, snapshot) = apply(
        network_stack(),
        &StateSnapshot::empty("dev"),
        &providers,
        &options,
    );
    assert!(
        report
            .results
            .iter()
            .all(|result| result.outcome == OperationOutcome::Cancelled)
    );
    assert!(snapshot.is_empty());
    assert!(cloud.calls().is_empty());
}

#[test]
fn cancellation_mid_run_stops_scheduling() {
    let options = ApplyOptions {
        jobs: 1,
        ..fast_options()
    };
    let cloud = leak(ScriptedCloud {
        cancel_on: Some(("create vpc".to_string(), options.cancel.clone())),
        ..ScriptedCloud::default()
    });
    let providers = registry(cloud);
    let (report, snapshot) = apply(
        vec![
            spec("vpc", "aws:ec2/vpc"),
            spec("cluster", "aws:ecs/cluster").with_property("vpc_id", output("vpc", "id")),
        ],
        &StateSnapshot::empty("dev"),
        &providers,
        &options,
    );

    assert_eq!(outcome(&report, "vpc"), &OperationOutcome::Created);
    assert_eq!(outcome(&report, "cluster"), &OperationOutcome::Cancelled);
    assert!(snapshot.get("vpc").is_some());
    let error = ensure_applied(&report).expect_err("must abort");
    assert!(matches!(error, ApplyError::Aborted { cancelled: 1, .. }));
}

fn applied_snapshot(specs: &[ResourceSpec]) -> StateSnapshot {
    let mut snapshot = StateSnapshot::empty("dev");
    for spec in specs {
        snapshot.resources.insert(
            spec.name.clone(),
            ResourceState {
                spec: spec.clone(),
                inputs: Outputs::new(),
                outputs: [("id".to_string(), json!(format!("{}-old", spec.name)))]
                    .into_iter()
                    .collect(),
            },
        );
    }
    snapshot
}

#[test]
fn noop_carries_prior_outputs_without_provider_calls() {
    let specs = vec![
        spec("vpc", "aws:ec2/vpc"),
        spec("cluster", "aws:ecs/cluster"),
    ];
    let prior = applied_snapshot(&specs);
    let cloud = leak(ScriptedCloud::default());
    let providers = registry(cloud);

    let desired = vec![
        spec("vpc", "aws:ec2/vpc"),
        spec("cluster", "aws:ecs/cluster").with_property("vpc_id", output("vpc", "id")),
    ];
    let (report, snapshot) = apply(desired, &prior, &providers, &fast_options());

    assert_eq!(outcome(&report, "vpc"), &OperationOutcome::Unchanged);
    assert_eq!(outcome(&report, "cluster"), &OperationOutcome::Updated);
    assert_eq!(cloud.calls(), vec!["update cluster"]);
    assert_eq!(
        snapshot.get("cluster").expect("cluster").inputs.get("vpc_id"),
        Some(&json!("vpc-old"))
    );
    assert_eq!(
        snapshot.outputs_of("vpc").expect("outputs").get("id"),
        Some(&json!("vpc-old"))
    );
}

fn vpc_and_cluster(cidr: &str) -> Vec<ResourceSpec> {
    vec![
        spec("vpc", "aws:ec2/vpc").with_property("cidr_block", PropertyValue::literal(cidr)),
        spec("cluster", "aws:ecs/cluster").with_property("vpc_id", output("vpc", "id")),
    ]
}

#[test]
fn replacement_removes_old_dependents_before_the_replaced_resource() {
    let prior = applied_snapshot(&vpc_and_cluster("10.0.0.0/16"));
    let cloud = leak(ScriptedCloud::default());
    let providers = registry(cloud);

    let (report, snapshot) = apply(
        vpc_and_cluster("10.1.0.0/16"),
        &prior,
        &providers,
        &fast_options(),
    );

    ensure_applied(&report).expect("success");
    assert_eq!(outcome(&report, "vpc"), &OperationOutcome::Replaced);
    assert_eq!(outcome(&report, "cluster"), &OperationOutcome::Replaced);
    assert_eq!(
        cloud.calls(),
        vec!["delete cluster", "delete vpc", "create vpc", "create cluster"]
    );
    assert_eq!(report.result_for("vpc").expect("vpc").attempts, 2);
    assert_eq!(
        snapshot.get("cluster").expect("cluster").inputs.get("vpc_id"),
        Some(&json!("vpc-id"))
    );
}

#[test]
fn replacement_waits_for_removed_former_dependent() {
    let prior = applied_snapshot(&[
        spec("vpc", "aws:ec2/vpc").with_property("cidr_block", PropertyValue::literal("10.0.0.0/16")),
        spec("lb", "aws:lb/application_load_balancer").with_property("vpc_id", output("vpc", "id")),
    ]);
    let cloud = leak(ScriptedCloud::default());
    let providers = registry(cloud);

    let desired = vec![
        spec("vpc", "aws:ec2/vpc").with_property("cidr_block", PropertyValue::literal("10.1.0.0/16")),
    ];
    let (report, snapshot) = apply(desired, &prior, &providers, &fast_options());

    ensure_applied(&report).expect("success");
    assert_eq!(cloud.calls(), vec!["delete lb", "delete vpc", "create vpc"]);
    assert!(snapshot.get("lb").is_none());
    assert!(snapshot.get("vpc").is_some());
}

#[test]
fn failed_dependent_teardown_keeps_replaced_resource() {
    let prior = applied_snapshot(&vpc_and_cluster("10.0.0.0/16"));
    let cloud = leak(ScriptedCloud::default());
    cloud.script(
        "delete cluster",
        vec![Err(ProviderError::non_transient("scripted", "cluster has services"))],
    );
    let providers = registry(cloud);

    let (report, snapshot) = apply(
        vpc_and_cluster("10.1.0.0/16"),
        &prior,
        &providers,
        &fast_options(),
    );

    assert!(matches!(
        outcome(&report, "cluster"),
        OperationOutcome::Failed { transient: false, .. }
    ));
    assert_eq!(
        outcome(&report, "vpc"),
        &OperationOutcome::Skipped {
            reason: "dependency cluster failed".to_string()
        }
    );
    assert_eq!(cloud.calls(), vec!["delete cluster"]);
    assert_eq!(snapshot.get("vpc"), prior.get("vpc"));
    assert_eq!(snapshot.get("cluster"), prior.get("cluster"));
}

#[test]
fn failed_rebuild_leaves_removed_instances_out_of_snapshot() {
    let prior = applied_snapshot(&vpc_and_cluster("10.0.0.0/16"));
    let cloud = leak(ScriptedCloud::default());
    cloud.script(
        "create vpc",
        vec![Err(ProviderError::non_transient("scripted", "cidr overlaps"))],
    );
    let providers = registry(cloud);

    let (report, snapshot) = apply(
        vpc_and_cluster("10.1.0.0/16"),
        &prior,
        &providers,
        &fast_options(),
    );

    assert!(matches!(outcome(&report, "vpc"), OperationOutcome::Failed { .. }));
    assert_eq!(
        outcome(&report, "cluster"),
        &OperationOutcome::Skipped {
            reason: "dependency vpc failed".to_string()
        }
    );
    assert_eq!(
        cloud.calls(),
        vec!["delete cluster", "delete vpc", "create vpc"]
    );
    assert!(snapshot.is_empty());
}

#[test]
fn operations_waiting_on_each_other_are_skipped() {
    let planned = |id: usize, resource: &str, depends_on: usize| PlannedOperation {
        id,
        resource: name(resource),
        type_tag: TypeTag::try_from("aws:s3/bucket").expect("tag"),
        action: PlanAction::Create,
        diff: Vec::new(),
        depends_on: vec![depends_on],
        teardown_after: Vec::new(),
        spec: Some(spec(resource, "aws:s3/bucket")),
        summary: format!("create {resource}"),
    };
    let plan = strata_domain::PlanReport {
        stack: "dev".to_string(),
        operations: vec![planned(1, "a", 2), planned(2, "b", 1)],
        warnings: Vec::new(),
    };
    let cloud = leak(ScriptedCloud::default());
    let providers = registry(cloud);

    let (report, _snapshot) = execute_plan(
        &plan,
        &StateSnapshot::empty("dev"),
        &providers,
        &fast_options(),
        &NoopObserver,
    )
    .expect("execute");

    assert_eq!(report.results.len(), 2);
    assert!(
        report
            .results
            .iter()
            .all(|result| matches!(result.outcome, OperationOutcome::Skipped { .. }))
    );
    assert!(cloud.calls().is_empty());
}

#[test]
fn deletes_remove_entries_dependents_first() {
    let prior = applied_snapshot(&[
        spec("vpc", "aws:ec2/vpc"),
        spec("cluster", "aws:ecs/cluster").with_property("vpc_id", output("vpc", "id")),
    ]);
    let cloud = leak(ScriptedCloud::default());
    let providers = registry(cloud);
    let (report, snapshot) = apply(Vec::new(), &prior, &providers, &fast_options());

    ensure_applied(&report).expect("success");
    assert!(snapshot.is_empty());
    assert_eq!(cloud.calls(), vec!["delete cluster", "delete vpc"]);
    assert!(
        report
            .results
            .iter()
            .all(|result| result.action == PlanAction::Delete)
    );
}

#[test]
fn failed_delete_keeps_prior_entry() {
    let prior = applied_snapshot(&[spec("bucket", "aws:s3/bucket")]);
    let cloud = leak(ScriptedCloud::default());
    cloud.script(
        "delete bucket",
        vec![Err(ProviderError::non_transient("scripted", "bucket not empty"))],
    );
    let providers = registry(cloud);
    let (report, snapshot) = apply(Vec::new(), &prior, &providers, &fast_options());

    assert!(report.has_failures());
    assert_eq!(snapshot.get("bucket"), prior.get("bucket"));
}

#[test]
fn worker_pool_bounds_concurrency() {
    let cloud = leak(ScriptedCloud {
        delay: Duration::from_millis(20),
        ..ScriptedCloud::default()
    });
    let providers = registry(cloud);
    let specs = (0..6)
        .map(|index| spec(&format!("bucket-{index}"), "aws:s3/bucket"))
        .collect();
    let options = ApplyOptions {
        jobs: 2,
        ..fast_options()
    };
    let (report, _snapshot) = apply(specs, &StateSnapshot::empty("dev"), &providers, &options);

    ensure_applied(&report).expect("success");
    assert!(cloud.max_in_flight.load(Ordering::SeqCst) <= 2);
}

#[derive(Default)]
struct RecordingObserver {
    events: Mutex<Vec<String>>,
}

impl ApplyObserver for RecordingObserver {
    fn on_operation_start(&self, operation: &PlannedOperation) {
        self.events
            .lock()
            .expect("events lock")
            .push(format!("start {}", operation.resource));
    }

    fn on_operation_complete(&self, result: &OperationResult) {
        self.events
            .lock()
            .expect("events lock")
            .push(format!("done {}", result.resource));
    }
}

#[test]
fn observer_sees_every_operation() {
    let cloud = leak(ScriptedCloud::default());
    let providers = registry(cloud);
    let graph = ResourceGraph::from_specs(vec![
        spec("vpc", "aws:ec2/vpc"),
        spec("cluster", "aws:ecs/cluster").with_property("vpc_id", output("vpc", "id")),
    ])
    .expect("graph");
    let prior = StateSnapshot::empty("dev");
    let plan = build_plan(&graph, &prior, &providers).expect("plan");
    let observer = RecordingObserver::default();
    execute_plan(&plan, &prior, &providers, &fast_options(), &observer).expect("execute");

    let events = observer.events.lock().expect("events lock").clone();
    assert_eq!(
        events,
        vec!["start vpc", "done vpc", "start cluster", "done cluster"]
    );
}
