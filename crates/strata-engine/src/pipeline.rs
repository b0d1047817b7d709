use std::collections::BTreeMap;
use std::path::Path;

use serde_json::Value;
use strata_domain::{ApplyReport, PlanReport, PropertyValue, StateSnapshot};
use tracing::{info, warn};

use crate::apply::{ApplyObserver, ApplyOptions, execute_plan};
use crate::context::StackContext;
use crate::discovery::discover_manifests;
use crate::error::PipelineError;
use crate::exports::render_exports;
use crate::graph::ResourceGraph;
use crate::manifest_lua::{StackManifest, evaluate_many};
use crate::plan::build_plan;
use crate::providers::ProviderRegistry;
use crate::state::StateStore;

/// Which stack of a directory to operate on and how to configure it.
#[derive(Debug, Clone, Default)]
pub struct StackOptions {
    pub stack: Option<String>,
    /// `key=value` overrides applied on top of `strata.toml`.
    pub overrides: Vec<String>,
}

impl StackOptions {
    /// # Errors
    ///
    /// Returns an error when the settings file or an override is invalid.
    pub fn context(&self, folder: &Path) -> Result<StackContext, PipelineError> {
        Ok(StackContext::load(
            folder,
            self.stack.as_deref(),
            &self.overrides,
        )?)
    }
}

/// A stack directory with its manifests evaluated and its last-applied
/// snapshot loaded.
#[derive(Debug, Clone)]
pub struct LoadedStack {
    pub context: StackContext,
    pub manifest: StackManifest,
    pub graph: ResourceGraph,
    pub prior: StateSnapshot,
    store: StateStore,
}

/// Result of applying a plan: the report and the snapshot that was saved.
#[derive(Debug, Clone)]
pub struct ApplyOutcome {
    pub report: ApplyReport,
    pub snapshot: StateSnapshot,
}

/// Load, evaluate and validate the stack in `folder`.
///
/// # Errors
///
/// Returns an error when configuration, discovery or evaluation fails, no
/// manifests exist, the resource graph is invalid, or the snapshot cannot be
/// loaded.
pub fn load_stack(folder: &Path, options: &StackOptions) -> Result<LoadedStack, PipelineError> {
    let context = options.context(folder)?;
    let manifests = discover_manifests(folder)?;
    if manifests.is_empty() {
        return Err(PipelineError::NoManifests {
            folder: folder.to_path_buf(),
        });
    }

    let manifest = evaluate_many(&manifests, &context)?;
    let graph = ResourceGraph::from_specs(manifest.resources.clone())?;
    let store = StateStore::new(context.state_path(), context.stack.clone());
    let prior = store.load()?;

    info!(
        project = %context.project,
        stack = %context.stack,
        manifests = manifests.len(),
        resources = graph.len(),
        "loaded stack"
    );

    Ok(LoadedStack {
        context,
        manifest,
        graph,
        prior,
        store,
    })
}

impl LoadedStack {
    /// Offline providers rooted in this stack's state directory.
    #[must_use]
    pub fn sandbox_providers(&self) -> ProviderRegistry {
        ProviderRegistry::sandbox(&self.context.sandbox_dir())
    }

    /// Plan the changes needed to reach the declared state.
    ///
    /// # Errors
    ///
    /// Returns an error when a resource type has no provider.
    pub fn plan(&self, providers: &ProviderRegistry) -> Result<PlanReport, PipelineError> {
        let mut report = build_plan(&self.graph, &self.prior, providers)?;
        report.stack.clone_from(&self.context.stack);
        report.warnings.extend(self.manifest.warnings.iter().cloned());
        Ok(report)
    }

    /// Plan removal of every resource in the snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error when a recorded resource type has no provider.
    pub fn destroy_plan(&self, providers: &ProviderRegistry) -> Result<PlanReport, PipelineError> {
        let empty = ResourceGraph::from_specs(Vec::new())?;
        let mut report = build_plan(&empty, &self.prior, providers)?;
        report.stack.clone_from(&self.context.stack);
        Ok(report)
    }

    /// Execute `plan`, render exports and persist the resulting snapshot.
    ///
    /// Operation failures are recorded in the report, not returned as
    /// errors; the snapshot is saved either way so that it reflects what
    /// was actually changed. Exports are re-rendered only after a fully
    /// successful run; when rendering fails they are cleared rather than
    /// left describing an earlier apply.
    ///
    /// # Errors
    ///
    /// Returns an error when the worker pool cannot start, or when saving
    /// the snapshot fails after every operation succeeded.
    pub fn apply(
        &self,
        plan: &PlanReport,
        providers: &ProviderRegistry,
        options: &ApplyOptions,
        observer: &dyn ApplyObserver,
    ) -> Result<ApplyOutcome, PipelineError> {
        self.execute(plan, &self.manifest.exports, providers, options, observer)
    }

    /// Execute a plan produced by [`LoadedStack::destroy_plan`].
    ///
    /// # Errors
    ///
    /// Same as [`LoadedStack::apply`].
    pub fn destroy(
        &self,
        plan: &PlanReport,
        providers: &ProviderRegistry,
        options: &ApplyOptions,
        observer: &dyn ApplyObserver,
    ) -> Result<ApplyOutcome, PipelineError> {
        self.execute(plan, &BTreeMap::new(), providers, options, observer)
    }

    fn execute(
        &self,
        plan: &PlanReport,
        exports: &BTreeMap<String, PropertyValue>,
        providers: &ProviderRegistry,
        options: &ApplyOptions,
        observer: &dyn ApplyObserver,
    ) -> Result<ApplyOutcome, PipelineError> {
        let (mut report, mut snapshot) =
            execute_plan(plan, &self.prior, providers, options, observer)?;

        if !report.has_failures() {
            match render_exports(exports, &snapshot, &self.context) {
                Ok(rendered) => snapshot.exports = rendered,
                Err(error) => {
                    warn!(%error, "failed to render exports; clearing previous exports");
                    snapshot.exports.clear();
                    report.errors.push(error_chain(&error));
                }
            }
        }

        if let Err(error) = self.store.save(&snapshot) {
            if !report.has_failures() {
                return Err(error.into());
            }
            warn!(%error, "failed to save state after partial apply");
            report.errors.push(error_chain(&error));
        }

        Ok(ApplyOutcome { report, snapshot })
    }
}

/// Read rendered exports from the last-applied snapshot.
///
/// # Errors
///
/// Returns an error when the stack settings or snapshot cannot be loaded.
pub fn read_outputs(
    folder: &Path,
    options: &StackOptions,
) -> Result<BTreeMap<String, Value>, PipelineError> {
    let context = options.context(folder)?;
    let snapshot = StateStore::new(context.state_path(), context.stack.clone()).load()?;
    Ok(snapshot.exports)
}

fn error_chain(error: &dyn std::error::Error) -> String {
    let mut message = error.to_string();
    let mut current = error.source();
    while let Some(source) = current {
        message.push_str(": ");
        message.push_str(&source.to_string());
        current = source.source();
    }
    message
}
