mod apply;
mod context;
mod discovery;
mod error;
mod exports;
mod fs_util;
mod graph;
mod manifest_lua;
mod pipeline;
mod plan;
mod providers;
mod resolve;
mod retry;
mod sandbox;
mod state;

pub use apply::{
    ApplyObserver, ApplyOptions, DEFAULT_JOBS, NoopObserver, ensure_applied, execute_plan,
};
pub use context::{DEFAULT_STACK, SETTINGS_FILE, STATE_DIR, StackConfig, StackContext};
pub use discovery::discover_manifests;
pub use error::{
    ApplyError, ConfigError, DiscoveryError, ExportError, GraphError, ManifestEvalError,
    PipelineError, PlanningError, ProviderError, ResolveError, StateError,
};
pub use exports::render_exports;
pub use graph::{GraphBuilder, ResourceGraph};
pub use manifest_lua::{StackManifest, evaluate_manifest, evaluate_many};
pub use pipeline::{ApplyOutcome, LoadedStack, StackOptions, load_stack, read_outputs};
pub use plan::build_plan;
pub use providers::{ControlPlane, ProviderRegistry, ResourceRequest};
pub use resolve::{OutputLookup, resolve_properties, resolve_value};
pub use retry::{CancellationToken, RetryPolicy};
pub use sandbox::{SandboxCloud, SandboxCluster, SandboxRegistry, hash_directory};
pub use state::StateStore;
