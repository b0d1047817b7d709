// Target-specific transitive dependency split (mio/crossterm stack) is accepted for now.
#![allow(clippy::multiple_crate_versions)]

use std::cell::Cell;
use std::collections::BTreeSet;
use std::ffi::OsString;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};

use clap::error::ErrorKind;
use clap::{Args, Parser, Subcommand, ValueEnum};
use minus::{ExitStrategy, Pager, page_all};
use strata_domain::{OperationResult, PlannedOperation};
use strata_engine::{
    ApplyObserver, ApplyOptions, CancellationToken, DEFAULT_JOBS, LoadedStack, StackOptions,
    ensure_applied, load_stack, read_outputs,
};
use strata_report::{
    ColorChoice, OutputFormat, RenderOptions, redact_sensitive, render_apply, render_outputs,
    render_plan,
};
use tracing::{debug, warn};

mod error;

pub use error::CliError;

#[derive(Debug, Parser)]
#[command(
    name = "strata",
    about = "Declarative resource-graph provisioning engine"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Show the operations needed to reach the declared state.
    Plan {
        #[arg(default_value = ".")]
        dir: PathBuf,
        #[command(flatten)]
        stack: StackFlags,
        #[command(flatten)]
        render: RenderFlags,
    },
    /// Plan and execute changes, then save the new snapshot.
    Apply {
        #[arg(default_value = ".")]
        dir: PathBuf,
        #[command(flatten)]
        stack: StackFlags,
        #[command(flatten)]
        render: RenderFlags,
        #[command(flatten)]
        exec: ExecFlags,
    },
    /// Delete every resource recorded in the snapshot.
    Destroy {
        #[arg(default_value = ".")]
        dir: PathBuf,
        #[command(flatten)]
        stack: StackFlags,
        #[command(flatten)]
        render: RenderFlags,
        #[command(flatten)]
        exec: ExecFlags,
    },
    /// Print exports from the last apply.
    Output {
        key: Option<String>,
        #[arg(default_value = ".")]
        dir: PathBuf,
        #[command(flatten)]
        stack: StackFlags,
        #[command(flatten)]
        render: RenderFlags,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FormatArg {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ColorArg {
    Auto,
    Always,
    Never,
}

#[derive(Debug, Clone, Args)]
struct StackFlags {
    /// Stack name (defaults to `[stack] name` in strata.toml, then "dev").
    #[arg(long)]
    stack: Option<String>,
    /// Config override as key=value; repeatable.
    #[arg(long = "config", value_name = "KEY=VALUE")]
    overrides: Vec<String>,
}

#[derive(Debug, Clone, Args)]
struct RenderFlags {
    #[arg(long, value_enum, default_value_t = FormatArg::Text)]
    format: FormatArg,
    #[arg(long, value_enum, default_value_t = ColorArg::Auto)]
    color: ColorArg,
    #[arg(long)]
    verbose: bool,
}

#[derive(Debug, Clone, Args)]
struct ExecFlags {
    /// Maximum number of operations in flight.
    #[arg(long, default_value_t = DEFAULT_JOBS, value_parser = parse_jobs)]
    jobs: usize,
}

fn parse_jobs(raw: &str) -> std::result::Result<usize, String> {
    match raw.parse::<usize>() {
        Ok(0) => Err("must be at least 1".to_string()),
        Ok(jobs) => Ok(jobs),
        Err(error) => Err(error.to_string()),
    }
}

impl StackFlags {
    fn options(&self) -> StackOptions {
        StackOptions {
            stack: self.stack.clone(),
            overrides: self.overrides.clone(),
        }
    }
}

impl RenderFlags {
    fn render_options(&self, target: &Path) -> RenderOptions {
        RenderOptions {
            color: self.color.into(),
            verbose: self.verbose,
            target: Some(target.display().to_string()),
        }
    }

    fn output_format(&self) -> OutputFormat {
        self.format.into()
    }
}

impl From<FormatArg> for OutputFormat {
    fn from(value: FormatArg) -> Self {
        match value {
            FormatArg::Text => Self::Text,
            FormatArg::Json => Self::Json,
        }
    }
}

impl From<ColorArg> for ColorChoice {
    fn from(value: ColorArg) -> Self {
        match value {
            ColorArg::Auto => Self::Auto,
            ColorArg::Always => Self::Always,
            ColorArg::Never => Self::Never,
        }
    }
}

/// Prints one line per operation to stderr while an apply runs.
struct ProgressObserver {
    total: usize,
    done: Cell<usize>,
}

impl ApplyObserver for ProgressObserver {
    fn on_operation_start(&self, operation: &PlannedOperation) {
        eprintln!(
            "[{}/{}] {} {} ({})",
            self.done.get(),
            self.total,
            operation.action,
            operation.resource,
            operation.type_tag
        );
    }

    fn on_operation_complete(&self, result: &OperationResult) {
        self.done.set(self.done.get() + 1);
        debug!(resource = %result.resource, attempts = result.attempts, "operation settled");
    }
}

/// Run the CLI using process arguments.
///
/// # Errors
///
/// Returns an error when argument parsing fails (excluding help/version) or command
/// execution fails.
pub fn run() -> std::result::Result<i32, CliError> {
    run_from(std::env::args_os())
}

fn run_from<I, T>(args: I) -> std::result::Result<i32, CliError>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = match Cli::try_parse_from(args) {
        Ok(parsed) => parsed,
        Err(error) => match error.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                print!("{error}");
                return Ok(0);
            }
            _ => return Err(error.into()),
        },
    };

    match cli.command {
        Commands::Plan { dir, stack, render } => {
            let loaded = load_stack(&dir, &stack.options())?;
            let providers = loaded.sandbox_providers();
            let report = loaded.plan(&providers)?;
            let rendered = render_plan(
                &report,
                render.output_format(),
                &render.render_options(&dir),
            )?;
            emit_output(&rendered, render.output_format(), &loaded.manifest.sensitive);
            Ok(0)
        }
        Commands::Apply {
            dir,
            stack,
            render,
            exec,
        } => {
            let loaded = load_stack(&dir, &stack.options())?;
            execute(&loaded, &dir, &render, &exec, false)
        }
        Commands::Destroy {
            dir,
            stack,
            render,
            exec,
        } => {
            let loaded = load_stack(&dir, &stack.options())?;
            execute(&loaded, &dir, &render, &exec, true)
        }
        Commands::Output {
            key,
            dir,
            stack,
            render,
        } => {
            let outputs = read_outputs(&dir, &stack.options())?;
            let rendered = render_outputs(
                &outputs,
                key.as_deref(),
                render.output_format(),
                &render.render_options(&dir),
            )?;
            emit_output(&rendered, render.output_format(), &BTreeSet::new());
            Ok(0)
        }
    }
}

fn execute(
    loaded: &LoadedStack,
    dir: &Path,
    render: &RenderFlags,
    exec: &ExecFlags,
    destroy: bool,
) -> std::result::Result<i32, CliError> {
    let cancel = CancellationToken::new();
    cancel_on_interrupt(cancel.clone());
    execute_with(loaded, dir, render, exec, destroy, cancel)
}

fn execute_with(
    loaded: &LoadedStack,
    dir: &Path,
    render: &RenderFlags,
    exec: &ExecFlags,
    destroy: bool,
    cancel: CancellationToken,
) -> std::result::Result<i32, CliError> {
    let providers = loaded.sandbox_providers();
    let plan = if destroy {
        loaded.destroy_plan(&providers)?
    } else {
        loaded.plan(&providers)?
    };

    let options = ApplyOptions {
        jobs: exec.jobs,
        cancel,
        ..ApplyOptions::default()
    };
    let format = render.output_format();
    let render_options = render.render_options(dir);

    if format == OutputFormat::Text && render_options.verbose {
        let rendered = render_plan(&plan, format, &render_options)?;
        eprint!(
            "{}",
            redact_sensitive(&rendered, &loaded.manifest.sensitive)
        );
    }

    let observer = ProgressObserver {
        total: plan.operations.len(),
        done: Cell::new(0),
    };
    let outcome = if destroy {
        loaded.destroy(&plan, &providers, &options, &observer)?
    } else {
        loaded.apply(&plan, &providers, &options, &observer)?
    };

    let rendered = render_apply(&outcome.report, format, &render_options)?;
    emit_output(&rendered, format, &loaded.manifest.sensitive);

    match ensure_applied(&outcome.report) {
        Ok(()) => Ok(0),
        Err(error) => {
            if format == OutputFormat::Text {
                eprintln!("error: {error}");
            }
            Ok(1)
        }
    }
}

/// Cancel `token` on the first Ctrl-C so operations that have not started
/// are marked cancelled while running ones finish. A second Ctrl-C exits.
fn cancel_on_interrupt(token: CancellationToken) {
    let watcher = std::thread::Builder::new()
        .name("strata-interrupt".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(error) => {
                    warn!(%error, "cannot listen for interrupts");
                    return;
                }
            };
            runtime.block_on(async {
                if tokio::signal::ctrl_c().await.is_err() {
                    return;
                }
                eprintln!("interrupted: waiting for running operations, press Ctrl-C again to abort");
                token.cancel();
                if tokio::signal::ctrl_c().await.is_ok() {
                    std::process::exit(130);
                }
            });
        });
    if let Err(error) = watcher {
        warn!(%error, "cannot listen for interrupts");
    }
}

fn emit_output(rendered: &str, format: OutputFormat, sensitive_values: &BTreeSet<String>) {
    let redacted = redact_sensitive(rendered, sensitive_values);

    if format == OutputFormat::Text && should_use_pager() && page_output(&redacted).is_ok() {
        return;
    }

    if redacted.ends_with('\n') {
        print!("{redacted}");
    } else {
        println!("{redacted}");
    }
}

fn should_use_pager() -> bool {
    std::io::stdout().is_terminal() && std::env::var_os("NO_PAGER").is_none()
}

fn page_output(rendered: &str) -> std::result::Result<(), minus::MinusError> {
    let pager = Pager::new();
    pager.set_exit_strategy(ExitStrategy::PagerQuit)?;
    pager.set_text(rendered)?;
    page_all(pager)
}
