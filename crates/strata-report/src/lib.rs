use std::collections::{BTreeMap, HashMap};
use std::fmt::Write;
use std::io::{self, IsTerminal};

use console::Style;
use serde_json::Value;
use strata_domain::{
    ApplyReport, OperationOutcome, OperationResult, PlanAction, PlanReport, PlannedOperation,
    PropertyDiff, PropertyValue,
};

mod error;
mod options;
mod redaction;

pub use error::ReportError;
pub use options::{ColorChoice, OutputFormat, RenderOptions};
pub use redaction::redact_sensitive;

/// Render a plan report in the requested output format.
///
/// # Errors
///
/// Returns an error if JSON serialization fails.
pub fn render_plan(
    report: &PlanReport,
    format: OutputFormat,
    options: &RenderOptions,
) -> std::result::Result<String, ReportError> {
    match format {
        OutputFormat::Json => to_json(report),
        OutputFormat::Text => Ok(render_plan_text(report, options)),
    }
}

/// Render an apply report in the requested output format.
///
/// # Errors
///
/// Returns an error if JSON serialization fails.
pub fn render_apply(
    report: &ApplyReport,
    format: OutputFormat,
    options: &RenderOptions,
) -> std::result::Result<String, ReportError> {
    match format {
        OutputFormat::Json => to_json(report),
        OutputFormat::Text => Ok(render_apply_text(report, options)),
    }
}

/// Render stack outputs, or the single output `key`.
///
/// A single string output renders as the bare string in text mode so it can
/// be used in shell substitutions.
///
/// # Errors
///
/// Returns an error if `key` is not an output or JSON serialization fails.
pub fn render_outputs(
    outputs: &BTreeMap<String, Value>,
    key: Option<&str>,
    format: OutputFormat,
    options: &RenderOptions,
) -> std::result::Result<String, ReportError> {
    if let Some(key) = key {
        let value = outputs.get(key).ok_or_else(|| ReportError::MissingOutput {
            key: key.to_string(),
        })?;
        return match (format, value) {
            (OutputFormat::Text, Value::String(text)) => Ok(text.clone()),
            (OutputFormat::Text, other) => Ok(other.to_string()),
            (OutputFormat::Json, other) => to_json(other),
        };
    }

    match format {
        OutputFormat::Json => to_json(outputs),
        OutputFormat::Text => Ok(render_outputs_text(outputs, options)),
    }
}

fn to_json<T: serde::Serialize + ?Sized>(value: &T) -> std::result::Result<String, ReportError> {
    serde_json::to_string_pretty(value).map_err(|source| ReportError::JsonSerialize { source })
}

// ---------------------------------------------------------------------------
// Plan text
// ---------------------------------------------------------------------------

fn render_plan_text(report: &PlanReport, options: &RenderOptions) -> String {
    let mut output = String::new();
    let style = TextStyle::new(options.color);
    let stack = format!("(stack {})", report.stack);

    append_header(
        &mut output,
        "plan",
        options.target.as_deref(),
        Some(&stack),
        style,
    );

    if report.operations.is_empty() {
        let _ = writeln!(output, "  Nothing to do.");
        append_warnings_and_errors(&mut output, &report.warnings, &[], style);
        return output;
    }

    let (changed, noops): (Vec<&PlannedOperation>, Vec<&PlannedOperation>) = report
        .operations
        .iter()
        .partition(|op| op.action.is_change());

    let _ = writeln!(output);
    append_warnings_and_errors(&mut output, &report.warnings, &[], style);
    for op in &changed {
        append_plan_op_line(&mut output, op, options, style);
    }

    if options.verbose {
        for op in &noops {
            append_plan_op_line(&mut output, op, options, style);
        }
    } else if !noops.is_empty() {
        if !changed.is_empty() {
            let _ = writeln!(output);
        }
        let _ = writeln!(
            output,
            "  {}",
            style.dim(&unchanged_by_provider(
                noops.iter().map(|op| op.type_tag.provider())
            ))
        );
    }

    let _ = writeln!(output);
    let tally = PlanTally::from_operations(&report.operations);
    let _ = writeln!(output, "{}", tally.format(style));

    output
}

// ---------------------------------------------------------------------------
// Apply text
// ---------------------------------------------------------------------------

fn render_apply_text(report: &ApplyReport, options: &RenderOptions) -> String {
    let mut output = String::new();
    let style = TextStyle::new(options.color);
    let operation_map: HashMap<usize, &PlannedOperation> = report
        .plan
        .operations
        .iter()
        .map(|op| (op.id, op))
        .collect();
    let stack = format!("(stack {})", report.plan.stack);

    append_header(
        &mut output,
        "apply",
        options.target.as_deref(),
        Some(&stack),
        style,
    );

    if report.results.is_empty() {
        let _ = writeln!(output, "  Nothing to do.");
        append_warnings_and_errors(&mut output, &[], &report.errors, style);
        return output;
    }

    let (active, unchanged): (Vec<&OperationResult>, Vec<&OperationResult>) = report
        .results
        .iter()
        .partition(|r| r.outcome != OperationOutcome::Unchanged);

    let _ = writeln!(output);
    for result in &active {
        let planned = operation_map.get(&result.operation_id).copied();
        append_apply_op_line(&mut output, result, planned, options, style);
    }

    if options.verbose {
        for result in &unchanged {
            let planned = operation_map.get(&result.operation_id).copied();
            append_apply_op_line(&mut output, result, planned, options, style);
        }
    } else if !unchanged.is_empty() {
        if !active.is_empty() {
            let _ = writeln!(output);
        }
        let providers = unchanged.iter().filter_map(|result| {
            operation_map
                .get(&result.operation_id)
                .map(|op| op.type_tag.provider())
        });
        let _ = writeln!(output, "  {}", style.dim(&unchanged_by_provider(providers)));
    }

    append_warnings_and_errors(&mut output, &[], &report.errors, style);

    let _ = writeln!(output);
    let tally = ApplyTally::from_results(&report.results);
    let _ = writeln!(output, "{}", tally.format(style));

    output
}

// ---------------------------------------------------------------------------
// Outputs text
// ---------------------------------------------------------------------------

fn render_outputs_text(outputs: &BTreeMap<String, Value>, options: &RenderOptions) -> String {
    let mut output = String::new();
    let style = TextStyle::new(options.color);
    append_header(&mut output, "outputs", options.target.as_deref(), None, style);

    if outputs.is_empty() {
        let _ = writeln!(output, "  No outputs. Run apply first.");
        return output;
    }

    let _ = writeln!(output);
    let width = outputs.keys().map(String::len).max().unwrap_or(0);
    for (key, value) in outputs {
        let rendered = match value {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        };
        let _ = writeln!(
            output,
            "  {} {} {}",
            style.primary_text(&format!("{key:<width$}")),
            style.dim("="),
            rendered
        );
    }
    output
}

// ---------------------------------------------------------------------------
// Line renderers
// ---------------------------------------------------------------------------

fn append_header(
    output: &mut String,
    command: &str,
    target: Option<&str>,
    suffix: Option<&str>,
    style: TextStyle,
) {
    let _ = write!(output, "{}", style.header_command(command));
    if let Some(t) = target {
        let _ = write!(output, " {}", style.dim(t));
    }
    if let Some(s) = suffix {
        let _ = write!(output, " {}", style.dim(s));
    }
    let _ = writeln!(output);
}

fn append_plan_op_line(
    output: &mut String,
    op: &PlannedOperation,
    options: &RenderOptions,
    style: TextStyle,
) {
    let (symbol, label) = plan_symbol_and_label(op.action, style);
    let _ = writeln!(
        output,
        "  {symbol} {label}{}",
        format_resource_detail(op, style)
    );

    let show_diff = options.verbose || matches!(op.action, PlanAction::Update | PlanAction::Replace);
    if show_diff {
        for entry in &op.diff {
            append_diff_line(output, entry, options.verbose, style);
        }
    }

    if options.verbose {
        let mut meta = format!("#{}", op.id);
        if !op.depends_on.is_empty() {
            let after: Vec<String> = op.depends_on.iter().map(|id| format!("#{id}")).collect();
            let _ = write!(meta, " after {}", after.join(", "));
        }
        let _ = writeln!(output, "    {}", style.dim(&meta));
        let _ = writeln!(output, "    {}", style.dim(&op.summary));
    } else if op.diff.is_empty() && op.action == PlanAction::Update {
        let _ = writeln!(output, "    {}", style.dim(&op.summary));
    }
}

fn append_diff_line(output: &mut String, entry: &PropertyDiff, verbose: bool, style: TextStyle) {
    let before = format_property(entry.before.as_ref(), verbose);
    let after = format_property(entry.after.as_ref(), verbose);
    let _ = writeln!(
        output,
        "      {}: {} {} {}",
        entry.property,
        style.dim(&before),
        style.dim("->"),
        style.primary_text(&after)
    );
}

fn format_property(value: Option<&PropertyValue>, verbose: bool) -> String {
    const MAX_WIDTH: usize = 60;
    let Some(value) = value else {
        return "(none)".to_string();
    };
    let rendered = value.to_string();
    if verbose || rendered.chars().count() <= MAX_WIDTH {
        return rendered;
    }
    let truncated: String = rendered.chars().take(MAX_WIDTH - 3).collect();
    format!("{truncated}...")
}

fn append_apply_op_line(
    output: &mut String,
    result: &OperationResult,
    planned: Option<&PlannedOperation>,
    options: &RenderOptions,
    style: TextStyle,
) {
    let (symbol, label) = apply_symbol_and_label(&result.outcome, style);
    let detail = planned.map_or_else(
        || style.primary_text(result.resource.as_str()),
        |op| format_resource_detail(op, style),
    );
    let _ = writeln!(output, "  {symbol} {label}{detail}");

    match &result.outcome {
        OperationOutcome::Failed { error, transient } => {
            let attempts = if *transient {
                format!(" (after {} attempts)", result.attempts)
            } else {
                String::new()
            };
            let _ = writeln!(
                output,
                "{}{}",
                " ".repeat(LABEL_WIDTH + 4),
                style.error_detail(&format!("{error}{attempts}"))
            );
        }
        OperationOutcome::Skipped { reason } => {
            let _ = writeln!(output, "{}{}", " ".repeat(LABEL_WIDTH + 4), style.dim(reason));
        }
        _ => {}
    }

    if options.verbose {
        let _ = writeln!(
            output,
            "    {}",
            style.dim(&format!(
                "#{} {} attempt(s)",
                result.operation_id, result.attempts
            ))
        );
    }
}

fn format_resource_detail(op: &PlannedOperation, style: TextStyle) -> String {
    format!(
        "{} {}",
        style.primary_text(op.resource.as_str()),
        style.dim(op.type_tag.as_str())
    )
}

// ---------------------------------------------------------------------------
// Warnings & Errors
// ---------------------------------------------------------------------------

fn append_warnings_and_errors(
    output: &mut String,
    warnings: &[String],
    errors: &[String],
    style: TextStyle,
) {
    if warnings.is_empty() && errors.is_empty() {
        return;
    }
    let _ = writeln!(output);
    for w in warnings {
        let _ = writeln!(output, "  {} {w}", style.warn_prefix("warn:"));
    }
    for e in errors {
        let _ = writeln!(output, "  {} {e}", style.error_prefix("error:"));
    }
    if !warnings.is_empty() {
        let _ = writeln!(output);
    }
}

// ---------------------------------------------------------------------------
// Symbol + Label helpers
// ---------------------------------------------------------------------------

fn plan_symbol_and_label(action: PlanAction, style: TextStyle) -> (String, String) {
    let (tone, symbol, label) = match action {
        PlanAction::Create => (Tone::Add, "+", "create"),
        PlanAction::Update => (Tone::Change, "~", "update"),
        PlanAction::Replace => (Tone::Replace, "±", "replace"),
        PlanAction::Delete => (Tone::Delete, "-", "delete"),
        PlanAction::NoOp => (Tone::Unchanged, "=", "unchanged"),
    };
    paint_symbol_and_label(tone, symbol, label, style)
}

fn apply_symbol_and_label(outcome: &OperationOutcome, style: TextStyle) -> (String, String) {
    let (tone, symbol, label) = match outcome {
        OperationOutcome::Created => (Tone::Add, "+", "created"),
        OperationOutcome::Updated => (Tone::Change, "~", "updated"),
        OperationOutcome::Replaced => (Tone::Replace, "±", "replaced"),
        OperationOutcome::Deleted => (Tone::Delete, "-", "deleted"),
        OperationOutcome::Unchanged => (Tone::Unchanged, "=", "unchanged"),
        OperationOutcome::Failed { .. } => (Tone::Failed, "!", "failed"),
        OperationOutcome::Skipped { .. } => (Tone::Skipped, ">", "skipped"),
        OperationOutcome::Cancelled => (Tone::Skipped, "x", "cancelled"),
    };
    paint_symbol_and_label(tone, symbol, label, style)
}

fn paint_symbol_and_label(
    tone: Tone,
    symbol: &str,
    label: &str,
    style: TextStyle,
) -> (String, String) {
    (
        style.symbol(tone, symbol),
        TextStyle::pad_label(&style.label(tone, label)),
    )
}

// ---------------------------------------------------------------------------
// Unchanged summary
// ---------------------------------------------------------------------------

fn unchanged_by_provider<'a>(providers: impl Iterator<Item = &'a str>) -> String {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for provider in providers {
        *counts.entry(provider).or_default() += 1;
    }
    let total: usize = counts.values().sum();
    let parts: Vec<String> = counts
        .iter()
        .map(|(provider, count)| format!("{count} {provider}"))
        .collect();
    if parts.is_empty() {
        format!("{total} unchanged")
    } else {
        format!("{total} unchanged ({})", parts.join(", "))
    }
}

// ---------------------------------------------------------------------------
// Tally Counts (Plan)
// ---------------------------------------------------------------------------

#[derive(Default)]
struct PlanTally {
    creates: usize,
    updates: usize,
    replaces: usize,
    deletes: usize,
    unchanged: usize,
}

impl PlanTally {
    fn from_operations(ops: &[PlannedOperation]) -> Self {
        let mut tally = Self::default();
        for op in ops {
            match op.action {
                PlanAction::Create => tally.creates += 1,
                PlanAction::Update => tally.updates += 1,
                PlanAction::Replace => tally.replaces += 1,
                PlanAction::Delete => tally.deletes += 1,
                PlanAction::NoOp => tally.unchanged += 1,
            }
        }
        tally
    }

    fn format(&self, style: TextStyle) -> String {
        let mut parts = Vec::new();
        if self.creates > 0 {
            parts.push(style.label(Tone::Add, &format!("{} to create", self.creates)));
        }
        if self.updates > 0 {
            parts.push(style.label(Tone::Change, &format!("{} to update", self.updates)));
        }
        if self.replaces > 0 {
            parts.push(style.label(Tone::Replace, &format!("{} to replace", self.replaces)));
        }
        if self.deletes > 0 {
            parts.push(style.label(Tone::Delete, &format!("{} to delete", self.deletes)));
        }
        if self.unchanged > 0 {
            parts.push(style.dim(&format!("{} unchanged", self.unchanged)));
        }
        if parts.is_empty() {
            format!("{} nothing to do", style.tally_label("Plan:"))
        } else {
            format!("{} {}", style.tally_label("Plan:"), parts.join(", "))
        }
    }
}

// ---------------------------------------------------------------------------
// Apply Tally
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ApplyTally {
    created: usize,
    updated: usize,
    replaced: usize,
    deleted: usize,
    failed: usize,
    skipped: usize,
    cancelled: usize,
    unchanged: usize,
}

impl ApplyTally {
    fn from_results(results: &[OperationResult]) -> Self {
        let mut tally = Self::default();
        for r in results {
            match r.outcome {
                OperationOutcome::Created => tally.created += 1,
                OperationOutcome::Updated => tally.updated += 1,
                OperationOutcome::Replaced => tally.replaced += 1,
                OperationOutcome::Deleted => tally.deleted += 1,
                OperationOutcome::Unchanged => tally.unchanged += 1,
                OperationOutcome::Failed { .. } => tally.failed += 1,
                OperationOutcome::Skipped { .. } => tally.skipped += 1,
                OperationOutcome::Cancelled => tally.cancelled += 1,
            }
        }
        tally
    }

    fn format(&self, style: TextStyle) -> String {
        let mut parts = Vec::new();
        if self.created > 0 {
            parts.push(style.label(Tone::Add, &format!("{} created", self.created)));
        }
        if self.updated > 0 {
            parts.push(style.label(Tone::Change, &format!("{} updated", self.updated)));
        }
        if self.replaced > 0 {
            parts.push(style.label(Tone::Replace, &format!("{} replaced", self.replaced)));
        }
        if self.deleted > 0 {
            parts.push(style.label(Tone::Delete, &format!("{} deleted", self.deleted)));
        }
        if self.failed > 0 {
            parts.push(style.label(Tone::Failed, &format!("{} failed", self.failed)));
        }
        if self.skipped > 0 {
            parts.push(style.label(Tone::Skipped, &format!("{} skipped", self.skipped)));
        }
        if self.cancelled > 0 {
            parts.push(style.label(Tone::Skipped, &format!("{} cancelled", self.cancelled)));
        }
        if self.unchanged > 0 {
            parts.push(style.dim(&format!("{} unchanged", self.unchanged)));
        }
        if parts.is_empty() {
            format!("{} nothing to do", style.tally_label("Applied:"))
        } else {
            format!("{} {}", style.tally_label("Applied:"), parts.join(", "))
        }
    }
}

// ---------------------------------------------------------------------------
// TextStyle
// ---------------------------------------------------------------------------

const LABEL_WIDTH: usize = 12;

/// Colour family of an action or outcome; symbol and label share it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tone {
    Add,
    Change,
    Replace,
    Delete,
    Failed,
    Skipped,
    Unchanged,
}

impl Tone {
    fn label_style(self) -> Style {
        match self {
            Self::Add => Style::new().green(),
            Self::Change => Style::new().cyan(),
            Self::Replace => Style::new().magenta(),
            Self::Delete | Self::Failed => Style::new().red(),
            Self::Skipped => Style::new().yellow(),
            Self::Unchanged => Style::new().dim(),
        }
    }

    fn symbol_style(self) -> Style {
        match self {
            Self::Unchanged => self.label_style(),
            _ => self.label_style().bold(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct TextStyle {
    color_enabled: bool,
}

impl TextStyle {
    fn new(choice: ColorChoice) -> Self {
        Self {
            color_enabled: should_color(choice),
        }
    }

    fn paint<T: std::fmt::Display>(self, style: Style, text: T) -> String {
        if self.color_enabled {
            style.force_styling(true).apply_to(text).to_string()
        } else {
            text.to_string()
        }
    }

    fn pad_label(painted: &str) -> String {
        let visible_len = console::measure_text_width(painted);
        if visible_len < LABEL_WIDTH {
            format!("{painted}{}", " ".repeat(LABEL_WIDTH - visible_len))
        } else {
            format!("{painted} ")
        }
    }

    fn symbol(self, tone: Tone, s: &str) -> String {
        self.paint(tone.symbol_style(), s)
    }

    fn label(self, tone: Tone, s: &str) -> String {
        self.paint(tone.label_style(), s)
    }

    fn primary_text(self, s: &str) -> String {
        self.paint(Style::new().white(), s)
    }

    fn dim(self, s: &str) -> String {
        self.paint(Style::new().dim(), s)
    }

    fn error_detail(self, s: &str) -> String {
        self.paint(Style::new().red(), s)
    }

    fn header_command(self, s: &str) -> String {
        self.paint(Style::new().white().bold(), s)
    }

    fn warn_prefix(self, s: &str) -> String {
        self.paint(Style::new().yellow().bold(), s)
    }

    fn error_prefix(self, s: &str) -> String {
        self.paint(Style::new().red().bold(), s)
    }

    fn tally_label(self, s: &str) -> String {
        self.paint(Style::new().white().bold(), s)
    }
}

fn should_color(choice: ColorChoice) -> bool {
    match choice {
        ColorChoice::Always => true,
        ColorChoice::Never => false,
        ColorChoice::Auto => io::stdout().is_terminal(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
