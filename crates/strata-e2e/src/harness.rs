use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::OnceLock;

use walkdir::WalkDir;

static BUILD_STRATA: OnceLock<Result<(), String>> = OnceLock::new();

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunResult {
    pub command_line: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl RunResult {
    #[must_use]
    pub fn transcript(&self) -> String {
        format!(
            "$ {}\n[exit: {}]\n[stdout]\n{}[stderr]\n{}",
            self.command_line, self.exit_code, self.stdout, self.stderr
        )
    }
}

/// Run the `strata` binary with `args`.
///
/// `NO_PAGER=1` is always set to keep output deterministic for assertions.
///
/// # Errors
///
/// Returns an error if building/running the `strata` binary fails.
pub fn run_strata(args: &[&str], env_overrides: &[(&str, &str)]) -> Result<RunResult, String> {
    ensure_strata_built()?;
    let bin = strata_bin()?;

    let mut command = Command::new(bin);
    command.env("NO_PAGER", "1");
    command.env_remove("RUST_LOG");
    command.args(args);
    for (name, value) in env_overrides {
        command.env(name, value);
    }

    let output = command
        .output()
        .map_err(|error| format!("failed to run strata: {error}"))?;

    let mut command_parts = vec!["strata".to_string()];
    command_parts.extend(args.iter().map(|arg| (*arg).to_string()));

    Ok(RunResult {
        command_line: command_parts.join(" "),
        exit_code: output.status.code().unwrap_or(1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Directory holding the bundled demo stacks and their build contexts.
#[must_use]
pub fn demos_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../demos")
}

/// Copy the demo stacks with their build contexts into `dest`, so a demo can
/// be applied without touching the checked-in tree. Returns the path of the
/// `name` stack inside `dest`.
///
/// # Errors
///
/// Returns an error if the demos cannot be read or copied.
pub fn copy_demos(dest: &Path, name: &str) -> std::io::Result<PathBuf> {
    let source = demos_dir();
    let entries = WalkDir::new(&source)
        .into_iter()
        .filter_entry(|entry| entry.file_name() != ".strata");
    for entry in entries {
        let entry = entry.map_err(std::io::Error::other)?;
        let relative = entry
            .path()
            .strip_prefix(&source)
            .map_err(std::io::Error::other)?;
        let target = dest.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(dest.join(name))
}

/// Write a text file, creating parent directories if needed.
///
/// # Errors
///
/// Returns an error if directories or file contents cannot be written.
pub fn write_file(path: &Path, content: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, content)
}

fn ensure_strata_built() -> Result<(), String> {
    match BUILD_STRATA.get_or_init(|| {
        let status = Command::new("cargo")
            .arg("build")
            .arg("-q")
            .arg("-p")
            .arg("strata")
            .status()
            .map_err(|error| format!("failed to build strata binary: {error}"))?;

        if status.success() {
            Ok(())
        } else {
            Err(format!(
                "failed to build strata binary: cargo exited with status {status}"
            ))
        }
    }) {
        Ok(()) => Ok(()),
        Err(error) => Err(error.clone()),
    }
}

fn strata_bin() -> Result<PathBuf, String> {
    let mut path = std::env::current_exe()
        .map_err(|error| format!("failed to determine current executable: {error}"))?;
    if !path.pop() {
        return Err("failed to resolve test executable directory".to_string());
    }
    if path.ends_with("deps") {
        let _ = path.pop();
    }
    Ok(path.join(format!("strata{}", std::env::consts::EXE_SUFFIX)))
}
