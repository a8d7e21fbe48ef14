//! External process execution for opensite.
//!
//! Every heavyweight spatial transformation in the build pipeline is
//! delegated to a command-line tool: `ogr2ogr` moves data in and out of
//! PostGIS, and `osm-export-tool` turns raw OSM extracts into GeoPackage
//! files. This crate wraps those invocations with output capture, optional
//! timeouts, and PATH probing.
//!
//! # Example
//!
//! ```ignore
//! use opensite_process::{run_tool, tool_exists};
//!
//! if tool_exists("ogr2ogr") {
//!     let out = run_tool("ogr2ogr", &["--version"]).expect("run");
//!     assert!(out.success());
//! }
//! ```

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Captured result of a tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutput {
    /// Exit code (or -1 when not available, e.g. killed by signal).
    pub exit_code: i32,
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
    /// Whether execution exceeded the timeout and was killed.
    pub timed_out: bool,
    /// Total wall-clock duration.
    pub duration_ms: u64,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }

    /// Convert to a `Result`, surfacing stderr on failure.
    pub fn ok(&self) -> Result<&Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(anyhow::anyhow!(
                "command failed with exit code {}: {}",
                self.exit_code,
                self.stderr.trim()
            ))
        }
    }

    fn from_output(output: &Output, duration: Duration) -> Self {
        Self {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            timed_out: false,
            duration_ms: duration.as_millis() as u64,
        }
    }
}

/// Run a tool and capture its output.
pub fn run_tool(program: &str, args: &[&str]) -> Result<ToolOutput> {
    let start = Instant::now();

    let output = Command::new(program)
        .args(args)
        .output()
        .with_context(|| format!("failed to run command: {program} {args:?}"))?;

    Ok(ToolOutput::from_output(&output, start.elapsed()))
}

/// Run a tool in a specific working directory.
pub fn run_tool_in_dir(program: &str, args: &[&str], dir: &Path) -> Result<ToolOutput> {
    let start = Instant::now();

    let output = Command::new(program)
        .args(args)
        .current_dir(dir)
        .output()
        .with_context(|| {
            format!(
                "failed to run command: {program} {args:?} in {}",
                dir.display()
            )
        })?;

    Ok(ToolOutput::from_output(&output, start.elapsed()))
}

/// Run a tool with an optional wall-clock timeout.
///
/// Without a timeout this delegates to [`run_tool_in_dir`]. With one, the
/// child is polled and killed once the deadline passes; the partial output
/// is returned with `timed_out` set.
pub fn run_tool_with_timeout(
    program: &str,
    args: &[&str],
    working_dir: &Path,
    timeout: Option<Duration>,
) -> Result<ToolOutput> {
    let start = Instant::now();

    let Some(timeout_dur) = timeout else {
        return run_tool_in_dir(program, args, working_dir);
    };

    let mut command = Command::new(program);
    command
        .args(args)
        .current_dir(working_dir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = command
        .spawn()
        .with_context(|| format!("failed to spawn command: {program}"))?;

    let deadline = Instant::now() + timeout_dur;
    loop {
        match child
            .try_wait()
            .with_context(|| format!("failed to poll command: {program}"))?
        {
            Some(status) => {
                return Ok(ToolOutput {
                    exit_code: status.code().unwrap_or(-1),
                    stdout: read_pipe(child.stdout.take()),
                    stderr: read_pipe(child.stderr.take()),
                    timed_out: false,
                    duration_ms: start.elapsed().as_millis() as u64,
                });
            }
            None => {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();

                    let mut stderr = read_pipe(child.stderr.take());
                    stderr.push_str(&format!(
                        "\n{} timed out after {}",
                        program,
                        humantime::format_duration(timeout_dur)
                    ));

                    return Ok(ToolOutput {
                        exit_code: -1,
                        stdout: read_pipe(child.stdout.take()),
                        stderr,
                        timed_out: true,
                        duration_ms: start.elapsed().as_millis() as u64,
                    });
                }

                std::thread::sleep(Duration::from_millis(100));
            }
        }
    }
}

fn read_pipe<R: Read>(stream: Option<R>) -> String {
    let mut buffer = Vec::new();
    if let Some(mut s) = stream {
        let _ = s.read_to_end(&mut buffer);
    }
    String::from_utf8_lossy(&buffer).to_string()
}

/// Check if a tool exists in PATH.
pub fn tool_exists(program: &str) -> bool {
    which::which(program).is_ok()
}

/// Get the full path to a tool.
pub fn tool_path(program: &str) -> Option<PathBuf> {
    which::which(program).ok()
}

/// Run `ogr2ogr` with the given arguments.
pub fn run_ogr2ogr(args: &[&str]) -> Result<ToolOutput> {
    run_tool("ogr2ogr", args)
}

/// Run `osm-export-tool -m <mapping> <extract> <out_base>`.
///
/// The tool writes `<out_base>.gpkg`; callers are expected to pass a
/// temporary base name and rename the result into place on success.
pub fn run_osm_export_tool(
    mapping_file: &Path,
    extract_file: &Path,
    out_base: &Path,
) -> Result<ToolOutput> {
    let mapping = mapping_file.to_string_lossy();
    let extract = extract_file.to_string_lossy();
    let base = out_base.to_string_lossy();
    run_tool("osm-export-tool", &["-m", &mapping, &extract, &base])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_tool_captures_stdout() {
        let result = run_tool("echo", &["hello"]).expect("run");
        assert!(result.success());
        assert!(result.stdout.contains("hello"));
    }

    #[test]
    fn run_tool_reports_missing_program() {
        let err = run_tool("opensite-no-such-tool-xyz", &[]).expect_err("must fail");
        assert!(format!("{err:#}").contains("failed to run command"));
    }

    #[test]
    fn run_tool_reports_non_zero_exit() {
        let result = run_tool("false", &[]).expect("run");
        assert!(!result.success());
        assert!(result.ok().is_err());
    }

    #[test]
    fn run_tool_in_dir_uses_working_directory() {
        let td = tempfile::tempdir().expect("tempdir");
        let result = run_tool_in_dir("pwd", &[], td.path()).expect("run");
        assert!(result.success());
        assert!(result.stdout.trim().ends_with(
            td.path()
                .file_name()
                .expect("dir name")
                .to_string_lossy()
                .as_ref()
        ));
    }

    #[test]
    fn run_tool_with_timeout_kills_slow_child() {
        let td = tempfile::tempdir().expect("tempdir");
        let result = run_tool_with_timeout(
            "sleep",
            &["5"],
            td.path(),
            Some(Duration::from_millis(200)),
        )
        .expect("run");
        assert!(result.timed_out);
        assert_eq!(result.exit_code, -1);
        assert!(result.stderr.contains("timed out"));
    }

    #[test]
    fn run_tool_with_timeout_passes_fast_child() {
        let td = tempfile::tempdir().expect("tempdir");
        let result =
            run_tool_with_timeout("echo", &["ok"], td.path(), Some(Duration::from_secs(5)))
                .expect("run");
        assert!(!result.timed_out);
        assert!(result.success());
    }

    #[test]
    fn tool_exists_for_shell_builtin_binaries() {
        assert!(tool_exists("echo"));
        assert!(!tool_exists("opensite-no-such-tool-xyz"));
    }

    #[test]
    fn tool_output_serializes() {
        let out = ToolOutput {
            exit_code: 0,
            stdout: "x".to_string(),
            stderr: String::new(),
            timed_out: false,
            duration_ms: 12,
        };
        let json = serde_json::to_string(&out).expect("serialize");
        assert!(json.contains("\"exit_code\":0"));
    }
}
