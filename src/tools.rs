//! External tool invocation.
//!
//! Every tool run is an argument vector handed straight to the process.
//! No shell is involved, so uploaded file names and layer names never reach
//! a command interpreter.

use serde::Serialize;
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

/// How often a running child is polled for exit.
const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Longest stderr excerpt kept in error messages.
const STDERR_EXCERPT_CHARS: usize = 2000;

/// External programs the compositor knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Tool {
    Ghostscript,
    #[serde(rename = "imagemagick")]
    ImageMagick,
    /// ImageMagick 6 `convert`, used when `magick` is not installed.
    #[serde(rename = "imagemagick_legacy")]
    ImageMagickLegacy,
    Qpdf,
    Pdftk,
}

impl Tool {
    pub const ALL: [Tool; 5] = [
        Tool::Ghostscript,
        Tool::ImageMagick,
        Tool::ImageMagickLegacy,
        Tool::Qpdf,
        Tool::Pdftk,
    ];

    /// Flag that makes the tool print its version and exit.
    pub fn version_flag(self) -> &'static str {
        match self {
            Tool::ImageMagick | Tool::ImageMagickLegacy => "-version",
            Tool::Ghostscript | Tool::Qpdf | Tool::Pdftk => "--version",
        }
    }
}

impl fmt::Display for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tool::Ghostscript => write!(f, "ghostscript"),
            Tool::ImageMagick => write!(f, "imagemagick"),
            Tool::ImageMagickLegacy => write!(f, "imagemagick_legacy"),
            Tool::Qpdf => write!(f, "qpdf"),
            Tool::Pdftk => write!(f, "pdftk"),
        }
    }
}

/// Binary name or path for each tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolPaths {
    pub ghostscript: String,
    pub magick: String,
    pub convert: String,
    pub qpdf: String,
    pub pdftk: String,
}

impl ToolPaths {
    pub fn program(&self, tool: Tool) -> &str {
        match tool {
            Tool::Ghostscript => &self.ghostscript,
            Tool::ImageMagick => &self.magick,
            Tool::ImageMagickLegacy => &self.convert,
            Tool::Qpdf => &self.qpdf,
            Tool::Pdftk => &self.pdftk,
        }
    }
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            ghostscript: "gs".to_string(),
            magick: "magick".to_string(),
            convert: "convert".to_string(),
            qpdf: "qpdf".to_string(),
            pdftk: "pdftk".to_string(),
        }
    }
}

/// A single external process run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub tool: Tool,
    pub program: String,
    pub args: Vec<OsString>,
    pub timeout: Duration,
}

impl Invocation {
    pub fn new(tool: Tool, program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            tool,
            program: program.into(),
            args: Vec::new(),
            timeout,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    /// Appends `prefix` immediately followed by `value`, e.g. `-sOutputFile=/tmp/x.pdf`.
    pub fn joined_arg(mut self, prefix: &str, value: impl AsRef<OsStr>) -> Self {
        let mut joined = OsString::from(prefix);
        joined.push(value.as_ref());
        self.args.push(joined);
        self
    }

    /// Arguments as lossy UTF-8, for logs and assertions.
    pub fn args_lossy(&self) -> Vec<String> {
        self.args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    /// Same invocation aimed at a different tool binary.
    pub fn retarget(&self, tool: Tool, program: impl Into<String>) -> Self {
        Self {
            tool,
            program: program.into(),
            args: self.args.clone(),
            timeout: self.timeout,
        }
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// Captured result of a successful run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("{tool} not found: '{program}' is not installed or not on PATH")]
    NotFound { tool: Tool, program: String },

    #[error("{tool} exited with {}: {stderr}", exit_label(.code))]
    Failed {
        tool: Tool,
        code: Option<i32>,
        stderr: String,
    },

    #[error("{tool} timed out after {}s", .timeout.as_secs())]
    TimedOut { tool: Tool, timeout: Duration },

    #[error("{tool} I/O error: {source}")]
    Io {
        tool: Tool,
        #[source]
        source: io::Error,
    },
}

impl ToolError {
    pub fn tool(&self) -> Tool {
        match self {
            ToolError::NotFound { tool, .. }
            | ToolError::Failed { tool, .. }
            | ToolError::TimedOut { tool, .. }
            | ToolError::Io { tool, .. } => *tool,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ToolError::NotFound { .. })
    }
}

fn exit_label(code: &Option<i32>) -> String {
    code.map_or_else(|| "signal".to_string(), |c| format!("code {}", c))
}

/// Runs external tools. The seam between the compositor and the OS.
#[cfg_attr(test, mockall::automock)]
pub trait ToolRunner: Send + Sync {
    fn run(&self, invocation: &Invocation) -> Result<ToolOutput, ToolError>;
}

/// Runs tools as child processes, blocking the calling thread.
///
/// Output is captured into anonymous temporary files rather than pipes so a
/// chatty tool can never stall on a full pipe buffer while being polled.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        Self
    }
}

impl ToolRunner for ProcessRunner {
    fn run(&self, invocation: &Invocation) -> Result<ToolOutput, ToolError> {
        let tool = invocation.tool;
        let io_err = |source: io::Error| ToolError::Io { tool, source };

        debug!(tool = %tool, command = %invocation, "Running external tool");

        let mut stdout = tempfile::tempfile().map_err(io_err)?;
        let mut stderr = tempfile::tempfile().map_err(io_err)?;

        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout.try_clone().map_err(io_err)?))
            .stderr(Stdio::from(stderr.try_clone().map_err(io_err)?));

        // Own process group, so a timeout also reaches helpers the tool
        // spawned (ImageMagick runs Ghostscript to read PDFs).
        #[cfg(unix)]
        std::os::unix::process::CommandExt::process_group(&mut command, 0);

        let spawned = command.spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ToolError::NotFound {
                    tool,
                    program: invocation.program.clone(),
                });
            }
            Err(e) => return Err(io_err(e)),
        };

        let started = Instant::now();
        let status = loop {
            if let Some(status) = child.try_wait().map_err(io_err)? {
                break status;
            }
            if started.elapsed() >= invocation.timeout {
                warn!(tool = %tool, timeout_secs = invocation.timeout.as_secs(), "Killing tool after timeout");
                kill_process_group(child.id());
                let _ = child.kill();
                let _ = child.wait();
                return Err(ToolError::TimedOut {
                    tool,
                    timeout: invocation.timeout,
                });
            }
            std::thread::sleep(POLL_INTERVAL);
        };
        let duration = started.elapsed();

        let stdout = read_captured(&mut stdout).map_err(io_err)?;
        let stderr = read_captured(&mut stderr).map_err(io_err)?;

        if !status.success() {
            return Err(ToolError::Failed {
                tool,
                code: status.code(),
                stderr: excerpt(&stderr),
            });
        }

        debug!(tool = %tool, duration_ms = duration.as_millis() as u64, "Tool finished");

        Ok(ToolOutput {
            stdout,
            stderr,
            duration,
        })
    }
}

/// Sends SIGKILL to the process group led by `pid`.
#[cfg(unix)]
fn kill_process_group(pid: u32) {
    let status = Command::new("sh")
        .arg("-c")
        .arg(format!("kill -KILL -- -{}", pid))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    if let Err(e) = status {
        warn!(pid, error = %e, "Could not signal tool process group");
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) {}

fn read_captured(file: &mut File) -> io::Result<String> {
    file.seek(SeekFrom::Start(0))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Keeps the tail of a tool's stderr, where the actual error usually is.
fn excerpt(stderr: &str) -> String {
    let trimmed = stderr.trim();
    let count = trimmed.chars().count();
    if count <= STDERR_EXCERPT_CHARS {
        return trimmed.to_string();
    }
    let tail: String = trimmed.chars().skip(count - STDERR_EXCERPT_CHARS).collect();
    format!("...{}", tail)
}

/// Availability of one tool on this host.
#[derive(Debug, Clone, Serialize)]
pub struct ToolStatus {
    pub tool: Tool,
    pub program: String,
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Runs the tool's version flag to see whether it is usable.
pub fn probe(runner: &dyn ToolRunner, paths: &ToolPaths, tool: Tool, timeout: Duration) -> ToolStatus {
    let program = paths.program(tool).to_string();
    let invocation = Invocation::new(tool, program.clone(), timeout).arg(tool.version_flag());

    match runner.run(&invocation) {
        Ok(output) => {
            let banner = if output.stdout.trim().is_empty() {
                &output.stderr
            } else {
                &output.stdout
            };
            ToolStatus {
                tool,
                program,
                available: true,
                version: banner
                    .lines()
                    .map(str::trim)
                    .find(|l| !l.is_empty())
                    .map(str::to_string),
                error: None,
            }
        }
        Err(e) => ToolStatus {
            tool,
            program,
            available: false,
            version: None,
            error: Some(e.to_string()),
        },
    }
}

/// Probes every known tool.
pub fn probe_all(runner: &dyn ToolRunner, paths: &ToolPaths, timeout: Duration) -> Vec<ToolStatus> {
    Tool::ALL
        .iter()
        .map(|&tool| probe(runner, paths, tool, timeout))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sh(script: &str, timeout: Duration) -> Invocation {
        Invocation::new(Tool::Ghostscript, "sh", timeout)
            .arg("-c")
            .arg(script)
    }

    #[test]
    fn test_invocation_builder() {
        let invocation = Invocation::new(Tool::Ghostscript, "gs", Duration::from_secs(5))
            .arg("-dBATCH")
            .joined_arg("-sOutputFile=", "/tmp/out file.pdf")
            .arg("/tmp/in.pdf");

        assert_eq!(
            invocation.args_lossy(),
            vec!["-dBATCH", "-sOutputFile=/tmp/out file.pdf", "/tmp/in.pdf"]
        );
        assert_eq!(
            invocation.to_string(),
            "gs -dBATCH -sOutputFile=/tmp/out file.pdf /tmp/in.pdf"
        );
    }

    #[test]
    fn test_retarget_keeps_args() {
        let invocation = Invocation::new(Tool::ImageMagick, "magick", Duration::from_secs(5))
            .arg("a.png")
            .arg("b.pdf");
        let legacy = invocation.retarget(Tool::ImageMagickLegacy, "convert");

        assert_eq!(legacy.tool, Tool::ImageMagickLegacy);
        assert_eq!(legacy.program, "convert");
        assert_eq!(legacy.args, invocation.args);
    }

    #[cfg(unix)]
    #[test]
    fn test_process_runner_captures_output() {
        let output = ProcessRunner::new()
            .run(&sh("echo hello; echo oops >&2", Duration::from_secs(10)))
            .unwrap();

        assert_eq!(output.stdout.trim(), "hello");
        assert_eq!(output.stderr.trim(), "oops");
    }

    #[cfg(unix)]
    #[test]
    fn test_process_runner_reports_exit_code() {
        let err = ProcessRunner::new()
            .run(&sh("echo broken page >&2; exit 3", Duration::from_secs(10)))
            .unwrap_err();

        match err {
            ToolError::Failed { code, stderr, .. } => {
                assert_eq!(code, Some(3));
                assert_eq!(stderr, "broken page");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_process_runner_missing_binary() {
        let invocation = Invocation::new(
            Tool::Pdftk,
            "definitely-not-a-real-pdf-tool",
            Duration::from_secs(5),
        );
        let err = ProcessRunner::new().run(&invocation).unwrap_err();

        assert!(err.is_not_found());
        assert_eq!(err.tool(), Tool::Pdftk);
    }

    #[cfg(unix)]
    #[test]
    fn test_process_runner_timeout() {
        let started = Instant::now();
        let err = ProcessRunner::new()
            .run(&sh("sleep 10", Duration::from_millis(200)))
            .unwrap_err();

        assert!(matches!(err, ToolError::TimedOut { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_timeout_kills_spawned_helpers() {
        let dir = tempfile::TempDir::new().unwrap();
        let pid_file = dir.path().join("helper.pid");
        let script = format!("sleep 30 & echo $! > '{}'; wait", pid_file.display());

        let err = ProcessRunner::new()
            .run(&sh(&script, Duration::from_millis(300)))
            .unwrap_err();
        assert!(matches!(err, ToolError::TimedOut { .. }));

        let pid = std::fs::read_to_string(&pid_file).unwrap().trim().to_string();
        let stat = std::path::PathBuf::from(format!("/proc/{}/stat", pid));
        let deadline = Instant::now() + Duration::from_secs(3);
        let gone = loop {
            // A killed helper is either reaped or left as a zombie.
            let alive = std::fs::read_to_string(&stat)
                .map(|s| !s.contains(") Z "))
                .unwrap_or(false);
            if !alive {
                break true;
            }
            if Instant::now() >= deadline {
                break false;
            }
            std::thread::sleep(Duration::from_millis(50));
        };
        assert!(gone, "helper process {} outlived the timeout", pid);
    }

    #[test]
    fn test_serialized_names_match_display() {
        for tool in Tool::ALL {
            assert_eq!(serde_json::to_value(tool).unwrap(), serde_json::json!(tool.to_string()));
        }
        assert_eq!(serde_json::to_value(Tool::ImageMagick).unwrap(), "imagemagick");
    }

    #[test]
    fn test_excerpt_keeps_tail() {
        let long = format!("{}END", "x".repeat(5000));
        let cut = excerpt(&long);

        assert!(cut.starts_with("..."));
        assert!(cut.ends_with("END"));
        assert_eq!(cut.chars().count(), STDERR_EXCERPT_CHARS + 3);
    }

    #[test]
    fn test_probe_reads_first_banner_line() {
        let mut runner = MockToolRunner::new();
        runner
            .expect_run()
            .withf(|inv| inv.program == "qpdf" && inv.args_lossy() == vec!["--version"])
            .returning(|_| {
                Ok(ToolOutput {
                    stdout: "\nqpdf version 11.9.0\nRun qpdf --copyright\n".to_string(),
                    ..Default::default()
                })
            });

        let status = probe(&runner, &ToolPaths::default(), Tool::Qpdf, Duration::from_secs(5));

        assert!(status.available);
        assert_eq!(status.version.as_deref(), Some("qpdf version 11.9.0"));
    }

    #[test]
    fn test_probe_unavailable_tool() {
        let mut runner = MockToolRunner::new();
        runner.expect_run().returning(|inv| {
            Err(ToolError::NotFound {
                tool: inv.tool,
                program: inv.program.clone(),
            })
        });

        let statuses = probe_all(&runner, &ToolPaths::default(), Duration::from_secs(5));

        assert_eq!(statuses.len(), Tool::ALL.len());
        assert!(statuses.iter().all(|s| !s.available && s.error.is_some()));
    }
}
