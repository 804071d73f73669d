//! External backend: ImageMagick on the command line.
//!
//! The tool is spawned directly (no shell), so paths are passed as single
//! arguments and never re-parsed. A path beginning with `-` is prefixed with
//! `./` so the tool cannot mistake it for an option.
//!
//! The primary command (`magick`, ImageMagick 7) is tried first. On a non-zero
//! exit, or when it leaves no output, the legacy command (`convert`,
//! ImageMagick 6) is tried once. Combined stdout and stderr of the last
//! attempt is kept for the failure message.

use super::backend::{BackendError, Capability, ConversionBackend};
use super::format::TargetFormat;
use super::params::ConversionParams;
use std::borrow::Cow;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

/// How often a running tool is polled for exit.
const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Diagnostic output is truncated to this many bytes.
const MAX_CAPTURE: usize = 4096;

pub struct ExternalBackend {
    primary: String,
    legacy: String,
    timeout: Duration,
}

impl ExternalBackend {
    pub fn new(primary: impl Into<String>, legacy: impl Into<String>, timeout: Duration) -> Self {
        Self {
            primary: primary.into(),
            legacy: legacy.into(),
            timeout,
        }
    }

    /// Commands that resolve to an executable on `PATH`, primary first.
    fn available_commands(&self) -> Vec<&str> {
        [self.primary.as_str(), self.legacy.as_str()]
            .into_iter()
            .filter(|cmd| !cmd.is_empty() && which::which(cmd).is_ok())
            .collect()
    }
}

impl Default for ExternalBackend {
    fn default() -> Self {
        Self::new("magick", "convert", Duration::from_secs(120))
    }
}

/// Make a path safe to pass as a positional argument.
pub fn safe_path_arg(path: &Path) -> Cow<'_, str> {
    let s = path.to_string_lossy();
    if s.starts_with('-') {
        Cow::Owned(format!("./{}", s))
    } else {
        s
    }
}

/// Argument vector for one conversion: `SRC -quality Q FMT:DEST`.
///
/// The explicit `FMT:` prefix selects the encoder regardless of the
/// destination's extension.
pub fn build_args(params: &ConversionParams) -> Vec<String> {
    vec![
        safe_path_arg(&params.source).into_owned(),
        "-quality".to_string(),
        params.quality.value().to_string(),
        format!(
            "{}:{}",
            params.format.extension(),
            safe_path_arg(&params.output)
        ),
    ]
}

/// Outcome of one tool invocation.
#[derive(Debug)]
struct RunResult {
    success: bool,
    output: String,
}

/// Run `program args…` with a wall-clock bound, capturing stdout and stderr
/// into one buffer.
///
/// Both streams share a single temporary file, so the capture keeps their
/// interleaving and a chatty tool can never block on a full pipe.
fn run_with_timeout(
    program: &str,
    args: &[String],
    timeout: Duration,
) -> Result<RunResult, BackendError> {
    let mut capture = tempfile::tempfile()?;
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(capture.try_clone()?)
        .stderr(capture.try_clone()?)
        .spawn()?;

    let started = Instant::now();
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break Some(status);
        }
        if started.elapsed() >= timeout {
            let _ = child.kill();
            let _ = child.wait();
            break None;
        }
        std::thread::sleep(POLL_INTERVAL);
    };

    capture.seek(SeekFrom::Start(0))?;
    let mut raw = Vec::new();
    capture.take(MAX_CAPTURE as u64).read_to_end(&mut raw)?;
    let mut output = String::from_utf8_lossy(&raw).trim().to_string();

    match status {
        Some(status) => Ok(RunResult {
            success: status.success(),
            output,
        }),
        None => {
            output.push_str(&format!(" [killed after {}s]", timeout.as_secs()));
            Ok(RunResult {
                success: false,
                output,
            })
        }
    }
}

fn has_output(path: &Path) -> bool {
    std::fs::metadata(path).is_ok_and(|m| m.len() > 0)
}

impl ConversionBackend for ExternalBackend {
    fn capability(&self) -> Capability {
        Capability::External
    }

    fn supports(&self, _format: TargetFormat) -> bool {
        !self.available_commands().is_empty()
    }

    fn convert(&self, params: &ConversionParams) -> Result<(), BackendError> {
        let commands = self.available_commands();
        if commands.is_empty() {
            return Err(BackendError::ProcessingFailed(format!(
                "neither `{}` nor `{}` found on PATH",
                self.primary, self.legacy
            )));
        }

        let args = build_args(params);
        let mut last_output = String::new();
        for program in commands {
            tracing::debug!(program, ?args, "running external converter");
            let run = run_with_timeout(program, &args, self.timeout)?;
            if run.success && has_output(&params.output) {
                return Ok(());
            }
            tracing::debug!(program, output = %run.output, "external converter attempt failed");
            last_output = format!("{program}: {}", run.output);
        }

        Err(BackendError::ProcessingFailed(last_output))
    }
}
