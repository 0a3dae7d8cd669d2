//! Build context and output framing for a sandboxed Go program.

use crate::error::SandboxError;
use std::{path::Path, time::Duration};
use tempfile::TempDir;
use tokio::time::Instant;

pub const START_MARKER: &str = "START_EXECUTION";
pub const END_MARKER: &str = "END_EXECUTION";

/// Mount point of the build context inside the container.
pub const WORKDIR: &str = "/code";
pub const SOURCE_FILE: &str = "code.go";
pub const SETUP_FILE: &str = "setup.sh";

/// Resolves dependencies first so only the program itself runs between the markers.
const SETUP_SCRIPT: &str = r#"#!/bin/sh
cd /code || exit 1
go mod init code >/dev/null 2>&1
go mod tidy >/dev/null 2>&1
echo "START_EXECUTION"
go run code.go 2>&1 || {
    status=$?
    echo "program failed with exit code $status"
    exit 1
}
echo "END_EXECUTION"
"#;

/// Temporary directory holding the user source and the setup script.
/// Deleted when dropped.
pub struct BuildContext {
    dir: TempDir,
}

impl BuildContext {
    pub fn prepare(source: &[u8]) -> Result<Self, SandboxError> {
        let dir = tempfile::Builder::new().prefix("keeper-sandbox-").tempdir()?;
        std::fs::write(dir.path().join(SOURCE_FILE), source)?;

        let setup = dir.path().join(SETUP_FILE);
        std::fs::write(&setup, SETUP_SCRIPT)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&setup, std::fs::Permissions::from_mode(0o755))?;
        }

        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn bind(&self) -> String {
        format!("{}:{}", self.dir.path().display(), WORKDIR)
    }

    pub fn command() -> Vec<String> {
        vec!["sh".to_string(), format!("{}/{}", WORKDIR, SETUP_FILE)]
    }
}

/// Accumulates container log chunks and keeps the lines between the markers.
#[derive(Debug, Default)]
pub struct LogCapture {
    started_at: Option<Instant>,
    finished_at: Option<Instant>,
    lines: Vec<String>,
    partial: String,
}

impl LogCapture {
    pub fn push_chunk(&mut self, chunk: &str, now: Instant) {
        self.partial.push_str(chunk);
        while let Some(pos) = self.partial.find('\n') {
            let line: String = self.partial.drain(..=pos).collect();
            self.push_line(line.trim_end_matches(['\n', '\r']), now);
        }
    }

    /// Flush a trailing line without newline.
    pub fn finish(mut self, now: Instant) -> Self {
        if !self.partial.is_empty() {
            let line = std::mem::take(&mut self.partial);
            self.push_line(line.trim_end_matches('\r'), now);
        }
        self
    }

    fn push_line(&mut self, line: &str, now: Instant) {
        if self.started_at.is_none() {
            if line.contains(START_MARKER) {
                self.started_at = Some(now);
            }
            return;
        }
        if self.finished_at.is_some() {
            return;
        }
        if line.contains(END_MARKER) {
            self.finished_at = Some(now);
            return;
        }
        self.lines.push(line.to_string());
    }

    pub fn output(&self) -> String {
        self.lines.join("\n")
    }

    /// Time between the markers, when both were seen.
    pub fn execution_time(&self) -> Option<Duration> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some(end.saturating_duration_since(start)),
            _ => None,
        }
    }
}

/// Reads a condition verdict from script output.
///
/// `Condition satisfied: true|false` lines win; otherwise a JSON object with a
/// boolean `satisfied` field. Anything else is not satisfied.
pub fn condition_status(output: &str) -> bool {
    for line in output.lines() {
        if line.contains("Condition satisfied: true") {
            return true;
        }
        if line.contains("Condition satisfied: false") {
            return false;
        }
    }

    serde_json::from_str::<serde_json::Value>(output.trim())
        .ok()
        .and_then(|value| value.get("satisfied").and_then(|v| v.as_bool()))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_keeps_only_lines_between_markers() {
        let t0 = Instant::now();
        let mut capture = LogCapture::default();
        capture.push_chunk("go: downloading deps\nSTART_EXEC", t0);
        capture.push_chunk("UTION\nhello\nwor", t0 + Duration::from_secs(1));
        capture.push_chunk("ld\r\nEND_EXECUTION\ntrailing\n", t0 + Duration::from_secs(3));
        let capture = capture.finish(t0 + Duration::from_secs(4));

        assert_eq!(capture.output(), "hello\nworld");
        assert_eq!(capture.execution_time(), Some(Duration::from_secs(2)));
    }

    #[test]
    fn capture_without_end_marker_has_no_timing() {
        let mut capture = LogCapture::default();
        capture.push_chunk("START_EXECUTION\npartial", Instant::now());
        let capture = capture.finish(Instant::now());
        assert_eq!(capture.output(), "partial");
        assert_eq!(capture.execution_time(), None);
    }

    #[test]
    fn condition_lines_and_json() {
        assert!(condition_status("checking\nCondition satisfied: true\n"));
        assert!(!condition_status("Condition satisfied: false"));
        assert!(condition_status(r#"{"satisfied": true, "value": 3}"#));
        assert!(!condition_status(r#"{"satisfied": "yes"}"#));
        assert!(!condition_status("nothing to see"));
    }

    #[test]
    fn build_context_is_removed_on_drop() -> anyhow::Result<()> {
        let context = BuildContext::prepare(b"package main\nfunc main() {}\n")?;
        let root = context.path().to_path_buf();
        assert!(root.join(SOURCE_FILE).exists());
        assert!(root.join(SETUP_FILE).exists());
        assert!(context.bind().ends_with(":/code"));

        drop(context);
        assert!(!root.exists());
        Ok(())
    }
}
