use super::{BUILD_FLAGS, BuildBackend, BuildResult, OutputTail};
use crate::display::{LineStyle, RollingDisplay};
use crate::error::{BuildError, Result};
use sprout_core::{BackendKind, ResolvedImage};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;

const NIX_CONFIG: &str = "cores = 0\n\
max-jobs = auto\n\
substituters = https://cache.nixos.org\n\
trusted-public-keys = cache.nixos.org-1:6NCHdD59X431o0gWypbMrAURkbJ16ZPMQFGspcDShjY=";

/// ホストのツールチェーンでビルドする
#[derive(Debug, Clone)]
pub struct LocalBackend {
    program: PathBuf,
}

impl LocalBackend {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl BuildBackend for LocalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    async fn execute(
        &self,
        input: &Path,
        _images: &[ResolvedImage],
        display: &RollingDisplay,
    ) -> Result<BuildResult> {
        tracing::info!(program = %self.program.display(), input = %input.display(), "Starting local build");

        let mut child = Command::new(&self.program)
            .args(BUILD_FLAGS)
            .arg(input)
            .env("NIX_BUILD_CORES", "0")
            .env("NIX_CONFIG", NIX_CONFIG)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("stdout was not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| std::io::Error::other("stderr was not captured"))?;

        let tail = Mutex::new(OutputTail::default());
        let (last_line, drained, status) = tokio::join!(
            collect_stdout(stdout, display, &tail),
            forward_stderr(stderr, display, &tail),
            child.wait(),
        );
        let status = status?;
        let last_line = last_line?;
        drained?;

        let diagnostics = tail.lock().map(|t| t.render()).unwrap_or_default();
        if !status.success() {
            return Err(BuildError::BuildFailed {
                backend: BackendKind::Local,
                message: format!("{} exited with {}", self.program.display(), status),
                diagnostics,
            });
        }

        let reported = last_line.ok_or(BuildError::Extraction {
            backend: BackendKind::Local,
            diagnostics,
        })?;
        tracing::info!(path = %reported, "Local build finished");
        Ok(BuildResult::new(BackendKind::Local, reported))
    }
}

/// 標準出力を読み切り、最後の空でない行を返す
async fn collect_stdout<R: AsyncRead + Unpin>(
    reader: R,
    display: &RollingDisplay,
    tail: &Mutex<OutputTail>,
) -> std::io::Result<Option<String>> {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut last = None;
    while let Some(line) = next_line(&mut reader, &mut buf).await? {
        display.push(&line, LineStyle::Stdout);
        if let Ok(mut tail) = tail.lock() {
            tail.push(&line);
        }
        last = Some(line);
    }
    Ok(last)
}

async fn forward_stderr<R: AsyncRead + Unpin>(
    reader: R,
    display: &RollingDisplay,
    tail: &Mutex<OutputTail>,
) -> std::io::Result<()> {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    while let Some(line) = next_line(&mut reader, &mut buf).await? {
        display.push(&line, LineStyle::Stderr);
        if let Ok(mut tail) = tail.lock() {
            tail.push(&line);
        }
    }
    Ok(())
}

/// 次の空でない行を読む（UTF-8 として不正なバイトは置換文字にする）
async fn next_line<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    buf: &mut Vec<u8>,
) -> std::io::Result<Option<String>> {
    loop {
        buf.clear();
        if reader.read_until(b'\n', buf).await? == 0 {
            return Ok(None);
        }
        let line = String::from_utf8_lossy(buf);
        let line = line.trim();
        if !line.is_empty() {
            return Ok(Some(line.to_string()));
        }
    }
}
