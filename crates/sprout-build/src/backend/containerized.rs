use super::{BUILD_FLAGS, BuildBackend, BuildResult, OutputTail, STORE_PREFIX, TOOLCHAIN_BINARY};
use crate::display::{LineStyle, RollingDisplay};
use crate::engine::{ContainerEngine, ContainerSpec};
use crate::error::{BuildError, Result};
use crate::frame::{StreamKind, read_frame};
use crate::lock::CacheLock;
use sprout_config::SproutPaths;
use sprout_core::{BackendKind, ResolvedImage};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// ツールチェーン入りのイメージ
pub const TOOLCHAIN_IMAGE: &str = "nixos/nix:latest";

const CONTAINER_WORKSPACE: &str = "/workspace";
const CONTAINER_INPUT: &str = "image.nix";
const CONTAINER_CACHE: &str = "/root/.cache/nix";
const CONTAINER_STORE: &str = "/nix";
const WORKDIR_PREFIX: &str = "sprout-docker-";
const CONTAINER_AGENT: &str = "sprout-agent";

const MEMORY_LIMIT: i64 = 4 * 1024 * 1024 * 1024;
const CPU_SHARES: i64 = 1024;

const CONTAINER_PATH: &str = "/root/.nix-profile/bin:/nix/var/nix/profiles/default/bin:/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";
const CONTAINER_NIX_PATH: &str = "nixpkgs=/root/.nix-defexpr/channels/nixpkgs";
const CONTAINER_NIX_CONFIG: &str = "cores = 0\n\
max-jobs = auto\n\
substituters = https://cache.nixos.org https://cache.nixos.org/\n\
trusted-public-keys = cache.nixos.org-1:6NCHdD59X431o0gWypbMrAURkbJ16ZPMQFGspcDShjY=\n\
filter-syscalls = false";

/// 実行中のビルドコンテナ（タイムアウト時の強制削除用）
#[derive(Debug, Default)]
pub struct ContainerTracker {
    active: Mutex<Option<String>>,
}

impl ContainerTracker {
    fn set(&self, id: Option<String>) {
        if let Ok(mut active) = self.active.lock() {
            *active = id;
        }
    }

    pub fn take(&self) -> Option<String> {
        self.active.lock().ok().and_then(|mut active| active.take())
    }
}

/// コンテナ内のツールチェーンでビルドする
pub struct ContainerizedBackend<'a, E> {
    engine: &'a E,
    paths: &'a SproutPaths,
    tracker: &'a ContainerTracker,
    agent: Option<&'a Path>,
}

impl<'a, E: ContainerEngine> ContainerizedBackend<'a, E> {
    pub fn new(engine: &'a E, paths: &'a SproutPaths, tracker: &'a ContainerTracker) -> Self {
        Self {
            engine,
            paths,
            tracker,
            agent: None,
        }
    }

    /// 入力が参照するエージェントのバイナリ（作業ディレクトリへ一緒に置く）
    pub fn with_agent(mut self, agent: Option<&'a Path>) -> Self {
        self.agent = agent;
        self
    }

    /// 作業ディレクトリに入力とアーカイブを置き、入力内のパスをコンテナ内のものに書き換える
    async fn stage(&self, workdir: &Path, input: &Path, images: &[ResolvedImage]) -> Result<()> {
        let mut rendered = tokio::fs::read_to_string(input).await?;

        if let Some(agent) = self.agent {
            tokio::fs::copy(agent, workdir.join(CONTAINER_AGENT)).await?;
            let host_path = agent.display().to_string();
            rendered = rendered.replace(
                &host_path,
                &format!("{CONTAINER_WORKSPACE}/{CONTAINER_AGENT}"),
            );
        }

        for image in images {
            let Some(file_name) = image.archive_file_name() else {
                continue;
            };
            tokio::fs::copy(&image.archive_path, workdir.join(file_name)).await?;
            let host_path = image.archive_path.display().to_string();
            rendered = rendered.replace(&host_path, &format!("{CONTAINER_WORKSPACE}/{file_name}"));
        }

        tokio::fs::write(workdir.join(CONTAINER_INPUT), rendered).await?;
        Ok(())
    }

    fn container_spec(&self, workdir: &Path) -> ContainerSpec {
        let mut cmd = vec![TOOLCHAIN_BINARY.to_string()];
        cmd.extend(BUILD_FLAGS.iter().map(|flag| flag.to_string()));
        cmd.push(format!("{CONTAINER_WORKSPACE}/{CONTAINER_INPUT}"));

        ContainerSpec {
            image: TOOLCHAIN_IMAGE.to_string(),
            cmd,
            env: vec![
                format!("PATH={CONTAINER_PATH}"),
                format!("NIX_PATH={CONTAINER_NIX_PATH}"),
                "NIX_BUILD_CORES=0".to_string(),
                format!("NIX_CONFIG={CONTAINER_NIX_CONFIG}"),
            ],
            working_dir: CONTAINER_WORKSPACE.to_string(),
            mounts: vec![
                (workdir.to_path_buf(), CONTAINER_WORKSPACE.to_string()),
                (self.paths.cache_dir(), CONTAINER_CACHE.to_string()),
                (self.paths.store_dir(), CONTAINER_STORE.to_string()),
            ],
            memory_bytes: MEMORY_LIMIT,
            cpu_shares: CPU_SHARES,
            privileged: true,
            auto_remove: true,
        }
    }

    /// 多重化ログを読み切り、全行を連結して返す
    async fn collect_logs(
        &self,
        id: &str,
        display: &RollingDisplay,
        tail: &Mutex<OutputTail>,
    ) -> std::io::Result<String> {
        let mut reader = self
            .engine
            .log_stream(id)
            .map_err(std::io::Error::other)?;
        let mut accumulated = String::new();
        while let Some(frame) = read_frame(&mut reader).await? {
            let style = match frame.kind {
                StreamKind::Stderr => LineStyle::Stderr,
                _ => LineStyle::Stdout,
            };
            for line in frame.lines() {
                display.push(&line, style);
                if let Ok(mut tail) = tail.lock() {
                    tail.push(&line);
                }
                accumulated.push_str(&line);
                accumulated.push('\n');
            }
        }
        Ok(accumulated)
    }

    /// コンテナ内のストアパスをホスト側のパスにする
    fn host_view(&self, store_path: &str) -> PathBuf {
        match store_path.strip_prefix(CONTAINER_STORE) {
            Some(rest) => self.paths.store_dir().join(rest.trim_start_matches('/')),
            None => PathBuf::from(store_path),
        }
    }
}

impl<E: ContainerEngine> BuildBackend for ContainerizedBackend<'_, E> {
    fn kind(&self) -> BackendKind {
        BackendKind::Containerized
    }

    async fn execute(
        &self,
        input: &Path,
        images: &[ResolvedImage],
        display: &RollingDisplay,
    ) -> Result<BuildResult> {
        let _lock = CacheLock::acquire_async(self.paths.lock_path()).await?;
        self.paths.ensure_persistent_dirs()?;

        // 作業ディレクトリはどの経路でも drop 時に削除される
        let workdir = tempfile::Builder::new()
            .prefix(WORKDIR_PREFIX)
            .tempdir_in(self.paths.workspace_root())?;
        self.stage(workdir.path(), input, images).await?;

        let spec = self.container_spec(workdir.path());
        let id = self.engine.run_container(&spec).await?;
        self.tracker.set(Some(id.clone()));
        tracing::info!(container = %id, image = TOOLCHAIN_IMAGE, "Started containerized build");

        let tail = Mutex::new(OutputTail::default());
        let (logs, exit) = tokio::join!(
            self.collect_logs(&id, display, &tail),
            self.engine.wait_container(&id),
        );
        self.tracker.set(None);

        let diagnostics = tail.lock().map(|t| t.render()).unwrap_or_default();
        let exit_code = exit?;
        let output = logs?;
        if exit_code != 0 {
            return Err(BuildError::BuildFailed {
                backend: BackendKind::Containerized,
                message: format!("build container exited with status {exit_code}"),
                diagnostics,
            });
        }

        let store_path = extract_store_path(&output).ok_or(BuildError::Extraction {
            backend: BackendKind::Containerized,
            diagnostics,
        })?;
        let host_path = self.host_view(store_path);
        tracing::info!(store_path = %store_path, host_path = %host_path.display(), "Containerized build finished");

        Ok(BuildResult::new(
            BackendKind::Containerized,
            host_path.display().to_string(),
        ))
    }
}

/// 出力を末尾から走査し、最初に見つかったストアパスの行を返す
pub fn extract_store_path(output: &str) -> Option<&str> {
    output
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| line.starts_with(STORE_PREFIX))
}
