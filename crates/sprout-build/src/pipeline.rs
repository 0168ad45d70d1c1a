//! 設定の読み込みからイメージの書き出しまでを順に実行する

use crate::backend::{
    BackendChoice, BackendSelector, BuildBackend, ContainerTracker, ContainerizedBackend,
    LocalBackend, SelectedBackend,
};
use crate::delivery::{DeliveryReport, OutputDelivery};
use crate::display::RollingDisplay;
use crate::embedder::{EmbeddedImage, ImageEmbedder, remove_archives};
use crate::engine::ContainerEngine;
use crate::error::{BuildError, Phase, PhaseExt, PipelineError};
use crate::locator::ArtifactLocator;
use sprout_config::SproutPaths;
use sprout_core::{BackendKind, ConfigLoader, TemplateRenderer};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// 実行全体の制限時間
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60 * 60);

const RUN_STAGING_PREFIX: &str = "run-";

/// 成功したビルドの結果
#[derive(Debug, Clone)]
pub struct BuildSummary {
    pub backend: BackendKind,
    pub images: Vec<EmbeddedImage>,
    pub artifact: PathBuf,
    pub delivery: DeliveryReport,
    pub build_elapsed: Duration,
}

pub struct Pipeline<'a, E> {
    engine: &'a E,
    paths: &'a SproutPaths,
    selector: BackendSelector,
    timeout: Duration,
    display: RollingDisplay,
    delivery: OutputDelivery,
    tracker: ContainerTracker,
    phase: Mutex<Phase>,
}

impl<'a, E: ContainerEngine> Pipeline<'a, E> {
    pub fn new(engine: &'a E, paths: &'a SproutPaths) -> Self {
        Self {
            engine,
            paths,
            selector: BackendSelector::from_env(),
            timeout: DEFAULT_TIMEOUT,
            display: RollingDisplay::new(),
            delivery: OutputDelivery::new(),
            tracker: ContainerTracker::default(),
            phase: Mutex::new(Phase::Load),
        }
    }

    pub fn with_selector(mut self, selector: BackendSelector) -> Self {
        self.selector = selector;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_display(mut self, display: RollingDisplay) -> Self {
        self.display = display;
        self
    }

    pub fn with_delivery(mut self, delivery: OutputDelivery) -> Self {
        self.delivery = delivery;
        self
    }

    /// ビルドを実行し、成果物を設定の出力先へ書き出す
    ///
    /// 制限時間を超えると実行中のプロセスやコンテナを止めて失敗します。
    /// アーカイブは実行ごとのディレクトリに置かれ、どの経路でも削除されます。
    pub async fn run(
        &self,
        config_path: &Path,
        invocation_dir: &Path,
        agent_binary: Option<PathBuf>,
    ) -> Result<BuildSummary, PipelineError> {
        let outcome = tokio::time::timeout(
            self.timeout,
            self.run_phases(config_path, invocation_dir, agent_binary),
        )
        .await;

        match outcome {
            Ok(result) => result,
            Err(_) => {
                let phase = self.current_phase();
                warn!(phase = %phase, limit_secs = self.timeout.as_secs(), "Build timed out");
                self.abort_container().await;
                Err(PipelineError::new(phase, BuildError::Timeout(self.timeout)))
            }
        }
    }

    async fn run_phases(
        &self,
        config_path: &Path,
        invocation_dir: &Path,
        agent_binary: Option<PathBuf>,
    ) -> Result<BuildSummary, PipelineError> {
        self.enter(Phase::Load);
        let mut config = ConfigLoader::load(config_path).phase(Phase::Load)?;
        config.agent_binary = agent_binary;

        self.enter(Phase::Embed);
        // 同時に走る別の実行とアーカイブが衝突しないよう実行ごとに分ける
        let staging = self.run_staging_dir().phase(Phase::Embed)?;
        let images = match config
            .resolve_images(staging.path())
            .phase(Phase::Embed)?
        {
            Some(resolution) => {
                let embedded = ImageEmbedder::new(self.engine)
                    .embed(&resolution.images)
                    .await
                    .phase(Phase::Embed)?;
                config.compose.commit(resolution);
                embedded
            }
            None => Vec::new(),
        };

        self.enter(Phase::Render);
        let rendered = TemplateRenderer::new()
            .and_then(|renderer| renderer.render(&config))
            .phase(Phase::Render)?;
        let input = tempfile::Builder::new()
            .prefix("sprout-")
            .suffix(".nix")
            .tempfile()
            .phase(Phase::Render)?;
        tokio::fs::write(input.path(), rendered)
            .await
            .phase(Phase::Render)?;

        self.enter(Phase::Build);
        let backend = match self.selector.select() {
            BackendChoice::Local(program) => SelectedBackend::Local(LocalBackend::new(program)),
            BackendChoice::Containerized => SelectedBackend::Containerized(
                ContainerizedBackend::new(self.engine, self.paths, &self.tracker).with_agent(
                    config
                        .agent_binary
                        .as_deref()
                        .filter(|_| config.autodiscovery),
                ),
            ),
        };
        info!(backend = %backend.kind(), "Selected build backend");

        let started = Instant::now();
        let built = backend
            .execute(input.path(), config.compose.images(), &self.display)
            .await;
        self.display.finish();
        remove_archives(config.compose.images()).await;
        if let Err(e) = staging.close() {
            warn!(error = %e, "Failed to remove staging directory");
        }
        let mut result = built.phase(Phase::Build)?;
        let build_elapsed = started.elapsed();

        self.enter(Phase::Locate);
        let artifact = ArtifactLocator::locate(&mut result).phase(Phase::Locate)?;

        self.enter(Phase::Deliver);
        let destination = config.output_path(invocation_dir);
        let delivery = self
            .delivery
            .deliver(&artifact, &destination)
            .await
            .phase(Phase::Deliver)?;

        info!(
            output = %delivery.destination.display(),
            bytes = delivery.bytes,
            "Image written"
        );
        Ok(BuildSummary {
            backend: result.kind,
            images,
            artifact,
            delivery,
            build_elapsed,
        })
    }

    async fn abort_container(&self) {
        let Some(id) = self.tracker.take() else {
            return;
        };
        warn!(container = %id, "Removing build container");
        if let Err(e) = self.engine.remove_container(&id).await {
            warn!(container = %id, error = %e, "Failed to remove build container");
        }
    }

    fn enter(&self, phase: Phase) {
        tracing::debug!(phase = %phase, "Entering phase");
        *lock(&self.phase) = phase;
    }

    fn current_phase(&self) -> Phase {
        *lock(&self.phase)
    }

    fn run_staging_dir(&self) -> std::io::Result<tempfile::TempDir> {
        std::fs::create_dir_all(self.paths.staging_dir())?;
        tempfile::Builder::new()
            .prefix(RUN_STAGING_PREFIX)
            .tempdir_in(self.paths.staging_dir())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::FakeEngine;
    use crate::frame::{StreamKind, encode_frame};
    use std::fs;

    struct Fixture {
        root: tempfile::TempDir,
        paths: SproutPaths,
        config: PathBuf,
    }

    impl Fixture {
        fn new(config: &str) -> Self {
            let root = tempfile::tempdir().unwrap();
            let paths = SproutPaths::with_root(&root.path().join("state"));
            let project = root.path().join("project");
            fs::create_dir_all(&project).unwrap();
            let config_path = project.join("sprout.yaml");
            fs::write(&config_path, config).unwrap();
            Self {
                root,
                paths,
                config: config_path,
            }
        }

        fn project(&self) -> PathBuf {
            self.root.path().join("project")
        }

        fn pipeline<'a>(&'a self, engine: &'a FakeEngine) -> Pipeline<'a, FakeEngine> {
            Pipeline::new(engine, &self.paths)
                .with_selector(BackendSelector::new(true, None))
                .with_display(RollingDisplay::hidden())
                .with_delivery(OutputDelivery::hidden())
        }

        /// コンテナ内の /nix/store/<name> に対応するホスト側のディレクトリ
        fn store_output(&self, name: &str) -> PathBuf {
            let dir = self.paths.store_dir().join("store").join(name);
            fs::create_dir_all(&dir).unwrap();
            dir
        }
    }

    fn staging_entries(fixture: &Fixture) -> usize {
        fs::read_dir(fixture.paths.staging_dir())
            .map(|entries| entries.count())
            .unwrap_or(0)
    }

    fn stdout_logs(text: &str) -> Vec<u8> {
        encode_frame(StreamKind::Stdout, text.as_bytes()).to_vec()
    }

    const COMPOSE_CONFIG: &str = "\
ssh_keys:
  - ssh-ed25519 AAAAC3Nza test@host
docker_compose:
  enabled: true
  path: compose.yaml
output:
  path: out/sprout.img
";

    #[tokio::test]
    async fn test_containerized_run_embeds_builds_and_delivers() {
        let fixture = Fixture::new(COMPOSE_CONFIG);
        let project = fixture.project();
        fs::create_dir_all(project.join("app")).unwrap();
        fs::write(project.join("app/Dockerfile"), "FROM alpine:3.19\n").unwrap();
        fs::write(
            project.join("compose.yaml"),
            "services:\n  cache:\n    image: redis:7\n  app:\n    build: ./app\n",
        )
        .unwrap();

        let store = fixture.store_output("abc-nixos-sd-image");
        fs::write(store.join("result.img"), b"raw image").unwrap();

        let engine = FakeEngine {
            logs: stdout_logs("building...\n/nix/store/abc-nixos-sd-image\n"),
            ..Default::default()
        };
        let summary = fixture
            .pipeline(&engine)
            .run(&fixture.config, &project, None)
            .await
            .unwrap();

        assert_eq!(summary.backend, BackendKind::Containerized);
        assert_eq!(summary.images.len(), 2);
        assert_eq!(summary.artifact, store.join("result.img"));
        assert_eq!(summary.delivery.destination, project.join("out/sprout.img"));
        assert_eq!(fs::read(project.join("out/sprout.img")).unwrap(), b"raw image");

        let calls = engine.calls();
        assert!(calls.contains(&"build app:latest".to_string()));
        assert!(calls.contains(&"pull redis:7 linux/arm64".to_string()));
        assert!(calls.contains(&"tag redis:7 embedded/redis_7".to_string()));
        assert!(calls.contains(&"run nixos/nix:latest".to_string()));

        // アーカイブはビルド後に削除される
        let leftovers = fs::read_dir(fixture.paths.staging_dir()).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_run_without_compose_skips_embedding() {
        let fixture = Fixture::new("ssh_keys: []\n");
        let store = fixture.store_output("def-nixos-sd-image");
        fs::write(store.join("result.img"), b"img").unwrap();

        let engine = FakeEngine {
            logs: stdout_logs("/nix/store/def-nixos-sd-image\n"),
            ..Default::default()
        };
        let summary = fixture
            .pipeline(&engine)
            .run(&fixture.config, &fixture.project(), None)
            .await
            .unwrap();

        assert!(summary.images.is_empty());
        assert_eq!(
            summary.delivery.destination,
            fixture.project().join("build/image.img")
        );
        assert_eq!(engine.calls().first().unwrap(), "run nixos/nix:latest");
    }

    #[tokio::test]
    async fn test_missing_config_fails_in_load_phase() {
        let fixture = Fixture::new("");
        let engine = FakeEngine::default();
        let err = fixture
            .pipeline(&engine)
            .run(&fixture.project().join("absent.yaml"), &fixture.project(), None)
            .await
            .unwrap_err();

        assert_eq!(err.phase, Phase::Load);
        assert!(engine.calls().is_empty());
    }

    #[tokio::test]
    async fn test_tag_failure_fails_in_embed_phase_and_cleans_up() {
        let fixture = Fixture::new(COMPOSE_CONFIG);
        fs::write(
            fixture.project().join("compose.yaml"),
            "services:\n  db:\n    image: postgres:16\n  web:\n    image: nginx:1.25\n",
        )
        .unwrap();

        let engine = FakeEngine {
            failing_tags: ["postgres:16".to_string()].into_iter().collect(),
            ..Default::default()
        };
        let err = fixture
            .pipeline(&engine)
            .run(&fixture.config, &fixture.project(), None)
            .await
            .unwrap_err();

        assert_eq!(err.phase, Phase::Embed);
        assert!(matches!(err.source, BuildError::ImageTag { .. }));
        assert!(!engine.calls().iter().any(|call| call.starts_with("run ")));
    }

    #[tokio::test]
    async fn test_missing_store_path_fails_in_build_phase() {
        let fixture = Fixture::new(COMPOSE_CONFIG);
        fs::write(
            fixture.project().join("compose.yaml"),
            "services:\n  web:\n    image: nginx:1.25\n",
        )
        .unwrap();

        let engine = FakeEngine {
            logs: stdout_logs("error: nothing to build\n"),
            ..Default::default()
        };
        let err = fixture
            .pipeline(&engine)
            .run(&fixture.config, &fixture.project(), None)
            .await
            .unwrap_err();

        assert_eq!(err.phase, Phase::Build);
        assert!(matches!(err.source, BuildError::Extraction { .. }));
        assert_eq!(staging_entries(&fixture), 0);
    }

    #[tokio::test]
    async fn test_timeout_removes_build_container_and_archives() {
        let fixture = Fixture::new(COMPOSE_CONFIG);
        fs::write(
            fixture.project().join("compose.yaml"),
            "services:\n  web:\n    image: nginx:1.25\n",
        )
        .unwrap();

        let engine = FakeEngine {
            hang_wait: true,
            ..Default::default()
        };
        let err = fixture
            .pipeline(&engine)
            .with_timeout(Duration::from_millis(300))
            .run(&fixture.config, &fixture.project(), None)
            .await
            .unwrap_err();

        assert_eq!(err.phase, Phase::Build);
        assert!(matches!(err.source, BuildError::Timeout(_)));
        assert_eq!(*engine.removed.lock().unwrap(), vec!["fake-container"]);

        let exported = engine.exports.lock().unwrap().clone();
        assert_eq!(exported.len(), 1);
        assert!(!exported[0].exists());
        assert_eq!(staging_entries(&fixture), 0);
    }

    #[tokio::test]
    async fn test_each_run_stages_into_its_own_directory() {
        let fixture = Fixture::new(COMPOSE_CONFIG);
        fs::write(
            fixture.project().join("compose.yaml"),
            "services:\n  web:\n    image: nginx:1.25\n",
        )
        .unwrap();
        let store = fixture.store_output("abc-nixos-sd-image");
        fs::write(store.join("result.img"), b"raw image").unwrap();

        let engine = FakeEngine {
            logs: stdout_logs("/nix/store/abc-nixos-sd-image\n"),
            ..Default::default()
        };
        let pipeline = fixture.pipeline(&engine);
        for _ in 0..2 {
            pipeline
                .run(&fixture.config, &fixture.project(), None)
                .await
                .unwrap();
        }

        let exported = engine.exports.lock().unwrap().clone();
        assert_eq!(exported.len(), 2);
        let first = exported[0].parent().unwrap();
        let second = exported[1].parent().unwrap();
        assert_ne!(first, second);
        assert_eq!(first.parent().unwrap(), fixture.paths.staging_dir());
        assert_eq!(second.parent().unwrap(), fixture.paths.staging_dir());
        assert_eq!(exported[0].file_name(), exported[1].file_name());
        assert_eq!(staging_entries(&fixture), 0);
    }

    #[tokio::test]
    async fn test_unlocatable_artifact_fails_in_locate_phase() {
        let fixture = Fixture::new("ssh_keys: []\n");
        fixture.store_output("empty-output");

        let engine = FakeEngine {
            logs: stdout_logs("/nix/store/empty-output\n"),
            ..Default::default()
        };
        let err = fixture
            .pipeline(&engine)
            .run(&fixture.config, &fixture.project(), None)
            .await
            .unwrap_err();

        assert_eq!(err.phase, Phase::Locate);
        assert!(matches!(err.source, BuildError::NotFound { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    #[serial_test::serial]
    async fn test_timeout_stops_local_build() {
        use std::os::unix::fs::PermissionsExt;

        let fixture = Fixture::new("ssh_keys: []\n");
        let bin = fixture.root.path().join("bin");
        fs::create_dir_all(&bin).unwrap();
        let program = bin.join(crate::backend::TOOLCHAIN_BINARY);
        fs::write(&program, "#!/bin/sh\nsleep 30\n").unwrap();
        fs::set_permissions(&program, fs::Permissions::from_mode(0o755)).unwrap();

        let engine = FakeEngine::default();
        let started = Instant::now();
        let err = fixture
            .pipeline(&engine)
            .with_selector(BackendSelector::new(false, Some(bin.into_os_string())))
            .with_timeout(Duration::from_millis(500))
            .run(&fixture.config, &fixture.project(), None)
            .await
            .unwrap_err();

        assert_eq!(err.phase, Phase::Build);
        assert!(matches!(err.source, BuildError::Timeout(_)));
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
