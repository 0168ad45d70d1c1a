use sprout_core::BackendKind;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Dockerfile not found: {0}")]
    DockerfileNotFound(PathBuf),

    #[error("Build context directory not found: {0}")]
    ContextNotFound(PathBuf),

    #[error("Docker connection error: {0}")]
    DockerConnection(#[from] bollard::errors::Error),

    #[error("Image build failed for {reference}: {message}")]
    ImageBuild { reference: String, message: String },

    #[error("Failed to tag {reference} as {tag}: {message}")]
    ImageTag {
        reference: String,
        tag: String,
        message: String,
    },

    #[error("Failed to export {reference} to {}: {message}", path.display())]
    ImageExport {
        reference: String,
        path: PathBuf,
        message: String,
    },

    #[error("{backend} build failed: {message}")]
    BuildFailed {
        backend: BackendKind,
        message: String,
        /// 失敗直前の出力（末尾数十行）
        diagnostics: String,
    },

    #[error("No build artifact reference found in {backend} build output")]
    Extraction {
        backend: BackendKind,
        diagnostics: String,
    },

    #[error("Build artifact not found under {}", reported.display())]
    NotFound { reported: PathBuf },

    #[error("Failed to deliver image to {}: {message}", path.display())]
    Delivery { path: PathBuf, message: String },

    #[error("Build timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error(transparent)]
    Core(#[from] sprout_core::CoreError),

    #[error(transparent)]
    Config(#[from] sprout_config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BuildError {
    /// ユーザー向けの分かりやすいエラーメッセージ
    pub fn user_message(&self) -> String {
        match self {
            BuildError::DockerfileNotFound(path) => {
                format!(
                    "Dockerfileが見つかりません: {}\n\
                     \n\
                     docker-compose の build.dockerfile を確認してください。",
                    path.display()
                )
            }
            BuildError::ContextNotFound(path) => {
                format!(
                    "ビルドコンテキストが見つかりません: {}\n\
                     \n\
                     docker-compose の build.context を確認してください。",
                    path.display()
                )
            }
            BuildError::DockerConnection(e) => {
                format!(
                    "Dockerに接続できません: {}\n\
                     \n\
                     解決方法:\n\
                     1. Dockerが起動しているか確認してください\n\
                     2. docker ps コマンドが正常に動作するか確認してください",
                    e
                )
            }
            BuildError::BuildFailed {
                message,
                diagnostics,
                ..
            } => {
                format!(
                    "イメージのビルドに失敗しました: {}\n\
                     \n\
                     直前の出力:\n{}",
                    message, diagnostics
                )
            }
            BuildError::Extraction { diagnostics, .. } => {
                format!(
                    "ビルド出力から成果物のパスを取得できませんでした。\n\
                     \n\
                     直前の出力:\n{}",
                    diagnostics
                )
            }
            BuildError::Delivery { path, message } => {
                format!(
                    "イメージの書き出しに失敗しました: {}\n理由: {}\n\
                     \n\
                     書きかけのファイルはそのまま残しています。",
                    path.display(),
                    message
                )
            }
            BuildError::Timeout(limit) => {
                format!(
                    "ビルドが制限時間（{}分）を超えました。\n\
                     \n\
                     --timeout で制限時間を延ばせます。",
                    limit.as_secs() / 60
                )
            }
            _ => format!("{}", self),
        }
    }
}

pub type Result<T> = std::result::Result<T, BuildError>;

/// 失敗したフェーズ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Load,
    Embed,
    Render,
    Build,
    Locate,
    Deliver,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Phase::Load => "load",
            Phase::Embed => "embed",
            Phase::Render => "render",
            Phase::Build => "build",
            Phase::Locate => "locate",
            Phase::Deliver => "deliver",
        };
        f.write_str(name)
    }
}

/// フェーズ情報付きのパイプラインエラー
#[derive(Debug, Error)]
#[error("{phase} phase failed: {source}")]
pub struct PipelineError {
    pub phase: Phase,
    #[source]
    pub source: BuildError,
}

impl PipelineError {
    pub fn new(phase: Phase, source: impl Into<BuildError>) -> Self {
        Self {
            phase,
            source: source.into(),
        }
    }
}

/// `Result` にフェーズを付与する
pub trait PhaseExt<T> {
    fn phase(self, phase: Phase) -> std::result::Result<T, PipelineError>;
}

impl<T, E: Into<BuildError>> PhaseExt<T> for std::result::Result<T, E> {
    fn phase(self, phase: Phase) -> std::result::Result<T, PipelineError> {
        self.map_err(|e| PipelineError::new(phase, e))
    }
}
