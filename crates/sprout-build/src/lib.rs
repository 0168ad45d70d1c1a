//! Sprout のビルドパイプライン
//!
//! コンテナ仕様のイメージを取得してアーカイブに書き出し、
//! ローカルまたはコンテナ内のツールチェーンでディスクイメージをビルドし、
//! 成果物を出力先へコピーします。

pub mod backend;
pub mod context;
pub mod delivery;
pub mod display;
pub mod embedder;
pub mod engine;
pub mod error;
pub mod frame;
pub mod locator;
pub mod lock;
pub mod pipeline;

pub use backend::{
    BackendChoice, BackendSelector, BuildBackend, BuildResult, ContainerTracker,
    ContainerizedBackend, DISABLE_LOCAL_ENV, LocalBackend,
};
pub use delivery::{DeliveryReport, OutputDelivery};
pub use display::{LineStyle, RollingDisplay};
pub use embedder::{EmbeddedImage, ImageEmbedder, PullOutcome};
pub use engine::{ContainerEngine, DockerEngine};
pub use error::{BuildError, Phase, PipelineError, Result};
pub use locator::ArtifactLocator;
pub use lock::CacheLock;
pub use pipeline::{BuildSummary, DEFAULT_TIMEOUT, Pipeline};
