//! ビルドバックエンド
//!
//! ローカルのツールチェーンで直接ビルドする [`LocalBackend`] と、
//! ツールチェーン入りのコンテナでビルドする [`ContainerizedBackend`] は
//! 同じ [`BuildBackend`] を実装し、どちらも成果物の参照を1つ返します。

pub mod containerized;
pub mod local;
pub mod select;

pub use containerized::{ContainerTracker, ContainerizedBackend};
pub use local::LocalBackend;
pub use select::{BackendChoice, BackendSelector, DISABLE_LOCAL_ENV};

use crate::display::RollingDisplay;
use crate::engine::ContainerEngine;
use crate::error::Result;
use sprout_core::{BackendKind, ResolvedImage};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};

/// ツールチェーンのビルドコマンド
pub const TOOLCHAIN_BINARY: &str = "nix-build";

/// 全コア・ジョブ数自動・結果シンボリックリンクなし
pub(crate) const BUILD_FLAGS: [&str; 5] = ["--cores", "0", "--max-jobs", "auto", "--no-link"];

/// ビルドストア内のパスの接頭辞
pub const STORE_PREFIX: &str = "/nix/store/";

const DIAGNOSTIC_LINES: usize = 40;

/// バックエンドの実行結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildResult {
    pub kind: BackendKind,
    /// バックエンドが報告した成果物の参照（ホストから見たパス）
    pub reported_path: String,
    /// [`crate::locator::ArtifactLocator`] が解決したイメージファイル
    pub artifact: Option<PathBuf>,
}

impl BuildResult {
    pub fn new(kind: BackendKind, reported_path: impl Into<String>) -> Self {
        Self {
            kind,
            reported_path: reported_path.into(),
            artifact: None,
        }
    }
}

#[allow(async_fn_in_trait)]
pub trait BuildBackend {
    fn kind(&self) -> BackendKind;

    /// レンダリング済みの入力をビルドする
    ///
    /// `images` は入力が参照しているアーカイブ。
    async fn execute(
        &self,
        input: &Path,
        images: &[ResolvedImage],
        display: &RollingDisplay,
    ) -> Result<BuildResult>;
}

/// 選択されたバックエンド
pub enum SelectedBackend<'a, E> {
    Local(LocalBackend),
    Containerized(ContainerizedBackend<'a, E>),
}

impl<E: ContainerEngine> BuildBackend for SelectedBackend<'_, E> {
    fn kind(&self) -> BackendKind {
        match self {
            SelectedBackend::Local(backend) => backend.kind(),
            SelectedBackend::Containerized(backend) => backend.kind(),
        }
    }

    async fn execute(
        &self,
        input: &Path,
        images: &[ResolvedImage],
        display: &RollingDisplay,
    ) -> Result<BuildResult> {
        match self {
            SelectedBackend::Local(backend) => backend.execute(input, images, display).await,
            SelectedBackend::Containerized(backend) => {
                backend.execute(input, images, display).await
            }
        }
    }
}

/// 失敗時の診断用に出力の末尾を保持する
#[derive(Debug, Default)]
pub(crate) struct OutputTail {
    lines: VecDeque<String>,
}

impl OutputTail {
    pub(crate) fn push(&mut self, line: &str) {
        if self.lines.len() == DIAGNOSTIC_LINES {
            self.lines.pop_front();
        }
        self.lines.push_back(line.to_string());
    }

    pub(crate) fn render(&self) -> String {
        self.lines.iter().cloned().collect::<Vec<_>>().join("\n")
    }
}
