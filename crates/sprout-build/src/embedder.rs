//! イメージの取得・タグ付け・エクスポート

use crate::context::ContextBuilder;
use crate::engine::{ContainerEngine, ImageBuildRequest};
use crate::error::{BuildError, Result};
use sprout_core::{ImageSource, ResolvedImage};
use tracing::{debug, info, warn};

/// ターゲット機器のプラットフォーム
pub const PREFERRED_PLATFORM: &str = "linux/arm64";

/// イメージをどう入手したか
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullOutcome {
    /// build セクションからローカルでビルドした
    Built,
    /// 指定プラットフォーム（None は既定）で取得した
    Pulled { platform: Option<String> },
    /// どちらの取得にも失敗し、ローカルにあるものとして続行した
    AssumedLocal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbeddedImage {
    pub canonical: String,
    pub outcome: PullOutcome,
    pub archive_bytes: u64,
}

pub struct ImageEmbedder<'a, E> {
    engine: &'a E,
}

impl<'a, E: ContainerEngine> ImageEmbedder<'a, E> {
    pub fn new(engine: &'a E) -> Self {
        Self { engine }
    }

    /// 解決済みイメージを順にアーカイブへ書き出す
    ///
    /// タグ付けとエクスポートの失敗はその場で中断します。
    pub async fn embed(&self, images: &[ResolvedImage]) -> Result<Vec<EmbeddedImage>> {
        let mut embedded = Vec::with_capacity(images.len());
        for image in images {
            let outcome = self.acquire(image).await?;
            let archive_bytes = self.tag_and_export(image).await?;
            info!(
                image = %image.canonical,
                tag = %image.local_tag,
                bytes = archive_bytes,
                "Embedded image"
            );
            embedded.push(EmbeddedImage {
                canonical: image.canonical.clone(),
                outcome,
                archive_bytes,
            });
        }
        Ok(embedded)
    }

    async fn acquire(&self, image: &ResolvedImage) -> Result<PullOutcome> {
        match &image.source {
            ImageSource::Build(spec) => {
                info!(service = %spec.service, image = %image.canonical, "Building image from local context");
                let context = ContextBuilder::from_spec(spec)?;
                self.engine
                    .build_image(ImageBuildRequest {
                        tag: &image.canonical,
                        context,
                        args: &spec.args,
                        target: spec.target.as_deref(),
                    })
                    .await?;
                Ok(PullOutcome::Built)
            }
            ImageSource::Pull => self.pull_with_fallback(&image.canonical).await,
        }
    }

    async fn pull_with_fallback(&self, reference: &str) -> Result<PullOutcome> {
        match self
            .engine
            .pull_image(reference, Some(PREFERRED_PLATFORM))
            .await
        {
            Ok(()) => {
                return Ok(PullOutcome::Pulled {
                    platform: Some(PREFERRED_PLATFORM.to_string()),
                });
            }
            Err(e) => {
                info!(
                    image = %reference,
                    platform = PREFERRED_PLATFORM,
                    error = %e,
                    "Pull failed for preferred platform, retrying with the default platform"
                );
            }
        }

        match self.engine.pull_image(reference, None).await {
            Ok(()) => Ok(PullOutcome::Pulled { platform: None }),
            Err(e) => {
                warn!(
                    image = %reference,
                    error = %e,
                    "Could not pull image, assuming it exists locally"
                );
                Ok(PullOutcome::AssumedLocal)
            }
        }
    }

    async fn tag_and_export(&self, image: &ResolvedImage) -> Result<u64> {
        self.engine
            .tag_image(&image.canonical, &image.local_tag)
            .await
            .map_err(|e| BuildError::ImageTag {
                reference: image.canonical.clone(),
                tag: image.local_tag.clone(),
                message: e.to_string(),
            })?;

        if let Some(parent) = image.archive_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        debug!(tag = %image.local_tag, archive = %image.archive_path.display(), "Exporting image");
        self.engine
            .export_image(&image.local_tag, &image.archive_path)
            .await
            .map_err(|e| BuildError::ImageExport {
                reference: image.local_tag.clone(),
                path: image.archive_path.clone(),
                message: e.to_string(),
            })
    }
}

/// ステージングしたアーカイブを削除する（存在しないものは無視）
pub async fn remove_archives(images: &[ResolvedImage]) {
    for image in images {
        match tokio::fs::remove_file(&image.archive_path).await {
            Ok(()) => debug!(archive = %image.archive_path.display(), "Removed staged archive"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(archive = %image.archive_path.display(), error = %e, "Failed to remove staged archive"),
        }
    }
}
