use crate::error::{BuildError, Result};
use flate2::Compression;
use flate2::write::GzEncoder;
use sprout_core::BuildSpec;
use std::path::Path;
use tar::Builder;

/// ビルドコンテキストのサイズ警告の閾値
const MAX_CONTEXT_SIZE: usize = 500 * 1024 * 1024;

/// ビルドコンテキストの中で Dockerfile を置く名前
pub(crate) const CONTEXT_DOCKERFILE: &str = "Dockerfile";

pub struct ContextBuilder;

impl ContextBuilder {
    /// ビルド指定からコンテキストを作成
    pub fn from_spec(spec: &BuildSpec) -> Result<Vec<u8>> {
        if !spec.context.is_dir() {
            return Err(BuildError::ContextNotFound(spec.context.clone()));
        }
        if !spec.dockerfile.is_file() {
            return Err(BuildError::DockerfileNotFound(spec.dockerfile.clone()));
        }
        Self::create_context(&spec.context, &spec.dockerfile)
    }

    /// ビルドコンテキストをtar.gzアーカイブとして作成
    ///
    /// Dockerfile はコンテキスト外にあっても `Dockerfile` として格納します。
    pub fn create_context(context_path: &Path, dockerfile_path: &Path) -> Result<Vec<u8>> {
        tracing::debug!(context = %context_path.display(), "Creating build context");

        let mut archive_data = Vec::new();
        {
            let encoder = GzEncoder::new(&mut archive_data, Compression::default());
            let mut tar = Builder::new(encoder);
            tar.follow_symlinks(false);

            tar.append_dir_all(".", context_path)?;

            let dockerfile_content = std::fs::read(dockerfile_path)?;
            let mut header = tar::Header::new_gnu();
            header.set_size(dockerfile_content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            tar.append_data(&mut header, CONTEXT_DOCKERFILE, &dockerfile_content[..])?;

            tar.into_inner()?.finish()?;
        }

        tracing::debug!(bytes = archive_data.len(), "Build context created");
        if archive_data.len() > MAX_CONTEXT_SIZE {
            tracing::warn!(
                "警告: ビルドコンテキストが大きすぎます（{}MB）\n\
                 .dockerignoreファイルで不要なファイルを除外することを推奨します。",
                archive_data.len() / 1024 / 1024
            );
        }

        Ok(archive_data)
    }
}
