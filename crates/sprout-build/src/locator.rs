//! バックエンドが報告したパスからイメージファイルを見つける

use crate::backend::BuildResult;
use crate::error::{BuildError, Result};
use sprout_core::BackendKind;
use std::path::{Path, PathBuf};

pub const IMAGE_EXTENSION: &str = "img";

/// コンテナビルドの成果物の既定名
pub const CONTAINER_ARTIFACT_NAME: &str = "result.img";

/// ビルド出力内でイメージが置かれるディレクトリ
pub const IMAGE_SUBDIR: &str = "sd-image";

pub struct ArtifactLocator;

impl ArtifactLocator {
    /// イメージファイルを解決し、`result.artifact` に記録する
    pub fn locate(result: &mut BuildResult) -> Result<PathBuf> {
        let artifact = Self::resolve(Path::new(&result.reported_path), result.kind)?;
        tracing::info!(artifact = %artifact.display(), "Located build artifact");
        result.artifact = Some(artifact.clone());
        Ok(artifact)
    }

    /// バックエンドの種類に応じて探す
    ///
    /// 拡張子が `.img` のファイルはそのまま返し、中を調べません。
    /// ストアの出力ディレクトリ自体が `.img` で終わることがあるので、ディレクトリは除きます。
    pub fn resolve(reported: &Path, kind: BackendKind) -> Result<PathBuf> {
        if has_image_extension(reported) && !reported.is_dir() {
            return Ok(reported.to_path_buf());
        }

        let found = match kind {
            BackendKind::Containerized => {
                let candidate = reported.join(CONTAINER_ARTIFACT_NAME);
                if candidate.is_file() {
                    Some(candidate)
                } else {
                    // ツールチェーンの標準レイアウトで出力された場合
                    single_image_in(&reported.join(IMAGE_SUBDIR))
                }
            }
            BackendKind::Local => single_image_in(&reported.join(IMAGE_SUBDIR)),
        };

        found.ok_or_else(|| BuildError::NotFound {
            reported: reported.to_path_buf(),
        })
    }
}

fn has_image_extension(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == IMAGE_EXTENSION)
}

/// ディレクトリ内の `.img` がちょうど1つならそれを返す
fn single_image_in(dir: &Path) -> Option<PathBuf> {
    let entries = std::fs::read_dir(dir).ok()?;
    let mut images: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file() && has_image_extension(path))
        .collect();

    match images.len() {
        1 => images.pop(),
        0 => None,
        n => {
            tracing::warn!(dir = %dir.display(), count = n, "Multiple image files found, refusing to guess");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_image_path_returned_without_probing() {
        let reported = Path::new("/does/not/exist/nixos.img");
        for kind in [BackendKind::Local, BackendKind::Containerized] {
            assert_eq!(
                ArtifactLocator::resolve(reported, kind).unwrap(),
                PathBuf::from("/does/not/exist/nixos.img")
            );
        }
    }

    #[test]
    fn test_local_finds_single_image_in_subdir() {
        let dir = tempfile::tempdir().unwrap();
        let sd = dir.path().join("sd-image");
        fs::create_dir(&sd).unwrap();
        fs::write(sd.join("nixos-24.05-aarch64-linux.img"), "img").unwrap();
        fs::write(sd.join("README"), "notes").unwrap();

        let mut result = BuildResult::new(BackendKind::Local, dir.path().display().to_string());
        let artifact = ArtifactLocator::locate(&mut result).unwrap();

        assert_eq!(artifact, sd.join("nixos-24.05-aarch64-linux.img"));
        assert_eq!(result.artifact, Some(artifact));
    }

    #[test]
    fn test_store_directory_with_image_suffix_is_searched() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("abc-nixos-sd-image-24.05-aarch64-linux.img");
        let sd = out.join("sd-image");
        fs::create_dir_all(&sd).unwrap();
        fs::write(sd.join("nixos.img"), "img").unwrap();

        assert_eq!(
            ArtifactLocator::resolve(&out, BackendKind::Local).unwrap(),
            sd.join("nixos.img")
        );
        assert_eq!(
            ArtifactLocator::resolve(&out, BackendKind::Containerized).unwrap(),
            sd.join("nixos.img")
        );
    }

    #[test]
    fn test_local_ambiguous_or_missing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            ArtifactLocator::resolve(dir.path(), BackendKind::Local),
            Err(BuildError::NotFound { .. })
        ));

        let sd = dir.path().join("sd-image");
        fs::create_dir(&sd).unwrap();
        fs::write(sd.join("a.img"), "a").unwrap();
        fs::write(sd.join("b.img"), "b").unwrap();
        assert!(matches!(
            ArtifactLocator::resolve(dir.path(), BackendKind::Local),
            Err(BuildError::NotFound { .. })
        ));
    }

    #[test]
    fn test_containerized_well_known_name() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("result.img"), "img").unwrap();

        assert_eq!(
            ArtifactLocator::resolve(dir.path(), BackendKind::Containerized).unwrap(),
            dir.path().join("result.img")
        );
    }

    #[test]
    fn test_containerized_does_not_use_local_convention_first() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("result.img"), "img").unwrap();
        let sd = dir.path().join("sd-image");
        fs::create_dir(&sd).unwrap();
        fs::write(sd.join("other.img"), "img").unwrap();

        assert_eq!(
            ArtifactLocator::resolve(dir.path(), BackendKind::Containerized).unwrap(),
            dir.path().join("result.img")
        );
        assert_eq!(
            ArtifactLocator::resolve(dir.path(), BackendKind::Local).unwrap(),
            sd.join("other.img")
        );
    }
}
