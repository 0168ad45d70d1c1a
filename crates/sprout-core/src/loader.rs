//! 設定ファイルの読み込み

use crate::error::{CoreError, Result};
use crate::model::Configuration;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// sprout.yaml ローダー
pub struct ConfigLoader;

impl ConfigLoader {
    /// 設定ファイルだけを解析する（コンテナ仕様は読まない）
    ///
    /// 出力先の問い合わせなど、ビルドを伴わない用途向けです。
    pub fn load_metadata(path: &Path) -> Result<Configuration> {
        let content = std::fs::read_to_string(path).map_err(|e| CoreError::io(path, e))?;
        Self::parse_str(&content, path)
    }

    /// 出力先だけを解決する（コンテナ仕様は読まない）
    pub fn output_path(path: &Path, invocation_dir: &Path) -> Result<PathBuf> {
        Ok(Self::load_metadata(path)?.output_path(invocation_dir))
    }

    /// 文字列から設定を解析
    pub fn parse_str(content: &str, origin: &Path) -> Result<Configuration> {
        // 空ファイルはすべて既定値
        if content.trim().is_empty() {
            return Ok(Configuration::default());
        }
        serde_yaml::from_str(content).map_err(|e| CoreError::Parse {
            path: origin.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// 設定ファイルを解析し、有効ならコンテナ仕様の本文も読み込む
    ///
    /// 仕様のパスは設定ファイルのあるディレクトリ基準です。
    /// イメージの解決と埋め込みは呼び出し側で行います。
    #[tracing::instrument]
    pub fn load(path: &Path) -> Result<Configuration> {
        let mut config = Self::load_metadata(path)?;

        if config.compose.is_active()
            && let Some(spec_path) = config.compose.path.clone()
        {
            let spec_path = resolve_relative(path, &spec_path);
            let content =
                std::fs::read_to_string(&spec_path).map_err(|e| CoreError::io(&spec_path, e))?;
            debug!(spec = %spec_path.display(), bytes = content.len(), "Loaded container spec");
            config.compose.source_path = Some(spec_path);
            config.compose.content = Some(content);
        }

        info!(
            config = %path.display(),
            ssh_keys = config.ssh_keys.len(),
            compose = config.compose.is_active(),
            "Loaded configuration"
        );
        Ok(config)
    }
}

fn resolve_relative(config_path: &Path, target: &Path) -> PathBuf {
    if target.is_absolute() {
        return target.to_path_buf();
    }
    config_path
        .parent()
        .map(|dir| dir.join(target))
        .unwrap_or_else(|| target.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const FULL_CONFIG: &str = r#"
ssh_keys:
  - ssh-ed25519 AAAAC3Nza alice@laptop
username: pi
wireless:
  enabled: true
  networks:
    home:
      psk: hunter22
output:
  path: out/pi.img
docker_compose:
  enabled: true
  path: stack/compose.yaml
autodiscovery: true
"#;

    #[test]
    fn test_load_metadata_reads_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sprout.yaml");
        fs::write(&path, FULL_CONFIG).unwrap();

        let config = ConfigLoader::load_metadata(&path).unwrap();
        assert_eq!(config.ssh_keys.len(), 1);
        assert_eq!(config.username, "pi");
        assert!(config.wireless.enabled);
        assert_eq!(config.wireless.networks["home"].psk, "hunter22");
        assert_eq!(config.output.path, Some(PathBuf::from("out/pi.img")));
        assert!(config.compose.is_active());
        assert!(config.compose.content.is_none());
        assert!(config.autodiscovery);
    }

    #[test]
    fn test_load_metadata_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sprout.yaml");
        fs::write(&path, FULL_CONFIG).unwrap();

        assert_eq!(
            ConfigLoader::load_metadata(&path).unwrap(),
            ConfigLoader::load_metadata(&path).unwrap()
        );
    }

    #[test]
    fn test_load_reads_spec_relative_to_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sprout.yaml");
        fs::write(&path, FULL_CONFIG).unwrap();
        fs::create_dir_all(dir.path().join("stack")).unwrap();
        fs::write(
            dir.path().join("stack/compose.yaml"),
            "services:\n  web:\n    image: nginx\n",
        )
        .unwrap();

        let config = ConfigLoader::load(&path).unwrap();
        assert_eq!(
            config.compose.source_path,
            Some(dir.path().join("stack/compose.yaml"))
        );
        assert!(config.compose.content.as_deref().unwrap().contains("nginx"));
        assert!(config.compose.rewritten().is_none());
    }

    #[test]
    fn test_load_missing_spec_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sprout.yaml");
        fs::write(&path, FULL_CONFIG).unwrap();

        match ConfigLoader::load(&path) {
            Err(CoreError::IoError { path, .. }) => assert!(path.ends_with("stack/compose.yaml")),
            other => panic!("Expected IoError, got {:?}", other),
        }
    }

    #[test]
    fn test_output_path_skips_spec() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sprout.yaml");
        // 仕様ファイルは存在しないが、出力先の解決には不要
        fs::write(&path, FULL_CONFIG).unwrap();

        let out = ConfigLoader::output_path(&path, Path::new("/home/pi/project")).unwrap();
        assert_eq!(out, PathBuf::from("/home/pi/project/out/pi.img"));
    }

    #[test]
    fn test_missing_file() {
        let result = ConfigLoader::load_metadata(Path::new("/nonexistent/sprout.yaml"));
        assert!(matches!(result, Err(CoreError::IoError { .. })));
    }

    #[test]
    fn test_malformed_yaml() {
        let result = ConfigLoader::parse_str("ssh_keys: [unterminated", Path::new("sprout.yaml"));
        assert!(matches!(result, Err(CoreError::Parse { .. })));
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = ConfigLoader::parse_str("\n", Path::new("sprout.yaml")).unwrap();
        assert_eq!(config, Configuration::default());
    }
}
