//! Sprout のツールディレクトリと設定ファイルの探索
//!
//! ビルドキャッシュ、ビルドストア、イメージのステージング領域など、
//! 1回の実行を超えて共有されるパスをここで一元管理します。

pub mod error;

pub use error::*;

use std::path::{Path, PathBuf};

/// 設定ディレクトリを上書きする環境変数
pub const CONFIG_DIR_ENV: &str = "SPROUT_CONFIG_DIR";

/// 設定ファイルを直接指定する環境変数
pub const CONFIG_FILE_ENV: &str = "SPROUT_CONFIG";

const CONFIG_FILE_CANDIDATES: [&str; 2] = ["sprout.yaml", "sprout.yml"];

/// Sprout の設定ディレクトリを取得
///
/// `SPROUT_CONFIG_DIR` が設定されていればそれを優先し、
/// なければ `<XDG config>/sprout` を使います。
pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = match std::env::var_os(CONFIG_DIR_ENV) {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => dirs::config_dir()
            .ok_or(ConfigError::ConfigDirNotFound)?
            .join("sprout"),
    };

    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir)?;
    }

    Ok(config_dir)
}

/// sprout.yaml を探す
///
/// 1. 環境変数 SPROUT_CONFIG (直接パス指定)
/// 2. カレントディレクトリ: sprout.yaml, sprout.yml
pub fn find_config_file() -> Result<PathBuf> {
    if let Some(config_path) = std::env::var_os(CONFIG_FILE_ENV) {
        let path = PathBuf::from(config_path);
        if path.exists() {
            return Ok(path);
        }
        tracing::warn!(path = %path.display(), "SPROUT_CONFIG points to a missing file");
    }

    let current_dir = std::env::current_dir()?;
    find_config_file_in(&current_dir)
}

/// 指定ディレクトリ内で設定ファイルを探す
pub fn find_config_file_in(dir: &Path) -> Result<PathBuf> {
    CONFIG_FILE_CANDIDATES
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.is_file())
        .ok_or(ConfigError::ConfigFileNotFound)
}

/// 実行をまたいで共有されるディレクトリ群
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SproutPaths {
    config_dir: PathBuf,
    staging_dir: PathBuf,
    workspace_root: PathBuf,
}

impl SproutPaths {
    /// 実行環境から各ディレクトリを決定
    pub fn discover() -> Result<Self> {
        let config_dir = get_config_dir()?;
        // コンテナランタイム (Colima 等) から見えるのはホーム配下だけの場合がある
        let workspace_root = dirs::home_dir().ok_or(ConfigError::HomeDirNotFound)?;
        Ok(Self {
            config_dir,
            staging_dir: std::env::temp_dir().join("sprout-embedded"),
            workspace_root,
        })
    }

    /// すべてのディレクトリを1つのルート配下に置く（テストや隔離実行用）
    pub fn with_root(root: &Path) -> Self {
        Self {
            config_dir: root.join("config"),
            staging_dir: root.join("staging"),
            workspace_root: root.join("work"),
        }
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// バイナリキャッシュ（コンテナ内の ~/.cache/nix）
    pub fn cache_dir(&self) -> PathBuf {
        self.config_dir.join("cache")
    }

    /// ビルドストア（コンテナ内の /nix）
    pub fn store_dir(&self) -> PathBuf {
        self.config_dir.join("nix-store")
    }

    /// キャッシュとストアへの同時アクセスを直列化するロックファイル
    pub fn lock_path(&self) -> PathBuf {
        self.config_dir.join("build.lock")
    }

    /// 埋め込みイメージのアーカイブを書き出す場所
    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    /// コンテナビルド用の作業ディレクトリを作る親ディレクトリ
    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    /// 永続ディレクトリを作成
    pub fn ensure_persistent_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(self.cache_dir())?;
        std::fs::create_dir_all(self.store_dir())?;
        std::fs::create_dir_all(&self.staging_dir)?;
        std::fs::create_dir_all(&self.workspace_root)?;
        Ok(())
    }
}
