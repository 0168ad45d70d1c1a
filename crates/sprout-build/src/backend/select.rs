use super::TOOLCHAIN_BINARY;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};

/// 設定されているとローカルのツールチェーンを使わない
pub const DISABLE_LOCAL_ENV: &str = "SPROUT_DISABLE_LOCAL_NIX";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendChoice {
    /// 見つかったツールチェーンのパス
    Local(PathBuf),
    Containerized,
}

/// バックエンドの選択
///
/// 1. 無効化の環境変数があればコンテナ
/// 2. 検索パス上にツールチェーンがあればローカル
/// 3. それ以外はコンテナ
#[derive(Debug, Clone)]
pub struct BackendSelector {
    disable_local: bool,
    search_path: Option<OsString>,
}

impl BackendSelector {
    pub fn new(disable_local: bool, search_path: Option<OsString>) -> Self {
        Self {
            disable_local,
            search_path,
        }
    }

    pub fn from_env() -> Self {
        let disable_local = std::env::var_os(DISABLE_LOCAL_ENV).is_some_and(|v| !v.is_empty());
        Self::new(disable_local, std::env::var_os("PATH"))
    }

    pub fn select(&self) -> BackendChoice {
        if self.disable_local {
            tracing::debug!("{} is set, using the containerized backend", DISABLE_LOCAL_ENV);
            return BackendChoice::Containerized;
        }

        match self
            .search_path
            .as_deref()
            .and_then(|path| find_executable(TOOLCHAIN_BINARY, path))
        {
            Some(program) => BackendChoice::Local(program),
            None => BackendChoice::Containerized,
        }
    }
}

/// 検索パスから実行可能ファイルを探す
pub fn find_executable(name: &str, search_path: &OsStr) -> Option<PathBuf> {
    std::env::split_paths(search_path)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
