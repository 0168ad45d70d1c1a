use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("設定ファイルの解析に失敗しました: {path}\n理由: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("コンテナ仕様の解析に失敗しました: {path}\n理由: {message}")]
    SpecParse { path: PathBuf, message: String },

    #[error("テンプレートエラー: {0}")]
    Template(String),

    #[error("IO エラー: {path}\n理由: {message}")]
    IoError { path: PathBuf, message: String },
}

impl CoreError {
    pub(crate) fn io(path: &std::path::Path, err: std::io::Error) -> Self {
        CoreError::IoError {
            path: path.to_path_buf(),
            message: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
