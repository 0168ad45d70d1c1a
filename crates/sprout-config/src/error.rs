use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("設定ディレクトリが見つかりません")]
    ConfigDirNotFound,

    #[error("ホームディレクトリが見つかりません")]
    HomeDirNotFound,

    #[error(
        "設定ファイルが見つかりません。以下の場所を確認してください:\n\
        - カレントディレクトリ: sprout.yaml, sprout.yml\n\
        または SPROUT_CONFIG 環境変数で直接指定できます"
    )]
    ConfigFileNotFound,

    #[error("IO エラー: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;
