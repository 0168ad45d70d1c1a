//! ユーザー設定とイメージ解決結果のデータ型

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// 出力先が指定されていないときの既定パス（実行ディレクトリ基準）
pub const DEFAULT_OUTPUT_PATH: &str = "build/image.img";

/// 既定のログインユーザー名
pub const DEFAULT_USERNAME: &str = "sprout";

/// sprout.yaml の内容
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Configuration {
    /// 公開鍵（authorized_keys にそのまま入る）
    pub ssh_keys: Vec<String>,
    pub username: String,
    pub wireless: WirelessConfig,
    pub output: OutputConfig,
    #[serde(rename = "docker_compose")]
    pub compose: ComposeConfig,
    pub autodiscovery: bool,
    /// 自動探索エージェントのバイナリ（CLI から設定）
    #[serde(skip)]
    pub agent_binary: Option<PathBuf>,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            ssh_keys: Vec::new(),
            username: DEFAULT_USERNAME.to_string(),
            wireless: WirelessConfig::default(),
            output: OutputConfig::default(),
            compose: ComposeConfig::default(),
            autodiscovery: false,
            agent_binary: None,
        }
    }
}

impl Configuration {
    /// 最終的なイメージの出力先
    ///
    /// 相対パスは実行ディレクトリ基準で解決します。
    pub fn output_path(&self, invocation_dir: &Path) -> PathBuf {
        let path = self
            .output
            .path
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_PATH));
        if path.is_absolute() {
            path
        } else {
            invocation_dir.join(path)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct WirelessConfig {
    pub enabled: bool,
    /// SSID -> 認証情報
    pub networks: BTreeMap<String, NetworkCredential>,
}

/// 無線ネットワークの認証情報
///
/// `ssid: secret` と `ssid: { psk: secret }` の両方の書き方を受け付けます。
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "RawCredential")]
pub struct NetworkCredential {
    pub psk: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawCredential {
    Bare(String),
    Detailed { psk: String },
}

impl From<RawCredential> for NetworkCredential {
    fn from(raw: RawCredential) -> Self {
        match raw {
            RawCredential::Bare(psk) | RawCredential::Detailed { psk } => Self { psk },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub path: Option<PathBuf>,
}

/// コンテナ仕様（docker-compose）の埋め込み設定
///
/// `rewritten` と `images` は埋め込みが成功したときだけ [`ComposeConfig::commit`]
/// で設定されます。
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ComposeConfig {
    pub enabled: bool,
    /// 設定ファイルに書かれたままのパス
    pub path: Option<PathBuf>,
    /// 設定ファイルの位置で解決した実際のパス
    #[serde(skip)]
    pub source_path: Option<PathBuf>,
    /// 元の仕様の本文
    #[serde(skip)]
    pub content: Option<String>,
    #[serde(skip)]
    rewritten: Option<String>,
    #[serde(skip)]
    images: Vec<ResolvedImage>,
}

impl ComposeConfig {
    /// 仕様を読み込んでイメージを埋め込む対象か
    pub fn is_active(&self) -> bool {
        self.enabled && self.path.is_some()
    }

    /// ローカルタグに書き換え済みの仕様
    pub fn rewritten(&self) -> Option<&str> {
        self.rewritten.as_deref()
    }

    /// 埋め込み済みのイメージ
    pub fn images(&self) -> &[ResolvedImage] {
        &self.images
    }

    /// 埋め込み完了後に解決結果を反映
    pub fn commit(&mut self, resolution: Resolution) {
        self.rewritten = Some(resolution.rewritten);
        self.images = resolution.images;
    }
}

/// 仕様から集めたイメージ1件分
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedImage {
    /// 仕様に書かれた参照（ビルド専用サービスは `<service>:latest`）
    pub canonical: String,
    /// 成果物の中で使うローカルタグ
    pub local_tag: String,
    /// エクスポート先のアーカイブ
    pub archive_path: PathBuf,
    pub source: ImageSource,
}

impl ResolvedImage {
    /// アーカイブのファイル名
    pub fn archive_file_name(&self) -> Option<&str> {
        self.archive_path.file_name().and_then(|name| name.to_str())
    }

    pub fn is_local_build(&self) -> bool {
        matches!(self.source, ImageSource::Build(_))
    }
}

/// イメージの入手方法
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    /// レジストリから取得
    Pull,
    /// 仕様の build セクションからローカルでビルド
    Build(BuildSpec),
}

/// ローカルビルドの指定
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildSpec {
    pub service: String,
    pub context: PathBuf,
    pub dockerfile: PathBuf,
    pub args: BTreeMap<String, String>,
    pub target: Option<String>,
}

/// イメージ解決の結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub images: Vec<ResolvedImage>,
    /// 参照をローカルタグに置き換えた仕様
    pub rewritten: String,
}

/// ビルドを実行する場所
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Local,
    Containerized,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Local => write!(f, "local"),
            BackendKind::Containerized => write!(f, "containerized"),
        }
    }
}
