//! コンテナ仕様（docker-compose）からのイメージ解決と書き換え
//!
//! 仕様中のサービスが参照するイメージを重複なく集め、それぞれに
//! ローカルタグとアーカイブの置き場所を割り当てます。書き換え後の仕様では
//! 各サービスの `image` がローカルタグになり、`build` セクションは取り除かれます。

use crate::error::{CoreError, Result};
use crate::interpolate::Interpolator;
use crate::model::{BuildSpec, Configuration, ImageSource, Resolution, ResolvedImage};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// ローカルタグの名前空間
pub const LOCAL_TAG_NAMESPACE: &str = "embedded";

const DEFAULT_DOCKERFILE: &str = "Dockerfile";

/// 参照をファイル名・タグに使える形にする（`/` `:` `-` を `_` に）
pub fn sanitize_reference(reference: &str) -> String {
    reference.replace(['/', ':', '-'], "_")
}

/// 参照に対応するローカルタグ
pub fn local_tag_for(reference: &str) -> String {
    format!("{LOCAL_TAG_NAMESPACE}/{}", sanitize_reference(reference))
}

/// 参照に対応するアーカイブのファイル名
pub fn archive_file_name(reference: &str) -> String {
    format!("{}.tar", sanitize_reference(reference))
}

#[derive(Debug, Deserialize, Serialize)]
struct ComposeDocument {
    services: BTreeMap<String, ComposeService>,
    #[serde(flatten)]
    extra: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Deserialize, Serialize)]
struct ComposeService {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    build: Option<BuildSection>,
    #[serde(flatten)]
    extra: BTreeMap<String, serde_yaml::Value>,
}

/// `build: ./dir` または `build: { context, dockerfile, args, target }`
#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
enum BuildSection {
    Context(String),
    Detailed(BuildDetails),
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct BuildDetails {
    #[serde(default)]
    context: Option<String>,
    #[serde(default)]
    dockerfile: Option<String>,
    #[serde(default)]
    args: Option<BuildArgs>,
    #[serde(default)]
    target: Option<String>,
    #[serde(flatten)]
    extra: BTreeMap<String, serde_yaml::Value>,
}

/// `args` はマップでも `KEY=VALUE` のリストでも書ける
#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
enum BuildArgs {
    Map(BTreeMap<String, serde_yaml::Value>),
    List(Vec<String>),
}

impl BuildArgs {
    fn into_map(self) -> BTreeMap<String, String> {
        match self {
            BuildArgs::Map(map) => map
                .into_iter()
                .filter_map(|(key, value)| {
                    let value = match value {
                        serde_yaml::Value::String(s) => s,
                        serde_yaml::Value::Number(n) => n.to_string(),
                        serde_yaml::Value::Bool(b) => b.to_string(),
                        serde_yaml::Value::Null => std::env::var(&key).ok()?,
                        _ => return None,
                    };
                    Some((key, value))
                })
                .collect(),
            BuildArgs::List(list) => list
                .into_iter()
                .filter_map(|entry| match entry.split_once('=') {
                    Some((key, value)) => Some((key.to_string(), value.to_string())),
                    None => std::env::var(&entry).ok().map(|value| (entry, value)),
                })
                .collect(),
        }
    }
}

/// イメージ解決器
#[derive(Debug, Clone)]
pub struct ImageResolver {
    staging_dir: PathBuf,
    project_dir: PathBuf,
}

impl ImageResolver {
    /// `staging_dir` にアーカイブを置き、`project_dir` 基準でビルドコンテキストを解決
    pub fn new(staging_dir: impl Into<PathBuf>, project_dir: impl Into<PathBuf>) -> Self {
        Self {
            staging_dir: staging_dir.into(),
            project_dir: project_dir.into(),
        }
    }

    /// 仕様を解析してイメージ一覧と書き換え後の仕様を返す
    ///
    /// 同じ入力からは常に同じ結果になります（サービスは名前順に走査）。
    pub fn resolve(&self, spec: &str, origin: &Path) -> Result<Resolution> {
        let mut document: ComposeDocument =
            serde_yaml::from_str(spec).map_err(|e| CoreError::SpecParse {
                path: origin.to_path_buf(),
                message: e.to_string(),
            })?;

        // ローカルタグ -> images 内の位置
        let mut by_tag: HashMap<String, usize> = HashMap::new();
        let mut images: Vec<ResolvedImage> = Vec::new();

        for (name, service) in &mut document.services {
            let canonical = match (&service.image, &service.build) {
                (Some(image), _) => image.clone(),
                (None, Some(_)) => format!("{name}:latest"),
                (None, None) => {
                    warn!(service = %name, "Service has neither image nor build, leaving it untouched");
                    continue;
                }
            };
            let local_tag = local_tag_for(&canonical);
            let build = service.build.take();

            match by_tag.get(&local_tag) {
                None => {
                    let source = match build {
                        Some(section) => ImageSource::Build(self.build_spec(name, section)),
                        None => ImageSource::Pull,
                    };
                    debug!(service = %name, image = %canonical, local_build = matches!(source, ImageSource::Build(_)), "Resolved image");
                    by_tag.insert(local_tag.clone(), images.len());
                    images.push(ResolvedImage {
                        local_tag: local_tag.clone(),
                        archive_path: self.staging_dir.join(archive_file_name(&canonical)),
                        canonical,
                        source,
                    });
                }
                Some(&index) => {
                    let existing = &mut images[index];
                    if existing.canonical != canonical {
                        // サニタイズ後に同じ名前になる参照は先に現れたものを使う
                        warn!(
                            service = %name,
                            image = %canonical,
                            existing = %existing.canonical,
                            tag = %local_tag,
                            "Image reference collides with another after sanitizing, using the first"
                        );
                    } else if let Some(section) = build {
                        match existing.source {
                            ImageSource::Pull => {
                                debug!(service = %name, image = %canonical, "Image is built locally by this service");
                                existing.source = ImageSource::Build(self.build_spec(name, section));
                            }
                            ImageSource::Build(ref first) => {
                                warn!(
                                    service = %name,
                                    image = %canonical,
                                    built_by = %first.service,
                                    "Image is already built by another service, ignoring this build section"
                                );
                            }
                        }
                    }
                }
            }

            service.image = Some(local_tag);
        }

        let rewritten = serde_yaml::to_string(&document).map_err(|e| CoreError::SpecParse {
            path: origin.to_path_buf(),
            message: e.to_string(),
        })?;

        Ok(Resolution { images, rewritten })
    }

    fn build_spec(&self, service: &str, section: BuildSection) -> BuildSpec {
        let details = match section {
            BuildSection::Context(context) => BuildDetails {
                context: Some(context),
                ..Default::default()
            },
            BuildSection::Detailed(details) => details,
        };

        let context = self
            .project_dir
            .join(details.context.as_deref().unwrap_or("."));
        let dockerfile = context.join(details.dockerfile.as_deref().unwrap_or(DEFAULT_DOCKERFILE));

        BuildSpec {
            service: service.to_string(),
            context,
            dockerfile,
            args: details.args.map(BuildArgs::into_map).unwrap_or_default(),
            target: details.target,
        }
    }
}

impl Configuration {
    /// 読み込み済みの仕様からイメージを解決する
    ///
    /// 仕様の埋め込みが無効なら `None`。
    pub fn resolve_images(&self, staging_dir: &Path) -> Result<Option<Resolution>> {
        if !self.compose.is_active() {
            return Ok(None);
        }

        let (Some(source_path), Some(content)) =
            (&self.compose.source_path, &self.compose.content)
        else {
            return Err(CoreError::SpecParse {
                path: self.compose.path.clone().unwrap_or_default(),
                message: "コンテナ仕様が読み込まれていません".to_string(),
            });
        };

        let project_dir = source_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let interpolated = Interpolator::from_env()
            .with_env_file(&project_dir.join(".env"))?
            .interpolate(content);

        ImageResolver::new(staging_dir, project_dir)
            .resolve(&interpolated, source_path)
            .map(Some)
    }
}
