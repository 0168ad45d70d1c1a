//! コンテナエンジンとの境界
//!
//! イメージの取得・タグ付け・エクスポートと、ビルド用コンテナの実行を
//! [`ContainerEngine`] にまとめます。実装は Docker API を使う
//! [`DockerEngine`] のみで、テストではスクリプト化した偽エンジンに差し替えます。

use crate::error::{BuildError, Result};
use crate::frame::{StreamKind, encode_frame};
use bollard::Docker;
use bollard::container::LogOutput;
use bollard::models::{HostConfig, Mount, MountTypeEnum};
use futures_util::stream::StreamExt;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::OnceLock;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio_util::io::StreamReader;

/// 多重化されたログ（8バイトヘッダー + 本文のフレーム列）
pub type LogStream<'a> = Pin<Box<dyn AsyncRead + 'a>>;

/// ビルド用コンテナの指定
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub image: String,
    pub cmd: Vec<String>,
    pub env: Vec<String>,
    pub working_dir: String,
    /// (ホスト側, コンテナ側) のバインドマウント
    pub mounts: Vec<(PathBuf, String)>,
    pub memory_bytes: i64,
    pub cpu_shares: i64,
    pub privileged: bool,
    pub auto_remove: bool,
}

/// ローカルビルドの要求
#[derive(Debug)]
pub struct ImageBuildRequest<'a> {
    pub tag: &'a str,
    /// tar.gz のビルドコンテキスト
    pub context: Vec<u8>,
    pub args: &'a BTreeMap<String, String>,
    pub target: Option<&'a str>,
}

#[allow(async_fn_in_trait)]
pub trait ContainerEngine {
    /// イメージを取得（`platform` 指定時はそのプラットフォームを優先）
    async fn pull_image(&self, reference: &str, platform: Option<&str>) -> Result<()>;

    async fn image_exists(&self, reference: &str) -> Result<bool>;

    async fn build_image(&self, request: ImageBuildRequest<'_>) -> Result<()>;

    async fn tag_image(&self, source: &str, target: &str) -> Result<()>;

    /// イメージをアーカイブに書き出し、書き込んだバイト数を返す
    async fn export_image(&self, reference: &str, dest: &Path) -> Result<u64>;

    /// コンテナを作成して起動し、ID を返す（イメージがなければ取得する）
    async fn run_container(&self, spec: &ContainerSpec) -> Result<String>;

    /// 多重化ログを読むストリームを開く
    fn log_stream(&self, id: &str) -> Result<LogStream<'_>>;

    /// 終了を待って終了コードを返す
    async fn wait_container(&self, id: &str) -> Result<i64>;

    async fn remove_container(&self, id: &str) -> Result<()>;
}

/// 参照をリポジトリとタグに分ける
///
/// レジストリのポート (`localhost:5000/app`) とダイジェスト (`app@sha256:...`) を考慮します。
pub fn split_reference(reference: &str) -> (&str, &str) {
    if reference.contains('@') {
        return (reference, "");
    }
    let name_start = reference.rfind('/').map(|i| i + 1).unwrap_or(0);
    match reference[name_start..].rfind(':') {
        Some(i) => (
            &reference[..name_start + i],
            &reference[name_start + i + 1..],
        ),
        None => (reference, "latest"),
    }
}

/// Docker API を使うエンジン
///
/// [`DockerEngine::local`] で作った場合、ソケットへの接続は最初の操作まで行いません。
/// ローカルのツールチェーンだけで完結するビルドでは Docker がなくても動きます。
pub struct DockerEngine {
    docker: OnceLock<Docker>,
}

impl DockerEngine {
    pub fn new(docker: Docker) -> Self {
        Self {
            docker: OnceLock::from(docker),
        }
    }

    pub fn local() -> Self {
        Self {
            docker: OnceLock::new(),
        }
    }

    /// クライアントを取得（未接続ならローカルの既定設定で接続）
    fn client(&self) -> Result<&Docker> {
        if let Some(docker) = self.docker.get() {
            return Ok(docker);
        }
        let docker = Docker::connect_with_local_defaults()?;
        tracing::debug!("Connected to local Docker");
        Ok(self.docker.get_or_init(|| docker))
    }

    pub fn is_connected(&self) -> bool {
        self.docker.get().is_some()
    }

    /// ビルド出力の処理
    fn handle_build_output(&self, tag: &str, output: bollard::models::BuildInfo) -> Result<()> {
        if let Some(stream) = output.stream {
            let line = stream.trim_end();
            if !line.is_empty() {
                tracing::debug!(image = %tag, "{}", line);
            }
        }

        if let Some(error) = output.error {
            return Err(BuildError::ImageBuild {
                reference: tag.to_string(),
                message: error,
            });
        }

        if let Some(error_detail) = output.error_detail {
            let message = error_detail
                .message
                .unwrap_or_else(|| "Unknown build error".to_string());
            return Err(BuildError::ImageBuild {
                reference: tag.to_string(),
                message,
            });
        }

        if let Some(status) = output.status {
            tracing::debug!(image = %tag, "{}", status);
        }

        Ok(())
    }
}

impl ContainerEngine for DockerEngine {
    async fn pull_image(&self, reference: &str, platform: Option<&str>) -> Result<()> {
        let (image_name, tag) = split_reference(reference);
        tracing::info!(image = %reference, platform = platform.unwrap_or("default"), "Pulling image");

        #[allow(deprecated)]
        let options = bollard::image::CreateImageOptions {
            from_image: image_name,
            tag,
            platform: platform.unwrap_or(""),
            ..Default::default()
        };

        #[allow(deprecated)]
        let mut stream = self.client()?.create_image(Some(options), None, None);

        while let Some(info) = stream.next().await {
            if let bollard::models::CreateImageInfo {
                status: Some(status),
                ..
            } = info?
            {
                tracing::trace!(image = %reference, "{}", status);
            }
        }

        Ok(())
    }

    async fn image_exists(&self, reference: &str) -> Result<bool> {
        match self.client()?.inspect_image(reference).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(BuildError::DockerConnection(e)),
        }
    }

    async fn build_image(&self, request: ImageBuildRequest<'_>) -> Result<()> {
        tracing::info!("Building image: {}", request.tag);

        let build_args: HashMap<&str, &str> = request
            .args
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();

        #[allow(deprecated)]
        let options = bollard::image::BuildImageOptions {
            dockerfile: crate::context::CONTEXT_DOCKERFILE,
            t: request.tag,
            buildargs: build_args,
            target: request.target.unwrap_or(""),
            rm: true,
            forcerm: true,
            pull: true,
            ..Default::default()
        };

        use bytes::Bytes;
        use http_body_util::{Either, Full};
        let body = Full::new(Bytes::from(request.context));
        #[allow(deprecated)]
        let mut stream = self
            .client()?
            .build_image(options, None, Some(Either::Left(body)));

        while let Some(msg) = stream.next().await {
            self.handle_build_output(request.tag, msg?)?;
        }

        tracing::info!("Successfully built: {}", request.tag);
        Ok(())
    }

    async fn tag_image(&self, source: &str, target: &str) -> Result<()> {
        let (repo, tag) = split_reference(target);
        #[allow(deprecated)]
        let options = bollard::image::TagImageOptions { repo, tag };
        #[allow(deprecated)]
        self.client()?.tag_image(source, Some(options)).await?;
        Ok(())
    }

    async fn export_image(&self, reference: &str, dest: &Path) -> Result<u64> {
        let docker = self.client()?;
        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = docker.export_image(reference);
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        Ok(written)
    }

    async fn run_container(&self, spec: &ContainerSpec) -> Result<String> {
        if !self.image_exists(&spec.image).await? {
            self.pull_image(&spec.image, None).await?;
        }

        let mounts = spec
            .mounts
            .iter()
            .map(|(source, target)| Mount {
                source: Some(source.display().to_string()),
                target: Some(target.clone()),
                typ: Some(MountTypeEnum::BIND),
                ..Default::default()
            })
            .collect();

        #[allow(deprecated)]
        let config = bollard::container::Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.cmd.clone()),
            env: Some(spec.env.clone()),
            working_dir: Some(spec.working_dir.clone()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            host_config: Some(HostConfig {
                mounts: Some(mounts),
                auto_remove: Some(spec.auto_remove),
                memory: Some(spec.memory_bytes),
                cpu_shares: Some(spec.cpu_shares),
                privileged: Some(spec.privileged),
                ..Default::default()
            }),
            ..Default::default()
        };

        let docker = self.client()?;
        let response = docker
            .create_container(
                None::<bollard::query_parameters::CreateContainerOptions>,
                config,
            )
            .await?;

        docker
            .start_container(
                &response.id,
                None::<bollard::query_parameters::StartContainerOptions>,
            )
            .await?;

        tracing::debug!(container = %response.id, image = %spec.image, "Started build container");
        Ok(response.id)
    }

    fn log_stream(&self, id: &str) -> Result<LogStream<'_>> {
        let options = bollard::query_parameters::LogsOptions {
            follow: true,
            stdout: true,
            stderr: true,
            ..Default::default()
        };

        let frames = self.client()?.logs(id, Some(options)).map(|item| {
            item.map(|output| match output {
                LogOutput::StdErr { message } => encode_frame(StreamKind::Stderr, &message),
                LogOutput::StdOut { message } | LogOutput::Console { message } => {
                    encode_frame(StreamKind::Stdout, &message)
                }
                LogOutput::StdIn { message } => encode_frame(StreamKind::Stdin, &message),
            })
            .map_err(std::io::Error::other)
        });

        Ok(Box::pin(StreamReader::new(frames)))
    }

    async fn wait_container(&self, id: &str) -> Result<i64> {
        let mut stream = self
            .client()?
            .wait_container(id, None::<bollard::query_parameters::WaitContainerOptions>);

        let mut status_code = 0;
        while let Some(item) = stream.next().await {
            match item {
                Ok(response) => status_code = response.status_code,
                Err(bollard::errors::Error::DockerContainerWaitError { code, .. }) => {
                    return Ok(code);
                }
                Err(e) => return Err(BuildError::DockerConnection(e)),
            }
        }
        Ok(status_code)
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        let options = bollard::query_parameters::RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self.client()?.remove_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            // 自動削除済み
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(BuildError::DockerConnection(e)),
        }
    }
}

/// テスト用のスクリプト化したエンジン
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    #[derive(Default)]
    pub(crate) struct FakeEngine {
        pub calls: Mutex<Vec<String>>,
        /// pull に失敗させる (参照, プラットフォーム)。プラットフォーム None は既定の取得
        pub failing_pulls: HashSet<(String, Option<String>)>,
        pub failing_tags: HashSet<String>,
        pub failing_exports: HashSet<String>,
        pub present_images: Mutex<HashSet<String>>,
        /// log_stream が返す生のバイト列
        pub logs: Vec<u8>,
        pub exit_code: i64,
        /// wait_container が戻らない
        pub hang_wait: bool,
        /// export_image の書き出し先
        pub exports: Mutex<Vec<PathBuf>>,
        pub last_container: Mutex<Option<ContainerSpec>>,
        pub removed: Mutex<Vec<String>>,
    }

    impl FakeEngine {
        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    impl ContainerEngine for FakeEngine {
        async fn pull_image(&self, reference: &str, platform: Option<&str>) -> Result<()> {
            self.record(format!("pull {reference} {}", platform.unwrap_or("-")));
            let key = (reference.to_string(), platform.map(str::to_string));
            if self.failing_pulls.contains(&key) {
                return Err(BuildError::ImageBuild {
                    reference: reference.to_string(),
                    message: "manifest unknown".to_string(),
                });
            }
            self.present_images
                .lock()
                .unwrap()
                .insert(reference.to_string());
            Ok(())
        }

        async fn image_exists(&self, reference: &str) -> Result<bool> {
            Ok(self.present_images.lock().unwrap().contains(reference))
        }

        async fn build_image(&self, request: ImageBuildRequest<'_>) -> Result<()> {
            self.record(format!("build {}", request.tag));
            self.present_images
                .lock()
                .unwrap()
                .insert(request.tag.to_string());
            Ok(())
        }

        async fn tag_image(&self, source: &str, target: &str) -> Result<()> {
            self.record(format!("tag {source} {target}"));
            if self.failing_tags.contains(source) {
                return Err(BuildError::ImageBuild {
                    reference: source.to_string(),
                    message: "No such image".to_string(),
                });
            }
            Ok(())
        }

        async fn export_image(&self, reference: &str, dest: &Path) -> Result<u64> {
            self.record(format!("export {reference}"));
            if self.failing_exports.contains(reference) {
                return Err(BuildError::Io(std::io::Error::other("disk full")));
            }
            self.exports.lock().unwrap().push(dest.to_path_buf());
            let body = format!("archive of {reference}");
            tokio::fs::write(dest, &body).await?;
            Ok(body.len() as u64)
        }

        async fn run_container(&self, spec: &ContainerSpec) -> Result<String> {
            self.record(format!("run {}", spec.image));
            *self.last_container.lock().unwrap() = Some(spec.clone());
            Ok("fake-container".to_string())
        }

        fn log_stream(&self, _id: &str) -> Result<LogStream<'_>> {
            Ok(Box::pin(std::io::Cursor::new(self.logs.clone())))
        }

        async fn wait_container(&self, id: &str) -> Result<i64> {
            self.record(format!("wait {id}"));
            if self.hang_wait {
                std::future::pending::<()>().await;
            }
            Ok(self.exit_code)
        }

        async fn remove_container(&self, id: &str) -> Result<()> {
            self.removed.lock().unwrap().push(id.to_string());
            Ok(())
        }
    }
}
