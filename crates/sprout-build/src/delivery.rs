//! ビルド成果物を出力先へコピーする

use crate::error::{BuildError, Result};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const COPY_BUFFER_SIZE: usize = 1024 * 1024;

/// 進捗を報告する間隔（バイト）
pub const PROGRESS_INTERVAL: u64 = 10 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub destination: PathBuf,
    pub bytes: u64,
    pub elapsed: Duration,
}

pub struct OutputDelivery {
    interval: u64,
    draw_target: fn() -> ProgressDrawTarget,
}

impl Default for OutputDelivery {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputDelivery {
    /// 進捗バーを stderr に描画する
    pub fn new() -> Self {
        Self {
            interval: PROGRESS_INTERVAL,
            draw_target: ProgressDrawTarget::stderr,
        }
    }

    pub fn hidden() -> Self {
        Self {
            interval: PROGRESS_INTERVAL,
            draw_target: ProgressDrawTarget::hidden,
        }
    }

    pub fn with_interval(mut self, interval: u64) -> Self {
        self.interval = interval.max(1);
        self
    }

    /// 進捗バー付きでコピーする
    pub async fn deliver(&self, source: &Path, destination: &Path) -> Result<DeliveryReport> {
        let bar = ProgressBar::with_draw_target(None, (self.draw_target)());
        bar.set_style(
            ProgressStyle::with_template(
                "{spinner:.green} [{elapsed_precise}] {bar:30.green} {bytes}/{total_bytes} ({percent}%)",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );

        let report = self
            .deliver_with(source, destination, |copied, total| {
                if bar.length() != Some(total) {
                    bar.set_length(total);
                }
                bar.set_position(copied);
            })
            .await;

        match &report {
            Ok(_) => bar.finish_and_clear(),
            Err(_) => bar.abandon(),
        }
        report
    }

    /// コピーし、`interval` バイトごとと完了時に `progress(コピー済み, 合計)` を呼ぶ
    ///
    /// 失敗時、書きかけの出力ファイルは削除しません。
    pub async fn deliver_with<F>(
        &self,
        source: &Path,
        destination: &Path,
        mut progress: F,
    ) -> Result<DeliveryReport>
    where
        F: FnMut(u64, u64),
    {
        let started = Instant::now();
        let fail = |e: std::io::Error| BuildError::Delivery {
            path: destination.to_path_buf(),
            message: e.to_string(),
        };

        if let Some(parent) = destination.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await.map_err(fail)?;
        }

        let mut reader = tokio::fs::File::open(source).await.map_err(fail)?;
        let total = reader.metadata().await.map_err(fail)?.len();
        let mut writer = tokio::fs::File::create(destination).await.map_err(fail)?;

        tracing::info!(
            source = %source.display(),
            destination = %destination.display(),
            bytes = total,
            "Copying image to output"
        );

        let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
        let mut copied = 0u64;
        let mut next_report = self.interval;
        loop {
            let n = reader.read(&mut buffer).await.map_err(fail)?;
            if n == 0 {
                break;
            }
            writer.write_all(&buffer[..n]).await.map_err(fail)?;
            copied += n as u64;
            if copied >= next_report {
                progress(copied, total);
                next_report = copied - copied % self.interval + self.interval;
            }
        }
        writer.flush().await.map_err(fail)?;
        writer.sync_all().await.map_err(fail)?;
        progress(copied, total);

        let elapsed = started.elapsed();
        tracing::debug!(bytes = copied, elapsed_ms = elapsed.as_millis() as u64, "Copy finished");
        Ok(DeliveryReport {
            destination: destination.to_path_buf(),
            bytes: copied,
            elapsed,
        })
    }
}
