use colored::Colorize;
use indicatif::{HumanBytes, HumanDuration};
use sprout_build::{BuildSummary, DockerEngine, Pipeline, PullOutcome};
use sprout_config::SproutPaths;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// grow コマンドを処理
pub async fn handle_grow_command(
    config_path: &Path,
    timeout_minutes: u64,
    agent_binary: Option<PathBuf>,
) -> anyhow::Result<()> {
    println!("{}", "🌱 イメージをビルドします".green().bold());
    println!("  設定: {}", config_path.display().to_string().cyan());

    let paths = SproutPaths::discover()?;
    let engine = DockerEngine::local();
    let invocation_dir = std::env::current_dir()?;

    let pipeline = Pipeline::new(&engine, &paths)
        .with_timeout(Duration::from_secs(timeout_minutes.max(1) * 60));

    match pipeline.run(config_path, &invocation_dir, agent_binary).await {
        Ok(summary) => {
            print_summary(&summary);
            Ok(())
        }
        Err(err) => {
            eprintln!();
            eprintln!(
                "{} {}",
                "✗".red().bold(),
                format!("{} フェーズで失敗しました", err.phase).red()
            );
            eprintln!("{}", err.source.user_message());
            std::process::exit(1);
        }
    }
}

fn print_summary(summary: &BuildSummary) {
    println!();
    for image in &summary.images {
        let note = match &image.outcome {
            PullOutcome::Built => "ビルド".to_string(),
            PullOutcome::Pulled {
                platform: Some(platform),
            } => platform.clone(),
            PullOutcome::Pulled { platform: None } => "既定のプラットフォーム".to_string(),
            PullOutcome::AssumedLocal => "取得失敗・ローカルのものを使用".yellow().to_string(),
        };
        println!(
            "  {} {} ({}, {})",
            "•".cyan(),
            image.canonical,
            note,
            HumanBytes(image.archive_bytes)
        );
    }

    println!(
        "{} {}",
        "✓".green().bold(),
        format!(
            "イメージを書き出しました: {}",
            summary.delivery.destination.display()
        )
        .green()
    );
    println!("  バックエンド: {}", summary.backend);
    println!("  ビルド時間:   {}", HumanDuration(summary.build_elapsed));
    println!(
        "  コピー:       {} ({})",
        HumanBytes(summary.delivery.bytes),
        HumanDuration(summary.delivery.elapsed)
    );
}
