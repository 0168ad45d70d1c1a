mod grow;

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "sprout")]
#[command(about = "コンテナ構成ごと焼き込んだ起動イメージを、1コマンドで。", long_about = None)]
struct Cli {
    /// 詳細なログを表示
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 起動イメージをビルドして出力先に書き出す
    Grow {
        /// 設定ファイル（省略時は SPROUT_CONFIG またはカレントディレクトリの sprout.yaml）
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// 制限時間（分）
        #[arg(short, long, default_value_t = 60)]
        timeout: u64,
        /// 自動探索エージェントのバイナリ（autodiscovery 有効時のみ使用）
        #[arg(long)]
        agent_binary: Option<PathBuf>,
    },
    /// 設定から出力先のパスだけを表示
    #[command(name = "output-path")]
    OutputPath {
        /// 設定ファイル
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// バージョン情報を表示
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Grow {
            config,
            timeout,
            agent_binary,
        } => {
            let config_path = resolve_config(config)?;
            grow::handle_grow_command(&config_path, timeout, agent_binary).await?;
        }
        Commands::OutputPath { config } => {
            let config_path = resolve_config(config)?;
            let invocation_dir = std::env::current_dir()?;
            let output = sprout_core::ConfigLoader::output_path(&config_path, &invocation_dir)?;
            println!("{}", output.display());
        }
        Commands::Version => {
            println!("sprout {}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}

fn resolve_config(explicit: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    match explicit {
        Some(path) => Ok(path),
        None => sprout_config::find_config_file().context("設定ファイルを特定できません"),
    }
}
