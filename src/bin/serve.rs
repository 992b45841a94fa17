//! 推論サーバー

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{error, info};

use dermascan::{create_router, logging, AppConfig, InferenceService, ServiceSettings};

#[derive(Parser, Debug)]
#[command(version, about = "Serve skin lesion classifications over HTTP")]
struct Args {
    /// 設定ファイル
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// モデルアーティファクト
    #[arg(short, long)]
    model: Option<PathBuf>,

    /// 待ち受けポート
    #[arg(short, long, env = "PORT")]
    port: Option<u16>,

    /// アップロード画像の保存先
    #[arg(long)]
    upload_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();
    let args = Args::parse();

    let mut config = AppConfig::load_or_default_from(&args.config);
    if let Some(model) = args.model {
        config.model.model_path = model;
    }
    if let Some(dir) = args.upload_dir {
        config.serving.upload_dir = dir;
    }

    let mut addr: SocketAddr = config
        .serving
        .bind_addr
        .parse()
        .with_context(|| format!("不正な待ち受けアドレス: {}", config.serving.bind_addr))?;
    if let Some(port) = args.port {
        addr.set_port(port);
    }

    info!("モデルを読み込みます: {}", config.model.model_path.display());
    let service = Arc::new(InferenceService::start(ServiceSettings::from_config(&config)).await);
    if !service.is_loaded() {
        error!("モデル未読み込みのため /api/analyze は 503 を返します");
    }

    let app = create_router(service);

    info!("サーバーを起動します: http://{}", addr);
    info!("ヘルスチェック: http://{}/api/health", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("サーバーを停止しました");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Ctrl+C ハンドラを設定できません: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("SIGTERM ハンドラを設定できません: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("シャットダウンを開始します");
}
