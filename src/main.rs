use std::process::ExitCode;

use pagemirror::{config::ProxyConfig, router, AppState};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn setup_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    setup_logging();

    // 設定ファイルを読み込み（第 1 引数、省略時は config.toml）
    let path = std::env::args().nth(1).unwrap_or_else(|| "config.toml".to_string());
    let config = match ProxyConfig::load(&path) {
        Ok(config) => config,
        Err(err) => {
            error!("❌ 設定の読み込みに失敗しました: {}", err);
            return ExitCode::FAILURE;
        }
    };

    info!("🚀 pagemirror を起動中...");
    info!("📝 公開 URL: {}{}", config.public_url, config.proxy_prefix);
    info!("📦 静的アセットのプロキシ: {}", config.proxy_static_assets);
    for referrer in &config.allowed_referrers {
        info!("  - 許可された Referer: {}", referrer);
    }
    if !config.enforce_access_checks {
        warn!("⚠️ アクセスチェックが無効です（ローカル検証専用）");
    }

    let addr = config.listen_addr;
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("❌ {} にバインドできませんでした: {}", addr, err);
            return ExitCode::FAILURE;
        }
    };

    info!("✅ サーバー起動完了: http://{}", addr);

    let app = router(AppState::new(config));
    if let Err(err) = axum::serve(listener, app).await {
        error!("❌ サーバーが異常終了しました: {}", err);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
