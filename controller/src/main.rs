use anyhow::Result;
use clap::Parser;
use sea_orm_migration::MigratorTrait;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use controller::config::Config;
use controller::config_store::ConfigStore;
use controller::control_client::HttpConnector;
use controller::db::Datastore;
use controller::jobs::{start_restart_job, start_traffic_poller, TrafficPoller};
use controller::live_sync::{LiveSync, LiveSyncClient};
use controller::migration::{self, init_sqlite};
use controller::notify::{BroadcastNotifier, NotificationSink};
use controller::restart::{ProxyConfigWriter, RestartCoordinator, RestartHook};
use controller::settings_cache::SettingsCache;
use controller::traffic::TrafficAccountant;

#[derive(Parser, Debug)]
#[command(name = "controller", about = "代理面板控制核心")]
struct Args {
    /// 配置文件路径
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::load(args.config.as_deref())?;

    // 初始化 tracing 日志系统
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,sqlx::query=warn"));
    let (file_layer, _log_guard) = match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "controller.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().with_writer(writer).with_ansi(false)), Some(guard))
        }
        None => (None, None),
    };
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer())
        .with(file_layer)
        .init();

    info!("📋 controller 启动");
    info!("🔗 控制通道地址: {}", config.control_endpoint);

    // 初始化数据库
    let db = init_sqlite(&config.db_path, config.db_timeout()).await?;
    migration::Migrator::up(&db, None).await?;
    info!("✅ 数据库初始化完成: {}", config.db_path);

    let datastore = Arc::new(Datastore::new(db, config.db_timeout()));
    let cache = Arc::new(SettingsCache::new());
    let notifier = Arc::new(BroadcastNotifier::new(256));
    let mut events = notifier.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            info!("📣 {:?}", event);
        }
    });

    // 控制通道，代理未启动时先记录地址，由重启任务重新绑定
    let live_client = Arc::new(LiveSyncClient::new(
        Arc::new(HttpConnector::new(config.control_secret())),
        config.live_sync_timeout(),
    ));
    if let Err(e) = live_client.bind(&config.control_endpoint).await {
        warn!("⚠️ 控制通道暂不可用: {}", e);
    }
    let live: Arc<dyn LiveSync> = live_client.clone();
    let sink: Arc<dyn NotificationSink> = notifier.clone();

    let config_store = Arc::new(ConfigStore::new(datastore.clone(), cache.clone(), live.clone(), sink.clone()));
    let traffic = Arc::new(TrafficAccountant::new(datastore, cache, live, sink.clone()));

    let hook: Arc<dyn RestartHook> = Arc::new(ProxyConfigWriter::new(
        config.proxy_config_path.clone(),
        config.proxy_template_path.as_ref().map(std::path::PathBuf::from),
        config.restart_command.clone(),
    ));
    let restart = Arc::new(RestartCoordinator::new(config_store.clone(), live_client.clone(), hook, sink));
    if !live_client.is_bound().await {
        // 按数据库配置拉起代理
        restart.request();
    }

    info!("📦 已加载 {} 个入站", config_store.get_all_inbounds().await?.len());

    // 启动后台任务
    let poller = TrafficPoller::new(live_client, traffic);
    start_traffic_poller(poller, restart.clone(), config.traffic_poll_interval());
    start_restart_job(restart, config.restart_check_interval());

    info!("✅ 所有服务已启动，等待终止信号...");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("收到 Ctrl+C 信号，正在关闭服务...");
        }
        _ = async {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};
                match signal(SignalKind::terminate()) {
                    Ok(mut sigterm) => {
                        sigterm.recv().await;
                    }
                    Err(e) => {
                        warn!("无法监听 SIGTERM: {}", e);
                        std::future::pending::<()>().await;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                std::future::pending::<()>().await;
            }
        } => {
            info!("收到 SIGTERM 信号，正在关闭服务...");
        }
    }

    Ok(())
}
