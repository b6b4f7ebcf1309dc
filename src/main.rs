// =============================================================================
// MOBMIND CORE — main.rs
// «Coordinator Bootstrap»
// =============================================================================
//
// Поднимает координатор: логгер, конфиг из env, sled-хранилище,
// восстановление состояния, фоновый цикл выгрузки backlog'а и
// HTTP-поверхность.
// =============================================================================

mod aggregator;
mod api;
mod backlog;
mod config;
mod constants;
mod coordinator;
mod episodes;
mod model;
mod sink;
mod store;
mod tiers;
mod weights;

use crate::api::AppState;
use crate::config::BrainConfig;
use crate::constants::{DEFAULT_DATA_DIR, DEFAULT_PORT, FLUSH_LOOP_INTERVAL_SECS};
use crate::coordinator::Coordinator;
use crate::sink::{GitHubSink, LogSink};
use crate::store::{KvStore, SledStore};
use rand::Rng;
use std::sync::Arc;
use tokio::time::{interval, sleep, Duration};

#[tokio::main]
async fn main() {
    env_logger::init();
    constants::print_banner();

    let cfg = BrainConfig::from_env();
    log::info!(
        "⚙️ конфиг: momentum={} priors=({}, {}) iqrK={} maxActions={} minModels={} interval={}s",
        cfg.momentum,
        cfg.prior_a,
        cfg.prior_b,
        cfg.iqr_k,
        cfg.max_actions,
        cfg.min_models,
        cfg.agg_interval_secs
    );

    let data_dir =
        std::env::var("MOBMIND_DATA_DIR").unwrap_or_else(|_| DEFAULT_DATA_DIR.to_string());
    let store: Arc<dyn KvStore> = match SledStore::open(&data_dir) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            log::error!("💥 хранилище не открылось: {}", e);
            std::process::exit(1);
        }
    };

    let sink: Option<Arc<dyn LogSink>> = GitHubSink::from_env().map(|s| Arc::new(s) as Arc<dyn LogSink>);
    if sink.is_none() {
        log::warn!("лог-хранилище не сконфигурировано, backlog будет копиться");
    }

    let coord = Arc::new(Coordinator::new(cfg, store, sink));

    // Фоновый сброс backlog'а: выгружает хвосты даже когда агрегации
    // давно не было. Джиттер размазывает старты по флоту координаторов.
    {
        let coord = coord.clone();
        tokio::spawn(async move {
            let jitter = rand::thread_rng().gen_range(0..15);
            sleep(Duration::from_secs(jitter)).await;
            let mut ticker = interval(Duration::from_secs(FLUSH_LOOP_INTERVAL_SECS));
            loop {
                ticker.tick().await;
                if coord.has_sink() {
                    let report = coord.flush_backlog().await;
                    if report.pending_round_logs > 0 {
                        log::info!(
                            "📦 backlog после сброса: {} раундов в очереди",
                            report.pending_round_logs
                        );
                    }
                }
            }
        });
    }

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(DEFAULT_PORT);
    let addr = format!("0.0.0.0:{}", port);

    let state = Arc::new(AppState::from_env(coord));
    let app = api::router(state);

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            log::error!("💥 не удалось забиндить {}: {}", addr, e);
            std::process::exit(1);
        }
    };
    log::info!("🧠 Mobmind координатор слушает {}", addr);

    if let Err(e) = axum::serve(listener, app).await {
        log::error!("💥 HTTP-сервер упал: {}", e);
        std::process::exit(1);
    }
}
