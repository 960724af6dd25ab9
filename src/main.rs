use std::sync::Arc;
use std::time::Duration;

use tokio::time::interval;
use trackflow::broker;
use trackflow::config::Config;
use trackflow::engine::TrackingEngine;
use trackflow::http;
use trackflow::listener::{BrokerPublisher, DiskSortMirror};
use trackflow::metrics;
use trackflow::sink::clickhouse::{ClickhouseConfig, ClickhouseSink};
use trackflow::sink::{EventSink, FanoutSink};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::from_env();
    metrics::init_metrics();

    log::info!("🚀 Starting trackflow...");
    log::info!("   snapshot: {}", config.snapshot_path);
    log::info!("   tracking topic: {}", config.tracking_topic);

    // Broker connectivity is the only hard startup requirement besides
    // configuration itself.
    let connection = broker::connect(&config.rabbit_url).await?;
    let publish_channel = connection.create_channel().await?;
    broker::declare_sort_exchange(&publish_channel, &config.sort_exchange).await?;

    let mut engine = TrackingEngine::load(&config.snapshot_path);
    engine.attach_listener(Arc::new(BrokerPublisher::new(
        publish_channel,
        &config.sort_exchange,
    )));
    engine.attach_listener(Arc::new(DiskSortMirror::new(&config.sort_mirror_dir)));
    let engine = Arc::new(engine);

    // Sink fan-out: the in-memory engine always, clickhouse when configured.
    let mut sinks: Vec<Arc<dyn EventSink>> = vec![engine.clone()];
    let mut clickhouse_sink: Option<Arc<ClickhouseSink>> = None;
    if let Some(ch_config) = ClickhouseConfig::from_env() {
        match ClickhouseSink::connect(ch_config).await {
            Ok(sink) => {
                let sink = Arc::new(sink);
                clickhouse_sink = Some(sink.clone());
                sinks.push(sink);
            }
            Err(e) => log::warn!("clickhouse logging disabled: {}", e),
        }
    }
    let sink: Arc<dyn EventSink> = Arc::new(FanoutSink::new(sinks));

    // Periodic decay/publish/save cycle.
    let save_engine = engine.clone();
    let save_interval = config.save_interval_secs;
    tokio::spawn(async move {
        let mut timer = interval(Duration::from_secs(save_interval));
        timer.tick().await;
        loop {
            timer.tick().await;
            if save_engine.changes() > 0 {
                save_engine.save().await;
            }
        }
    });

    // Broker consumer feeding the sink fan-out.
    let consume_channel = connection.create_channel().await?;
    let consume_sink = sink.clone();
    let tracking_topic = config.tracking_topic.clone();
    tokio::spawn(async move {
        if let Err(e) = broker::consume_tracking(consume_channel, &tracking_topic, consume_sink).await
        {
            log::error!("tracking consumer failed: {}", e);
        }
    });

    let listener = tokio::net::TcpListener::bind(&config.http_addr).await?;
    log::info!("listening on {}", config.http_addr);

    let app = http::router(engine.clone(), sink, &config);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Flush pending analytics rows and persist state exactly once.
    if let Some(ch) = clickhouse_sink {
        ch.close().await;
    }
    engine.save().await;
    log::info!("shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::warn!("failed to install shutdown handler: {}", e);
    }
}
