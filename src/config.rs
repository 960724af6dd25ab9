use std::env;

/// Service configuration loaded from environment variables
pub struct Config {
    pub rabbit_url: String,
    pub tracking_topic: String,
    pub sort_exchange: String,
    pub snapshot_path: String,
    pub sort_mirror_dir: String,
    pub http_addr: String,
    pub ingest_http: bool,
    pub save_interval_secs: u64,
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// `RABBIT_URL` is required; everything else has a default. Set
    /// `HTTP_INGEST=false` to answer beacon posts with 501 while keeping
    /// the broker path live.
    pub fn from_env() -> Self {
        let rabbit_url = env::var("RABBIT_URL").expect("RABBIT_URL must be set");

        Self {
            rabbit_url,
            tracking_topic: env::var("TRACKING_TOPIC").unwrap_or_else(|_| "tracking".to_string()),
            sort_exchange: env::var("SORT_EXCHANGE")
                .unwrap_or_else(|_| "sort_override".to_string()),
            snapshot_path: env::var("SNAPSHOT_PATH")
                .unwrap_or_else(|_| "data/tracking.json".to_string()),
            sort_mirror_dir: env::var("SORT_MIRROR_DIR").unwrap_or_else(|_| "data".to_string()),
            http_addr: env::var("HTTP_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            ingest_http: env::var("HTTP_INGEST")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(true),
            save_interval_secs: env::var("SAVE_INTERVAL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(60),
        }
    }
}
