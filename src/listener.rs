//! Popularity publication fan-out
//!
//! After each decay pass the engine hands freshly computed override maps to
//! every attached listener. Publication is best-effort: failures are logged
//! by the caller and the next tick republishes current values.

use crate::decay::SortOverride;
use async_trait::async_trait;
use lapin::{options::BasicPublishOptions, BasicProperties, Channel};
use serde::Serialize;
use std::path::PathBuf;

#[derive(Debug)]
pub enum ListenerError {
    Broker(lapin::Error),
    Io(std::io::Error),
    Serialization(serde_json::Error),
}

impl From<lapin::Error> for ListenerError {
    fn from(err: lapin::Error) -> Self {
        ListenerError::Broker(err)
    }
}

impl From<std::io::Error> for ListenerError {
    fn from(err: std::io::Error) -> Self {
        ListenerError::Io(err)
    }
}

impl From<serde_json::Error> for ListenerError {
    fn from(err: serde_json::Error) -> Self {
        ListenerError::Serialization(err)
    }
}

impl std::fmt::Display for ListenerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ListenerError::Broker(e) => write!(f, "broker error: {}", e),
            ListenerError::Io(e) => write!(f, "IO error: {}", e),
            ListenerError::Serialization(e) => write!(f, "serialization error: {}", e),
        }
    }
}

impl std::error::Error for ListenerError {}

/// Downstream consumer of decayed override maps.
#[async_trait]
pub trait PopularityListener: Send + Sync {
    async fn popularity_changed(&self, sort: &SortOverride) -> Result<(), ListenerError>;
    async fn field_popularity_changed(&self, sort: &SortOverride) -> Result<(), ListenerError>;
    async fn session_popularity_changed(
        &self,
        session_id: i64,
        sort: &SortOverride,
    ) -> Result<(), ListenerError>;
    async fn session_field_popularity_changed(
        &self,
        session_id: i64,
        sort: &SortOverride,
    ) -> Result<(), ListenerError>;
    async fn group_popularity_changed(
        &self,
        group_id: &str,
        sort: &SortOverride,
    ) -> Result<(), ListenerError>;
    async fn group_field_popularity_changed(
        &self,
        group_id: &str,
        sort: &SortOverride,
    ) -> Result<(), ListenerError>;

    /// Listener label for logging.
    fn listener_type(&self) -> &'static str;
}

#[derive(Serialize)]
struct SortMessage<'a> {
    key: &'a str,
    data: &'a SortOverride,
}

/// Publishes override maps as JSON envelopes on a topic exchange.
pub struct BrokerPublisher {
    channel: Channel,
    exchange: String,
}

impl BrokerPublisher {
    pub fn new(channel: Channel, exchange: &str) -> Self {
        BrokerPublisher {
            channel,
            exchange: exchange.to_string(),
        }
    }

    async fn publish(&self, key: &str, sort: &SortOverride) -> Result<(), ListenerError> {
        let payload = serde_json::to_vec(&SortMessage { key, data: sort })?;
        let _confirm = self
            .channel
            .basic_publish(
                &self.exchange,
                key,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default(),
            )
            .await?;
        log::debug!("published {} ({} entries)", key, sort.len());
        Ok(())
    }
}

#[async_trait]
impl PopularityListener for BrokerPublisher {
    async fn popularity_changed(&self, sort: &SortOverride) -> Result<(), ListenerError> {
        self.publish("popular", sort).await
    }

    async fn field_popularity_changed(&self, sort: &SortOverride) -> Result<(), ListenerError> {
        self.publish("popular-fields", sort).await
    }

    async fn session_popularity_changed(
        &self,
        session_id: i64,
        sort: &SortOverride,
    ) -> Result<(), ListenerError> {
        self.publish(&format!("session-{}", session_id), sort).await
    }

    async fn session_field_popularity_changed(
        &self,
        session_id: i64,
        sort: &SortOverride,
    ) -> Result<(), ListenerError> {
        self.publish(&format!("session-fields-{}", session_id), sort)
            .await
    }

    async fn group_popularity_changed(
        &self,
        group_id: &str,
        sort: &SortOverride,
    ) -> Result<(), ListenerError> {
        self.publish(&format!("group-{}", group_id), sort).await
    }

    async fn group_field_popularity_changed(
        &self,
        group_id: &str,
        sort: &SortOverride,
    ) -> Result<(), ListenerError> {
        self.publish(&format!("group-fields-{}", group_id), sort)
            .await
    }

    fn listener_type(&self) -> &'static str {
        "broker"
    }
}

/// Mirrors every publication as one file per key in the `k:v,…` line
/// format, for consumers that poll the filesystem instead of the broker.
pub struct DiskSortMirror {
    path: PathBuf,
}

impl DiskSortMirror {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        DiskSortMirror { path: path.into() }
    }

    fn save_to_file(&self, filename: &str, sort: &SortOverride) -> Result<(), ListenerError> {
        std::fs::create_dir_all(&self.path)?;
        let file_path = self.path.join(filename);
        std::fs::write(file_path, sort.to_line_format())?;
        Ok(())
    }
}

#[async_trait]
impl PopularityListener for DiskSortMirror {
    async fn popularity_changed(&self, sort: &SortOverride) -> Result<(), ListenerError> {
        self.save_to_file("popular", sort)
    }

    async fn field_popularity_changed(&self, sort: &SortOverride) -> Result<(), ListenerError> {
        self.save_to_file("popular-fields", sort)
    }

    async fn session_popularity_changed(
        &self,
        session_id: i64,
        sort: &SortOverride,
    ) -> Result<(), ListenerError> {
        self.save_to_file(&format!("session-{}", session_id), sort)
    }

    async fn session_field_popularity_changed(
        &self,
        session_id: i64,
        sort: &SortOverride,
    ) -> Result<(), ListenerError> {
        self.save_to_file(&format!("session-fields-{}", session_id), sort)
    }

    async fn group_popularity_changed(
        &self,
        group_id: &str,
        sort: &SortOverride,
    ) -> Result<(), ListenerError> {
        self.save_to_file(&format!("group-{}", group_id), sort)
    }

    async fn group_field_popularity_changed(
        &self,
        group_id: &str,
        sort: &SortOverride,
    ) -> Result<(), ListenerError> {
        self.save_to_file(&format!("group-fields-{}", group_id), sort)
    }

    fn listener_type(&self) -> &'static str {
        "disk"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disk_mirror_writes_key_files() {
        let dir = tempfile::tempdir().unwrap();
        let mirror = DiskSortMirror::new(dir.path());

        let mut sort = SortOverride::default();
        sort.0.insert(42, 200.0);

        mirror.popularity_changed(&sort).await.unwrap();
        mirror.group_popularity_changed("tv", &sort).await.unwrap();

        let popular = std::fs::read_to_string(dir.path().join("popular")).unwrap();
        assert_eq!(popular, "42:200");

        let parsed = SortOverride::from_line_format(
            &std::fs::read_to_string(dir.path().join("group-tv")).unwrap(),
        )
        .unwrap();
        assert_eq!(parsed, sort);
    }
}
