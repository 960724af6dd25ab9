//! ClickHouse columnar sink
//!
//! A write-only follower of the event stream. Each event is normalized
//! into one (or, for list events, many) fixed-schema rows and appended to
//! a batched inserter that flushes every two seconds or at 5000 rows.
//! Session starts additionally upsert into a replacing-merge sessions
//! table. Schema setup is idempotent and failures there are logged, never
//! fatal to ingest.

use crate::events::{event_name, BaseEvent, BaseItem, SessionStartEvent, TrackingEvent};
use crate::sink::EventSink;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use clickhouse::inserter::Inserter;
use clickhouse::{Client, Row};
use serde::Serialize;
use std::env;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::timeout;

const FLUSH_PERIOD: Duration = Duration::from_secs(2);
const FLUSH_MAX_ROWS: u64 = 5000;

#[derive(Debug, Clone)]
pub struct ClickhouseConfig {
    pub url: String,
    pub database: String,
    pub username: String,
    pub password: String,
    pub events_table: String,
    pub sessions_table: String,
    pub dial_timeout: Duration,
    pub write_timeout: Duration,
}

impl ClickhouseConfig {
    /// Build the sink configuration from environment variables. Returns
    /// `None` when no address is configured, which disables the sink.
    ///
    /// Knobs: `CLICKHOUSE_ADDR`, `CLICKHOUSE_DATABASE`,
    /// `CLICKHOUSE_USERNAME`, `CLICKHOUSE_PASSWORD`,
    /// `CLICKHOUSE_EVENTS_TABLE`, `CLICKHOUSE_SESSIONS_TABLE`,
    /// `CLICKHOUSE_SECURE`, `CLICKHOUSE_DIAL_TIMEOUT_SECS`,
    /// `CLICKHOUSE_WRITE_TIMEOUT_SECS`.
    pub fn from_env() -> Option<Self> {
        let addr = env::var("CLICKHOUSE_ADDR").ok()?;
        let addr = addr.trim().to_string();
        if addr.is_empty() {
            return None;
        }

        let secure = matches!(
            env::var("CLICKHOUSE_SECURE")
                .unwrap_or_default()
                .to_lowercase()
                .as_str(),
            "1" | "true" | "yes" | "y" | "on"
        );

        let url = if addr.contains("://") {
            addr
        } else {
            let scheme = if secure { "https" } else { "http" };
            let addr = if addr.contains(':') {
                addr
            } else {
                format!("{}:8123", addr)
            };
            format!("{}://{}", scheme, addr)
        };

        let parse_secs = |key: &str, default: u64| {
            env::var(key)
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(default)
        };

        Some(ClickhouseConfig {
            url,
            database: env::var("CLICKHOUSE_DATABASE").unwrap_or_else(|_| "tracking".to_string()),
            username: env::var("CLICKHOUSE_USERNAME").unwrap_or_default(),
            password: env::var("CLICKHOUSE_PASSWORD").unwrap_or_default(),
            events_table: env::var("CLICKHOUSE_EVENTS_TABLE")
                .unwrap_or_else(|_| "events".to_string()),
            sessions_table: env::var("CLICKHOUSE_SESSIONS_TABLE")
                .unwrap_or_else(|_| "sessions".to_string()),
            dial_timeout: Duration::from_secs(parse_secs("CLICKHOUSE_DIAL_TIMEOUT_SECS", 5)),
            write_timeout: Duration::from_secs(parse_secs("CLICKHOUSE_WRITE_TIMEOUT_SECS", 5)),
        })
    }
}

/// One analytic row per event (or per item for list events).
#[derive(Debug, Clone, Row, Serialize)]
pub struct EventRow {
    #[serde(with = "clickhouse::serde::chrono::datetime")]
    pub event_time: DateTime<Utc>,
    #[serde(with = "clickhouse::serde::chrono::date")]
    pub event_date: NaiveDate,
    pub session_id: i64,
    pub event_type: u16,
    pub event_name: String,
    pub event_value: f64,
    pub country: String,
    pub context: String,
    pub item_id: u32,
    pub item_position: f32,
    pub item_price: f32,
    pub item_quantity: u32,
    pub item_brand: String,
    pub item_categories: Vec<String>,
    pub action: String,
    pub cart_type: String,
    pub query: String,
    pub number_of_results: i32,
    pub suggestions: i32,
    pub results: i32,
    pub filters_json: String,
    pub referer: String,
    pub ip: String,
    pub user_agent: String,
    pub payload_json: String,
}

#[derive(Debug, Clone, Row, Serialize)]
pub struct SessionRow {
    pub session_id: i64,
    #[serde(with = "clickhouse::serde::chrono::datetime")]
    pub started_at: DateTime<Utc>,
    pub country: String,
    pub context: String,
    pub ip: String,
    pub user_agent: String,
    pub language: String,
    pub referrer: String,
    pub pragma: String,
}

fn event_timestamp(base: &BaseEvent) -> DateTime<Utc> {
    Utc.timestamp_opt(base.timestamp, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

fn empty_row(base: &BaseEvent) -> EventRow {
    let event_time = event_timestamp(base);
    EventRow {
        event_time,
        event_date: event_time.date_naive(),
        session_id: base.session_id,
        event_type: base.event,
        event_name: event_name(base.event),
        event_value: 1.0,
        country: base.country.clone(),
        context: base.context.clone(),
        item_id: 0,
        item_position: 0.0,
        item_price: 0.0,
        item_quantity: 0,
        item_brand: String::new(),
        item_categories: Vec::new(),
        action: String::new(),
        cart_type: String::new(),
        query: String::new(),
        number_of_results: 0,
        suggestions: 0,
        results: 0,
        filters_json: String::new(),
        referer: String::new(),
        ip: String::new(),
        user_agent: String::new(),
        payload_json: String::new(),
    }
}

fn with_item(mut row: EventRow, item: &BaseItem) -> EventRow {
    row.item_id = item.id;
    row.item_position = item.position;
    row.item_price = item.price;
    row.item_quantity = item.quantity;
    row.item_brand = item.brand.clone();
    row.item_categories = item.categories();
    row
}

fn marshal_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|e| {
        log::warn!("clickhouse: payload marshal failed: {}", e);
        String::new()
    })
}

/// Normalize one tracking event into its analytic rows.
pub fn event_rows(event: &TrackingEvent) -> Vec<EventRow> {
    match event {
        TrackingEvent::SessionStart(e) => {
            let mut row = empty_row(&e.base);
            row.referer = e.content.referrer.clone();
            row.ip = e.content.ip.clone();
            row.user_agent = e.content.user_agent.clone();
            row.payload_json = marshal_json(e);
            vec![row]
        }
        TrackingEvent::Search(e) => {
            let mut row = empty_row(&e.base);
            row.query = e.query.clone();
            row.number_of_results = e.number_of_results as i32;
            row.filters_json = marshal_json(&e.filters);
            row.payload_json = marshal_json(e);
            vec![row]
        }
        TrackingEvent::ItemClick(e) => {
            let mut row = with_item(empty_row(&e.base), &e.item);
            row.payload_json = marshal_json(e);
            vec![row]
        }
        TrackingEvent::Impression(e) => e
            .items
            .iter()
            .map(|item| {
                let mut row = with_item(empty_row(&e.base), item);
                row.payload_json = marshal_json(e);
                row
            })
            .collect(),
        TrackingEvent::Action(e) => {
            let mut row = with_item(empty_row(&e.base), &e.item);
            row.action = e.action.clone();
            row.referer = e.referer.clone();
            row.payload_json = marshal_json(e);
            vec![row]
        }
        TrackingEvent::Suggest(e) => {
            let mut row = empty_row(&e.base);
            row.query = e.value.clone();
            row.suggestions = e.suggestions;
            row.results = e.results;
            row.payload_json = marshal_json(e);
            vec![row]
        }
        TrackingEvent::DataSet(e) => {
            let mut row = empty_row(&e.base);
            row.query = e.query.clone();
            row.payload_json = marshal_json(e);
            vec![row]
        }
        TrackingEvent::Cart(e) => {
            let mut row = with_item(empty_row(&e.base), &e.item);
            row.cart_type = e.cart_type.clone();
            row.event_value = f64::from(e.item.quantity);
            row.payload_json = marshal_json(e);
            vec![row]
        }
        TrackingEvent::EnterCheckout(e) => e
            .items
            .iter()
            .map(|item| {
                let mut row = with_item(empty_row(&e.base), item);
                row.cart_type = "checkout".to_string();
                row.event_value = f64::from(item.quantity);
                row.payload_json = marshal_json(e);
                row
            })
            .collect(),
        TrackingEvent::Purchase(e) => e
            .items
            .iter()
            .map(|item| {
                let mut row = with_item(empty_row(&e.base), item);
                row.event_value = f64::from(item.quantity);
                row.payload_json = marshal_json(e);
                row
            })
            .collect(),
    }
}

fn session_row(event: &SessionStartEvent) -> SessionRow {
    SessionRow {
        session_id: event.base.session_id,
        started_at: event_timestamp(&event.base),
        country: event.base.country.clone(),
        context: event.base.context.clone(),
        ip: event.content.ip.clone(),
        user_agent: event.content.user_agent.clone(),
        language: event.content.language.clone(),
        referrer: event.content.referrer.clone(),
        pragma: event.content.pragma.clone(),
    }
}

fn quote_identifier(identifier: &str) -> String {
    format!("`{}`", identifier.replace('`', "``"))
}

pub struct ClickhouseSink {
    client: Client,
    cfg: ClickhouseConfig,
    inserter: Mutex<Inserter<EventRow>>,
}

impl ClickhouseSink {
    /// Connect, verify the server answers, make sure the schema exists and
    /// prepare the batched inserter.
    pub async fn connect(cfg: ClickhouseConfig) -> Result<Self, clickhouse::error::Error> {
        let base_client = Client::default()
            .with_url(&cfg.url)
            .with_user(&cfg.username)
            .with_password(&cfg.password);

        match timeout(cfg.dial_timeout, base_client.query("SELECT 1").execute()).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(clickhouse::error::Error::Custom(format!(
                    "clickhouse did not answer within {:?}",
                    cfg.dial_timeout
                )))
            }
        }

        ensure_schema(&base_client, &cfg).await?;

        let client = base_client.with_database(&cfg.database);
        let inserter = client
            .inserter::<EventRow>(&cfg.events_table)?
            .with_max_rows(FLUSH_MAX_ROWS)
            .with_period(Some(FLUSH_PERIOD));

        log::info!(
            "clickhouse sink ready: {}.{}",
            cfg.database,
            cfg.events_table
        );

        Ok(ClickhouseSink {
            client,
            cfg,
            inserter: Mutex::new(inserter),
        })
    }

    async fn append_rows(&self, rows: Vec<EventRow>) {
        let mut inserter = self.inserter.lock().await;
        for row in &rows {
            if let Err(e) = inserter.write(row) {
                log::warn!("clickhouse: append event failed: {}", e);
                self.replace_inserter(&mut inserter);
                return;
            }
        }
        match timeout(self.cfg.write_timeout, inserter.commit()).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                log::warn!("clickhouse: commit failed: {}", e);
                self.replace_inserter(&mut inserter);
            }
            Err(_) => {
                log::warn!("clickhouse: commit timed out");
                self.replace_inserter(&mut inserter);
            }
        }
    }

    /// Drop a wedged batch and start a fresh one; ingest never blocks on
    /// the sink.
    fn replace_inserter(&self, inserter: &mut Inserter<EventRow>) {
        match self.client.inserter(&self.cfg.events_table) {
            Ok(fresh) => {
                *inserter = fresh
                    .with_max_rows(FLUSH_MAX_ROWS)
                    .with_period(Some(FLUSH_PERIOD));
            }
            Err(e) => log::error!("clickhouse: failed to prepare fresh batch: {}", e),
        }
    }

    async fn insert_session(&self, row: SessionRow) {
        let insert = match self.client.insert::<SessionRow>(&self.cfg.sessions_table) {
            Ok(insert) => insert,
            Err(e) => {
                log::warn!("clickhouse: prepare session insert failed: {}", e);
                return;
            }
        };
        let write = async move {
            let mut insert = insert;
            insert.write(&row).await?;
            insert.end().await
        };
        match timeout(self.cfg.write_timeout, write).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::warn!("clickhouse: session insert failed: {}", e),
            Err(_) => log::warn!("clickhouse: session insert timed out"),
        }
    }

    /// Flush anything still buffered; called once at shutdown.
    pub async fn close(&self) {
        let mut inserter = self.inserter.lock().await;
        if let Err(e) = inserter.force_commit().await {
            log::warn!("clickhouse: final flush failed: {}", e);
        }
    }
}

#[async_trait]
impl EventSink for ClickhouseSink {
    async fn handle(&self, event: &TrackingEvent) {
        if let TrackingEvent::SessionStart(e) = event {
            self.insert_session(session_row(e)).await;
        }
        let rows = event_rows(event);
        if !rows.is_empty() {
            self.append_rows(rows).await;
        }
    }

    fn sink_type(&self) -> &'static str {
        "clickhouse"
    }
}

/// Idempotent schema setup. Table creation errors are returned; the
/// auxiliary projections and skip indexes only log on failure so older
/// servers keep working.
async fn ensure_schema(
    client: &Client,
    cfg: &ClickhouseConfig,
) -> Result<(), clickhouse::error::Error> {
    let database = quote_identifier(&cfg.database);
    let events = format!("{}.{}", database, quote_identifier(&cfg.events_table));
    let sessions = format!("{}.{}", database, quote_identifier(&cfg.sessions_table));

    client
        .query(&format!("CREATE DATABASE IF NOT EXISTS {}", database))
        .execute()
        .await?;

    let create_events = format!(
        "CREATE TABLE IF NOT EXISTS {} (
            event_time DateTime('UTC'),
            event_date Date DEFAULT toDate(event_time),
            session_id Int64,
            event_type UInt16,
            event_name LowCardinality(String),
            event_value Float64,
            country LowCardinality(String),
            context String,
            item_id UInt32,
            item_position Float32,
            item_price Float32,
            item_quantity UInt32,
            item_brand LowCardinality(String),
            item_categories Array(LowCardinality(String)),
            action LowCardinality(String),
            cart_type LowCardinality(String),
            query String,
            number_of_results Int32,
            suggestions Int32,
            results Int32,
            filters_json String,
            referer String,
            ip String,
            user_agent String,
            payload_json String,
            inserted_at DateTime('UTC') DEFAULT now('UTC')
        ) ENGINE = MergeTree()
        PARTITION BY toYYYYMM(event_date)
        ORDER BY (event_date, event_type, item_id, session_id)
        SETTINGS index_granularity = 8192",
        events
    );
    client.query(&create_events).execute().await?;

    let create_sessions = format!(
        "CREATE TABLE IF NOT EXISTS {} (
            session_id Int64,
            started_at DateTime('UTC'),
            country LowCardinality(String),
            context String,
            ip String,
            user_agent String,
            language LowCardinality(String),
            referrer String,
            pragma String,
            inserted_at DateTime('UTC') DEFAULT now('UTC')
        ) ENGINE = ReplacingMergeTree(inserted_at)
        ORDER BY (session_id)
        SETTINGS index_granularity = 8192",
        sessions
    );
    client.query(&create_sessions).execute().await?;

    let auxiliaries = [
        format!(
            "ALTER TABLE {} ADD PROJECTION IF NOT EXISTS session_idx \
             (SELECT * ORDER BY (session_id, event_time))",
            events
        ),
        format!(
            "ALTER TABLE {} ADD PROJECTION IF NOT EXISTS item_idx \
             (SELECT * ORDER BY (item_id, event_time))",
            events
        ),
        format!(
            "ALTER TABLE {} ADD INDEX IF NOT EXISTS idx_session_id session_id \
             TYPE minmax GRANULARITY 1",
            events
        ),
        format!(
            "ALTER TABLE {} ADD INDEX IF NOT EXISTS idx_item_id item_id \
             TYPE minmax GRANULARITY 1",
            events
        ),
    ];
    for statement in auxiliaries {
        if let Err(e) = client.query(&statement).execute().await {
            log::warn!("clickhouse: schema auxiliary failed: {}", e);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{
        CheckoutEvent, ImpressionEvent, ItemClickEvent, SearchEvent, StringFilter,
        EVENT_CART_ENTER_CHECKOUT, EVENT_IMPRESSION, EVENT_ITEM_CLICK, EVENT_SEARCH,
        EVENT_SESSION_START,
    };

    fn base(event: u16) -> BaseEvent {
        BaseEvent {
            timestamp: 1_700_000_000,
            session_id: 9,
            event,
            country: "no".to_string(),
            context: "web".to_string(),
        }
    }

    #[test]
    fn test_click_row() {
        let event = TrackingEvent::ItemClick(ItemClickEvent {
            base: base(EVENT_ITEM_CLICK),
            item: BaseItem {
                id: 42,
                position: 2.0,
                brand: "Acme".to_string(),
                category: "Computing".to_string(),
                category3: "Laptops".to_string(),
                price: 999.5,
                quantity: 1,
                ..Default::default()
            },
        });

        let rows = event_rows(&event);
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.event_name, "item_click");
        assert_eq!(row.item_id, 42);
        assert_eq!(row.item_categories, vec!["Computing", "Laptops"]);
        assert_eq!(row.event_value, 1.0);
        assert_eq!(row.country, "no");
        assert!(row.payload_json.contains("\"id\":42"));
    }

    #[test]
    fn test_impression_emits_row_per_item() {
        let event = TrackingEvent::Impression(ImpressionEvent {
            base: base(EVENT_IMPRESSION),
            items: vec![
                BaseItem {
                    id: 1,
                    ..Default::default()
                },
                BaseItem {
                    id: 2,
                    ..Default::default()
                },
                BaseItem {
                    id: 3,
                    ..Default::default()
                },
            ],
        });

        let rows = event_rows(&event);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1].item_id, 2);
        assert_eq!(rows[1].session_id, 9);
    }

    #[test]
    fn test_checkout_rows_carry_quantity() {
        let event = TrackingEvent::EnterCheckout(CheckoutEvent {
            base: base(EVENT_CART_ENTER_CHECKOUT),
            items: vec![BaseItem {
                id: 5,
                quantity: 3,
                ..Default::default()
            }],
        });

        let rows = event_rows(&event);
        assert_eq!(rows[0].cart_type, "checkout");
        assert_eq!(rows[0].event_value, 3.0);
    }

    #[test]
    fn test_search_row_encodes_filters() {
        let mut search = SearchEvent {
            base: base(EVENT_SEARCH),
            query: "phone".to_string(),
            number_of_results: 12,
            ..Default::default()
        };
        search.filters.string_filter.push(StringFilter {
            field_id: 3,
            value: vec!["apple".to_string()],
        });

        let rows = event_rows(&TrackingEvent::Search(search));
        assert_eq!(rows[0].query, "phone");
        assert_eq!(rows[0].number_of_results, 12);
        assert!(rows[0].filters_json.contains("apple"));
    }

    #[test]
    fn test_event_date_matches_event_time() {
        let event = TrackingEvent::ItemClick(ItemClickEvent {
            base: base(EVENT_ITEM_CLICK),
            item: BaseItem {
                id: 1,
                ..Default::default()
            },
        });
        let rows = event_rows(&event);
        assert_eq!(rows[0].event_date, rows[0].event_time.date_naive());
    }

    #[test]
    fn test_session_row_from_start_event() {
        let event = SessionStartEvent {
            base: base(EVENT_SESSION_START),
            content: crate::events::SessionContent {
                ip: "10.0.0.1".to_string(),
                user_agent: "test-agent".to_string(),
                language: "en".to_string(),
                ..Default::default()
            },
        };
        let row = session_row(&event);
        assert_eq!(row.session_id, 9);
        assert_eq!(row.ip, "10.0.0.1");
        assert_eq!(row.language, "en");
    }

    #[test]
    fn test_quote_identifier_escapes_backticks() {
        assert_eq!(quote_identifier("events"), "`events`");
        assert_eq!(quote_identifier("ev`ents"), "`ev``ents`");
    }
}
