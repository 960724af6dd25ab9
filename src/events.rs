//! Normalized tracking event taxonomy
//!
//! Inbound payloads are JSON documents discriminated by the integer `event`
//! field on the shared base record. Decoding reads the base first, then the
//! variant payload; unknown discriminators are reported to the caller so
//! they can be logged and dropped.

use chrono::Utc;
use serde::{Deserialize, Serialize};

pub const EVENT_SESSION_START: u16 = 0;
pub const EVENT_SEARCH: u16 = 1;
pub const EVENT_ITEM_CLICK: u16 = 2;
pub const EVENT_IMPRESSION: u16 = 5;
pub const EVENT_ACTION: u16 = 6;
pub const EVENT_SUGGEST: u16 = 7;
pub const EVENT_DATA_SET: u16 = 8;
pub const EVENT_CART_ADD: u16 = 11;
pub const EVENT_CART_REMOVE: u16 = 12;
pub const EVENT_CART_CLEAR: u16 = 13;
pub const EVENT_CART_ENTER_CHECKOUT: u16 = 14;
pub const EVENT_CART_QUANTITY: u16 = 15;
pub const EVENT_PURCHASE: u16 = 16;

pub fn current_timestamp() -> i64 {
    Utc::now().timestamp()
}

/// Metadata shared by every event variant.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BaseEvent {
    #[serde(rename = "ts", default)]
    pub timestamp: i64,
    #[serde(default)]
    pub session_id: i64,
    pub event: u16,
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub context: String,
}

impl BaseEvent {
    /// Stamp the event with the current time if the producer left it zero.
    pub fn set_timestamp(&mut self) {
        if self.timestamp == 0 {
            self.timestamp = current_timestamp();
        }
    }
}

/// Catalog item as carried on click, impression, cart and purchase events.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BaseItem {
    #[serde(default)]
    pub id: u32,
    #[serde(default)]
    pub position: f32,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub category2: String,
    #[serde(default)]
    pub category3: String,
    #[serde(default)]
    pub category4: String,
    #[serde(default)]
    pub category5: String,
    #[serde(default)]
    pub brand: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub price: f32,
    #[serde(default)]
    pub quantity: u32,
}

impl BaseItem {
    /// Non-empty category levels, in order.
    pub fn categories(&self) -> Vec<String> {
        [
            &self.category,
            &self.category2,
            &self.category3,
            &self.category4,
            &self.category5,
        ]
        .into_iter()
        .filter(|c| !c.is_empty())
        .cloned()
        .collect()
    }
}

/// Browser context captured when a session starts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionContent {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user_agent: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ip: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub language: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub referrer: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pragma: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionStartEvent {
    #[serde(flatten)]
    pub base: BaseEvent,
    #[serde(flatten)]
    pub content: SessionContent,
}

/// A facet filter carrying one or more selected string values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StringFilter {
    #[serde(rename = "id")]
    pub field_id: u32,
    #[serde(default)]
    pub value: Vec<String>,
}

/// A numeric range filter on a facet field.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RangeFilter {
    #[serde(rename = "id")]
    pub field_id: u32,
    #[serde(default)]
    pub min: f64,
    #[serde(default)]
    pub max: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchFilters {
    #[serde(rename = "string", default)]
    pub string_filter: Vec<StringFilter>,
    #[serde(rename = "range", default)]
    pub range_filter: Vec<RangeFilter>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchEvent {
    #[serde(flatten)]
    pub base: BaseEvent,
    #[serde(default)]
    pub filters: SearchFilters,
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub page: i32,
    #[serde(default)]
    pub number_of_results: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ItemClickEvent {
    #[serde(flatten)]
    pub base: BaseEvent,
    #[serde(flatten)]
    pub item: BaseItem,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImpressionEvent {
    #[serde(flatten)]
    pub base: BaseEvent,
    #[serde(default)]
    pub items: Vec<BaseItem>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionEvent {
    #[serde(flatten)]
    pub base: BaseEvent,
    #[serde(flatten)]
    pub item: BaseItem,
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub referer: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SuggestEvent {
    #[serde(flatten)]
    pub base: BaseEvent,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub suggestions: i32,
    #[serde(default)]
    pub results: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataSetEvent {
    #[serde(flatten)]
    pub base: BaseEvent,
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub positive: Vec<u32>,
    #[serde(default)]
    pub negative: Vec<u32>,
}

/// Single-item cart mutation. The numeric discriminator on the base event
/// is authoritative; `cart_type` is informational only.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CartEvent {
    #[serde(flatten)]
    pub base: BaseEvent,
    #[serde(flatten)]
    pub item: BaseItem,
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub cart_type: String,
}

/// Checkout entry carrying the full basket.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckoutEvent {
    #[serde(flatten)]
    pub base: BaseEvent,
    #[serde(default)]
    pub items: Vec<BaseItem>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PurchaseEvent {
    #[serde(flatten)]
    pub base: BaseEvent,
    #[serde(default)]
    pub items: Vec<BaseItem>,
}

/// Decoded tracking event, tagged by the wire discriminator. Serializes
/// back to the flat wire shape; decoding goes through [`TrackingEvent::decode`]
/// so the discriminator stays authoritative.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum TrackingEvent {
    SessionStart(SessionStartEvent),
    Search(SearchEvent),
    ItemClick(ItemClickEvent),
    Impression(ImpressionEvent),
    Action(ActionEvent),
    Suggest(SuggestEvent),
    DataSet(DataSetEvent),
    Cart(CartEvent),
    EnterCheckout(CheckoutEvent),
    Purchase(PurchaseEvent),
}

#[derive(Debug)]
pub enum EventDecodeError {
    Json(serde_json::Error),
    UnknownEvent(u16),
}

impl From<serde_json::Error> for EventDecodeError {
    fn from(err: serde_json::Error) -> Self {
        EventDecodeError::Json(err)
    }
}

impl std::fmt::Display for EventDecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventDecodeError::Json(e) => write!(f, "malformed event payload: {}", e),
            EventDecodeError::UnknownEvent(t) => write!(f, "unknown event type {}", t),
        }
    }
}

impl std::error::Error for EventDecodeError {}

impl TrackingEvent {
    /// Decode a raw JSON payload by its `event` discriminator and stamp a
    /// missing timestamp with the current time.
    pub fn decode(payload: &[u8]) -> Result<Self, EventDecodeError> {
        let base: BaseEvent = serde_json::from_slice(payload)?;
        let mut event = match base.event {
            EVENT_SESSION_START => TrackingEvent::SessionStart(serde_json::from_slice(payload)?),
            EVENT_SEARCH => TrackingEvent::Search(serde_json::from_slice(payload)?),
            EVENT_ITEM_CLICK => TrackingEvent::ItemClick(serde_json::from_slice(payload)?),
            EVENT_IMPRESSION => TrackingEvent::Impression(serde_json::from_slice(payload)?),
            EVENT_ACTION => TrackingEvent::Action(serde_json::from_slice(payload)?),
            EVENT_SUGGEST => TrackingEvent::Suggest(serde_json::from_slice(payload)?),
            EVENT_DATA_SET => TrackingEvent::DataSet(serde_json::from_slice(payload)?),
            EVENT_CART_ADD | EVENT_CART_REMOVE | EVENT_CART_CLEAR | EVENT_CART_QUANTITY => {
                TrackingEvent::Cart(serde_json::from_slice(payload)?)
            }
            EVENT_CART_ENTER_CHECKOUT => {
                TrackingEvent::EnterCheckout(serde_json::from_slice(payload)?)
            }
            EVENT_PURCHASE => TrackingEvent::Purchase(serde_json::from_slice(payload)?),
            other => return Err(EventDecodeError::UnknownEvent(other)),
        };
        event.base_mut().set_timestamp();
        Ok(event)
    }

    pub fn base(&self) -> &BaseEvent {
        match self {
            TrackingEvent::SessionStart(e) => &e.base,
            TrackingEvent::Search(e) => &e.base,
            TrackingEvent::ItemClick(e) => &e.base,
            TrackingEvent::Impression(e) => &e.base,
            TrackingEvent::Action(e) => &e.base,
            TrackingEvent::Suggest(e) => &e.base,
            TrackingEvent::DataSet(e) => &e.base,
            TrackingEvent::Cart(e) => &e.base,
            TrackingEvent::EnterCheckout(e) => &e.base,
            TrackingEvent::Purchase(e) => &e.base,
        }
    }

    pub fn base_mut(&mut self) -> &mut BaseEvent {
        match self {
            TrackingEvent::SessionStart(e) => &mut e.base,
            TrackingEvent::Search(e) => &mut e.base,
            TrackingEvent::ItemClick(e) => &mut e.base,
            TrackingEvent::Impression(e) => &mut e.base,
            TrackingEvent::Action(e) => &mut e.base,
            TrackingEvent::Suggest(e) => &mut e.base,
            TrackingEvent::DataSet(e) => &mut e.base,
            TrackingEvent::Cart(e) => &mut e.base,
            TrackingEvent::EnterCheckout(e) => &mut e.base,
            TrackingEvent::Purchase(e) => &mut e.base,
        }
    }
}

/// Short analytic label for a wire discriminator.
pub fn event_name(event_type: u16) -> String {
    match event_type {
        EVENT_SESSION_START => "session_start".to_string(),
        EVENT_SEARCH => "search".to_string(),
        EVENT_ITEM_CLICK => "item_click".to_string(),
        EVENT_IMPRESSION => "item_impression".to_string(),
        EVENT_ACTION => "item_action".to_string(),
        EVENT_SUGGEST => "suggest".to_string(),
        EVENT_DATA_SET => "data_set".to_string(),
        EVENT_CART_ADD => "cart_add".to_string(),
        EVENT_CART_REMOVE => "cart_remove".to_string(),
        EVENT_CART_CLEAR => "cart_clear".to_string(),
        EVENT_CART_ENTER_CHECKOUT => "cart_enter_checkout".to_string(),
        EVENT_CART_QUANTITY => "cart_quantity".to_string(),
        EVENT_PURCHASE => "purchase".to_string(),
        other => format!("event_{}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_item_click() {
        let payload = br#"{"ts":1000,"session_id":7,"event":2,"id":42,"position":3.0,"category":"Gaming","brand":"Acme"}"#;
        let event = TrackingEvent::decode(payload).unwrap();
        match event {
            TrackingEvent::ItemClick(click) => {
                assert_eq!(click.base.session_id, 7);
                assert_eq!(click.item.id, 42);
                assert_eq!(click.item.category, "Gaming");
            }
            other => panic!("expected item click, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_stamps_missing_timestamp() {
        let payload = br#"{"session_id":1,"event":2,"id":5}"#;
        let event = TrackingEvent::decode(payload).unwrap();
        assert!(event.base().timestamp > 0);
    }

    #[test]
    fn test_decode_preserves_producer_timestamp() {
        let payload = br#"{"ts":12345,"session_id":1,"event":5,"items":[{"id":1,"position":0.0}]}"#;
        let event = TrackingEvent::decode(payload).unwrap();
        assert_eq!(event.base().timestamp, 12345);
    }

    #[test]
    fn test_decode_unknown_discriminator() {
        let payload = br#"{"session_id":1,"event":99}"#;
        match TrackingEvent::decode(payload) {
            Err(EventDecodeError::UnknownEvent(99)) => {}
            other => panic!("expected unknown event error, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_malformed_json() {
        assert!(matches!(
            TrackingEvent::decode(b"{not json"),
            Err(EventDecodeError::Json(_))
        ));
    }

    #[test]
    fn test_cart_discriminator_is_authoritative() {
        // A "remove" label on an add event does not change the variant kind.
        let payload = br#"{"session_id":1,"event":12,"id":4,"quantity":1,"type":"add"}"#;
        let event = TrackingEvent::decode(payload).unwrap();
        match event {
            TrackingEvent::Cart(cart) => {
                assert_eq!(cart.base.event, EVENT_CART_REMOVE);
                assert_eq!(cart.cart_type, "add");
            }
            other => panic!("expected cart event, got {:?}", other),
        }
    }

    #[test]
    fn test_categories_skips_empty_levels() {
        let item = BaseItem {
            category: "Computing".to_string(),
            category3: "Laptops".to_string(),
            ..Default::default()
        };
        assert_eq!(item.categories(), vec!["Computing", "Laptops"]);
    }

    #[test]
    fn test_event_name_fallback() {
        assert_eq!(event_name(EVENT_CART_ADD), "cart_add");
        assert_eq!(event_name(4242), "event_4242");
    }
}
