//! Per-session aggregation state
//!
//! Each visitor session keeps its own decay lists, independent of the
//! global ones, with event weights tuned for personal relevance rather
//! than catalog-wide popularity. Sessions also accumulate persona scores
//! that route events into the coarse personalization groups.

use crate::decay::{DecayEvent, DecayList, SortOverride};
use crate::events::{SessionContent, TrackingEvent, EVENT_CART_ADD};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Soft cap on the per-session raw event log.
const EVENT_LIMIT: usize = 500;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionData {
    #[serde(default)]
    pub id: i64,
    #[serde(flatten)]
    pub content: SessionContent,
    #[serde(rename = "ts", default)]
    pub created: i64,
    #[serde(default)]
    pub last_update: i64,
    #[serde(default)]
    pub last_sync: i64,
    #[serde(default)]
    pub events: Vec<serde_json::Value>,
    #[serde(default)]
    pub visited_skus: Vec<u32>,
    #[serde(default)]
    pub groups: HashMap<String, f64>,
    #[serde(default)]
    pub variations: HashMap<String, String>,
    #[serde(default)]
    pub item_events: DecayList,
    #[serde(default)]
    pub field_events: DecayList,
}

impl SessionData {
    pub fn new(id: i64, content: SessionContent, now: i64) -> Self {
        SessionData {
            id,
            content,
            created: now,
            last_update: now,
            last_sync: 0,
            ..Default::default()
        }
    }

    /// Apply a tracking event to this session's decay state and persona
    /// scores. Returns the persona scores so the caller can forward the
    /// event into any matching personalization group.
    pub fn handle_event(&mut self, event: &TrackingEvent, now: i64) -> &HashMap<String, f64> {
        if let Ok(value) = serde_json::to_value(event) {
            self.events.push(value);
            if self.events.len() > EVENT_LIMIT {
                let excess = self.events.len() - EVENT_LIMIT;
                self.events.drain(..excess);
            }
        }
        self.last_update = now;

        match event {
            TrackingEvent::ItemClick(e) => {
                if e.item.id > 0 {
                    self.item_events.add(
                        e.item.id,
                        DecayEvent {
                            timestamp: now,
                            value: 200.0,
                        },
                    );
                    self.tag_persona(&e.item.category, &e.item.category3, &e.item.brand);
                } else {
                    log::debug!("item click without item, session {}", self.id);
                }
            }
            TrackingEvent::Search(e) => {
                for filter in &e.filters.string_filter {
                    self.field_events.add(
                        filter.field_id,
                        DecayEvent {
                            timestamp: now,
                            value: 150.0,
                        },
                    );
                }
                for filter in &e.filters.range_filter {
                    self.field_events.add(
                        filter.field_id,
                        DecayEvent {
                            timestamp: now,
                            value: 100.0,
                        },
                    );
                }
            }
            TrackingEvent::Impression(e) => {
                for item in &e.items {
                    self.item_events.add(
                        item.id,
                        DecayEvent {
                            timestamp: now,
                            value: 10.0 + 0.02 * f64::from(item.position.max(300.0)),
                        },
                    );
                    self.visited_skus.push(item.id);
                }
            }
            TrackingEvent::Cart(e) => {
                if e.base.event == EVENT_CART_ADD {
                    self.item_events.add(
                        e.item.id,
                        DecayEvent {
                            timestamp: now,
                            value: 700.0,
                        },
                    );
                }
            }
            TrackingEvent::Action(e) => {
                if e.item.id > 0 {
                    self.item_events.add(
                        e.item.id,
                        DecayEvent {
                            timestamp: now,
                            value: 80.0,
                        },
                    );
                }
            }
            TrackingEvent::Purchase(e) => {
                for item in &e.items {
                    self.item_events.add(
                        item.id,
                        DecayEvent {
                            timestamp: now,
                            value: 800.0 * f64::from(item.quantity),
                        },
                    );
                }
            }
            TrackingEvent::EnterCheckout(_)
            | TrackingEvent::Suggest(_)
            | TrackingEvent::SessionStart(_)
            | TrackingEvent::DataSet(_) => {}
        }
        &self.groups
    }

    fn tag_persona(&mut self, category: &str, category3: &str, brand: &str) {
        if category == "Gaming" {
            *self.groups.entry("gamer".to_string()).or_insert(0.0) += 5.0;
        } else if category3 == "TV" {
            *self.groups.entry("tv".to_string()).or_insert(0.0) += 5.0;
        } else if brand == "Apple" {
            *self.groups.entry("apple".to_string()).or_insert(0.0) += 3.0;
        }
    }

    /// Return the memoized A/B bucket for an experiment id, assigning one
    /// with a fair coin flip on first request.
    pub fn handle_variation(&mut self, id: &str) -> String {
        if let Some(existing) = self.variations.get(id) {
            return existing.clone();
        }
        let bucket = if rand::thread_rng().gen_range(0..100) < 50 {
            "a"
        } else {
            "b"
        };
        self.variations.insert(id.to_string(), bucket.to_string());
        bucket.to_string()
    }

    /// Decay both per-session lists, returning the non-empty overrides for
    /// publication. Updates `last_sync`.
    pub fn decay_events(&mut self, now: i64) -> (Option<SortOverride>, Option<SortOverride>) {
        self.last_sync = now;

        let items = if self.item_events.is_empty() {
            None
        } else {
            let sort = self.item_events.decay(now);
            (!sort.is_empty()).then_some(sort)
        };
        let fields = if self.field_events.is_empty() {
            None
        } else {
            let sort = self.field_events.decay(now);
            (!sort.is_empty()).then_some(sort)
        };
        (items, fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{
        BaseEvent, BaseItem, CartEvent, ImpressionEvent, ItemClickEvent, PurchaseEvent,
        EVENT_CART_ADD, EVENT_IMPRESSION, EVENT_ITEM_CLICK, EVENT_PURCHASE,
    };

    fn make_click(item_id: u32, category: &str, category3: &str, brand: &str) -> TrackingEvent {
        TrackingEvent::ItemClick(ItemClickEvent {
            base: BaseEvent {
                timestamp: 1000,
                session_id: 1,
                event: EVENT_ITEM_CLICK,
                ..Default::default()
            },
            item: BaseItem {
                id: item_id,
                category: category.to_string(),
                category3: category3.to_string(),
                brand: brand.to_string(),
                ..Default::default()
            },
        })
    }

    #[test]
    fn test_click_weight_and_persona() {
        let mut session = SessionData::new(1, SessionContent::default(), 1000);
        session.handle_event(&make_click(42, "", "TV", ""), 1000);

        assert_eq!(session.groups.get("tv"), Some(&5.0));
        let sort = session.item_events.decay(1000);
        assert!((sort.0[&42] - 200.0).abs() < 1e-9);
    }

    #[test]
    fn test_persona_chain_prefers_gaming() {
        // Category chain is exclusive: a Gaming item from Apple tags gamer only.
        let mut session = SessionData::new(1, SessionContent::default(), 1000);
        session.handle_event(&make_click(1, "Gaming", "TV", "Apple"), 1000);

        assert_eq!(session.groups.get("gamer"), Some(&5.0));
        assert!(session.groups.get("tv").is_none());
        assert!(session.groups.get("apple").is_none());
    }

    #[test]
    fn test_impression_weights_and_visited_skus() {
        let mut session = SessionData::new(1, SessionContent::default(), 1000);
        let event = TrackingEvent::Impression(ImpressionEvent {
            base: BaseEvent {
                timestamp: 1000,
                session_id: 1,
                event: EVENT_IMPRESSION,
                ..Default::default()
            },
            items: vec![
                BaseItem {
                    id: 10,
                    position: 0.0,
                    ..Default::default()
                },
                BaseItem {
                    id: 11,
                    position: 1.0,
                    ..Default::default()
                },
                BaseItem {
                    id: 12,
                    position: 2.0,
                    ..Default::default()
                },
            ],
        });
        session.handle_event(&event, 1000);

        assert_eq!(session.visited_skus, vec![10, 11, 12]);
        let sort = session.item_events.decay(1000);
        // Positions below the clamp all resolve to 10 + 0.02 * 300 = 16.
        for id in [10, 11, 12] {
            assert!((sort.0[&id] - 16.0).abs() < 1e-9, "item {}", id);
        }
    }

    #[test]
    fn test_cart_add_weight() {
        let mut session = SessionData::new(1, SessionContent::default(), 1000);
        let event = TrackingEvent::Cart(CartEvent {
            base: BaseEvent {
                timestamp: 1000,
                session_id: 1,
                event: EVENT_CART_ADD,
                ..Default::default()
            },
            item: BaseItem {
                id: 9,
                quantity: 2,
                ..Default::default()
            },
            cart_type: "add".to_string(),
        });
        session.handle_event(&event, 1000);

        let sort = session.item_events.decay(1000);
        assert!((sort.0[&9] - 700.0).abs() < 1e-9);
    }

    #[test]
    fn test_purchase_scales_with_quantity() {
        let mut session = SessionData::new(1, SessionContent::default(), 1000);
        let event = TrackingEvent::Purchase(PurchaseEvent {
            base: BaseEvent {
                timestamp: 1000,
                session_id: 1,
                event: EVENT_PURCHASE,
                ..Default::default()
            },
            items: vec![BaseItem {
                id: 3,
                quantity: 3,
                ..Default::default()
            }],
        });
        session.handle_event(&event, 1000);

        let sort = session.item_events.decay(1000);
        assert!((sort.0[&3] - 2400.0).abs() < 1e-9);
    }

    #[test]
    fn test_variation_is_memoized() {
        let mut session = SessionData::new(1, SessionContent::default(), 1000);
        let first = session.handle_variation("checkout-button");
        assert!(first == "a" || first == "b");
        for _ in 0..20 {
            assert_eq!(session.handle_variation("checkout-button"), first);
        }
    }

    #[test]
    fn test_event_log_capped() {
        let mut session = SessionData::new(1, SessionContent::default(), 1000);
        for i in 0..EVENT_LIMIT + 50 {
            session.handle_event(&make_click(i as u32 + 1, "", "", ""), 1000);
        }
        assert_eq!(session.events.len(), EVENT_LIMIT);
    }

    #[test]
    fn test_decay_events_skips_empty_lists() {
        let mut session = SessionData::new(1, SessionContent::default(), 1000);
        let (items, fields) = session.decay_events(2000);
        assert!(items.is_none());
        assert!(fields.is_none());
        assert_eq!(session.last_sync, 2000);
    }
}
