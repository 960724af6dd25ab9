//! Coarse persona buckets
//!
//! Three seed groups exist at startup (`gamer`, `tv`, `apple`); events from
//! sessions tagged into a bucket are re-aggregated here with weights close
//! to the per-session ones. No new groups are created at runtime.

use crate::decay::{DecayEvent, DecayList, SortOverride};
use crate::events::{TrackingEvent, EVENT_CART_ADD};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersonalizationGroup {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub item_events: DecayList,
    #[serde(default)]
    pub field_events: DecayList,
    #[serde(rename = "ts", default)]
    pub created: i64,
    #[serde(default)]
    pub last_update: i64,
    #[serde(default)]
    pub last_sync: i64,
}

impl PersonalizationGroup {
    pub fn new(id: &str, name: &str) -> Self {
        PersonalizationGroup {
            id: id.to_string(),
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// The three groups present at startup.
    pub fn seed_groups() -> HashMap<String, PersonalizationGroup> {
        let mut groups = HashMap::new();
        for (id, name) in [("gamer", "Gamer"), ("tv", "TV"), ("apple", "Apple")] {
            groups.insert(id.to_string(), PersonalizationGroup::new(id, name));
        }
        groups
    }

    pub fn handle_event(&mut self, event: &TrackingEvent, now: i64) {
        if self.created == 0 {
            self.created = now;
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
                            value: 0.02 * f64::from(item.position.max(300.0)),
                        },
                    );
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
            _ => {}
        }
    }

    /// Decay both group lists, returning non-empty overrides for publication.
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
    use crate::events::{BaseEvent, BaseItem, ItemClickEvent, EVENT_ITEM_CLICK};

    #[test]
    fn test_seed_groups() {
        let groups = PersonalizationGroup::seed_groups();
        assert_eq!(groups.len(), 3);
        assert_eq!(groups["tv"].name, "TV");
        assert!(groups["gamer"].item_events.is_empty());
    }

    #[test]
    fn test_group_records_click() {
        let mut group = PersonalizationGroup::new("tv", "TV");
        let event = TrackingEvent::ItemClick(ItemClickEvent {
            base: BaseEvent {
                timestamp: 500,
                session_id: 1,
                event: EVENT_ITEM_CLICK,
                ..Default::default()
            },
            item: BaseItem {
                id: 77,
                category3: "TV".to_string(),
                ..Default::default()
            },
        });
        group.handle_event(&event, 500);

        assert_eq!(group.created, 500);
        let (items, fields) = group.decay_events(500);
        assert!(fields.is_none());
        let items = items.unwrap();
        assert!((items.0[&77] - 200.0).abs() < 1e-9);
    }
}
