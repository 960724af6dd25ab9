//! Funnel engine
//!
//! A funnel is a named collection of steps, each with filters matching a
//! fixed funnel event-type constant. Steps record the sessions that reach
//! them; a `session_unique` step counts each session once and bumps a
//! per-session counter for repeats instead of appending new events.

use crate::events::{
    TrackingEvent, EVENT_CART_ADD, EVENT_CART_CLEAR, EVENT_CART_REMOVE,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Reserved: filters with this type never match anything.
pub const FUNNEL_EVENT_ITEM_EVENT: u16 = 0;
pub const FUNNEL_EVENT_IMPRESSION: u16 = 1;
pub const FUNNEL_EVENT_ENTER_CHECKOUT: u16 = 2;
pub const FUNNEL_EVENT_CART_ADD: u16 = 3;
pub const FUNNEL_EVENT_CART_REMOVE: u16 = 4;
pub const FUNNEL_EVENT_CART_CLEAR: u16 = 5;
pub const FUNNEL_EVENT_CART_ENTER_CHECKOUT: u16 = 6;
pub const FUNNEL_EVENT_SEARCH: u16 = 7;
pub const FUNNEL_EVENT_ACTION: u16 = 8;
pub const FUNNEL_EVENT_SUGGEST: u16 = 9;
pub const FUNNEL_EVENT_PURCHASE: u16 = 10;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepMatcher {
    #[default]
    #[serde(rename = "none")]
    None,
    #[serde(rename = "cart-event")]
    CartEvent,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FunnelFilter {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub event_type: u16,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub match_data: String,
    #[serde(default)]
    pub matcher: StepMatcher,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FunnelEvent {
    pub session_id: i64,
    #[serde(rename = "ts")]
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FunnelStep {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub session_unique: bool,
    #[serde(default)]
    pub sessions: HashMap<i64, u32>,
    #[serde(default)]
    pub filter: Vec<FunnelFilter>,
    #[serde(default)]
    pub events: Vec<FunnelEvent>,
}

impl FunnelStep {
    /// Whether a filter accepts the event given its extracted tags.
    fn should_handle(filter: &FunnelFilter, tags: &[String]) -> bool {
        match filter.matcher {
            StepMatcher::None => true,
            StepMatcher::CartEvent => {
                filter.match_data.is_empty() || tags.iter().any(|t| t == &filter.match_data)
            }
        }
    }

    fn record(&mut self, session_id: i64, timestamp: i64, tags: &[String]) {
        if self.session_unique {
            if let Some(count) = self.sessions.get_mut(&session_id) {
                *count += 1;
                return;
            }
            self.sessions.insert(session_id, 1);
        }
        self.events.push(FunnelEvent {
            session_id,
            timestamp,
            tags: tags.to_vec(),
        });
        log::debug!("[funnel] recorded event in step {}", self.name);
    }

    pub fn clear_events(&mut self) {
        self.events.clear();
        self.sessions.clear();
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Funnel {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub steps: HashMap<String, FunnelStep>,
}

impl Funnel {
    pub fn process_event(&mut self, event: &TrackingEvent) {
        let event_type = funnel_event_type(event);
        if event_type == FUNNEL_EVENT_ITEM_EVENT {
            return;
        }
        let tags = event_tags(event);
        let base = event.base();

        for step in self.steps.values_mut() {
            let matches = step
                .filter
                .iter()
                .filter(|f| {
                    f.event_type != FUNNEL_EVENT_ITEM_EVENT
                        && f.event_type == event_type
                        && FunnelStep::should_handle(f, &tags)
                })
                .count();
            for _ in 0..matches {
                step.record(base.session_id, base.timestamp, &tags);
            }
        }
    }
}

/// Map a tracking event onto its funnel event-type constant. Events with
/// no funnel counterpart map to the reserved ignore value.
pub fn funnel_event_type(event: &TrackingEvent) -> u16 {
    match event {
        TrackingEvent::Impression(_) => FUNNEL_EVENT_IMPRESSION,
        TrackingEvent::EnterCheckout(_) => FUNNEL_EVENT_CART_ENTER_CHECKOUT,
        TrackingEvent::Cart(e) => match e.base.event {
            EVENT_CART_ADD => FUNNEL_EVENT_CART_ADD,
            EVENT_CART_REMOVE => FUNNEL_EVENT_CART_REMOVE,
            EVENT_CART_CLEAR => FUNNEL_EVENT_CART_CLEAR,
            _ => FUNNEL_EVENT_ITEM_EVENT,
        },
        TrackingEvent::Search(_) => FUNNEL_EVENT_SEARCH,
        TrackingEvent::Action(_) => FUNNEL_EVENT_ACTION,
        TrackingEvent::Suggest(_) => FUNNEL_EVENT_SUGGEST,
        TrackingEvent::Purchase(_) => FUNNEL_EVENT_PURCHASE,
        TrackingEvent::ItemClick(_)
        | TrackingEvent::SessionStart(_)
        | TrackingEvent::DataSet(_) => FUNNEL_EVENT_ITEM_EVENT,
    }
}

/// Tags extracted from an event for filter matching: item ids for list
/// events, whitespace-split words for suggest input, nothing otherwise.
pub fn event_tags(event: &TrackingEvent) -> Vec<String> {
    match event {
        TrackingEvent::Impression(e) => e.items.iter().map(|i| i.id.to_string()).collect(),
        TrackingEvent::EnterCheckout(e) => e.items.iter().map(|i| i.id.to_string()).collect(),
        TrackingEvent::Suggest(e) => e
            .value
            .split_whitespace()
            .map(|w| w.to_string())
            .collect(),
        _ => Vec::new(),
    }
}
