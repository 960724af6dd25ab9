//! Core tracking engine
//!
//! Process-wide aggregate behind a single reader/writer lock. Event
//! handlers mutate the global decay lists, the owning session and any
//! matched persona group in one lock acquisition; funnel processing
//! re-acquires the lock separately so it stays decoupled from the hot
//! path. A periodic save cycle decays everything, publishes the fresh
//! override maps to the attached listeners and persists a snapshot.

use crate::decay::{DecayEvent, DecayList, SortOverride, PRUNE_FLOOR};
use crate::events::{
    current_timestamp, ActionEvent, CartEvent, CheckoutEvent, DataSetEvent, ImpressionEvent,
    ItemClickEvent, PurchaseEvent, SearchEvent, SessionContent, SessionStartEvent, SuggestEvent,
    TrackingEvent, EVENT_CART_ADD,
};
use crate::funnel::Funnel;
use crate::groups::PersonalizationGroup;
use crate::listener::PopularityListener;
use crate::metrics;
use crate::session::SessionData;
use crate::snapshot;
use crate::suggest::{
    decay_suggestions, normalize_query, FacetValueResult, QueryMatcher, QueryResult,
};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, RwLock};

/// Sessions idle for longer than this are evicted during cleanup.
const SESSION_TTL: i64 = 7 * 86400;

/// Decayed co-occurrence lists for one source item.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProductRelation {
    #[serde(default)]
    pub item_id: u32,
    #[serde(default)]
    pub other: HashMap<u32, DecayList>,
}

fn add_relation(relations: &mut HashMap<u32, ProductRelation>, from: u32, to: u32, now: i64) {
    let relation = relations.entry(from).or_insert_with(|| ProductRelation {
        item_id: from,
        other: HashMap::new(),
    });
    relation.other.entry(to).or_default().add(
        to,
        DecayEvent {
            timestamp: now,
            value: 20.0,
        },
    );
}

/// The whole aggregated state; this struct is the snapshot document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineState {
    #[serde(default)]
    pub item_popularity: SortOverride,
    #[serde(default)]
    pub field_popularity: SortOverride,
    #[serde(default)]
    pub queries: HashMap<String, u64>,
    #[serde(rename = "suggestions", default)]
    pub query_events: HashMap<String, QueryMatcher>,
    #[serde(default)]
    pub sessions: HashMap<i64, SessionData>,
    #[serde(default)]
    pub item_events: DecayList,
    #[serde(default)]
    pub field_events: DecayList,
    #[serde(default)]
    pub field_value_events: HashMap<u32, HashMap<String, crate::decay::DecayPopularity>>,
    #[serde(default)]
    pub field_value_scores: HashMap<u32, Vec<FacetValueResult>>,
    #[serde(default)]
    pub sorted_queries: Vec<QueryResult>,
    #[serde(rename = "funnel_storage", default)]
    pub funnels: Vec<Funnel>,
    #[serde(rename = "empty_results_v2", default)]
    pub empty_results: Vec<SearchEvent>,
    #[serde(rename = "personalization_groups", default)]
    pub groups: HashMap<String, PersonalizationGroup>,
    #[serde(rename = "dataset", default)]
    pub data_set: Vec<DataSetEvent>,
    #[serde(default)]
    pub viewed_together: HashMap<u32, ProductRelation>,
    #[serde(default)]
    pub also_bought: HashMap<u32, ProductRelation>,
}

impl Default for EngineState {
    fn default() -> Self {
        EngineState {
            item_popularity: SortOverride::default(),
            field_popularity: SortOverride::default(),
            queries: HashMap::new(),
            query_events: HashMap::new(),
            sessions: HashMap::new(),
            item_events: DecayList::default(),
            field_events: DecayList::default(),
            field_value_events: HashMap::new(),
            field_value_scores: HashMap::new(),
            sorted_queries: Vec::new(),
            funnels: Vec::new(),
            empty_results: Vec::new(),
            groups: PersonalizationGroup::seed_groups(),
            data_set: Vec::new(),
            viewed_together: HashMap::new(),
            also_bought: HashMap::new(),
        }
    }
}

impl EngineState {
    /// Post-load fixup: mirror map keys back into the value ids and make
    /// sure the seed persona groups exist.
    pub fn normalize(&mut self) {
        for (id, session) in self.sessions.iter_mut() {
            session.id = *id;
        }
        for (id, group) in self.groups.iter_mut() {
            group.id = id.clone();
        }
        for (id, group) in PersonalizationGroup::seed_groups() {
            self.groups.entry(id).or_insert(group);
        }
    }
}

/// Summary row for the session listing endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct SessionOverview {
    pub id: String,
    #[serde(flatten)]
    pub content: SessionContent,
    #[serde(rename = "ts")]
    pub created: i64,
    pub last_update: i64,
    pub last_sync: i64,
    pub event_count: usize,
}

pub struct TrackingEngine {
    path: PathBuf,
    state: RwLock<EngineState>,
    changes: AtomicU64,
    listeners: Vec<Arc<dyn PopularityListener>>,
}

impl TrackingEngine {
    /// Load the engine from the snapshot path, starting empty when no
    /// snapshot exists or it cannot be read.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let state = match snapshot::load_state(&path) {
            Ok(state) => state,
            Err(e) => {
                log::warn!("failed to load tracking snapshot: {}", e);
                EngineState::default()
            }
        };
        TrackingEngine {
            path,
            state: RwLock::new(state),
            changes: AtomicU64::new(0),
            listeners: Vec::new(),
        }
    }

    pub fn attach_listener(&mut self, listener: Arc<dyn PopularityListener>) {
        log::info!("attached {} popularity listener", listener.listener_type());
        self.listeners.push(listener);
    }

    pub fn changes(&self) -> u64 {
        self.changes.load(AtomicOrdering::Relaxed)
    }

    fn mark_changed(&self) {
        self.changes.fetch_add(1, AtomicOrdering::Relaxed);
        metrics::inc_events_processed();
    }

    /// Dispatch one decoded event into the aggregate, then run it through
    /// the funnels under a separate lock acquisition.
    pub fn handle_tracking_event(&self, event: &TrackingEvent) {
        match event {
            TrackingEvent::SessionStart(e) => self.handle_session_event(e),
            TrackingEvent::Search(e) => self.handle_search_event(event, e),
            TrackingEvent::ItemClick(e) => self.handle_click_event(event, e),
            TrackingEvent::Impression(e) => self.handle_impression_event(event, e),
            TrackingEvent::Action(e) => self.handle_action_event(event, e),
            TrackingEvent::Suggest(e) => self.handle_suggest_event(event, e),
            TrackingEvent::DataSet(e) => self.handle_dataset_event(e),
            TrackingEvent::Cart(e) => self.handle_cart_event(event, e),
            TrackingEvent::EnterCheckout(e) => self.handle_checkout_event(event, e),
            TrackingEvent::Purchase(e) => self.handle_purchase_event(event, e),
        }
    }

    fn handle_session_event(&self, event: &SessionStartEvent) {
        let now = current_timestamp();
        {
            let mut state = self.state.write().unwrap();
            update_session(
                &mut state,
                &TrackingEvent::SessionStart(event.clone()),
                event.base.session_id,
                Some(event.content.clone()),
                now,
            );
        }
        self.mark_changed();
    }

    fn handle_click_event(&self, event: &TrackingEvent, click: &ItemClickEvent) {
        let now = current_timestamp();
        {
            let mut state = self.state.write().unwrap();
            state.item_events.add(
                click.item.id,
                DecayEvent {
                    timestamp: now,
                    value: 200.0 + 0.1 * f64::from(click.item.position.min(300.0)),
                },
            );

            let visited = update_session(&mut state, event, click.base.session_id, None, now);
            // Every sku already seen in this session co-occurs with the
            // clicked item.
            for viewed in visited {
                if viewed == click.item.id {
                    continue;
                }
                add_relation(&mut state.viewed_together, viewed, click.item.id, now);
            }
        }
        self.mark_changed();
        self.process_funnels(event);
    }

    fn handle_search_event(&self, event: &TrackingEvent, search: &SearchEvent) {
        let now = current_timestamp();
        {
            let mut state = self.state.write().unwrap();

            if search.number_of_results == 0 {
                if !search.query.is_empty() {
                    log::debug!("search with no results: {}", search.query);
                    state.empty_results.push(search.clone());
                }
                return;
            }

            if !search.query.is_empty() && search.query != "*" {
                let normalized = normalize_query(&search.query);
                *state.queries.entry(normalized.clone()).or_insert(0) += 1;

                if !normalized.is_empty() {
                    let matcher = state.query_events.entry(normalized).or_default();
                    matcher.popularity.add(DecayEvent {
                        timestamp: now,
                        value: 20.0,
                    });
                    for filter in &search.filters.string_filter {
                        for value in &filter.value {
                            matcher.add_key_filter_event(filter.field_id, value, now);
                        }
                    }
                }
            } else {
                for filter in &search.filters.string_filter {
                    state.field_events.add(
                        filter.field_id,
                        DecayEvent {
                            timestamp: now,
                            value: 40.0,
                        },
                    );
                    let field_values = state
                        .field_value_events
                        .entry(filter.field_id)
                        .or_default();
                    for value in &filter.value {
                        field_values.entry(value.clone()).or_default().add(DecayEvent {
                            timestamp: now,
                            value: 80.0,
                        });
                    }
                }
                for filter in &search.filters.range_filter {
                    state.field_events.add(
                        filter.field_id,
                        DecayEvent {
                            timestamp: now,
                            value: 30.0,
                        },
                    );
                }
            }

            update_session(&mut state, event, search.base.session_id, None, now);
        }
        self.mark_changed();
        self.process_funnels(event);
    }

    fn handle_impression_event(&self, event: &TrackingEvent, impression: &ImpressionEvent) {
        let now = current_timestamp();
        {
            let mut state = self.state.write().unwrap();
            for item in &impression.items {
                state.item_events.add(
                    item.id,
                    DecayEvent {
                        timestamp: now,
                        value: f64::from(item.position),
                    },
                );
            }
            update_session(&mut state, event, impression.base.session_id, None, now);
        }
        self.mark_changed();
        self.process_funnels(event);
    }

    fn handle_action_event(&self, event: &TrackingEvent, action: &ActionEvent) {
        let now = current_timestamp();
        {
            let mut state = self.state.write().unwrap();
            if action.item.id > 0 {
                state.item_events.add(
                    action.item.id,
                    DecayEvent {
                        timestamp: now,
                        value: 30.0,
                    },
                );
            }
            update_session(&mut state, event, action.base.session_id, None, now);
        }
        self.mark_changed();
        self.process_funnels(event);
    }

    fn handle_cart_event(&self, event: &TrackingEvent, cart: &CartEvent) {
        let now = current_timestamp();
        {
            let mut state = self.state.write().unwrap();
            if cart.base.event == EVENT_CART_ADD {
                state.item_events.add(
                    cart.item.id,
                    DecayEvent {
                        timestamp: now,
                        value: 190.0 * f64::from(cart.item.quantity),
                    },
                );
            }
            update_session(&mut state, event, cart.base.session_id, None, now);
        }
        self.mark_changed();
        self.process_funnels(event);
    }

    fn handle_checkout_event(&self, event: &TrackingEvent, checkout: &CheckoutEvent) {
        let now = current_timestamp();
        {
            let mut state = self.state.write().unwrap();
            for item in &checkout.items {
                state.item_events.add(
                    item.id,
                    DecayEvent {
                        timestamp: now,
                        value: 200.0 * f64::from(item.quantity),
                    },
                );
            }
            update_session(&mut state, event, checkout.base.session_id, None, now);
        }
        self.mark_changed();
        self.process_funnels(event);
    }

    fn handle_purchase_event(&self, event: &TrackingEvent, purchase: &PurchaseEvent) {
        let now = current_timestamp();
        {
            let mut state = self.state.write().unwrap();
            for a in &purchase.items {
                for b in &purchase.items {
                    if a.id != b.id {
                        add_relation(&mut state.also_bought, a.id, b.id, now);
                    }
                }
            }
            update_session(&mut state, event, purchase.base.session_id, None, now);
        }
        self.mark_changed();
        self.process_funnels(event);
    }

    fn handle_suggest_event(&self, event: &TrackingEvent, suggest: &SuggestEvent) {
        let now = current_timestamp();
        {
            let mut state = self.state.write().unwrap();
            *state.queries.entry(suggest.value.clone()).or_insert(0) += 1;
            update_session(&mut state, event, suggest.base.session_id, None, now);
        }
        self.mark_changed();
        self.process_funnels(event);
    }

    fn handle_dataset_event(&self, event: &DataSetEvent) {
        {
            let mut state = self.state.write().unwrap();
            state.data_set.push(event.clone());
        }
        self.mark_changed();
    }

    /// Funnel mutation runs under its own lock acquisition so the event
    /// handlers never hold the lock across it.
    fn process_funnels(&self, event: &TrackingEvent) {
        let mut state = self.state.write().unwrap();
        let state = &mut *state;
        for funnel in state.funnels.iter_mut() {
            funnel.process_event(event);
        }
    }

    /// The periodic save cycle: decay every list, publish the fresh
    /// overrides outside the lock, prune stale state and persist a
    /// snapshot. Failed snapshot writes keep the change counter non-zero
    /// so the next tick retries.
    pub async fn save(&self) {
        let now = current_timestamp();
        let pending = self.changes.load(AtomicOrdering::Relaxed);

        let (item_pop, field_pop, session_pubs, group_pubs) = {
            let mut guard = self.state.write().unwrap();
            let state = &mut *guard;

            state.sorted_queries = decay_suggestions(&mut state.query_events, now);

            state.item_popularity = state.item_events.decay(now);
            state.field_popularity = state.field_events.decay(now);
            state.item_events.prune_expired(now);
            state.field_events.prune_expired(now);

            let mut session_pubs = Vec::new();
            for (id, session) in state.sessions.iter_mut() {
                session.id = *id;
                let (items, fields) = session.decay_events(now);
                if items.is_some() || fields.is_some() {
                    session_pubs.push((*id, items, fields));
                }
            }

            let mut group_pubs = Vec::new();
            for (id, group) in state.groups.iter_mut() {
                group.id = id.clone();
                let (items, fields) = group.decay_events(now);
                if items.is_some() || fields.is_some() {
                    group_pubs.push((id.clone(), items, fields));
                }
            }

            clean_sessions(state, now);
            decay_facet_value_events(state, now);

            (
                state.item_popularity.clone(),
                state.field_popularity.clone(),
                session_pubs,
                group_pubs,
            )
        };

        self.publish(item_pop, field_pop, session_pubs, group_pubs);

        log::info!("saving tracking data");
        match self.write_snapshot() {
            Ok(()) => {
                self.changes.fetch_sub(
                    pending.min(self.changes.load(AtomicOrdering::Relaxed)),
                    AtomicOrdering::Relaxed,
                );
            }
            Err(e) => {
                log::error!("failed to write tracking snapshot: {}", e);
            }
        }
    }

    /// Fan the freshly decayed overrides out to every listener as detached
    /// tasks; state locks are never held here.
    fn publish(
        &self,
        item_pop: SortOverride,
        field_pop: SortOverride,
        session_pubs: Vec<(i64, Option<SortOverride>, Option<SortOverride>)>,
        group_pubs: Vec<(String, Option<SortOverride>, Option<SortOverride>)>,
    ) {
        for listener in &self.listeners {
            let listener = listener.clone();
            let item_pop = item_pop.clone();
            let field_pop = field_pop.clone();
            let session_pubs = session_pubs.clone();
            let group_pubs = group_pubs.clone();
            tokio::spawn(async move {
                if let Err(e) = listener.popularity_changed(&item_pop).await {
                    log::warn!("{} listener: {}", listener.listener_type(), e);
                }
                if let Err(e) = listener.field_popularity_changed(&field_pop).await {
                    log::warn!("{} listener: {}", listener.listener_type(), e);
                }
                for (id, items, fields) in &session_pubs {
                    if let Some(sort) = items {
                        if let Err(e) = listener.session_popularity_changed(*id, sort).await {
                            log::warn!("{} listener: {}", listener.listener_type(), e);
                        }
                    }
                    if let Some(sort) = fields {
                        if let Err(e) = listener.session_field_popularity_changed(*id, sort).await {
                            log::warn!("{} listener: {}", listener.listener_type(), e);
                        }
                    }
                }
                for (id, items, fields) in &group_pubs {
                    if let Some(sort) = items {
                        if let Err(e) = listener.group_popularity_changed(id, sort).await {
                            log::warn!("{} listener: {}", listener.listener_type(), e);
                        }
                    }
                    if let Some(sort) = fields {
                        if let Err(e) = listener.group_field_popularity_changed(id, sort).await {
                            log::warn!("{} listener: {}", listener.listener_type(), e);
                        }
                    }
                }
            });
        }
    }

    fn write_snapshot(&self) -> Result<(), snapshot::SnapshotError> {
        let json = {
            let state = self.state.read().unwrap();
            serde_json::to_vec(&*state)?
        };
        snapshot::write_atomic(&self.path, &json)
    }

    // --- read access for the inspection surface ---

    pub fn get_item_popularity(&self) -> SortOverride {
        self.state.read().unwrap().item_popularity.clone()
    }

    pub fn get_field_popularity(&self) -> SortOverride {
        self.state.read().unwrap().field_popularity.clone()
    }

    pub fn get_field_value_popularity(&self, field_id: u32) -> Option<Vec<FacetValueResult>> {
        self.state
            .read()
            .unwrap()
            .field_value_scores
            .get(&field_id)
            .cloned()
    }

    pub fn get_item_events(&self) -> DecayList {
        self.state.read().unwrap().item_events.clone()
    }

    pub fn get_queries(&self) -> HashMap<String, u64> {
        self.state.read().unwrap().queries.clone()
    }

    pub fn get_no_result_queries(&self) -> Vec<SearchEvent> {
        self.state.read().unwrap().empty_results.clone()
    }

    pub fn get_data_set(&self) -> Vec<DataSetEvent> {
        self.state.read().unwrap().data_set.clone()
    }

    /// Ranked suggestions; with a filter string, the subset of queries
    /// containing it, score order preserved.
    pub fn get_suggestions(&self, q: &str) -> Vec<QueryResult> {
        let state = self.state.read().unwrap();
        if q.is_empty() {
            return state.sorted_queries.clone();
        }
        let needle = normalize_query(q);
        state
            .sorted_queries
            .iter()
            .filter(|result| result.query.contains(&needle))
            .cloned()
            .collect()
    }

    pub fn get_session(&self, session_id: i64) -> Option<SessionData> {
        self.state.read().unwrap().sessions.get(&session_id).cloned()
    }

    pub fn get_session_groups(&self, session_id: i64) -> Option<HashMap<String, f64>> {
        self.state
            .read()
            .unwrap()
            .sessions
            .get(&session_id)
            .map(|s| s.groups.clone())
    }

    pub fn get_sessions(&self) -> Vec<SessionOverview> {
        let state = self.state.read().unwrap();
        let mut overview: Vec<SessionOverview> = state
            .sessions
            .iter()
            .filter(|(_, session)| session.events.len() > 1)
            .map(|(id, session)| SessionOverview {
                id: id.to_string(),
                content: session.content.clone(),
                created: session.created,
                last_update: session.last_update,
                last_sync: session.last_sync,
                event_count: session.events.len(),
            })
            .collect();
        overview.sort_by(|a, b| b.last_update.cmp(&a.last_update).then(a.id.cmp(&b.id)));
        overview
    }

    pub fn get_funnels(&self) -> Vec<Funnel> {
        self.state.read().unwrap().funnels.clone()
    }

    pub fn set_funnels(&self, funnels: Vec<Funnel>) {
        let mut state = self.state.write().unwrap();
        state.funnels = funnels;
        drop(state);
        self.changes.fetch_add(1, AtomicOrdering::Relaxed);
    }

    /// Memoized A/B bucket for an experiment, if the session exists.
    pub fn handle_variation(&self, session_id: i64, variation_id: &str) -> Option<String> {
        let mut state = self.state.write().unwrap();
        state
            .sessions
            .get_mut(&session_id)
            .map(|session| session.handle_variation(variation_id))
    }

    /// Kept as an accepted-but-inert endpoint.
    pub fn clear(&self) {
        log::warn!("tracking clear requested, ignoring");
    }
}

/// Find or create the session, apply the event to it and forward it into
/// every persona group the session scores positive for. Returns the
/// session's visited skus so the caller can record co-occurrence.
fn update_session(
    state: &mut EngineState,
    event: &TrackingEvent,
    session_id: i64,
    content: Option<SessionContent>,
    now: i64,
) -> Vec<u32> {
    if !state.sessions.contains_key(&session_id) {
        metrics::inc_sessions();
        state.sessions.insert(
            session_id,
            SessionData::new(session_id, content.unwrap_or_default(), now),
        );
    } else if let Some(session) = state.sessions.get_mut(&session_id) {
        session.last_update = now;
        if let Some(content) = content {
            session.content = content;
        }
    }
    let Some(session) = state.sessions.get_mut(&session_id) else {
        return Vec::new();
    };

    let groups = session.handle_event(event, now).clone();
    let visited = session.visited_skus.clone();

    for (group_id, score) in groups {
        if group_id.is_empty() || score <= 0.0 {
            continue;
        }
        if let Some(group) = state.groups.get_mut(&group_id) {
            group.handle_event(event, now);
        }
    }
    visited
}

/// Evict sessions idle past the TTL, drop no-query entries from the empty
/// results log and re-mirror session ids.
fn clean_sessions(state: &mut EngineState, now: i64) {
    state.empty_results.retain(|search| !search.query.is_empty());

    for (id, session) in state.sessions.iter_mut() {
        session.events.retain(|event| !event.is_null());
        if session.id != *id {
            session.id = *id;
        }
    }

    let limit = now - SESSION_TTL;
    let before = state.sessions.len();
    state.sessions.retain(|_, session| session.last_update >= limit);
    let dropped = before - state.sessions.len();
    if dropped > 0 {
        log::info!("cleaned {} stale sessions", dropped);
    }
}

fn by_value_score(a: &FacetValueResult, b: &FacetValueResult) -> Ordering {
    b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal)
}

/// Decay the per-(field,value) popularity map into the published
/// `field_value_scores` table, pruning faded values.
fn decay_facet_value_events(state: &mut EngineState, now: i64) {
    let mut result: HashMap<u32, Vec<FacetValueResult>> = HashMap::new();

    for (field_id, values) in state.field_value_events.iter_mut() {
        let mut value_results = Vec::new();
        for (value, pop) in values.iter_mut() {
            pop.decay(now);
            if pop.value >= PRUNE_FLOOR {
                value_results.push(FacetValueResult {
                    value: value.clone(),
                    score: pop.value,
                });
            }
        }
        value_results.sort_by(by_value_score);
        result.insert(*field_id, value_results);

        values.retain(|_, pop| pop.value >= PRUNE_FLOOR);
    }

    state.field_value_scores = result;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{BaseEvent, BaseItem, StringFilter, EVENT_ITEM_CLICK, EVENT_SEARCH};

    fn make_engine() -> (tempfile::TempDir, TrackingEngine) {
        let dir = tempfile::tempdir().unwrap();
        let engine = TrackingEngine::load(dir.path().join("tracking.json"));
        (dir, engine)
    }

    fn make_click(session_id: i64, item_id: u32, position: f32) -> TrackingEvent {
        TrackingEvent::ItemClick(ItemClickEvent {
            base: BaseEvent {
                timestamp: 0,
                session_id,
                event: EVENT_ITEM_CLICK,
                ..Default::default()
            },
            item: BaseItem {
                id: item_id,
                position,
                ..Default::default()
            },
        })
    }

    fn make_search(session_id: i64, query: &str, results: u32) -> TrackingEvent {
        TrackingEvent::Search(SearchEvent {
            base: BaseEvent {
                timestamp: 0,
                session_id,
                event: EVENT_SEARCH,
                ..Default::default()
            },
            query: query.to_string(),
            number_of_results: results,
            ..Default::default()
        })
    }

    #[test]
    fn test_click_creates_session_and_weights() {
        let (_dir, engine) = make_engine();
        engine.handle_tracking_event(&make_click(7, 42, 0.0));

        assert_eq!(engine.changes(), 1);
        let session = engine.get_session(7).expect("session materialized");
        assert_eq!(session.id, 7);

        let state = engine.state.read().unwrap();
        let now = current_timestamp();
        let sort = state.item_events.decay(now);
        assert!((sort.0[&42] - 200.0).abs() < 0.01);
    }

    #[test]
    fn test_search_with_query_feeds_suggestions() {
        let (_dir, engine) = make_engine();
        let mut search = SearchEvent {
            base: BaseEvent {
                session_id: 1,
                event: EVENT_SEARCH,
                ..Default::default()
            },
            query: " Phone ".to_string(),
            number_of_results: 12,
            ..Default::default()
        };
        search.filters.string_filter.push(StringFilter {
            field_id: 3,
            value: vec!["apple".to_string()],
        });
        engine.handle_tracking_event(&TrackingEvent::Search(search));

        let state = engine.state.read().unwrap();
        assert_eq!(state.queries["phone"], 1);
        let matcher = &state.query_events["phone"];
        assert_eq!(matcher.popularity.events.len(), 1);
        assert_eq!(matcher.key_fields[&3].value_pop["apple"].events.len(), 1);
        // A query search does not touch the global field lists.
        assert!(state.field_events.is_empty());
    }

    #[test]
    fn test_search_without_query_feeds_field_events() {
        let (_dir, engine) = make_engine();
        let mut search = SearchEvent {
            base: BaseEvent {
                session_id: 1,
                event: EVENT_SEARCH,
                ..Default::default()
            },
            query: String::new(),
            number_of_results: 50,
            ..Default::default()
        };
        search.filters.string_filter.push(StringFilter {
            field_id: 9,
            value: vec!["red".to_string()],
        });
        engine.handle_tracking_event(&TrackingEvent::Search(search));

        let state = engine.state.read().unwrap();
        assert_eq!(state.field_events.len(), 1);
        assert_eq!(state.field_value_events[&9]["red"].events.len(), 1);
        assert!(state.query_events.is_empty());
    }

    #[test]
    fn test_empty_results_recorded_only_with_query() {
        let (_dir, engine) = make_engine();
        engine.handle_tracking_event(&make_search(1, "abc", 0));
        engine.handle_tracking_event(&make_search(1, "", 0));

        let no_results = engine.get_no_result_queries();
        assert_eq!(no_results.len(), 1);
        assert_eq!(no_results[0].query, "abc");
        // Zero-result searches do not create sessions or count changes.
        assert_eq!(engine.changes(), 0);
        assert!(engine.get_session(1).is_none());
    }

    #[test]
    fn test_persona_group_receives_click() {
        let (_dir, engine) = make_engine();
        let mut click = make_click(5, 11, 0.0);
        if let TrackingEvent::ItemClick(ref mut e) = click {
            e.item.category3 = "TV".to_string();
        }
        engine.handle_tracking_event(&click);

        let groups = engine.get_session_groups(5).unwrap();
        assert_eq!(groups["tv"], 5.0);

        let state = engine.state.read().unwrap();
        assert_eq!(state.groups["tv"].item_events.len(), 1);
        assert!(state.groups["gamer"].item_events.is_empty());
    }

    #[test]
    fn test_viewed_together_from_visited_skus() {
        let (_dir, engine) = make_engine();
        let impression = TrackingEvent::Impression(ImpressionEvent {
            base: BaseEvent {
                session_id: 2,
                event: crate::events::EVENT_IMPRESSION,
                ..Default::default()
            },
            items: vec![
                BaseItem {
                    id: 100,
                    ..Default::default()
                },
                BaseItem {
                    id: 101,
                    ..Default::default()
                },
            ],
        });
        engine.handle_tracking_event(&impression);
        engine.handle_tracking_event(&make_click(2, 101, 0.0));

        let state = engine.state.read().unwrap();
        let relation = state.viewed_together.get(&100).expect("relation recorded");
        assert_eq!(relation.item_id, 100);
        assert!(relation.other.contains_key(&101));
        // The clicked item never relates to itself.
        assert!(!state.viewed_together.contains_key(&101));
    }

    #[test]
    fn test_funnel_processing_detached_from_dispatch() {
        let (_dir, engine) = make_engine();
        let mut steps = HashMap::new();
        steps.insert(
            "clicked".to_string(),
            crate::funnel::FunnelStep {
                name: "clicked".to_string(),
                filter: vec![crate::funnel::FunnelFilter {
                    event_type: crate::funnel::FUNNEL_EVENT_CART_ADD,
                    ..Default::default()
                }],
                ..Default::default()
            },
        );
        engine.set_funnels(vec![Funnel {
            name: "cart".to_string(),
            steps,
        }]);

        engine.handle_tracking_event(&TrackingEvent::Cart(CartEvent {
            base: BaseEvent {
                session_id: 3,
                event: EVENT_CART_ADD,
                ..Default::default()
            },
            item: BaseItem {
                id: 8,
                quantity: 1,
                ..Default::default()
            },
            cart_type: "add".to_string(),
        }));

        let funnels = engine.get_funnels();
        assert_eq!(funnels[0].steps["clicked"].events.len(), 1);
    }

    #[tokio::test]
    async fn test_save_cycle_builds_popularity() {
        let dir = tempfile::tempdir().unwrap();
        let engine = TrackingEngine::load(dir.path().join("tracking.json"));
        engine.handle_tracking_event(&make_click(1, 42, 0.0));

        engine.save().await;

        let pop = engine.get_item_popularity();
        assert!((pop.0[&42] - 200.0).abs() < 0.01);
        assert_eq!(engine.changes(), 0);
        assert!(dir.path().join("tracking.json").exists());
    }

    #[tokio::test]
    async fn test_save_cycle_evicts_stale_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let engine = TrackingEngine::load(dir.path().join("tracking.json"));
        engine.handle_tracking_event(&make_click(1, 42, 0.0));
        {
            let mut state = engine.state.write().unwrap();
            let session = state.sessions.get_mut(&1).unwrap();
            session.last_update = current_timestamp() - SESSION_TTL - 10;
        }

        engine.save().await;

        assert!(engine.get_session(1).is_none());
    }

    #[test]
    fn test_suggestion_lookup_filters_by_substring() {
        let (_dir, engine) = make_engine();
        {
            let mut state = engine.state.write().unwrap();
            state.sorted_queries = vec![
                QueryResult {
                    query: "phone case".to_string(),
                    score: 10.0,
                    facets: vec![],
                },
                QueryResult {
                    query: "laptop".to_string(),
                    score: 5.0,
                    facets: vec![],
                },
            ];
        }

        assert_eq!(engine.get_suggestions("").len(), 2);
        let filtered = engine.get_suggestions(" PHONE ");
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].query, "phone case");
        assert!(engine.get_suggestions("camera").is_empty());
    }

    #[test]
    fn test_session_overview_skips_single_event_sessions() {
        let (_dir, engine) = make_engine();
        engine.handle_tracking_event(&make_click(1, 10, 0.0));
        engine.handle_tracking_event(&make_click(2, 11, 0.0));
        engine.handle_tracking_event(&make_click(2, 12, 0.0));

        let overview = engine.get_sessions();
        assert_eq!(overview.len(), 1);
        assert_eq!(overview[0].id, "2");
        assert_eq!(overview[0].event_count, 2);
    }
}
