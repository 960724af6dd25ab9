//! Exponential time-decay primitives
//!
//! Every popularity signal in the engine is a sum of timestamped samples,
//! each attenuated by `DECAY_RATE^(now - ts)`. Samples older than `MAX_AGE`
//! contribute nothing and are dropped during the periodic decay pass.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Per-second attenuation factor. Halves a sample in roughly 16 days.
pub const DECAY_RATE: f64 = 0.9999995;

/// Hard cutoff: samples older than 48 days are worth exactly zero.
pub const MAX_AGE: i64 = 60 * 60 * 24 * 48;

/// Minimum summed score for a key to appear in a published `SortOverride`.
pub const SORT_SCORE_FLOOR: f64 = 0.002;

/// Minimum scalar value for an internal popularity entry to survive pruning.
pub const PRUNE_FLOOR: f64 = 0.0002;

/// A single timestamped weighted sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DecayEvent {
    #[serde(rename = "ts")]
    pub timestamp: i64,
    pub value: f64,
}

impl DecayEvent {
    /// Decayed value of this sample at `now`.
    ///
    /// A timestamp in the future returns the undecayed value; anything
    /// older than `MAX_AGE` returns zero.
    pub fn value_at(&self, now: i64) -> f64 {
        let elapsed = now - self.timestamp;
        if elapsed < 0 {
            return self.value;
        }
        if elapsed > MAX_AGE {
            return 0.0;
        }
        self.value * DECAY_RATE.powi(elapsed as i32)
    }
}

/// An append-only sample sequence plus the scalar computed at the last
/// decay pass. `value` is stale between passes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DecayPopularity {
    #[serde(default)]
    pub events: Vec<DecayEvent>,
    #[serde(default)]
    pub value: f64,
}

impl DecayPopularity {
    pub fn add(&mut self, event: DecayEvent) {
        self.events.push(event);
    }

    /// Recompute the scalar from all samples as of `now`.
    pub fn decay(&mut self, now: i64) -> f64 {
        let mut popularity = 0.0;
        for event in &self.events {
            popularity += event.value_at(now);
        }
        self.value = popularity;
        popularity
    }

    /// Drop samples that no longer contribute anything.
    pub fn prune_expired(&mut self, now: i64) {
        self.events.retain(|e| now - e.timestamp <= MAX_AGE);
    }
}

/// Keyed collection of sample sequences (item ids or facet field ids).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DecayList(pub HashMap<u32, Vec<DecayEvent>>);

impl DecayList {
    pub fn add(&mut self, key: u32, event: DecayEvent) {
        self.0.entry(key).or_default().push(event);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Sum the decayed samples per key and emit every key whose score
    /// clears the publication floor.
    pub fn decay(&self, now: i64) -> SortOverride {
        let mut result = SortOverride::default();
        for (key, events) in &self.0 {
            let mut popularity = 0.0;
            for event in events {
                popularity += event.value_at(now);
            }
            if popularity < SORT_SCORE_FLOOR {
                continue;
            }
            result.0.insert(*key, popularity);
        }
        result
    }

    /// Drop fully-expired samples and keys left without any.
    pub fn prune_expired(&mut self, now: i64) {
        for events in self.0.values_mut() {
            events.retain(|e| now - e.timestamp <= MAX_AGE);
        }
        self.0.retain(|_, events| !events.is_empty());
    }
}

/// Publication payload consumed by the downstream sort layer: a map from
/// numeric id to decayed score.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SortOverride(pub HashMap<u32, f64>);

impl SortOverride {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Line format for the disk mirror: `k1:v1,k2:v2,…`.
    pub fn to_line_format(&self) -> String {
        let mut parts: Vec<String> = self
            .0
            .iter()
            .map(|(key, value)| format!("{}:{}", key, value))
            .collect();
        parts.sort();
        parts.join(",")
    }

    /// Parse the line format back into a map. Blank segments are skipped
    /// so a trailing separator is harmless.
    pub fn from_line_format(data: &str) -> Result<Self, std::num::ParseFloatError> {
        let mut result = HashMap::new();
        for item in data.split(',') {
            let item = item.trim();
            if item.is_empty() {
                continue;
            }
            let Some((key, value)) = item.split_once(':') else {
                continue;
            };
            let key: u32 = match key.parse() {
                Ok(k) => k,
                Err(_) => continue,
            };
            let value: f64 = value.parse()?;
            result.insert(key, value);
        }
        Ok(SortOverride(result))
    }
}
