//! Synthetic background activity.
//!
//! Emulates a live fleet by creating shipments and walking them through a
//! status lifecycle on a fixed interval. It is deterministic: tick `n`
//! always does the same thing, so tests can assert on the resulting store.

use crate::scheduler::Task;
use crate::store::{log_background_error, Store};
use crate::types::{Fields, RecordId, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Generator configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratorConfig {
    /// Time between ticks.
    /// Default: 3000ms
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// Collection to write to.
    /// Default: "shipments"
    #[serde(default = "default_collection")]
    pub collection: String,

    /// Status lifecycle; new records start at the first entry and stop
    /// changing at the last.
    #[serde(default = "default_statuses")]
    pub statuses: Vec<String>,

    /// Every Nth tick creates a record; the others advance one.
    /// Default: 3
    #[serde(default = "default_create_every")]
    pub create_every: u64,
}

fn default_interval_ms() -> u64 {
    3000
}

fn default_collection() -> String {
    "shipments".to_string()
}

fn default_statuses() -> Vec<String> {
    ["pending", "in_transit", "out_for_delivery", "delivered"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_create_every() -> u64 {
    3
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            collection: default_collection(),
            statuses: default_statuses(),
            create_every: default_create_every(),
        }
    }
}

impl GeneratorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// What one tick did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Activity {
    Created(RecordId),
    Advanced { id: RecordId, status: String },
    Idle,
}

/// Writes synthetic records into a store.
pub struct ActivityGenerator {
    store: Arc<Store>,
    config: GeneratorConfig,
    ticks: u64,
    /// Records still moving through the lifecycle, oldest first.
    active: Vec<RecordId>,
}

impl ActivityGenerator {
    pub fn new(store: Arc<Store>, config: GeneratorConfig) -> Self {
        Self {
            store,
            config,
            ticks: 0,
            active: Vec::new(),
        }
    }

    pub fn config(&self) -> &GeneratorConfig {
        &self.config
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Run one step.
    pub fn step(&mut self) -> Activity {
        let tick = self.ticks;
        self.ticks += 1;

        if self.config.statuses.is_empty() {
            return Activity::Idle;
        }

        let create = self.active.is_empty() || tick % self.config.create_every.max(1) == 0;
        let activity = if create {
            self.create(tick)
        } else {
            self.advance(tick)
        };
        debug!(tick, ?activity, "generator step");
        activity
    }

    fn create(&mut self, tick: u64) -> Activity {
        let mut fields = Fields::new();
        fields.insert("status".into(), json!(self.config.statuses[0]));
        fields.insert("reference".into(), json!(format!("SHP-{:05}", tick)));
        fields.insert("priority".into(), json!(tick % 3));

        let id = self.store.create(&self.config.collection, fields);
        if self.config.statuses.len() > 1 {
            self.active.push(id.clone());
        }
        Activity::Created(id)
    }

    fn advance(&mut self, tick: u64) -> Activity {
        let slot = (tick as usize) % self.active.len();
        let id = self.active[slot].clone();

        let current = self
            .store
            .find(&self.config.collection, &id)
            .and_then(|r| r.field("status").and_then(|s| s.as_str()).map(str::to_string));
        let position = current
            .and_then(|status| self.config.statuses.iter().position(|s| *s == status))
            .unwrap_or(0);
        let next = (position + 1).min(self.config.statuses.len() - 1);
        let status = self.config.statuses[next].clone();

        let mut fields = Fields::new();
        fields.insert("status".into(), json!(status));
        if let Err(e) = self.store.update(&self.config.collection, &id, fields) {
            log_background_error("generator update", &e);
            self.active.remove(slot);
            return Activity::Idle;
        }

        if next == self.config.statuses.len() - 1 {
            self.active.remove(slot);
        }
        Activity::Advanced { id, status }
    }
}

impl Task for ActivityGenerator {
    fn name(&self) -> Cow<'_, str> {
        Cow::Borrowed("activity-generator")
    }

    fn run(&mut self, _now: Timestamp) -> Option<Duration> {
        self.step();
        Some(self.config.interval())
    }
}
