#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use ll_crypto::DeviceIdentity;
use ll_proto::{CeremonyEvent, SignedEvent};
use ll_store::{EncryptionGate, MemoryLogProvider, MemoryRegistry, MigrationEngine, OpenMode, StoreConfig};
use ll_threshold::{CeremonyConfig, Coordinator, Effect, EffectSink, StoreBridge, ThresholdError};
use serde_json::json;

pub const KEY_REF: &str = "db:my-list";

pub fn config() -> CeremonyConfig {
    CeremonyConfig {
        auto_approve: true,
        ..CeremonyConfig::default()
    }
}

pub fn ids(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

type DropRule = Box<dyn Fn(&SignedEvent) -> bool>;

/// Synchronous total-order durable channel between in-process coordinators.
///
/// Every published event is appended to one log; each online device consumes the log
/// from its own cursor, so all devices see the same order. Offline devices keep their
/// cursor and catch up when they come back.
pub struct Harness {
    devices: BTreeMap<String, Coordinator>,
    cursors: HashMap<String, usize>,
    offline: HashSet<String>,
    queue: VecDeque<SignedEvent>,
    pub log: Vec<SignedEvent>,
    pub dropped: Vec<SignedEvent>,
    pub rejections: Vec<(String, &'static str, String)>,
    outbox: HashMap<String, Vec<Effect>>,
    drop_rule: Option<DropRule>,
}

impl Harness {
    pub fn new(names: &[&str], config: CeremonyConfig) -> Self {
        let devices = names
            .iter()
            .map(|n| (n.to_string(), Coordinator::new(DeviceIdentity::generate(*n), config.clone())))
            .collect();
        Self {
            devices,
            cursors: names.iter().map(|n| (n.to_string(), 0)).collect(),
            offline: HashSet::new(),
            queue: VecDeque::new(),
            log: Vec::new(),
            dropped: Vec::new(),
            rejections: Vec::new(),
            outbox: HashMap::new(),
            drop_rule: None,
        }
    }

    pub fn device(&self, name: &str) -> &Coordinator {
        &self.devices[name]
    }

    pub fn device_mut(&mut self, name: &str) -> &mut Coordinator {
        self.devices.get_mut(name).expect("unknown device")
    }

    pub fn drop_events(&mut self, rule: impl Fn(&SignedEvent) -> bool + 'static) {
        self.drop_rule = Some(Box::new(rule));
    }

    pub fn set_offline(&mut self, name: &str) {
        self.offline.insert(name.to_string());
    }

    pub fn set_online(&mut self, name: &str) {
        self.offline.remove(name);
    }

    /// Run a local operation on `name` and queue what it produces.
    pub fn call(
        &mut self,
        name: &str,
        op: impl FnOnce(&mut Coordinator) -> Result<Vec<Effect>, ThresholdError>,
    ) -> Result<(), ThresholdError> {
        let effects = op(self.device_mut(name))?;
        self.submit(name, effects);
        Ok(())
    }

    pub fn submit(&mut self, name: &str, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Publish(event) => self.queue.push_back(event),
                Effect::Broadcast(_) => {}
                other => self.outbox.entry(name.to_string()).or_default().push(other),
            }
        }
    }

    /// Deliver until nothing is left to deliver.
    pub fn pump(&mut self) {
        loop {
            while let Some(event) = self.queue.pop_front() {
                if self.drop_rule.as_ref().is_some_and(|rule| rule(&event)) {
                    self.dropped.push(event);
                } else {
                    self.log.push(event);
                }
            }
            let mut produced = Vec::new();
            for (name, coordinator) in self.devices.iter_mut() {
                if self.offline.contains(name) {
                    continue;
                }
                let cursor = self.cursors.entry(name.clone()).or_insert(0);
                while *cursor < self.log.len() {
                    let event = &self.log[*cursor];
                    *cursor += 1;
                    match coordinator.handle_durable(event) {
                        Ok(effects) => produced.push((name.clone(), effects)),
                        Err(e) => self.rejections.push((name.clone(), event.event.type_name(), e.to_string())),
                    }
                }
            }
            let idle = produced.iter().all(|(_, effects)| effects.is_empty()) && self.queue.is_empty();
            for (name, effects) in produced {
                self.submit(&name, effects);
            }
            if idle && self.queue.is_empty() {
                return;
            }
        }
    }

    /// Non-transport effects collected for `name` since the last call.
    pub fn take(&mut self, name: &str) -> Vec<Effect> {
        self.outbox.remove(name).unwrap_or_default()
    }

    pub fn events_of_type(&self, type_name: &str) -> usize {
        self.log.iter().filter(|e| e.event.type_name() == type_name).count()
    }
}

pub fn is_finalize(event: &SignedEvent) -> bool {
    matches!(event.event, CeremonyEvent::Finalize(_))
}

/// The desktop's store: one list with a few entries, wired to a bridge.
pub struct DesktopStore {
    pub gate: Arc<EncryptionGate>,
    pub bridge: StoreBridge,
}

impl DesktopStore {
    pub async fn with_list() -> Self {
        let gate = Arc::new(EncryptionGate::new(
            Arc::new(MemoryRegistry::new()),
            Arc::new(MemoryLogProvider::new()),
            StoreConfig::for_tests(),
        ));
        gate.create("my-list").await.unwrap();
        let handle = gate.open("my-list", OpenMode::ReadWrite).await.unwrap();
        handle.put("milk", json!({"done": false})).await.unwrap();
        handle.put("eggs", json!({"done": true})).await.unwrap();
        let bridge = StoreBridge::new(Arc::new(MigrationEngine::new(gate.clone())));
        Self { gate, bridge }
    }

    pub async fn apply(&self, effects: &[Effect]) {
        for effect in effects {
            self.bridge.apply(effect).await.unwrap();
        }
    }

    pub async fn read_all(&self) -> Vec<(String, serde_json::Value)> {
        let handle = self.gate.open("my-list", OpenMode::ReadOnly).await.unwrap();
        let mut entries = handle.entries().await.unwrap();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}

pub fn expected_entries() -> Vec<(String, serde_json::Value)> {
    vec![
        ("eggs".to_string(), json!({"done": true})),
        ("milk".to_string(), json!({"done": false})),
    ]
}
