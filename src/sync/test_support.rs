//! Fakes shared by the sync tests.
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde_json::json;

use crate::{
    fetcher::{Fetch, FetchParams},
    rules::models::ChangeSetWire,
    storage::{InMemoryStorage, RuleSetStorage},
    sync::change_processor::ChangeProcessor,
    FetchError, SyncConfig,
};

/// Replays scripted responses, repeating the last one, and records every request.
pub(crate) struct ScriptedFetcher {
    responses: Mutex<VecDeque<Result<ChangeSetWire, FetchError>>>,
    calls: Mutex<Vec<FetchParams>>,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl ScriptedFetcher {
    pub fn new(responses: Vec<Result<ChangeSetWire, FetchError>>) -> Arc<ScriptedFetcher> {
        Arc::new(ScriptedFetcher {
            responses: Mutex::new(responses.into()),
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> Vec<FetchParams> {
        self.calls.lock().unwrap().clone()
    }

    /// Replace the remaining script.
    pub fn script(&self, responses: Vec<Result<ChangeSetWire, FetchError>>) {
        *self.responses.lock().unwrap() = responses.into();
    }
}

impl Fetch for ScriptedFetcher {
    fn fetch(&self, params: &FetchParams) -> Result<ChangeSetWire, FetchError> {
        let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(1));

        self.calls.lock().unwrap().push(params.clone());
        let mut responses = self.responses.lock().unwrap();
        let response = if responses.len() > 1 {
            responses.pop_front().unwrap()
        } else {
            responses.front().cloned().unwrap()
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        response
    }
}

pub(crate) fn flag(name: &str, change_number: i64) -> serde_json::Value {
    json!({
        "name": name, "status": "ACTIVE", "changeNumber": change_number,
        "defaultTreatment": "off", "sets": ["backend"], "conditions": []
    })
}

pub(crate) fn targeting(since: i64, till: i64, flags: &[&str]) -> ChangeSetWire {
    let flags: Vec<_> = flags.iter().map(|name| flag(name, till)).collect();
    serde_json::from_value(json!({
        "ff": {"d": flags, "s": since, "t": till},
        "rbs": {"d": [], "s": -1, "t": -1}
    }))
    .unwrap()
}

pub(crate) fn legacy(since: i64, till: i64, flags: &[&str]) -> ChangeSetWire {
    let flags: Vec<_> = flags.iter().map(|name| flag(name, till)).collect();
    serde_json::from_value(json!({"splits": flags, "since": since, "till": till})).unwrap()
}

pub(crate) fn storage_at(wire: ChangeSetWire, fetched_at: DateTime<Utc>) -> Arc<InMemoryStorage> {
    let storage = InMemoryStorage::new();
    let change_set = ChangeProcessor::default().process(wire, SyncConfig::LATEST_SPEC, fetched_at);
    storage.apply_atomically(&change_set, false).unwrap();
    Arc::new(storage)
}
