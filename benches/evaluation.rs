use std::{collections::HashMap, fs::File, sync::Arc};

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use serde_json::json;

use split_core::{
    rules::models::{ChangeSetWire, SegmentKind},
    sync::{ProxyHandler, StopSignal, SyncHelper, SyncTarget},
    AttributeValue, Evaluator, Fetch, FetchError, FetchParams, InMemorySegments, InMemoryStorage,
    Key, SyncConfig, SyncEvent,
};

/// Serves the fixture to a fresh client and reports nothing new afterwards.
struct FixtureFetcher {
    rules: ChangeSetWire,
}

impl Fetch for FixtureFetcher {
    fn fetch(&self, params: &FetchParams) -> Result<ChangeSetWire, FetchError> {
        if params.since == -1 {
            return Ok(self.rules.clone());
        }
        let rbs = params.rule_based_segments_since.unwrap_or(-1);
        Ok(serde_json::from_value(json!({
            "ff": {"d": [], "s": params.since, "t": params.since},
            "rbs": {"d": [], "s": rbs, "t": rbs}
        }))
        .unwrap())
    }
}

fn evaluator() -> Evaluator {
    let rules = serde_json::from_reader(File::open("tests/data/evaluation_rules.json").unwrap())
        .unwrap();
    let storage = Arc::new(InMemoryStorage::new());
    let helper = SyncHelper::new(
        &SyncConfig::from_sdk_key("bench"),
        Arc::new(FixtureFetcher { rules }),
        storage.clone(),
        Arc::new(ProxyHandler::inert()),
        Arc::new(|_: SyncEvent| {}),
        Arc::new(StopSignal::new()),
    );
    helper.sync(SyncTarget::Latest);

    let segments = InMemorySegments::new();
    segments
        .set_segments("alice", SegmentKind::Standard, ["employees"])
        .unwrap();

    Evaluator::new(storage, Arc::new(segments))
}

fn criterion_benchmark(c: &mut Criterion) {
    let evaluator = evaluator();
    let key = Key::new("alice");
    let no_attributes = HashMap::new();
    let attributes = HashMap::from([(
        "email".to_owned(),
        AttributeValue::from("alice@split.io"),
    )]);

    let mut group = c.benchmark_group("evaluate");
    group.throughput(Throughput::Elements(1));
    group.bench_function("whitelist", |b| {
        b.iter(|| {
            evaluator.evaluate(
                black_box(&key),
                black_box("FACUNDO_TEST"),
                black_box(&no_attributes),
            )
        })
    });
    group.bench_function("prerequisites", |b| {
        b.iter(|| {
            evaluator.evaluate(
                black_box(&key),
                black_box("gated_on"),
                black_box(&no_attributes),
            )
        })
    });
    group.bench_function("rule_based_segment", |b| {
        b.iter(|| {
            evaluator.evaluate(
                black_box(&key),
                black_box("rbs_flag"),
                black_box(&attributes),
            )
        })
    });
    group.bench_function("unknown_flag", |b| {
        b.iter(|| {
            evaluator.evaluate(
                black_box(&key),
                black_box("missing"),
                black_box(&no_attributes),
            )
        })
    });
    group.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
