//! Threaded pipeline: manager service plus a real worker pool.

mod common;

use common::builders::{failing_step, ItemBuilder};
use common::{delivered, pipeline_timeout};
use preproc_rs::backend::BuiltinStepExecutor;
use preproc_rs::config::{PreprocConfig, StaticConfigSource};
use preproc_rs::pipeline::{MemorySink, Preprocessing, ValueBatcher};
use preproc_rs::protocol::TestRequest;
use preproc_rs::types::{ErrorHandler, ItemValue, Step, StepType, Timespec, ValueType};
use preproc_rs::Variant;
use std::sync::Arc;
use std::time::Duration;

fn start(items: StaticConfigSource, sink: &MemorySink) -> Preprocessing {
    let config = PreprocConfig {
        workers: 3,
        manager_delay_ms: 10,
        flush_interval_ms: 10,
        batch_size: 8,
        ..Default::default()
    };
    Preprocessing::start(
        config,
        Box::new(items),
        Box::new(sink.clone()),
        Arc::new(BuiltinStepExecutor::new()),
    )
    .expect("pipeline starts")
}

#[test]
fn test_values_processed_in_arrival_order() {
    let items = StaticConfigSource::from_items([
        ItemBuilder::new(1).multiply("2").build(),
        ItemBuilder::new(2)
            .step(Step::new(StepType::DeltaValue, ""))
            .build(),
    ]);
    let sink = MemorySink::new();
    let pipeline = start(items, &sink);
    let client = pipeline.client();

    let mut batcher = ValueBatcher::new(client.clone(), 8);
    let mut expected = Vec::new();
    for i in 0..50u64 {
        let itemid = if i % 5 == 0 { 2 } else { 1 };
        let value = ItemValue::new(itemid, ValueType::Float, i.to_string().as_str())
            .with_ts(Timespec::new(i as i32, 0));
        batcher.push(&value).unwrap();
        expected.push(itemid);
    }
    batcher.flush().unwrap();

    client
        .wait_idle(Duration::from_millis(5), pipeline_timeout())
        .unwrap();

    let out = delivered(&sink);
    let ids: Vec<u64> = out.iter().map(|(id, _)| *id).collect();
    assert_eq!(ids, expected);
    assert_eq!(out[1], (1, Variant::Dbl(2.0)));
    // delta item: first sample yields nothing, then 5 per sample
    assert_eq!(out[0].1, Variant::None);
    assert_eq!(out[5].1, Variant::Dbl(5.0));

    pipeline.shutdown().unwrap();
}

#[test]
fn test_test_request_round_trip() {
    let sink = MemorySink::new();
    let pipeline = start(StaticConfigSource::new(), &sink);

    let request = TestRequest {
        value_type: ValueType::Float,
        value: "abc".into(),
        ts: Timespec::new(0, 0),
        history: Vec::new(),
        steps: vec![
            failing_step(ErrorHandler::Default, ""),
            Step::new(StepType::RTrim, "c"),
        ],
    };
    let result = pipeline.client().test(&request).unwrap();
    assert_eq!(result.results.len(), 2);
    assert_eq!(result.results[1].value, Variant::from("ab"));
    assert!(result.error.is_some());
    assert!(sink.is_empty());

    pipeline.shutdown().unwrap();
}

#[test]
fn test_queue_size_and_clean_shutdown() {
    let sink = MemorySink::new();
    let pipeline = start(StaticConfigSource::new(), &sink);
    let client = pipeline.client();

    assert_eq!(client.queue_size().unwrap(), 0);
    client
        .ingest(&[ItemValue::new(7, ValueType::Str, "pass")])
        .unwrap();
    client
        .wait_idle(Duration::from_millis(5), pipeline_timeout())
        .unwrap();
    assert_eq!(delivered(&sink), vec![(7, Variant::from("pass"))]);

    pipeline.shutdown().unwrap();
    assert!(client.queue_size().is_err());
}
