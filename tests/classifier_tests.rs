//! Integration tests for diagnostic stream classification
//!
//! These tests verify:
//! - The progress shapes emitted by the worker's progress bars
//! - Plain lines are routed to logging
//! - Classification of arbitrary bar/counter lines (property-based)

use audiosr_host::Metrics;
use audiosr_host::models::ProgressEvent;
use audiosr_host::services::diagnostics::DiagnosticLine;
use audiosr_host::services::{DiagnosticClassifier, ProgressParser, ProgressSlot};
use proptest::prelude::*;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

#[test]
fn test_progress_bar_line() {
    let parser = ProgressParser::new();
    assert_eq!(
        parser.classify("42%|████ | 42/100 [00:01<00:02, 30it/s]"),
        DiagnosticLine::Progress(ProgressEvent { current: 42, total: 100 })
    );
}

#[test]
fn test_indeterminate_counter_line() {
    let parser = ProgressParser::new();
    let event = parser.parse("17it [").unwrap();
    assert_eq!(event, ProgressEvent { current: 17, total: 0 });
    assert!(event.is_indeterminate());
    assert_eq!(event.fraction(), None);
}

#[test]
fn test_plain_line_goes_to_log() {
    let parser = ProgressParser::new();
    assert_eq!(
        parser.classify("starting up"),
        DiagnosticLine::Log("starting up".to_string())
    );
}

#[test]
fn test_download_sizes_keep_ratio() {
    let parser = ProgressParser::new();
    let event = parser
        .parse("Downloading: 45%|████▌     | 1.5M/3.0M [00:03<00:04, 512kB/s]")
        .unwrap();
    assert_eq!(event, ProgressEvent { current: 15, total: 30 });
    assert_eq!(event.fraction(), Some(0.5));
}

#[tokio::test]
async fn test_classifier_without_callback_still_drains() {
    let metrics = Arc::new(Metrics::new());
    let stream: &[u8] = b"DDIM Sampler:  10%|#         | 5/50\r DDIM Sampler:  20%|##        | 10/50\r\nwarning: torch.cuda unavailable\n";

    DiagnosticClassifier::new(ProgressSlot::new(), metrics.clone())
        .run(stream)
        .await;

    assert_eq!(metrics.progress_events.load(Ordering::Relaxed), 2);
    assert_eq!(metrics.worker_log_lines.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn test_events_reach_registered_callback() {
    let slot = ProgressSlot::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_clone = seen.clone();
    let registration = slot.register(Some(Arc::new(move |event: ProgressEvent| {
        seen_clone.lock().unwrap().push(event);
    })));

    let stream: &[u8] = b"3it [00:01, 2.9it/s]\r4it [00:01, 3.0it/s]\n";
    DiagnosticClassifier::new(slot.clone(), Arc::new(Metrics::new()))
        .run(stream)
        .await;
    drop(registration);

    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            ProgressEvent { current: 3, total: 0 },
            ProgressEvent { current: 4, total: 0 },
        ]
    );
    assert!(!slot.is_registered());
}

proptest! {
    #[test]
    fn prop_bar_lines_parse(current in 0u64..100_000, extra in 0u64..100_000, percent in 0u8..=100) {
        let total = current + extra;
        let line = format!("{:>3}%|#####     | {}/{} [00:01<00:02, 3.21it/s]", percent, current, total);
        prop_assert_eq!(
            ProgressParser::new().parse(&line),
            Some(ProgressEvent { current, total })
        );
    }

    #[test]
    fn prop_counters_parse(count in 0u64..1_000_000) {
        let line = format!("{}it [00:07, 2.50it/s]", count);
        prop_assert_eq!(
            ProgressParser::new().parse(&line),
            Some(ProgressEvent { current: count, total: 0 })
        );
    }

    #[test]
    fn prop_lines_without_digits_are_logs(line in "[a-zA-Z :,.=_-]{0,80}") {
        prop_assert!(ProgressParser::new().parse(&line).is_none());
    }

    #[test]
    fn prop_arbitrary_input_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
        let text = String::from_utf8_lossy(&bytes);
        let _ = ProgressParser::new().classify(&text);
    }
}
