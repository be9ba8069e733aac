//! Reconnect, shutdown and edge case tests.

use crossbeam_channel::{bounded, unbounded, Receiver};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};
use stream_watcher::{
    Document, Handlers, MemorySource, Namespace, ReconnectPolicy, SubscriptionFilter, WatchError,
    WatchEvent, Watcher, WatcherConfig, WatcherState,
};

const TIMEOUT: Duration = Duration::from_secs(5);

fn doc(value: Value) -> Document {
    match value {
        Value::Object(map) => map,
        _ => panic!("expected object"),
    }
}

fn test_config() -> WatcherConfig {
    WatcherConfig {
        reconnect: ReconnectPolicy::fixed(Duration::from_millis(10)),
        ..Default::default()
    }
}

fn ns() -> Namespace {
    WatcherConfig::default().namespace()
}

fn error_channel() -> (Handlers, Receiver<WatchError>) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let (tx, rx) = unbounded();
    let handlers = Handlers::new().on_error(move |e| {
        let _ = tx.send(e.clone());
    });
    (handlers, rx)
}

fn wait_for_state(watcher: &Watcher, state: WatcherState) {
    let deadline = Instant::now() + TIMEOUT;
    while watcher.state() != state {
        assert!(Instant::now() < deadline, "watcher never became {}", state);
        thread::sleep(Duration::from_millis(1));
    }
}

// --- Reconnect ---

#[test]
fn test_reconnects_after_consecutive_stream_failures() {
    let source = MemorySource::new();
    let (handlers, errors) = error_channel();
    let watcher = Arc::new(Watcher::new(test_config(), handlers, source.clone()).unwrap());
    let worker = watcher.spawn().unwrap();

    assert!(source.wait_for_opens(1, TIMEOUT));

    for round in 1..=3 {
        assert_eq!(source.break_streams("primary stepped down"), 1);

        // Reported before the stream is reopened
        assert_eq!(
            errors.recv_timeout(TIMEOUT).unwrap(),
            WatchError::Stream("primary stepped down".to_string())
        );
        assert!(source.wait_for_opens(round + 1, TIMEOUT));
    }

    // The connection itself was kept
    assert_eq!(source.connect_attempts(), 1);

    watcher.stop();
    worker.join().unwrap().unwrap();
}

#[test]
fn test_reconnects_after_unexpected_end_of_stream() {
    let source = MemorySource::new();
    let (handlers, errors) = error_channel();
    let watcher = Arc::new(Watcher::new(test_config(), handlers, source.clone()).unwrap());
    let worker = watcher.spawn().unwrap();

    assert!(source.wait_for_opens(1, TIMEOUT));
    source.end_streams();

    assert_eq!(errors.recv_timeout(TIMEOUT).unwrap(), WatchError::StreamClosed);
    assert!(source.wait_for_opens(2, TIMEOUT));

    watcher.stop();
    worker.join().unwrap().unwrap();
}

#[test]
fn test_retries_failed_connects_and_opens() {
    let source = MemorySource::new();
    source.fail_next_connects(2);
    source.fail_next_opens(1);

    let (handlers, errors) = error_channel();
    let watcher = Arc::new(Watcher::new(test_config(), handlers, source.clone()).unwrap());
    let worker = watcher.spawn().unwrap();

    assert!(source.wait_for_opens(1, TIMEOUT));

    let reported: Vec<WatchError> = errors.try_iter().collect();
    assert_eq!(reported.len(), 3);
    assert!(reported
        .iter()
        .all(|e| matches!(e, WatchError::Connection(_))));

    // Failed open forces a fresh connection
    assert_eq!(source.connect_attempts(), 4);

    watcher.stop();
    worker.join().unwrap().unwrap();
}

#[test]
fn test_events_flow_after_reconnect() {
    let source = MemorySource::new();
    let (tx, rx) = unbounded();
    let handlers = Handlers::new().on_insert(move |d| {
        tx.send(d["_id"].clone()).unwrap();
        Ok(())
    });
    let watcher = Arc::new(Watcher::new(test_config(), handlers, source.clone()).unwrap());
    let worker = watcher.spawn().unwrap();

    assert!(source.wait_for_opens(1, TIMEOUT));
    source.insert_one(&ns(), doc(json!({"_id": 1}))).unwrap();
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), json!(1));

    source.break_streams("network blip");
    assert!(source.wait_for_opens(2, TIMEOUT));

    source.insert_one(&ns(), doc(json!({"_id": 2}))).unwrap();
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), json!(2));

    watcher.stop();
    worker.join().unwrap().unwrap();
}

#[test]
fn test_lifecycle_notices_on_channel() {
    let source = MemorySource::new();
    let watcher =
        Arc::new(Watcher::new(test_config(), Handlers::default(), source.clone()).unwrap());
    let events = watcher.subscribe(SubscriptionFilter::all());
    let worker = watcher.spawn().unwrap();

    assert!(source.wait_for_opens(1, TIMEOUT));
    source.break_streams("gone");
    assert!(source.wait_for_opens(2, TIMEOUT));

    assert!(matches!(
        events.recv_timeout(TIMEOUT).unwrap(),
        WatchEvent::Connected { .. }
    ));
    assert_eq!(
        events.recv_timeout(TIMEOUT).unwrap(),
        WatchEvent::Error(WatchError::Stream("gone".to_string()))
    );
    assert!(matches!(
        events.recv_timeout(TIMEOUT).unwrap(),
        WatchEvent::Disconnected { .. }
    ));
    assert!(matches!(
        events.recv_timeout(TIMEOUT).unwrap(),
        WatchEvent::Connected { .. }
    ));

    watcher.stop();
    worker.join().unwrap().unwrap();
}

// --- Stop ---

#[test]
fn test_stop_without_start() {
    let source = MemorySource::new();
    let watcher = Watcher::new(test_config(), Handlers::default(), source.clone()).unwrap();

    watcher.stop();
    watcher.stop();

    assert_eq!(watcher.state(), WatcherState::Stopped);
    assert_eq!(source.connect_attempts(), 0);
}

#[test]
fn test_double_stop_after_start() {
    let source = MemorySource::new();
    let watcher =
        Arc::new(Watcher::new(test_config(), Handlers::default(), source.clone()).unwrap());
    let worker = watcher.spawn().unwrap();
    assert!(source.wait_for_opens(1, TIMEOUT));

    watcher.stop();
    watcher.stop();
    worker.join().unwrap().unwrap();

    assert_eq!(source.open_stream_count(), 0);
}

#[test]
fn test_start_twice_is_rejected() {
    let source = MemorySource::new();
    let watcher =
        Arc::new(Watcher::new(test_config(), Handlers::default(), source.clone()).unwrap());
    let worker = watcher.spawn().unwrap();
    assert!(source.wait_for_opens(1, TIMEOUT));

    let result = watcher.start();
    assert!(matches!(result, Err(WatchError::InvalidState(_))));

    // The running loop is unaffected
    assert_eq!(source.open_stream_count(), 1);
    assert!(watcher.state().is_running());

    watcher.stop();
    worker.join().unwrap().unwrap();
}

#[test]
fn test_stop_interrupts_reconnect_delay() {
    let source = MemorySource::new();
    source.fail_next_connects(1);

    let config = WatcherConfig {
        reconnect: ReconnectPolicy::fixed(Duration::from_secs(3600)),
        ..Default::default()
    };
    let (handlers, errors) = error_channel();
    let watcher = Arc::new(Watcher::new(config, handlers, source.clone()).unwrap());
    let worker = watcher.spawn().unwrap();

    // First connect failed; the loop is now sleeping
    assert!(matches!(
        errors.recv_timeout(TIMEOUT).unwrap(),
        WatchError::Connection(_)
    ));

    let started = Instant::now();
    watcher.stop();
    worker.join().unwrap().unwrap();
    assert!(started.elapsed() < TIMEOUT);

    // No attempt after the stop
    assert_eq!(source.connect_attempts(), 1);
}

#[test]
fn test_stop_from_handler_discards_buffered_notifications() {
    let source = MemorySource::new();
    let watcher =
        Arc::new(Watcher::new(test_config(), Handlers::default(), source.clone()).unwrap());

    let calls = Arc::new(AtomicUsize::new(0));
    let (ready_tx, ready_rx) = bounded(1);
    let (release_tx, release_rx) = bounded::<()>(1);
    let weak: Weak<Watcher> = Arc::downgrade(&watcher);
    let counter = Arc::clone(&calls);
    watcher.on_insert(move |_| {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            ready_tx.send(()).unwrap();
            release_rx.recv().unwrap();
            if let Some(watcher) = weak.upgrade() {
                watcher.stop();
            }
        }
        Ok(())
    });

    let worker = watcher.spawn().unwrap();
    assert!(source.wait_for_opens(1, TIMEOUT));

    source.insert_one(&ns(), doc(json!({"_id": 0}))).unwrap();
    ready_rx.recv_timeout(TIMEOUT).unwrap();

    // Buffered behind the blocked handler
    for i in 1..5 {
        source.insert_one(&ns(), doc(json!({"_id": i}))).unwrap();
    }
    release_tx.send(()).unwrap();

    worker.join().unwrap().unwrap();
    assert_eq!(watcher.state(), WatcherState::Stopped);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_stop_from_other_thread_waits_for_dispatch() {
    let source = MemorySource::new();
    let watcher =
        Arc::new(Watcher::new(test_config(), Handlers::default(), source.clone()).unwrap());

    let calls = Arc::new(AtomicUsize::new(0));
    let (ready_tx, ready_rx) = bounded(1);
    let (release_tx, release_rx) = bounded::<()>(1);
    let counter = Arc::clone(&calls);
    watcher.on_insert(move |_| {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            ready_tx.send(()).unwrap();
            release_rx.recv().unwrap();
        }
        Ok(())
    });

    let worker = watcher.spawn().unwrap();
    assert!(source.wait_for_opens(1, TIMEOUT));

    source.insert_one(&ns(), doc(json!({"_id": 0}))).unwrap();
    ready_rx.recv_timeout(TIMEOUT).unwrap();
    for i in 1..5 {
        source.insert_one(&ns(), doc(json!({"_id": i}))).unwrap();
    }

    let stopper = {
        let watcher = Arc::clone(&watcher);
        thread::spawn(move || watcher.stop())
    };
    wait_for_state(&watcher, WatcherState::Stopped);

    // stop() cannot return while the handler is still running
    thread::sleep(Duration::from_millis(20));
    assert!(!stopper.is_finished());

    release_tx.send(()).unwrap();
    stopper.join().unwrap();
    worker.join().unwrap().unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(source.open_stream_count(), 0);
}

#[test]
fn test_stop_from_other_thread_waits_for_error_handler() {
    let source = MemorySource::new();
    let (ready_tx, ready_rx) = bounded(1);
    let (release_tx, release_rx) = bounded::<()>(1);
    let handlers = Handlers::new().on_error(move |_| {
        let _ = ready_tx.try_send(());
        let _ = release_rx.recv();
    });
    let watcher = Arc::new(Watcher::new(test_config(), handlers, source.clone()).unwrap());

    let stop_returned = Arc::new(AtomicBool::new(false));
    let late_calls = Arc::new(AtomicUsize::new(0));
    {
        let stop_returned = Arc::clone(&stop_returned);
        let late_calls = Arc::clone(&late_calls);
        watcher.on_error(move |_| {
            if stop_returned.load(Ordering::SeqCst) {
                late_calls.fetch_add(1, Ordering::SeqCst);
            }
        });
    }

    let worker = watcher.spawn().unwrap();
    assert!(source.wait_for_opens(1, TIMEOUT));

    source.break_streams("boom");
    ready_rx.recv_timeout(TIMEOUT).unwrap();

    let stopper = {
        let watcher = Arc::clone(&watcher);
        let stop_returned = Arc::clone(&stop_returned);
        thread::spawn(move || {
            watcher.stop();
            stop_returned.store(true, Ordering::SeqCst);
        })
    };
    wait_for_state(&watcher, WatcherState::Stopped);

    // stop() cannot return while the error handler is still running
    thread::sleep(Duration::from_millis(20));
    assert!(!stopper.is_finished());

    release_tx.send(()).unwrap();
    stopper.join().unwrap();
    worker.join().unwrap().unwrap();

    assert_eq!(late_calls.load(Ordering::SeqCst), 0);
    assert_eq!(source.opened_total(), 1);
}

#[test]
fn test_no_error_reported_for_own_shutdown() {
    let source = MemorySource::new();
    let (handlers, errors) = error_channel();
    let watcher = Arc::new(Watcher::new(test_config(), handlers, source.clone()).unwrap());
    let worker = watcher.spawn().unwrap();
    assert!(source.wait_for_opens(1, TIMEOUT));

    watcher.stop();
    worker.join().unwrap().unwrap();

    assert!(errors.try_recv().is_err());
    assert_eq!(source.opened_total(), 1);
}

#[test]
fn test_panicking_error_handler_is_contained() {
    let source = MemorySource::new();
    let handlers = Handlers::new().on_error(|_| panic!("error handler bug"));
    let watcher = Arc::new(Watcher::new(test_config(), handlers, source.clone()).unwrap());
    let worker = watcher.spawn().unwrap();
    assert!(source.wait_for_opens(1, TIMEOUT));

    source.break_streams("gone");
    assert!(source.wait_for_opens(2, TIMEOUT));

    watcher.stop();
    worker.join().unwrap().unwrap();
}
