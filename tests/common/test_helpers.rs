//! Shared fixtures for the integration tests.
//!
//! Each test binary compiles this module independently and uses a subset.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use refetch::clock::ManualClock;
use refetch::events::FetchEvent;
use refetch::sleeper::Sleeper;
use refetch::transport::MockTransport;
use refetch::{FetchEngine, FetchOptions};

/// Build an engine over a fresh mock transport.
pub fn engine_with(options: FetchOptions) -> (FetchEngine, MockTransport) {
    let transport = MockTransport::new();
    let engine =
        FetchEngine::new(Arc::new(transport.clone()), options).expect("valid engine options");
    (engine, transport)
}

/// Record every emitted event name, in order.
pub struct EventLog {
    names: Arc<Mutex<Vec<String>>>,
}

impl EventLog {
    pub fn attach(engine: &FetchEngine) -> Self {
        let names: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = names.clone();
        // The subscription stays live for the engine's lifetime.
        drop(engine.on_any(move |event: &FetchEvent| {
            sink.lock().unwrap().push(event.name().to_string());
        }));
        Self { names }
    }

    pub fn names(&self) -> Vec<String> {
        self.names.lock().unwrap().clone()
    }

    pub fn count_of(&self, name: &str) -> usize {
        self.names.lock().unwrap().iter().filter(|n| n.as_str() == name).count()
    }

    pub fn clear(&self) {
        self.names.lock().unwrap().clear();
    }
}

/// Sleeper that drives a [`ManualClock`] forward by each requested delay,
/// so rate-limit waits and retry delays make progress without real time.
#[derive(Debug, Clone)]
pub struct ClockDrivenSleeper {
    clock: ManualClock,
    recorded: Arc<Mutex<Vec<Duration>>>,
}

impl ClockDrivenSleeper {
    pub fn new(clock: ManualClock) -> Self {
        Self { clock, recorded: Arc::new(Mutex::new(Vec::new())) }
    }

    pub fn recorded(&self) -> Vec<Duration> {
        self.recorded.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Sleeper for ClockDrivenSleeper {
    async fn sleep(&self, duration: Duration) {
        self.recorded.lock().unwrap().push(duration);
        self.clock.advance(duration.as_millis() as u64);
    }
}
