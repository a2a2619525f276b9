//! Shared test doubles: scripted Modbus connector and in-memory cloud channel
#![allow(dead_code)]
#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use modbridge::cloud::{CloudChannel, PropertyMap, TwinDocument, TwinPatch};
use modbridge::error::{BridgeError, Result};
use modbridge::modbus::{RegisterConnector, RegisterSource};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;

pub const DEVICE_ID: &str = "ModbusCollector";

/// One scripted register read
#[derive(Debug, Clone)]
pub enum ReadStep {
    Values(Vec<i16>),
    Fail(&'static str),
    /// Answer after a delay
    Slow(Duration, Vec<i16>),
}

#[derive(Default)]
struct ConnectorState {
    connect_failures: AtomicUsize,
    connect_attempts: AtomicUsize,
    reads: AtomicUsize,
    sources_dropped: AtomicUsize,
    steps: Mutex<VecDeque<ReadStep>>,
}

/// Connector that fails a configured number of times, then hands out
/// sources reading from a shared script. An exhausted script answers zeros.
#[derive(Clone, Default)]
pub struct ScriptedConnector {
    state: Arc<ConnectorState>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_connects(self, count: usize) -> Self {
        self.state.connect_failures.store(count, Ordering::SeqCst);
        self
    }

    pub fn then(self, step: ReadStep) -> Self {
        self.state.steps.lock().unwrap().push_back(step);
        self
    }

    /// Voltage then current, both successful
    pub fn reading(self, voltage: Vec<i16>, current: Vec<i16>) -> Self {
        self.then(ReadStep::Values(voltage))
            .then(ReadStep::Values(current))
    }

    pub fn connect_attempts(&self) -> usize {
        self.state.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn reads(&self) -> usize {
        self.state.reads.load(Ordering::SeqCst)
    }

    pub fn sources_dropped(&self) -> usize {
        self.state.sources_dropped.load(Ordering::SeqCst)
    }

    pub fn remaining_steps(&self) -> usize {
        self.state.steps.lock().unwrap().len()
    }
}

#[async_trait]
impl RegisterConnector for ScriptedConnector {
    async fn connect(&self) -> Result<Box<dyn RegisterSource>> {
        self.state.connect_attempts.fetch_add(1, Ordering::SeqCst);

        let remaining = self.state.connect_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.state
                .connect_failures
                .store(remaining - 1, Ordering::SeqCst);
            return Err(BridgeError::Connection("connection refused".to_string()));
        }

        Ok(Box::new(ScriptedSource {
            state: self.state.clone(),
        }))
    }

    fn endpoint(&self) -> String {
        "scripted:502".to_string()
    }
}

struct ScriptedSource {
    state: Arc<ConnectorState>,
}

#[async_trait]
impl RegisterSource for ScriptedSource {
    async fn read_registers(&mut self, _address: u16, count: u16) -> Result<Vec<i16>> {
        self.state.reads.fetch_add(1, Ordering::SeqCst);
        let step = self.state.steps.lock().unwrap().pop_front();

        match step {
            Some(ReadStep::Values(values)) => Ok(values),
            Some(ReadStep::Fail(reason)) => Err(BridgeError::Read(reason.to_string())),
            Some(ReadStep::Slow(delay, values)) => {
                tokio::time::sleep(delay).await;
                Ok(values)
            },
            None => Ok(vec![0; usize::from(count)]),
        }
    }
}

impl Drop for ScriptedSource {
    fn drop(&mut self) {
        self.state.sources_dropped.fetch_add(1, Ordering::SeqCst);
    }
}

/// Message captured by [`MockCloud::send_event`]
#[derive(Debug, Clone)]
pub struct SentEvent {
    pub at: Instant,
    pub body: Value,
}

/// In-memory cloud channel recording everything the bridge sends
pub struct MockCloud {
    twin: Mutex<Option<TwinDocument>>,
    sent: Mutex<Vec<SentEvent>>,
    reported: Mutex<Vec<PropertyMap>>,
    fail_reported: AtomicBool,
    desired_tx: mpsc::UnboundedSender<TwinPatch>,
    desired_rx: Mutex<Option<mpsc::UnboundedReceiver<TwinPatch>>>,
}

impl MockCloud {
    /// Twin with the given desired side
    pub fn with_desired(desired: Value) -> Arc<Self> {
        let desired = match desired {
            Value::Object(map) => map,
            _ => PropertyMap::new(),
        };
        Self::build(Some(TwinDocument {
            desired,
            reported: PropertyMap::new(),
        }))
    }

    /// Twin GET always fails
    pub fn without_twin() -> Arc<Self> {
        Self::build(None)
    }

    fn build(twin: Option<TwinDocument>) -> Arc<Self> {
        let (desired_tx, desired_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            twin: Mutex::new(twin),
            sent: Mutex::new(Vec::new()),
            reported: Mutex::new(Vec::new()),
            fail_reported: AtomicBool::new(false),
            desired_tx,
            desired_rx: Mutex::new(Some(desired_rx)),
        })
    }

    pub fn fail_reported(&self, fail: bool) {
        self.fail_reported.store(fail, Ordering::SeqCst);
    }

    /// Simulate a desired-property push from the cloud
    pub fn push_desired(&self, properties: Value) {
        let properties = match properties {
            Value::Object(map) => map,
            _ => PropertyMap::new(),
        };
        self.desired_tx.send(TwinPatch::new(properties)).unwrap();
    }

    pub fn sent(&self) -> Vec<SentEvent> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn reported(&self) -> Vec<PropertyMap> {
        self.reported.lock().unwrap().clone()
    }

    /// `pollingInterval` of every successful reported patch, in order
    pub fn reported_intervals(&self) -> Vec<u64> {
        self.reported()
            .iter()
            .filter_map(|props| props.get("pollingInterval").and_then(Value::as_u64))
            .collect()
    }
}

#[async_trait]
impl CloudChannel for MockCloud {
    async fn send_event(&self, payload: Vec<u8>) -> Result<()> {
        let body = serde_json::from_slice(&payload)?;
        self.sent.lock().unwrap().push(SentEvent {
            at: Instant::now(),
            body,
        });
        Ok(())
    }

    async fn get_twin(&self) -> Result<TwinDocument> {
        self.twin
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| BridgeError::Cloud("Twin GET failed with status 500".to_string()))
    }

    async fn update_reported(&self, properties: PropertyMap) -> Result<()> {
        if self.fail_reported.load(Ordering::SeqCst) {
            return Err(BridgeError::Timeout("reported patch".to_string()));
        }
        self.reported.lock().unwrap().push(properties);
        Ok(())
    }

    fn take_desired_updates(&self) -> Option<mpsc::UnboundedReceiver<TwinPatch>> {
        self.desired_rx.lock().unwrap().take()
    }
}

/// Poll `condition` every 10ms (virtual time under `start_paused`) for up to ten minutes
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..60_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}
