//! Scriptable in-memory transport for session and control plane tests.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::{Transport, TransportError, TransportFactory};
use crate::models::Instance;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Connect,
    Stage(String),
    Commit,
    Discard,
    DetectVersion,
    Close,
}

#[derive(Default)]
struct Script {
    unreachable: HashSet<String>,
    reject: HashSet<String>,
    break_on: HashSet<String>,
    reject_commit: Option<String>,
    fail_discard: bool,
    version: Option<String>,
    connect_delay: Duration,
    stage_delay: Duration,
    commit_delay: Duration,
}

#[derive(Default)]
struct Record {
    calls: Vec<(String, Call)>,
    committed: HashMap<String, Vec<String>>,
    active: usize,
    max_active: usize,
}

/// Shared script and call log; clones observe the same state
#[derive(Clone, Default)]
pub struct MockFactory {
    script: Arc<Mutex<Script>>,
    record: Arc<Mutex<Record>>,
}

impl MockFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unreachable(&self, instance_id: &str) -> &Self {
        self.script.lock().unwrap().unreachable.insert(instance_id.to_string());
        self
    }

    /// Stage of this exact command fails with a device rejection
    pub fn reject(&self, command: &str) -> &Self {
        self.script.lock().unwrap().reject.insert(command.to_string());
        self
    }

    /// Stage of this exact command fails with a broken connection
    pub fn break_on(&self, command: &str) -> &Self {
        self.script.lock().unwrap().break_on.insert(command.to_string());
        self
    }

    pub fn reject_commit(&self, detail: &str) -> &Self {
        self.script.lock().unwrap().reject_commit = Some(detail.to_string());
        self
    }

    pub fn accept_commits(&self) -> &Self {
        self.script.lock().unwrap().reject_commit = None;
        self
    }

    /// Discard fails with a broken connection and leaves the transaction staged
    pub fn fail_discard(&self) -> &Self {
        self.script.lock().unwrap().fail_discard = true;
        self
    }

    /// Version reported on connect; defaults to the instance's declared one
    pub fn report_version(&self, version: &str) -> &Self {
        self.script.lock().unwrap().version = Some(version.to_string());
        self
    }

    pub fn connect_delay(&self, delay: Duration) -> &Self {
        self.script.lock().unwrap().connect_delay = delay;
        self
    }

    pub fn stage_delay(&self, delay: Duration) -> &Self {
        self.script.lock().unwrap().stage_delay = delay;
        self
    }

    pub fn commit_delay(&self, delay: Duration) -> &Self {
        self.script.lock().unwrap().commit_delay = delay;
        self
    }

    /// Every call made against one instance, in order
    pub fn calls(&self, instance_id: &str) -> Vec<Call> {
        self.record
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|(id, _)| id == instance_id)
            .map(|(_, call)| call.clone())
            .collect()
    }

    pub fn total_calls(&self) -> usize {
        self.record.lock().unwrap().calls.len()
    }

    pub fn connects(&self, instance_id: &str) -> usize {
        self.calls(instance_id)
            .iter()
            .filter(|c| **c == Call::Connect)
            .count()
    }

    /// Commands that made it into a successful commit
    pub fn committed(&self, instance_id: &str) -> Vec<String> {
        self.record
            .lock()
            .unwrap()
            .committed
            .get(instance_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Highest number of stage calls observed running at once, across instances
    pub fn max_concurrent_stages(&self) -> usize {
        self.record.lock().unwrap().max_active
    }

    fn log(&self, instance_id: &str, call: Call) {
        self.record
            .lock()
            .unwrap()
            .calls
            .push((instance_id.to_string(), call));
    }
}

#[async_trait]
impl TransportFactory for MockFactory {
    async fn connect(&self, instance: &Instance) -> Result<Box<dyn Transport>, TransportError> {
        self.log(&instance.id, Call::Connect);
        let (delay, unreachable, version) = {
            let script = self.script.lock().unwrap();
            (
                script.connect_delay,
                script.unreachable.contains(&instance.id),
                script.version.clone(),
            )
        };
        tokio::time::sleep(delay).await;
        if unreachable {
            return Err(TransportError::Connection(format!(
                "{}:{}: connection refused",
                instance.endpoint.host, instance.endpoint.port
            )));
        }
        Ok(Box::new(MockTransport {
            instance_id: instance.id.clone(),
            version: version.unwrap_or_else(|| instance.version.clone()),
            factory: self.clone(),
            staged: Vec::new(),
        }))
    }
}

pub struct MockTransport {
    instance_id: String,
    version: String,
    factory: MockFactory,
    staged: Vec<String>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn stage(&mut self, command: &str) -> Result<(), TransportError> {
        self.factory.log(&self.instance_id, Call::Stage(command.to_string()));
        let (delay, rejected, broken) = {
            let script = self.factory.script.lock().unwrap();
            (
                script.stage_delay,
                script.reject.contains(command),
                script.break_on.contains(command),
            )
        };

        {
            let mut record = self.factory.record.lock().unwrap();
            record.active += 1;
            record.max_active = record.max_active.max(record.active);
        }
        tokio::time::sleep(delay).await;
        self.factory.record.lock().unwrap().active -= 1;

        if broken {
            return Err(TransportError::Io("connection reset by peer".to_string()));
        }
        if rejected {
            return Err(TransportError::Rejected(format!(
                "Invalid command: {}",
                command
            )));
        }
        self.staged.push(command.to_string());
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), TransportError> {
        self.factory.log(&self.instance_id, Call::Commit);
        let (delay, reject) = {
            let script = self.factory.script.lock().unwrap();
            (script.commit_delay, script.reject_commit.clone())
        };
        tokio::time::sleep(delay).await;
        if let Some(detail) = reject {
            return Err(TransportError::Rejected(detail));
        }
        let staged = std::mem::take(&mut self.staged);
        self.factory
            .record
            .lock()
            .unwrap()
            .committed
            .entry(self.instance_id.clone())
            .or_default()
            .extend(staged);
        Ok(())
    }

    async fn discard(&mut self) -> Result<(), TransportError> {
        self.factory.log(&self.instance_id, Call::Discard);
        if self.factory.script.lock().unwrap().fail_discard {
            return Err(TransportError::Io("connection reset by peer".to_string()));
        }
        self.staged.clear();
        Ok(())
    }

    async fn detect_version(&mut self) -> Result<String, TransportError> {
        self.factory.log(&self.instance_id, Call::DetectVersion);
        Ok(self.version.clone())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.factory.log(&self.instance_id, Call::Close);
        Ok(())
    }
}
