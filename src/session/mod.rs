//! Per-instance configuration sessions.
//!
//! Each registered instance gets one slot holding at most one live
//! transport. The slot's async mutex serializes every apply against that
//! instance; distinct instances never share a lock. An apply stages all of
//! its commands in one transaction and commits once, or discards the whole
//! transaction and reports why.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::instances::InstanceRegistry;
use crate::models::{skipped_all, ApplyMode, ApplyResult, Instance, Liveness, Outcome, SkipReason};
use crate::transport::{normalize_version, Transport, TransportError, TransportFactory};
use crate::ws::Hub;

/// Lifecycle of one instance's session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Idle,
    Connecting,
    Ready,
    Applying,
    Closing,
    Closed,
    Error,
}

/// What a second apply does while one is in flight on the same instance
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusyPolicy {
    #[default]
    Reject,
    Queue,
}

impl FromStr for BusyPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reject" => Ok(Self::Reject),
            "queue" => Ok(Self::Queue),
            other => Err(format!("unknown busy policy '{}'", other)),
        }
    }
}

/// Timeouts and contention policy for the session manager
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub busy_policy: BusyPolicy,
    pub connect_timeout: Duration,
    pub stage_timeout: Duration,
    pub commit_timeout: Duration,
    /// Zero disables idle reaping
    pub idle_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            busy_policy: BusyPolicy::Reject,
            connect_timeout: Duration::from_secs(10),
            stage_timeout: Duration::from_secs(15),
            commit_timeout: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(300),
        }
    }
}

/// Per-call apply options
#[derive(Debug, Clone, Default)]
pub struct ApplyOptions {
    pub mode: ApplyMode,
    /// Cancelling this token aborts the call and tears the session down
    pub cancel: Option<CancellationToken>,
}

/// Externally visible session details
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub instance_id: String,
    pub state: SessionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opened_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_applied: Option<String>,
    pub applies: u64,
}

#[derive(Debug, Clone)]
struct SessionMeta {
    id: Uuid,
    opened_at: DateTime<Utc>,
    last_applied: Option<String>,
    applies: u64,
}

/// Live session bound to one instance
struct Session {
    transport: Box<dyn Transport>,
    /// Commands staged in the open transaction
    pending: Vec<String>,
    meta: SessionMeta,
}

struct Slot {
    session: Arc<tokio::sync::Mutex<Option<Session>>>,
    state: watch::Sender<SessionState>,
    /// Cancelled by `close` to preempt whoever holds the session
    preempt: Mutex<CancellationToken>,
    last_used: Mutex<Instant>,
    meta: Mutex<Option<SessionMeta>>,
    /// Set once the instance is deregistered; the slot never connects again
    retired: AtomicBool,
}

impl Slot {
    fn new() -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        Self {
            session: Arc::new(tokio::sync::Mutex::new(None)),
            state,
            preempt: Mutex::new(CancellationToken::new()),
            last_used: Mutex::new(Instant::now()),
            meta: Mutex::new(None),
            retired: AtomicBool::new(false),
        }
    }

    fn preempt_token(&self) -> CancellationToken {
        self.preempt
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn touch(&self) {
        *self.last_used.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_used
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    fn record(&self, meta: Option<SessionMeta>) {
        *self.meta.lock().unwrap_or_else(PoisonError::into_inner) = meta;
    }

    fn meta(&self) -> Option<SessionMeta> {
        self.meta
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Replaces a cancelled preempt token with a fresh one on drop
struct Rearm<'a>(&'a Slot);

impl Drop for Rearm<'_> {
    fn drop(&mut self) {
        *self.0.preempt.lock().unwrap_or_else(PoisonError::into_inner) = CancellationToken::new();
    }
}

type SessionGuard = OwnedMutexGuard<Option<Session>>;

enum Interrupted {
    Closed,
    Cancelled,
}

/// SessionManager owns one session slot per instance
pub struct SessionManager {
    instances: Arc<InstanceRegistry>,
    factory: Arc<dyn TransportFactory>,
    settings: SessionSettings,
    ws_hub: Option<Arc<Hub>>,
    slots: Mutex<HashMap<String, Arc<Slot>>>,
}

impl SessionManager {
    pub fn new(
        instances: Arc<InstanceRegistry>,
        factory: Arc<dyn TransportFactory>,
        settings: SessionSettings,
        ws_hub: Option<Arc<Hub>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            instances,
            factory,
            settings,
            ws_hub,
            slots: Mutex::new(HashMap::new()),
        })
    }

    fn slots(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Slot>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn existing_slot(&self, instance_id: &str) -> Option<Arc<Slot>> {
        self.slots().get(instance_id).cloned()
    }

    fn slot(&self, instance_id: &str) -> Arc<Slot> {
        self.slots()
            .entry(instance_id.to_string())
            .or_insert_with(|| Arc::new(Slot::new()))
            .clone()
    }

    async fn set_state(&self, instance_id: &str, slot: &Slot, state: SessionState) {
        let previous = slot.state.send_replace(state);
        if previous == state {
            return;
        }
        tracing::debug!("Session {}: {:?} -> {:?}", instance_id, previous, state);
        if let Some(hub) = &self.ws_hub {
            hub.broadcast_session_state(instance_id, state).await;
        }
    }

    fn mark(&self, instance_id: &str, liveness: Liveness) {
        if let Err(e) = self.instances.set_liveness(instance_id, liveness) {
            tracing::debug!("Skipping liveness update for {}: {}", instance_id, e);
        }
    }

    async fn acquire(&self, instance_id: &str, slot: &Slot) -> CoreResult<SessionGuard> {
        match self.settings.busy_policy {
            BusyPolicy::Reject => slot
                .session
                .clone()
                .try_lock_owned()
                .map_err(|_| CoreError::Busy(instance_id.to_string())),
            BusyPolicy::Queue => Ok(slot.session.clone().lock_owned().await),
        }
    }

    /// Re-checked after the slot lock is taken: the instance may have been
    /// deregistered while this call was queued.
    fn ensure_live(&self, instance_id: &str, slot: &Arc<Slot>) -> CoreResult<()> {
        if slot.retired.load(Ordering::Acquire) || !self.instances.contains(instance_id) {
            let mut slots = self.slots();
            if slots.get(instance_id).is_some_and(|s| Arc::ptr_eq(s, slot)) {
                slots.remove(instance_id);
            }
            return Err(CoreError::UnknownInstance(instance_id.to_string()));
        }
        Ok(())
    }

    /// Open a session explicitly. Reuses a live one.
    pub async fn open(&self, instance_id: &str) -> CoreResult<SessionInfo> {
        let instance = self.instances.get(instance_id)?;
        let slot = self.slot(instance_id);
        let mut guard = self.acquire(instance_id, &slot).await?;
        self.ensure_live(instance_id, &slot)?;

        if slot.preempt_token().is_cancelled() {
            return Err(CoreError::SessionClosed(instance_id.to_string()));
        }
        if guard.is_none() {
            let session = self.connect(&instance, &slot).await?;
            *guard = Some(session);
        }
        slot.touch();
        drop(guard);
        Ok(self.describe(instance_id, &slot))
    }

    /// Apply commands in order as one transaction.
    ///
    /// Device-side failures never surface as `Err`; they come back as
    /// per-command results. `Err` is reserved for an unknown instance and
    /// for `Busy` under the reject policy.
    pub async fn apply(
        &self,
        instance_id: &str,
        commands: Vec<String>,
        options: ApplyOptions,
    ) -> CoreResult<Vec<ApplyResult>> {
        let instance = self.instances.get(instance_id)?;
        if commands.is_empty() {
            return Ok(Vec::new());
        }

        let slot = self.slot(instance_id);
        let mut guard = self.acquire(instance_id, &slot).await?;
        self.ensure_live(instance_id, &slot)?;

        let preempt = slot.preempt_token();
        if preempt.is_cancelled() {
            tracing::info!("Apply on {} dropped: session is closing", instance_id);
            return Ok(skipped_all(&commands, SkipReason::SessionClosed));
        }
        let cancel = options.cancel.unwrap_or_else(CancellationToken::new);
        if cancel.is_cancelled() {
            return Ok(skipped_all(&commands, SkipReason::Cancelled));
        }
        slot.touch();

        let interrupted = tokio::select! {
            biased;
            _ = preempt.cancelled() => Err(Interrupted::Closed),
            _ = cancel.cancelled() => Err(Interrupted::Cancelled),
            results = self.run_apply(&instance, &slot, &mut guard, &commands, options.mode) => Ok(results),
        };

        let results = match interrupted {
            Ok(results) => results,
            Err(Interrupted::Closed) => {
                tracing::warn!("Apply on {} preempted by close", instance_id);
                self.teardown(instance_id, &slot, &mut guard, SessionState::Closing)
                    .await;
                skipped_all(&commands, SkipReason::SessionClosed)
            }
            Err(Interrupted::Cancelled) => {
                tracing::warn!("Apply on {} cancelled by caller", instance_id);
                self.teardown(instance_id, &slot, &mut guard, SessionState::Error)
                    .await;
                skipped_all(&commands, SkipReason::Cancelled)
            }
        };

        slot.touch();
        Ok(results)
    }

    async fn run_apply(
        &self,
        instance: &Instance,
        slot: &Slot,
        session: &mut Option<Session>,
        commands: &[String],
        mode: ApplyMode,
    ) -> Vec<ApplyResult> {
        let id = instance.id.as_str();
        if session.is_none() {
            match self.connect(instance, slot).await {
                Ok(opened) => *session = Some(opened),
                Err(e) => return skipped_all(commands, skip_reason(&e)),
            }
        }
        let Some(live) = session.as_mut() else {
            return skipped_all(commands, SkipReason::SessionClosed);
        };

        self.set_state(id, slot, SessionState::Applying).await;

        // left behind by an apply future that was dropped mid-transaction
        if !live.pending.is_empty() {
            tracing::warn!("Discarding {} stale staged commands on {}", live.pending.len(), id);
            match timeout(self.settings.stage_timeout, live.transport.discard()).await {
                Ok(Ok(())) => live.pending.clear(),
                Ok(Err(e)) => {
                    let reason = SkipReason::ConnectionError(e.detail().to_string());
                    return self.fault(id, slot, session, Vec::new(), commands, reason).await;
                }
                Err(_) => {
                    return self
                        .fault(id, slot, session, Vec::new(), commands, SkipReason::TransportTimeout)
                        .await;
                }
            }
        }

        let mut results: Vec<ApplyResult> = Vec::with_capacity(commands.len());
        let mut rejected = false;
        for command in commands {
            if rejected && mode == ApplyMode::Atomic {
                results.push(ApplyResult::skipped(command, SkipReason::PriorRejection));
                continue;
            }
            match timeout(self.settings.stage_timeout, live.transport.stage(command)).await {
                Ok(Ok(())) => {
                    live.pending.push(command.clone());
                    results.push(ApplyResult::applied(command));
                }
                Ok(Err(e)) if e.is_rejection() => {
                    tracing::info!("{} rejected '{}': {}", id, command, e.detail());
                    results.push(ApplyResult::rejected(command, e.detail()));
                    rejected = true;
                }
                Ok(Err(e)) => {
                    tracing::warn!("Transport fault on {} while staging: {}", id, e);
                    let reason = SkipReason::ConnectionError(e.detail().to_string());
                    return self.fault(id, slot, session, results, commands, reason).await;
                }
                Err(_) => {
                    tracing::warn!("Staging on {} timed out", id);
                    return self
                        .fault(id, slot, session, results, commands, SkipReason::TransportTimeout)
                        .await;
                }
            }
        }

        if rejected {
            let discarded = timeout(self.settings.stage_timeout, live.transport.discard()).await;
            live.pending.clear();
            let results = roll_back(results);
            return match discarded {
                Ok(Ok(())) => {
                    self.set_state(id, slot, SessionState::Ready).await;
                    results
                }
                Ok(Err(e)) => {
                    tracing::warn!("Discard on {} failed: {}", id, e);
                    let reason = SkipReason::ConnectionError(e.detail().to_string());
                    self.fault(id, slot, session, results, commands, reason).await
                }
                Err(_) => {
                    tracing::warn!("Discard on {} timed out", id);
                    self.fault(id, slot, session, results, commands, SkipReason::TransportTimeout)
                        .await
                }
            };
        }

        match timeout(self.settings.commit_timeout, live.transport.commit()).await {
            Ok(Ok(())) => {
                live.pending.clear();
                live.meta.last_applied = commands.last().cloned();
                live.meta.applies += 1;
                slot.record(Some(live.meta.clone()));
                tracing::info!("Committed {} commands on {}", commands.len(), id);
                self.set_state(id, slot, SessionState::Ready).await;
                results
            }
            Ok(Err(e)) if e.is_rejection() => {
                tracing::info!("Commit rejected on {}: {}", id, e.detail());
                let rejected_all: Vec<ApplyResult> = commands
                    .iter()
                    .map(|c| ApplyResult::rejected(c, e.detail()))
                    .collect();
                // a transaction left open would ride along with the next commit
                match timeout(self.settings.stage_timeout, live.transport.discard()).await {
                    Ok(Ok(())) => {
                        live.pending.clear();
                        self.set_state(id, slot, SessionState::Ready).await;
                        rejected_all
                    }
                    Ok(Err(discard_err)) => {
                        tracing::warn!("Discard on {} failed: {}", id, discard_err);
                        let reason = SkipReason::ConnectionError(discard_err.detail().to_string());
                        self.fault(id, slot, session, rejected_all, commands, reason).await
                    }
                    Err(_) => {
                        tracing::warn!("Discard on {} timed out", id);
                        self.fault(id, slot, session, rejected_all, commands, SkipReason::TransportTimeout)
                            .await
                    }
                }
            }
            Ok(Err(e)) => {
                tracing::warn!("Transport fault on {} during commit: {}", id, e);
                let reason = SkipReason::ConnectionError(e.detail().to_string());
                self.fault(id, slot, session, results, commands, reason).await
            }
            Err(_) => {
                tracing::warn!("Commit on {} timed out", id);
                self.fault(id, slot, session, results, commands, SkipReason::TransportTimeout)
                    .await
            }
        }
    }

    /// Unrecoverable transport fault mid-apply: roll back, drop the
    /// session, and report every non-rejected command as skipped.
    async fn fault(
        &self,
        instance_id: &str,
        slot: &Slot,
        session: &mut Option<Session>,
        partial: Vec<ApplyResult>,
        commands: &[String],
        reason: SkipReason,
    ) -> Vec<ApplyResult> {
        self.mark(instance_id, Liveness::Unreachable);
        self.teardown(instance_id, slot, session, SessionState::Error)
            .await;
        commands
            .iter()
            .enumerate()
            .map(|(i, command)| match partial.get(i) {
                Some(result) if result.is_rejected() => result.clone(),
                _ => ApplyResult::skipped(command, reason.clone()),
            })
            .collect()
    }

    async fn connect(&self, instance: &Instance, slot: &Slot) -> CoreResult<Session> {
        let id = instance.id.as_str();
        self.set_state(id, slot, SessionState::Connecting).await;
        tracing::info!(
            "Connecting to {} at {}:{}",
            id,
            instance.endpoint.host,
            instance.endpoint.port
        );

        let mut transport =
            match timeout(self.settings.connect_timeout, self.factory.connect(instance)).await {
                Ok(Ok(transport)) => transport,
                Ok(Err(e)) => {
                    tracing::warn!("Connection to {} failed: {}", id, e);
                    self.mark(id, Liveness::Unreachable);
                    self.set_state(id, slot, SessionState::Closed).await;
                    return Err(CoreError::ConnectionError {
                        instance: id.to_string(),
                        detail: e.detail().to_string(),
                    });
                }
                Err(_) => {
                    tracing::warn!("Connection to {} timed out", id);
                    self.mark(id, Liveness::Unreachable);
                    self.set_state(id, slot, SessionState::Closed).await;
                    return Err(CoreError::TransportTimeout {
                        instance: id.to_string(),
                        operation: "connect",
                    });
                }
            };

        match timeout(self.settings.connect_timeout, transport.detect_version()).await {
            Ok(Ok(raw)) => match normalize_version(&raw) {
                Some(version) => {
                    if let Err(e) = self.instances.update_version(id, &version) {
                        tracing::debug!("Version write-back for {} skipped: {}", id, e);
                    }
                }
                None => tracing::warn!("{} reported unrecognized version '{}'", id, raw),
            },
            Ok(Err(e)) => tracing::warn!("Version detection on {} failed: {}", id, e),
            Err(_) => tracing::warn!("Version detection on {} timed out", id),
        }

        self.mark(id, Liveness::Reachable);
        let meta = SessionMeta {
            id: Uuid::new_v4(),
            opened_at: Utc::now(),
            last_applied: None,
            applies: 0,
        };
        slot.record(Some(meta.clone()));
        tracing::info!("Session {} open on {}", meta.id, id);
        self.set_state(id, slot, SessionState::Ready).await;

        Ok(Session {
            transport,
            pending: Vec::new(),
            meta,
        })
    }

    /// Release the transport, discarding anything staged
    async fn teardown(
        &self,
        instance_id: &str,
        slot: &Slot,
        session: &mut Option<Session>,
        via: SessionState,
    ) {
        self.set_state(instance_id, slot, via).await;
        if let Some(mut live) = session.take() {
            if !live.pending.is_empty() {
                release(
                    instance_id,
                    "discard",
                    timeout(self.settings.stage_timeout, live.transport.discard()).await,
                );
            }
            release(
                instance_id,
                "close",
                timeout(self.settings.stage_timeout, live.transport.close()).await,
            );
            tracing::info!("Session {} on {} closed", live.meta.id, instance_id);
        }
        slot.record(None);
        self.set_state(instance_id, slot, SessionState::Closed).await;
    }

    /// Close the instance's session, preempting any apply in flight.
    /// Waits for the slot regardless of busy policy.
    pub async fn close(&self, instance_id: &str) -> CoreResult<()> {
        let Some(slot) = self.existing_slot(instance_id) else {
            self.instances.get(instance_id)?;
            return Ok(());
        };

        slot.preempt_token().cancel();
        // re-arms the slot even if this future is dropped while waiting
        let rearm = Rearm(&slot);
        let mut guard = slot.session.clone().lock_owned().await;
        if guard.is_some() {
            self.teardown(instance_id, &slot, &mut guard, SessionState::Closing)
                .await;
        }
        drop(rearm);
        Ok(())
    }

    /// Close every session; used on shutdown
    pub async fn close_all(&self) {
        let ids: Vec<String> = self.slots().keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.close(&id).await {
                tracing::warn!("Failed to close session for {}: {}", id, e);
            }
        }
    }

    /// Close the session and deregister the instance while holding its slot,
    /// so no queued call can reconnect to it afterwards.
    pub async fn retire(&self, instance_id: &str) -> CoreResult<()> {
        self.instances.get(instance_id)?;
        let slot = self.slot(instance_id);

        slot.preempt_token().cancel();
        let rearm = Rearm(&slot);
        let mut guard = slot.session.clone().lock_owned().await;
        if guard.is_some() {
            self.teardown(instance_id, &slot, &mut guard, SessionState::Closing)
                .await;
        }
        slot.retired.store(true, Ordering::Release);
        let removed = self.instances.deregister(instance_id).map(|_| ());
        {
            let mut slots = self.slots();
            if slots.get(instance_id).is_some_and(|s| Arc::ptr_eq(s, &slot)) {
                slots.remove(instance_id);
            }
        }
        drop(rearm);
        removed
    }

    pub fn state(&self, instance_id: &str) -> CoreResult<SessionState> {
        match self.existing_slot(instance_id) {
            Some(slot) => Ok(*slot.state.borrow()),
            None => {
                self.instances.get(instance_id)?;
                Ok(SessionState::Idle)
            }
        }
    }

    pub fn info(&self, instance_id: &str) -> CoreResult<SessionInfo> {
        match self.existing_slot(instance_id) {
            Some(slot) => Ok(self.describe(instance_id, &slot)),
            None => {
                self.instances.get(instance_id)?;
                Ok(SessionInfo {
                    instance_id: instance_id.to_string(),
                    state: SessionState::Idle,
                    session_id: None,
                    opened_at: None,
                    last_applied: None,
                    applies: 0,
                })
            }
        }
    }

    fn describe(&self, instance_id: &str, slot: &Slot) -> SessionInfo {
        let meta = slot.meta();
        SessionInfo {
            instance_id: instance_id.to_string(),
            state: *slot.state.borrow(),
            session_id: meta.as_ref().map(|m| m.id),
            opened_at: meta.as_ref().map(|m| m.opened_at),
            last_applied: meta.as_ref().and_then(|m| m.last_applied.clone()),
            applies: meta.map(|m| m.applies).unwrap_or(0),
        }
    }

    /// Watch state transitions of one instance's session
    pub fn subscribe(&self, instance_id: &str) -> CoreResult<watch::Receiver<SessionState>> {
        self.instances.get(instance_id)?;
        Ok(self.slot(instance_id).state.subscribe())
    }

    /// Periodically close sessions idle longer than the idle timeout.
    /// Busy slots are skipped, never preempted.
    pub fn spawn_idle_reaper(self: &Arc<Self>, shutdown: CancellationToken) -> Option<JoinHandle<()>> {
        let idle = self.settings.idle_timeout;
        if idle.is_zero() {
            tracing::info!("Idle session reaper disabled");
            return None;
        }

        let manager = self.clone();
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval((idle / 2).max(Duration::from_millis(10)));
            loop {
                tokio::select! {
                    _ = ticker.tick() => manager.reap_idle(idle).await,
                    _ = shutdown.cancelled() => {
                        tracing::info!("Idle session reaper stopped");
                        break;
                    }
                }
            }
        }))
    }

    async fn reap_idle(&self, idle: Duration) {
        let slots: Vec<(String, Arc<Slot>)> = self
            .slots()
            .iter()
            .map(|(id, slot)| (id.clone(), slot.clone()))
            .collect();

        for (id, slot) in slots {
            if *slot.state.borrow() != SessionState::Ready || slot.idle_for() < idle {
                continue;
            }
            let Ok(mut guard) = slot.session.clone().try_lock_owned() else {
                continue;
            };
            if guard.is_some() {
                tracing::info!("Closing idle session on {}", id);
                self.teardown(&id, &slot, &mut guard, SessionState::Closing)
                    .await;
            }
        }
    }
}

fn skip_reason(err: &CoreError) -> SkipReason {
    match err {
        CoreError::ConnectionError { detail, .. } => SkipReason::ConnectionError(detail.clone()),
        CoreError::TransportTimeout { .. } => SkipReason::TransportTimeout,
        other => SkipReason::ConnectionError(other.to_string()),
    }
}

/// Staged-but-discarded commands become `rolled_back`
fn roll_back(results: Vec<ApplyResult>) -> Vec<ApplyResult> {
    results
        .into_iter()
        .map(|r| match r.outcome {
            Outcome::Applied => ApplyResult::skipped(r.command, SkipReason::RolledBack),
            _ => r,
        })
        .collect()
}

fn release(
    instance_id: &str,
    step: &str,
    outcome: Result<Result<(), TransportError>, tokio::time::error::Elapsed>,
) {
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!("{} on {} failed during teardown: {}", step, instance_id, e),
        Err(_) => tracing::warn!("{} on {} timed out during teardown", step, instance_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Endpoint;
    use crate::transport::mock::{Call, MockFactory};

    fn settings() -> SessionSettings {
        SessionSettings {
            busy_policy: BusyPolicy::Reject,
            connect_timeout: Duration::from_secs(1),
            stage_timeout: Duration::from_secs(1),
            commit_timeout: Duration::from_secs(1),
            idle_timeout: Duration::ZERO,
        }
    }

    fn setup(
        mock: &MockFactory,
        settings: SessionSettings,
    ) -> (Arc<SessionManager>, Arc<InstanceRegistry>) {
        let instances = Arc::new(InstanceRegistry::new(
            ["1.3", "1.4", "1.5"].iter().map(|v| v.to_string()).collect(),
        ));
        instances
            .register("r1", Endpoint::new("192.0.2.1", "vyos", "vyos"), "1.4")
            .unwrap();
        instances
            .register("r2", Endpoint::new("192.0.2.2", "vyos", "vyos"), "1.4")
            .unwrap();
        let manager =
            SessionManager::new(instances.clone(), Arc::new(mock.clone()), settings, None);
        (manager, instances)
    }

    fn cmds(list: &[&str]) -> Vec<String> {
        list.iter().map(|c| c.to_string()).collect()
    }

    fn stages(calls: &[Call]) -> Vec<String> {
        calls
            .iter()
            .filter_map(|c| match c {
                Call::Stage(cmd) => Some(cmd.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_busy_policy_parse() {
        assert_eq!("queue".parse::<BusyPolicy>().unwrap(), BusyPolicy::Queue);
        assert_eq!(" Reject ".parse::<BusyPolicy>().unwrap(), BusyPolicy::Reject);
        assert!("wait".parse::<BusyPolicy>().is_err());
    }

    #[tokio::test]
    async fn test_apply_commits_in_order() {
        let mock = MockFactory::new();
        let (manager, instances) = setup(&mock, settings());

        let results = manager
            .apply("r1", cmds(&["set a", "set b", "set c"]), ApplyOptions::default())
            .await
            .unwrap();

        assert!(crate::models::all_applied(&results));
        let order: Vec<&str> = results.iter().map(|r| r.command.as_str()).collect();
        assert_eq!(order, vec!["set a", "set b", "set c"]);
        assert_eq!(mock.committed("r1"), cmds(&["set a", "set b", "set c"]));
        assert_eq!(manager.state("r1").unwrap(), SessionState::Ready);
        assert_eq!(instances.get("r1").unwrap().liveness, Liveness::Reachable);

        let info = manager.info("r1").unwrap();
        assert!(info.session_id.is_some());
        assert_eq!(info.last_applied.as_deref(), Some("set c"));
        assert_eq!(info.applies, 1);
    }

    #[tokio::test]
    async fn test_session_reused_across_applies() {
        let mock = MockFactory::new();
        let (manager, _) = setup(&mock, settings());

        let opened = manager.open("r1").await.unwrap();
        manager
            .apply("r1", cmds(&["set a"]), ApplyOptions::default())
            .await
            .unwrap();
        let again = manager.open("r1").await.unwrap();

        assert_eq!(opened.session_id, again.session_id);
        assert_eq!(mock.connects("r1"), 1);
    }

    #[tokio::test]
    async fn test_rejection_discards_whole_transaction() {
        let mock = MockFactory::new();
        mock.reject("set b");
        let (manager, _) = setup(&mock, settings());

        let results = manager
            .apply("r1", cmds(&["set a", "set b", "set c"]), ApplyOptions::default())
            .await
            .unwrap();

        assert_eq!(results[0].skip_reason(), Some(&SkipReason::RolledBack));
        assert!(results[1].is_rejected());
        assert_eq!(results[2].skip_reason(), Some(&SkipReason::PriorRejection));
        assert!(!results.iter().any(|r| r.is_applied()));

        let calls = mock.calls("r1");
        assert_eq!(stages(&calls), cmds(&["set a", "set b"]));
        assert!(calls.contains(&Call::Discard));
        assert!(!calls.contains(&Call::Commit));
        assert!(mock.committed("r1").is_empty());
        assert_eq!(manager.state("r1").unwrap(), SessionState::Ready);
    }

    #[tokio::test]
    async fn test_best_effort_reports_every_rejection() {
        let mock = MockFactory::new();
        mock.reject("set a").reject("set c");
        let (manager, _) = setup(&mock, settings());

        let options = ApplyOptions {
            mode: ApplyMode::BestEffort,
            cancel: None,
        };
        let results = manager
            .apply("r1", cmds(&["set a", "set b", "set c"]), options)
            .await
            .unwrap();

        assert!(results[0].is_rejected());
        assert_eq!(results[1].skip_reason(), Some(&SkipReason::RolledBack));
        assert!(results[2].is_rejected());
        assert_eq!(stages(&mock.calls("r1")).len(), 3);
        assert!(mock.committed("r1").is_empty());
    }

    #[tokio::test]
    async fn test_commit_rejection_rejects_all() {
        let mock = MockFactory::new();
        mock.reject_commit("Commit failed");
        let (manager, _) = setup(&mock, settings());

        let results = manager
            .apply("r1", cmds(&["set a", "set b"]), ApplyOptions::default())
            .await
            .unwrap();

        assert_eq!(
            results,
            vec![
                ApplyResult::rejected("set a", "Commit failed"),
                ApplyResult::rejected("set b", "Commit failed"),
            ]
        );
        assert_eq!(manager.state("r1").unwrap(), SessionState::Ready);
    }

    #[tokio::test]
    async fn test_failed_discard_after_commit_rejection_drops_session() {
        let mock = MockFactory::new();
        mock.reject_commit("Commit failed").fail_discard();
        let (manager, instances) = setup(&mock, settings());

        let results = manager
            .apply("r1", cmds(&["set a", "set b"]), ApplyOptions::default())
            .await
            .unwrap();

        assert_eq!(
            results,
            vec![
                ApplyResult::rejected("set a", "Commit failed"),
                ApplyResult::rejected("set b", "Commit failed"),
            ]
        );
        assert_eq!(manager.state("r1").unwrap(), SessionState::Closed);
        assert_eq!(instances.get("r1").unwrap().liveness, Liveness::Unreachable);
        assert!(mock.calls("r1").contains(&Call::Close));

        mock.accept_commits();
        let results = manager
            .apply("r1", cmds(&["set c"]), ApplyOptions::default())
            .await
            .unwrap();
        assert!(crate::models::all_applied(&results));
        assert_eq!(mock.committed("r1"), cmds(&["set c"]));
        assert_eq!(mock.connects("r1"), 2);
    }

    #[tokio::test]
    async fn test_failed_discard_after_stage_rejection_drops_session() {
        let mock = MockFactory::new();
        mock.reject("set b").fail_discard();
        let (manager, instances) = setup(&mock, settings());

        let results = manager
            .apply("r1", cmds(&["set a", "set b"]), ApplyOptions::default())
            .await
            .unwrap();

        assert!(matches!(
            results[0].skip_reason(),
            Some(SkipReason::ConnectionError(_))
        ));
        assert!(results[1].is_rejected());
        assert!(!mock.calls("r1").contains(&Call::Commit));
        assert_eq!(manager.state("r1").unwrap(), SessionState::Closed);
        assert_eq!(instances.get("r1").unwrap().liveness, Liveness::Unreachable);
    }

    #[tokio::test]
    async fn test_stale_transaction_discarded_before_next_apply() {
        let mock = MockFactory::new();
        mock.stage_delay(Duration::from_millis(100));
        let (manager, _) = setup(&mock, settings());

        // dropped while "set b" is staging, leaving "set a" in the transaction
        let dropped = tokio::time::timeout(
            Duration::from_millis(150),
            manager.apply("r1", cmds(&["set a", "set b"]), ApplyOptions::default()),
        )
        .await;
        assert!(dropped.is_err());

        mock.stage_delay(Duration::ZERO);
        let results = manager
            .apply("r1", cmds(&["set c"]), ApplyOptions::default())
            .await
            .unwrap();

        assert!(crate::models::all_applied(&results));
        let calls = mock.calls("r1");
        let discard = calls.iter().position(|c| *c == Call::Discard).unwrap();
        let staged_c = calls
            .iter()
            .position(|c| *c == Call::Stage("set c".to_string()))
            .unwrap();
        assert!(discard < staged_c);
        assert_eq!(mock.committed("r1"), cmds(&["set c"]));
        assert_eq!(mock.connects("r1"), 1);
    }

    #[tokio::test]
    async fn test_unreachable_instance() {
        let mock = MockFactory::new();
        mock.unreachable("r1");
        let (manager, instances) = setup(&mock, settings());

        let results = manager
            .apply("r1", cmds(&["set a", "set b"]), ApplyOptions::default())
            .await
            .unwrap();

        assert!(results
            .iter()
            .all(|r| matches!(r.skip_reason(), Some(SkipReason::ConnectionError(_)))));
        assert_eq!(manager.state("r1").unwrap(), SessionState::Closed);
        assert_eq!(instances.get("r1").unwrap().liveness, Liveness::Unreachable);
        assert_eq!(mock.calls("r1"), vec![Call::Connect]);

        assert!(matches!(
            manager.open("r1").await,
            Err(CoreError::ConnectionError { .. })
        ));
    }

    #[tokio::test]
    async fn test_transport_fault_mid_stage() {
        let mock = MockFactory::new();
        mock.break_on("set b");
        let (manager, instances) = setup(&mock, settings());

        let results = manager
            .apply("r1", cmds(&["set a", "set b", "set c"]), ApplyOptions::default())
            .await
            .unwrap();

        assert!(results
            .iter()
            .all(|r| matches!(r.skip_reason(), Some(SkipReason::ConnectionError(_)))));
        let calls = mock.calls("r1");
        assert!(calls.contains(&Call::Discard));
        assert!(calls.contains(&Call::Close));
        assert_eq!(manager.state("r1").unwrap(), SessionState::Closed);
        assert_eq!(instances.get("r1").unwrap().liveness, Liveness::Unreachable);
    }

    #[tokio::test]
    async fn test_stage_timeout() {
        let mock = MockFactory::new();
        mock.stage_delay(Duration::from_millis(300));
        let mut s = settings();
        s.stage_timeout = Duration::from_millis(50);
        let (manager, _) = setup(&mock, s);

        let results = manager
            .apply("r1", cmds(&["set a", "set b"]), ApplyOptions::default())
            .await
            .unwrap();

        assert!(results
            .iter()
            .all(|r| r.skip_reason() == Some(&SkipReason::TransportTimeout)));
        assert_eq!(manager.state("r1").unwrap(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_commit_timeout() {
        let mock = MockFactory::new();
        mock.commit_delay(Duration::from_millis(300));
        let mut s = settings();
        s.commit_timeout = Duration::from_millis(50);
        let (manager, instances) = setup(&mock, s);

        let results = manager
            .apply("r1", cmds(&["set a", "set b"]), ApplyOptions::default())
            .await
            .unwrap();

        assert!(results
            .iter()
            .all(|r| r.skip_reason() == Some(&SkipReason::TransportTimeout)));
        assert!(mock.committed("r1").is_empty());
        assert_eq!(manager.state("r1").unwrap(), SessionState::Closed);
        assert_eq!(instances.get("r1").unwrap().liveness, Liveness::Unreachable);
    }

    #[tokio::test]
    async fn test_connect_timeout_on_open() {
        let mock = MockFactory::new();
        mock.connect_delay(Duration::from_millis(300));
        let mut s = settings();
        s.connect_timeout = Duration::from_millis(50);
        let (manager, _) = setup(&mock, s);

        assert_eq!(
            manager.open("r1").await.unwrap_err(),
            CoreError::TransportTimeout {
                instance: "r1".into(),
                operation: "connect"
            }
        );
    }

    #[tokio::test]
    async fn test_concurrent_apply_rejected_when_busy() {
        let mock = MockFactory::new();
        mock.stage_delay(Duration::from_millis(200));
        let (manager, _) = setup(&mock, settings());
        let mut rx = manager.subscribe("r1").unwrap();

        let m = manager.clone();
        let first = tokio::spawn(async move {
            m.apply("r1", cmds(&["set a"]), ApplyOptions::default()).await
        });
        rx.wait_for(|s| *s == SessionState::Applying).await.unwrap();

        let second = manager
            .apply("r1", cmds(&["set b"]), ApplyOptions::default())
            .await;
        assert_eq!(second.unwrap_err(), CoreError::Busy("r1".into()));

        let first = first.await.unwrap().unwrap();
        assert!(first[0].is_applied());
        assert_eq!(mock.committed("r1"), cmds(&["set a"]));
    }

    #[tokio::test]
    async fn test_queue_policy_serializes_applies() {
        let mock = MockFactory::new();
        mock.stage_delay(Duration::from_millis(30));
        let mut s = settings();
        s.busy_policy = BusyPolicy::Queue;
        let (manager, _) = setup(&mock, s);

        let (a, b) = tokio::join!(
            manager.apply("r1", cmds(&["set a1", "set a2"]), ApplyOptions::default()),
            manager.apply("r1", cmds(&["set b1", "set b2"]), ApplyOptions::default()),
        );
        assert!(crate::models::all_applied(&a.unwrap()));
        assert!(crate::models::all_applied(&b.unwrap()));

        let calls: Vec<Call> = mock
            .calls("r1")
            .into_iter()
            .filter(|c| matches!(c, Call::Stage(_) | Call::Commit))
            .collect();
        let batch = |x: &str| {
            vec![
                Call::Stage(format!("set {}1", x)),
                Call::Stage(format!("set {}2", x)),
                Call::Commit,
            ]
        };
        let ab: Vec<Call> = batch("a").into_iter().chain(batch("b")).collect();
        let ba: Vec<Call> = batch("b").into_iter().chain(batch("a")).collect();
        assert!(calls == ab || calls == ba, "interleaved: {:?}", calls);
        assert_eq!(mock.connects("r1"), 1);
    }

    #[tokio::test]
    async fn test_distinct_instances_run_in_parallel() {
        let mock = MockFactory::new();
        mock.stage_delay(Duration::from_millis(100));
        let (manager, _) = setup(&mock, settings());

        let (a, b) = tokio::join!(
            manager.apply("r1", cmds(&["set a"]), ApplyOptions::default()),
            manager.apply("r2", cmds(&["set b"]), ApplyOptions::default()),
        );
        assert!(a.unwrap()[0].is_applied());
        assert!(b.unwrap()[0].is_applied());
        assert_eq!(mock.max_concurrent_stages(), 2);
    }

    #[tokio::test]
    async fn test_close_preempts_in_flight_apply() {
        let mock = MockFactory::new();
        mock.stage_delay(Duration::from_millis(500));
        let (manager, _) = setup(&mock, settings());
        let mut rx = manager.subscribe("r1").unwrap();

        let m = manager.clone();
        let task = tokio::spawn(async move {
            m.apply("r1", cmds(&["set a", "set b"]), ApplyOptions::default())
                .await
        });
        rx.wait_for(|s| *s == SessionState::Applying).await.unwrap();

        manager.close("r1").await.unwrap();
        let results = task.await.unwrap().unwrap();

        assert!(results
            .iter()
            .all(|r| r.skip_reason() == Some(&SkipReason::SessionClosed)));
        assert_eq!(manager.state("r1").unwrap(), SessionState::Closed);
        assert!(mock.calls("r1").contains(&Call::Close));
        assert!(mock.committed("r1").is_empty());
    }

    #[tokio::test]
    async fn test_caller_cancel_closes_session() {
        let mock = MockFactory::new();
        mock.stage_delay(Duration::from_millis(500));
        let (manager, _) = setup(&mock, settings());
        let mut rx = manager.subscribe("r1").unwrap();

        let cancel = CancellationToken::new();
        let options = ApplyOptions {
            mode: ApplyMode::Atomic,
            cancel: Some(cancel.clone()),
        };
        let m = manager.clone();
        let task =
            tokio::spawn(async move { m.apply("r1", cmds(&["set a", "set b"]), options).await });
        rx.wait_for(|s| *s == SessionState::Applying).await.unwrap();

        cancel.cancel();
        let results = task.await.unwrap().unwrap();

        assert!(results
            .iter()
            .all(|r| r.skip_reason() == Some(&SkipReason::Cancelled)));
        assert_eq!(manager.state("r1").unwrap(), SessionState::Closed);
        assert!(mock.calls("r1").contains(&Call::Close));
    }

    #[tokio::test]
    async fn test_abandoned_close_rearms_slot() {
        let mock = MockFactory::new();
        let (manager, _) = setup(&mock, settings());

        let held = manager.slot("r1").session.clone().lock_owned().await;
        let waited = tokio::time::timeout(Duration::from_millis(50), manager.close("r1")).await;
        assert!(waited.is_err());
        drop(held);

        let results = manager
            .apply("r1", cmds(&["set a"]), ApplyOptions::default())
            .await
            .unwrap();
        assert!(results[0].is_applied());
    }

    #[tokio::test]
    async fn test_closed_session_reconnects() {
        let mock = MockFactory::new();
        let (manager, _) = setup(&mock, settings());

        manager
            .apply("r1", cmds(&["set a"]), ApplyOptions::default())
            .await
            .unwrap();
        manager.close("r1").await.unwrap();
        assert_eq!(manager.state("r1").unwrap(), SessionState::Closed);

        let results = manager
            .apply("r1", cmds(&["set b"]), ApplyOptions::default())
            .await
            .unwrap();
        assert!(results[0].is_applied());
        assert_eq!(mock.connects("r1"), 2);
        assert_eq!(manager.state("r1").unwrap(), SessionState::Ready);
    }

    #[tokio::test]
    async fn test_detected_version_written_back() {
        let mock = MockFactory::new();
        mock.report_version("1.5-rolling-202405010019");
        let (manager, instances) = setup(&mock, settings());

        manager.open("r1").await.unwrap();
        assert_eq!(instances.get("r1").unwrap().version, "1.5");
    }

    #[tokio::test]
    async fn test_empty_and_unknown() {
        let mock = MockFactory::new();
        let (manager, _) = setup(&mock, settings());

        let results = manager
            .apply("r1", Vec::new(), ApplyOptions::default())
            .await
            .unwrap();
        assert!(results.is_empty());
        assert_eq!(mock.total_calls(), 0);
        assert_eq!(manager.state("r1").unwrap(), SessionState::Idle);

        assert_eq!(
            manager
                .apply("ghost", cmds(&["set a"]), ApplyOptions::default())
                .await
                .unwrap_err(),
            CoreError::UnknownInstance("ghost".into())
        );
        assert!(manager.close("ghost").await.is_err());
        assert!(manager.close("r2").await.is_ok());
    }

    #[tokio::test]
    async fn test_idle_reaper_closes_session() {
        let mock = MockFactory::new();
        let mut s = settings();
        s.idle_timeout = Duration::from_millis(100);
        let (manager, _) = setup(&mock, s);
        let shutdown = CancellationToken::new();
        let reaper = manager.spawn_idle_reaper(shutdown.clone()).unwrap();

        manager.open("r1").await.unwrap();
        let mut rx = manager.subscribe("r1").unwrap();
        tokio::time::timeout(
            Duration::from_secs(2),
            rx.wait_for(|s| *s == SessionState::Closed),
        )
        .await
        .unwrap()
        .unwrap();

        assert!(mock.calls("r1").contains(&Call::Close));
        shutdown.cancel();
        reaper.await.unwrap();
    }

    #[tokio::test]
    async fn test_reaper_disabled_with_zero_timeout() {
        let mock = MockFactory::new();
        let (manager, _) = setup(&mock, settings());
        assert!(manager
            .spawn_idle_reaper(CancellationToken::new())
            .is_none());
    }

    #[tokio::test]
    async fn test_close_all() {
        let mock = MockFactory::new();
        let (manager, _) = setup(&mock, settings());
        manager.open("r1").await.unwrap();
        manager.open("r2").await.unwrap();

        manager.close_all().await;
        assert_eq!(manager.state("r1").unwrap(), SessionState::Closed);
        assert_eq!(manager.state("r2").unwrap(), SessionState::Closed);
    }
}
