//! Multi-device diagnostic session.
//!
//! A session owns one scan task and one blocking worker per device under test.
//! The scan task discovers ports, runs the handshake for new ones and detaches
//! vanished ones. Workers own their [`DeviceContext`] while testing and hand it
//! back through their `JoinHandle`, so device state is never shared.
//!
//! Events go out on a bounded broadcast channel; a slow consumer loses the
//! oldest events rather than stalling producers.

use std::collections::{HashMap, HashSet};
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::device::{DeviceContext, DeviceSnapshot, PollSettings, RunOutcome};
use crate::errors::{MspError, Result};
use crate::ports::{PortOpener, PortSource};
use crate::report::ReportSink;

pub const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub settings: PollSettings,
    /// Start testing as soon as a device attaches. Otherwise devices wait for [`Session::retest`].
    pub auto_flow: bool,
    pub scan_interval: Duration,
    pub event_capacity: usize,
}

impl SessionConfig {
    pub fn new(settings: PollSettings) -> Self {
        Self {
            settings,
            auto_flow: true,
            scan_interval: DEFAULT_SCAN_INTERVAL,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    Snapshot {
        uid: String,
        snapshot: Box<DeviceSnapshot>,
    },
    ProbeFailed {
        port: String,
        reason: String,
    },
    Removed {
        port: String,
        uid: String,
    },
}

/// Consumer side of the session event queue.
pub struct EventReceiver {
    rx: broadcast::Receiver<SessionEvent>,
}

impl EventReceiver {
    /// Next event, skipping over anything dropped while lagging. `None` once the session is gone.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(n)) => debug!("event consumer lagged; {} events dropped", n),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<SessionEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

// ============================================================================
// Device slots
// ============================================================================

enum DeviceTask {
    Idle(Box<DeviceContext>),
    Running {
        cancel: Arc<AtomicBool>,
        handle: JoinHandle<DeviceContext>,
    },
    /// Transient while a lifecycle operation holds the context.
    Vacant,
}

struct DeviceSlot {
    uid: String,
    task: DeviceTask,
}

impl DeviceTask {
    /// Cancel any running worker, wait for it, and return the context.
    async fn settle(self, port: &str) -> Option<DeviceContext> {
        match self {
            DeviceTask::Idle(ctx) => Some(*ctx),
            DeviceTask::Running { cancel, handle } => {
                cancel.store(true, Ordering::Release);
                match handle.await {
                    Ok(ctx) => Some(ctx),
                    Err(e) => {
                        error!("{}: device worker died: {}", port, e);
                        None
                    }
                }
            }
            DeviceTask::Vacant => None,
        }
    }
}

// ============================================================================
// Session
// ============================================================================

struct Inner {
    config: SessionConfig,
    source: Box<dyn PortSource>,
    opener: Arc<dyn PortOpener>,
    sink: Option<Arc<dyn ReportSink>>,
    events: broadcast::Sender<SessionEvent>,
    first_rx: Mutex<Option<broadcast::Receiver<SessionEvent>>>,
    devices: Mutex<HashMap<String, DeviceSlot>>,
    rejected: Mutex<HashSet<String>>,
    latest: Mutex<HashMap<String, DeviceSnapshot>>,
    reports: Mutex<HashMap<String, DeviceSnapshot>>,
    lifecycle: tokio::sync::Mutex<()>,
    stopped: AtomicBool,
    wake: Notify,
}

pub struct Session {
    inner: Arc<Inner>,
    scan: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Start scanning. Must be called from within a tokio runtime.
    pub fn start(
        config: SessionConfig,
        source: Box<dyn PortSource>,
        opener: Arc<dyn PortOpener>,
        sink: Option<Arc<dyn ReportSink>>,
    ) -> Self {
        let (events, first_rx) = broadcast::channel(config.event_capacity.max(1));
        let inner = Arc::new(Inner {
            config,
            source,
            opener,
            sink,
            events,
            first_rx: Mutex::new(Some(first_rx)),
            devices: Mutex::new(HashMap::new()),
            rejected: Mutex::new(HashSet::new()),
            latest: Mutex::new(HashMap::new()),
            reports: Mutex::new(HashMap::new()),
            lifecycle: tokio::sync::Mutex::new(()),
            stopped: AtomicBool::new(false),
            wake: Notify::new(),
        });
        info!(
            "session started (profile {}, mode {})",
            inner.config.settings.profile.name,
            inner.config.settings.mode.as_str()
        );
        let scan = tokio::spawn(scan_loop(Arc::clone(&inner)));
        Self {
            inner,
            scan: Mutex::new(Some(scan)),
        }
    }

    /// Subscribe to events. The first subscriber sees everything since start.
    pub fn subscribe(&self) -> EventReceiver {
        let rx = self
            .inner
            .first_rx
            .lock()
            .take()
            .unwrap_or_else(|| self.inner.events.subscribe());
        EventReceiver { rx }
    }

    /// Latest snapshot of every attached device.
    pub fn snapshots(&self) -> Vec<DeviceSnapshot> {
        let mut all: Vec<_> = self.inner.latest.lock().values().cloned().collect();
        all.sort_by(|a, b| a.port.cmp(&b.port));
        all
    }

    /// Reports stored by finished test runs.
    pub fn reports(&self) -> Vec<DeviceSnapshot> {
        let mut all: Vec<_> = self.inner.reports.lock().values().cloned().collect();
        all.sort_by(|a, b| a.uid.cmp(&b.uid));
        all
    }

    /// Cancel and await any in-flight run for `uid`, then start a fresh one.
    pub async fn retest(&self, uid: &str) -> Result<()> {
        let _guard = self.inner.lifecycle.lock().await;
        let (port, task) = {
            let mut devices = self.inner.devices.lock();
            let (port, slot) = devices
                .iter_mut()
                .find(|(_, slot)| slot.uid == uid)
                .ok_or_else(|| MspError::UnknownDevice(uid.to_string()))?;
            (port.clone(), mem::replace(&mut slot.task, DeviceTask::Vacant))
        };
        let Some(ctx) = task.settle(&port).await else {
            self.inner.devices.lock().remove(&port);
            return Err(MspError::UnknownDevice(uid.to_string()));
        };
        info!("{}: retest requested", port);
        let task = self.inner.spawn_run(ctx);
        if let Some(slot) = self.inner.devices.lock().get_mut(&port) {
            slot.task = task;
        }
        Ok(())
    }

    /// Stop scanning, cancel every worker and wait for all of them, then write the summary.
    pub async fn stop(&self) -> Vec<DeviceSnapshot> {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return self.reports();
        }
        self.inner.wake.notify_one();
        let scan = self.scan.lock().take();
        if let Some(scan) = scan {
            if let Err(e) = scan.await {
                error!("scan task failed: {}", e);
            }
        }

        let _guard = self.inner.lifecycle.lock().await;
        let slots: Vec<(String, DeviceSlot)> = self.inner.devices.lock().drain().collect();
        join_all(slots.into_iter().map(|(port, slot)| async move {
            if let Some(mut ctx) = slot.task.settle(&port).await {
                ctx.close();
            }
        }))
        .await;

        let reports = self.reports();
        if let Some(sink) = &self.inner.sink {
            if let Err(e) = sink.write_summary(&reports) {
                warn!("writing summary failed: {:#}", e);
            }
        }
        info!("session stopped ({} reports)", reports.len());
        reports
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.inner.stopped.store(true, Ordering::Release);
        self.inner.wake.notify_one();
        for slot in self.inner.devices.lock().values() {
            if let DeviceTask::Running { cancel, .. } = &slot.task {
                cancel.store(true, Ordering::Release);
            }
        }
    }
}

async fn scan_loop(inner: Arc<Inner>) {
    while !inner.stopped.load(Ordering::Acquire) {
        {
            let _guard = inner.lifecycle.lock().await;
            if inner.stopped.load(Ordering::Acquire) {
                break;
            }
            inner.scan_once().await;
        }
        tokio::select! {
            _ = inner.wake.notified() => {}
            _ = tokio::time::sleep(inner.config.scan_interval) => {}
        }
    }
    debug!("scan loop exited");
}

impl Inner {
    fn emit(&self, event: SessionEvent) {
        // no receivers is fine; the event is simply dropped
        let _ = self.events.send(event);
    }

    fn publish(&self, snapshot: DeviceSnapshot) {
        self.latest
            .lock()
            .insert(snapshot.uid.clone(), snapshot.clone());
        self.emit(SessionEvent::Snapshot {
            uid: snapshot.uid.clone(),
            snapshot: Box::new(snapshot),
        });
    }

    fn store_report(&self, snapshot: DeviceSnapshot) {
        if let Some(sink) = &self.sink {
            if let Err(e) = sink.store(&snapshot) {
                warn!("{}: storing report failed: {:#}", snapshot.uid, e);
            }
        }
        self.reports.lock().insert(snapshot.uid.clone(), snapshot);
    }

    fn spawn_run(self: &Arc<Self>, mut ctx: DeviceContext) -> DeviceTask {
        let cancel = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancel);
        let inner = Arc::clone(self);
        let handle = tokio::task::spawn_blocking(move || {
            let outcome = ctx.run_test(&flag, |snapshot| inner.publish(snapshot));
            if outcome != RunOutcome::Cancelled {
                inner.store_report(ctx.snapshot());
            }
            ctx
        });
        DeviceTask::Running { cancel, handle }
    }

    async fn scan_once(self: &Arc<Self>) {
        let listed = match self.source.list() {
            Ok(listed) => listed,
            Err(e) => {
                warn!("port enumeration failed: {}", e);
                return;
            }
        };
        let visible: HashSet<&str> = listed.iter().map(|c| c.name.as_str()).collect();

        self.reap_finished().await;

        let gone: Vec<(String, DeviceSlot)> = {
            let mut devices = self.devices.lock();
            let ports: Vec<String> = devices
                .keys()
                .filter(|p| !visible.contains(p.as_str()))
                .cloned()
                .collect();
            ports
                .into_iter()
                .filter_map(|p| devices.remove(&p).map(|slot| (p, slot)))
                .collect()
        };
        for (port, slot) in gone {
            self.detach(port, slot).await;
        }
        self.rejected.lock().retain(|p| visible.contains(p.as_str()));

        let fresh: Vec<String> = {
            let devices = self.devices.lock();
            let rejected = self.rejected.lock();
            listed
                .iter()
                .map(|c| &c.name)
                .filter(|p| !devices.contains_key(*p) && !rejected.contains(*p))
                .cloned()
                .collect()
        };
        if fresh.is_empty() {
            return;
        }

        let attempts = fresh.into_iter().map(|port| {
            let opener = Arc::clone(&self.opener);
            let settings = self.config.settings.clone();
            async move {
                let name = port.clone();
                let result = tokio::task::spawn_blocking(move || -> Result<DeviceContext> {
                    let link = opener.open(&name)?;
                    Ok(DeviceContext::attach(&name, link, settings)?.with_opener(opener))
                })
                .await;
                (port, result)
            }
        });
        for (port, result) in join_all(attempts).await {
            let reason = match result {
                Ok(Ok(ctx)) => {
                    self.install(port, ctx);
                    continue;
                }
                Ok(Err(e)) => e.reason(),
                Err(e) => e.to_string(),
            };
            warn!("{}: probe failed: {}", port, reason);
            self.rejected.lock().insert(port.clone());
            self.emit(SessionEvent::ProbeFailed { port, reason });
        }
    }

    fn install(self: &Arc<Self>, port: String, ctx: DeviceContext) {
        let uid = ctx.uid().to_string();
        self.publish(ctx.snapshot());
        let task = if self.config.auto_flow {
            self.spawn_run(ctx)
        } else {
            DeviceTask::Idle(Box::new(ctx))
        };
        self.devices.lock().insert(port, DeviceSlot { uid, task });
    }

    /// Collect contexts from workers that finished on their own.
    async fn reap_finished(&self) {
        let finished: Vec<(String, DeviceTask)> = {
            let mut devices = self.devices.lock();
            devices
                .iter_mut()
                .filter(|(_, slot)| {
                    matches!(&slot.task, DeviceTask::Running { handle, .. } if handle.is_finished())
                })
                .map(|(port, slot)| (port.clone(), mem::replace(&mut slot.task, DeviceTask::Vacant)))
                .collect()
        };
        for (port, task) in finished {
            match task.settle(&port).await {
                Some(ctx) => {
                    if let Some(slot) = self.devices.lock().get_mut(&port) {
                        slot.task = DeviceTask::Idle(Box::new(ctx));
                    }
                }
                None => {
                    self.devices.lock().remove(&port);
                }
            }
        }
    }

    async fn detach(&self, port: String, slot: DeviceSlot) {
        if let Some(mut ctx) = slot.task.settle(&port).await {
            ctx.close();
        }
        self.latest.lock().remove(&slot.uid);
        info!("{}: detached {}", port, slot.uid);
        self.emit(SessionEvent::Removed {
            port,
            uid: slot.uid,
        });
    }
}
