//! Workflow manager.
//!
//! The manager owns the discovered devices and runs one sub-workflow at a
//! time on a background task:
//!
//! ```text
//! Undefined ─launch─► DeviceDiscovery ─► Manage ◄──────────────┐
//!                                          │  request          │
//!                                          ├──► SubWorkflowIdle ┤
//!                                          │  device lost      │
//!                                          └──► DeviceRecovery ─┘
//! stop ─► Shutdown
//! ```
//!
//! Callers hand requests to [`WorkflowManager::set_workflow`], which queues
//! the request with a reply channel and waits for its sub-workflow to
//! complete. Requests run in arrival order. A caller that goes away only
//! drops its reply; nothing is kept for it.
//!
//! Candidates that fail discovery are probed again on every health tick and
//! join the device list once they answer.
//!
//! # Examples
//!
//! ```
//! use dal_core::{DalRequest, DeviceAction, config::DalConfig};
//! use dal_hardware::SimulatorDevice;
//! use dal_state::WorkflowManager;
//!
//! #[tokio::main]
//! async fn main() -> dal_state::Result<()> {
//!     let (simulator, _handle) = SimulatorDevice::new();
//!     let manager = WorkflowManager::builder(DalConfig::default())
//!         .with_device(simulator)
//!         .build();
//!
//!     manager.launch_workflow()?;
//!     let envelope = manager
//!         .set_workflow(DalRequest::for_action(DeviceAction::GetStatus))
//!         .await?;
//!     assert!(!envelope.request.has_errors());
//!
//!     manager.stop_workflow().await;
//!     Ok(())
//! }
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use dal_core::config::DalConfig;
use dal_core::constants::REQUEST_QUEUE_CAPACITY;
use dal_core::{DalRequest, DeviceInformation, StateEnvelope};
use dal_hardware::{AnyCardDevice, CardDevice, EventReceiver};

use crate::broker::TimeoutBroker;
use crate::controller::{SubWorkflowController, WorkflowContext};
use crate::error::Result;
use crate::store::{StateSnapshot, StateStore};

/// Lifecycle state of the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ManagerState {
    /// Not launched yet.
    #[default]
    Undefined,
    DeviceDiscovery,
    /// Waiting for requests.
    Manage,
    /// A sub-workflow is running.
    SubWorkflowIdle,
    /// Re-probing a device that dropped off.
    DeviceRecovery,
    Shutdown,
}

impl ManagerState {
    pub fn accepts_requests(&self) -> bool {
        !matches!(self, Self::Undefined | Self::Shutdown)
    }
}

impl fmt::Display for ManagerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One queued request.
#[derive(Debug)]
struct Job {
    ticket: u64,
    request: DalRequest,
    cancellation: CancellationToken,
    reply: oneshot::Sender<StateEnvelope>,
}

/// Builder for [`WorkflowManager`].
#[derive(Debug)]
pub struct WorkflowManagerBuilder {
    config: DalConfig,
    candidates: Vec<AnyCardDevice>,
    events: Option<EventReceiver>,
}

impl WorkflowManagerBuilder {
    /// Add a device to probe during discovery.
    pub fn with_device(mut self, device: impl Into<AnyCardDevice>) -> Self {
        self.candidates.push(device.into());
        self
    }

    /// Receiver of the event channel the devices publish on.
    pub fn with_events(mut self, events: EventReceiver) -> Self {
        self.events = Some(events);
        self
    }

    pub fn build(self) -> WorkflowManager {
        let (state, _) = watch::channel(ManagerState::Undefined);
        WorkflowManager {
            config: self.config,
            pending: Mutex::new(Some((self.candidates, self.events))),
            state: Arc::new(state),
            jobs: Mutex::new(None),
            next_ticket: AtomicU64::new(1),
            devices: Arc::new(RwLock::new(Vec::new())),
            store: StateStore::new(),
            shutdown: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }
}

type Candidates = (Vec<AnyCardDevice>, Option<EventReceiver>);

/// Runs sub-workflows against the discovered devices, one at a time.
#[derive(Debug)]
pub struct WorkflowManager {
    config: DalConfig,
    pending: Mutex<Option<Candidates>>,
    state: Arc<watch::Sender<ManagerState>>,
    jobs: Mutex<Option<mpsc::Sender<Job>>>,
    next_ticket: AtomicU64,
    devices: Arc<RwLock<Vec<Arc<AnyCardDevice>>>>,
    store: StateStore,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WorkflowManager {
    pub fn builder(config: DalConfig) -> WorkflowManagerBuilder {
        WorkflowManagerBuilder {
            config,
            candidates: Vec::new(),
            events: None,
        }
    }

    pub fn state(&self) -> ManagerState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ManagerState> {
        self.state.subscribe()
    }

    /// Snapshots saved by the running sub-workflow.
    pub fn snapshots(&self) -> watch::Receiver<StateSnapshot> {
        self.store.subscribe()
    }

    /// Identity of the devices found so far, by sort order.
    pub fn devices(&self) -> Vec<DeviceInformation> {
        self.devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|device| device.information())
            .collect()
    }

    /// Start discovery and the request loop on a background task.
    ///
    /// Calling it again while running has no effect.
    ///
    /// # Errors
    ///
    /// Returns `Error::ManagerStopped` once the manager has been stopped.
    pub fn launch_workflow(&self) -> Result<()> {
        if self.state() == ManagerState::Shutdown {
            return Err(dal_core::Error::ManagerStopped.into());
        }
        let Some((candidates, events)) = lock(&self.pending).take() else {
            warn!("Workflow manager already launched");
            return Ok(());
        };

        let (job_tx, job_rx) = mpsc::channel(REQUEST_QUEUE_CAPACITY);
        *lock(&self.jobs) = Some(job_tx);
        self.state.send_replace(ManagerState::DeviceDiscovery);

        let worker = Worker {
            config: self.config.clone(),
            absent: candidates,
            found: Vec::new(),
            events,
            jobs: job_rx,
            state: Arc::clone(&self.state),
            devices: Arc::clone(&self.devices),
            store: self.store.clone(),
            shutdown: self.shutdown.clone(),
        };
        *lock(&self.task) = Some(tokio::spawn(worker.run()));
        info!("Workflow manager launched");
        Ok(())
    }

    /// Run `request` and return its final envelope.
    ///
    /// # Errors
    ///
    /// Returns `Error::ManagerStopped` if the manager is not running or stops
    /// before the request completes.
    pub async fn set_workflow(&self, request: DalRequest) -> Result<StateEnvelope> {
        self.set_workflow_with_token(request, CancellationToken::new())
            .await
    }

    /// Like [`set_workflow`](Self::set_workflow); cancelling `cancellation`
    /// cancels the device call in progress.
    pub async fn set_workflow_with_token(
        &self,
        request: DalRequest,
        cancellation: CancellationToken,
    ) -> Result<StateEnvelope> {
        if !self.state().accepts_requests() {
            return Err(dal_core::Error::ManagerStopped.into());
        }
        let sender = lock(&self.jobs)
            .clone()
            .ok_or(dal_core::Error::ManagerStopped)?;

        let ticket = self.next_ticket.fetch_add(1, Ordering::SeqCst);
        debug!(ticket, "Queueing request");
        let (reply, envelope) = oneshot::channel();
        sender
            .send(Job {
                ticket,
                request,
                cancellation,
                reply,
            })
            .await
            .map_err(|_| dal_core::Error::ManagerStopped)?;

        // The worker drops queued jobs on stop, which closes the reply.
        envelope
            .await
            .map_err(|_| dal_core::Error::ManagerStopped.into())
    }

    /// Stop the request loop and wait for it to exit.
    ///
    /// The sub-workflow in progress, if any, is cancelled and still runs to
    /// `RequestComplete`. Queued requests are dropped.
    pub async fn stop_workflow(&self) {
        info!("Stopping workflow manager");
        self.shutdown.cancel();
        lock(&self.jobs).take();
        lock(&self.pending).take();
        let task = lock(&self.task).take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            error!(error = %e, "Workflow manager task failed");
        }
        self.state.send_replace(ManagerState::Shutdown);
    }
}

/// Background side of the manager.
struct Worker {
    config: DalConfig,
    /// Candidates that have not answered a probe yet.
    absent: Vec<AnyCardDevice>,
    found: Vec<Arc<AnyCardDevice>>,
    events: Option<EventReceiver>,
    jobs: mpsc::Receiver<Job>,
    state: Arc<watch::Sender<ManagerState>>,
    devices: Arc<RwLock<Vec<Arc<AnyCardDevice>>>>,
    store: StateStore,
    shutdown: CancellationToken,
}

impl Worker {
    fn set_state(&self, state: ManagerState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "Manager state changed");
        }
    }

    async fn run(mut self) {
        self.discover().await;
        let context = WorkflowContext::new(
            self.found.clone(),
            self.config.timeouts.clone(),
            TimeoutBroker::new(self.config.manager.drain_grace()),
            self.store.clone(),
        );
        let mut controller = SubWorkflowController::new(context).with_events(self.events.take());

        let period = self.config.manager.health_check_interval();
        let mut health = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        self.set_state(ManagerState::Manage);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                job = self.jobs.recv() => match job {
                    Some(job) => self.handle(&mut controller, job).await,
                    None => break,
                },
                _ = health.tick() => self.check_health(&mut controller).await,
            }
        }

        self.set_state(ManagerState::Shutdown);
        info!("Workflow manager stopped");
    }

    /// Probe every absent candidate; the ones that answer join `found`.
    ///
    /// Returns whether the device list changed.
    async fn discover(&mut self) -> bool {
        let timeout = self.config.timeouts.device_result();
        let mut still_absent = Vec::new();
        let mut joined = false;
        for device in std::mem::take(&mut self.absent) {
            match tokio::time::timeout(timeout, device.probe()).await {
                Ok(Ok(info)) => {
                    info!(
                        kind = %device.kind(),
                        model = %info.model,
                        serial = %info.serial_number,
                        "Device discovered"
                    );
                    self.found.push(Arc::new(device));
                    joined = true;
                    continue;
                }
                Ok(Err(e)) => warn!(kind = %device.kind(), error = %e, "Device probe failed"),
                Err(_) => warn!(kind = %device.kind(), "Device probe timed out"),
            }
            still_absent.push(device);
        }
        self.absent = still_absent;
        if !joined {
            if self.found.is_empty() {
                warn!("No devices discovered");
            }
            return false;
        }

        self.found.sort_by_key(|device| device.sort_order());
        *self.devices.write().unwrap_or_else(PoisonError::into_inner) = self.found.clone();
        true
    }

    async fn handle(&self, controller: &mut SubWorkflowController, mut job: Job) {
        self.set_state(ManagerState::SubWorkflowIdle);
        debug!(ticket = job.ticket, "Running request");

        // Stopping the manager cancels the request too.
        let token = self.shutdown.child_token();
        let forward = {
            let caller = job.cancellation.clone();
            let token = token.clone();
            tokio::spawn(async move {
                caller.cancelled().await;
                token.cancel();
            })
        };
        // A caller that goes away cancels its request like a token would.
        let run = controller.run(job.request, token.clone());
        tokio::pin!(run);
        let envelope = tokio::select! {
            envelope = &mut run => envelope,
            _ = job.reply.closed() => {
                debug!(ticket = job.ticket, "Caller gone, cancelling request");
                token.cancel();
                run.await
            }
        };
        forward.abort();

        if !self.shutdown.is_cancelled() {
            self.set_state(ManagerState::Manage);
        }
        if job.reply.send(envelope).is_err() {
            debug!(ticket = job.ticket, "Caller gone, dropping result");
        }
    }

    /// Re-probe devices that dropped off and retry absent candidates.
    async fn check_health(&mut self, controller: &mut SubWorkflowController) {
        let timeout = self.config.timeouts.device_result();
        for device in self.found.iter().filter(|device| !device.is_connected()) {
            let info = device.information();
            self.set_state(ManagerState::DeviceRecovery);
            warn!(serial = %info.serial_number, "Device disconnected, probing");
            match tokio::time::timeout(timeout, device.probe()).await {
                Ok(Ok(_)) => info!(serial = %info.serial_number, "Device back online"),
                Ok(Err(e)) => warn!(serial = %info.serial_number, error = %e, "Device still offline"),
                Err(_) => warn!(serial = %info.serial_number, "Device probe timed out"),
            }
        }

        if !self.absent.is_empty() {
            self.set_state(ManagerState::DeviceDiscovery);
            if self.discover().await {
                controller.context_mut().set_devices(self.found.clone());
            }
        }
        self.set_state(ManagerState::Manage);
    }
}
