//! Servo controller: one serial link, up to 64 actuator channels, one dispatcher task.
//!
//! Every request on the controller goes through a single FIFO queue. The dispatcher takes one
//! `(actuator, action)` pair at a time and runs the protocol state machine for it until it is
//! retired:
//!
//! ```text
//! Free -> Configuring -> Confirming -> Going -> AwaitingMotion -> AwaitingFinish -> Free
//!              ^              |          ^            |               |  ^
//!              +-- resend ----+          +-- re-run --+               +--+ poll
//!
//! any state -> Aborting (stop until Stopped) -> Free
//! ```
//!
//! Each tick sends at most one exchange and then waits for its response or the response
//! timeout. A lost response is treated as a lost command and the step is repeated. Only the
//! dispatcher task sends on the link and only it applies reports, always to the actuator it is
//! servicing.

use crate::action::ActuatorAction;
use crate::actuator::{Actuator, ActuatorId, Completion, Outcome, WorkItem};
use crate::command::Exchange;
use crate::error::{ServoError, ServoResult};
use crate::transport::{Link, Transport};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;

/// Number of channels one controller can address.
pub const CHANNEL_COUNT: usize = 64;

/// Unanswered stop exchanges sent before a shutting-down dispatcher gives up on a channel.
const SHUTDOWN_STOP_ATTEMPTS: u32 = 5;

/// Protocol state of a controller's dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolState {
    /// Idle; the next queued request may start.
    Free,
    /// Sending the action's configuration.
    Configuring,
    /// Polling until a report echoes the configuration.
    Confirming,
    /// Sending the run command.
    Going,
    /// Polling until pulses are seen or a completion signal fires.
    AwaitingMotion,
    /// Polling until pulses drop.
    AwaitingFinish,
    /// Sending stop until a report shows the pulses off.
    Aborting,
}

/// Dispatcher tuning.
#[derive(Debug, Clone)]
pub struct DispatchOptions {
    /// How long to wait for the response to one exchange.
    pub response_timeout: Duration,
    /// Configuration exchanges to try before giving up; `None` retries forever.
    pub max_confirm_attempts: Option<u32>,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_millis(200),
            max_confirm_attempts: Some(25),
        }
    }
}

struct Signals {
    abort: AtomicBool,
    shutdown: AtomicBool,
    wake: Notify,
    state: watch::Sender<ProtocolState>,
}

impl Signals {
    fn take_abort(&self) -> bool {
        self.abort.swap(false, Ordering::AcqRel)
    }
}

struct ControllerInner {
    name: String,
    channels: Mutex<Vec<Option<(ActuatorId, String)>>>,
    work_tx: mpsc::UnboundedSender<WorkItem>,
    signals: Arc<Signals>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a running servo controller. Cheap to clone.
#[derive(Clone)]
pub struct ServoController {
    inner: Arc<ControllerInner>,
}

impl std::fmt::Debug for ServoController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServoController")
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .finish()
    }
}

impl ServoController {
    /// Start the dispatcher task for `link`. Must be called within a Tokio runtime.
    pub fn spawn(name: impl Into<String>, link: Link, options: DispatchOptions) -> Self {
        let name = name.into();
        let (work_tx, work_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ProtocolState::Free);
        let signals = Arc::new(Signals {
            abort: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            wake: Notify::new(),
            state,
        });

        let dispatcher = Dispatcher {
            name: name.clone(),
            transport: link.transport,
            responses: link.responses,
            work_rx,
            signals: Arc::clone(&signals),
            options,
        };
        tracing::info!(controller = %name, "Starting servo dispatcher");
        let task = tokio::spawn(dispatcher.run());

        Self {
            inner: Arc::new(ControllerInner {
                name,
                channels: Mutex::new(vec![None; CHANNEL_COUNT]),
                work_tx,
                signals,
                task: Mutex::new(Some(task)),
            }),
        }
    }

    /// Name the controller was spawned with.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub(crate) fn same_as(&self, other: &ServoController) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Bind `actuator` to its channel on this controller.
    ///
    /// A channel that already belongs to a different actuator is a configuration error: it is
    /// logged and refused, and the existing binding stays in place.
    pub fn register(&self, actuator: &Arc<Actuator>) -> ServoResult<()> {
        let channel = actuator.channel();
        if usize::from(channel) >= CHANNEL_COUNT {
            tracing::error!(
                controller = %self.inner.name,
                actuator = %actuator.name(),
                channel,
                "Actuator channel out of range"
            );
            return Err(ServoError::ChannelOutOfRange(channel));
        }

        let mut channels = self.inner.channels.lock();
        let slot = &mut channels[usize::from(channel)];
        if let Some((existing_id, existing_name)) = slot.as_ref() {
            if *existing_id == actuator.id() {
                return Ok(());
            }
            tracing::error!(
                controller = %self.inner.name,
                channel,
                existing = %existing_name,
                requested = %actuator.name(),
                "Channel conflict: registration refused"
            );
            return Err(ServoError::ChannelConflict {
                controller: self.inner.name.clone(),
                channel,
                existing: existing_name.clone(),
                requested: actuator.name().to_string(),
            });
        }

        actuator.bind(self)?;
        *slot = Some((actuator.id(), actuator.name().to_string()));
        tracing::info!(
            controller = %self.inner.name,
            actuator = %actuator.name(),
            channel,
            "Registered actuator"
        );
        Ok(())
    }

    /// Actuator bound to `channel`, if any.
    pub fn channel_owner(&self, channel: u8) -> Option<ActuatorId> {
        self.inner
            .channels
            .lock()
            .get(usize::from(channel))
            .and_then(|slot| slot.as_ref().map(|(id, _)| *id))
    }

    pub(crate) fn enqueue(&self, item: WorkItem) -> ServoResult<()> {
        if self.inner.signals.shutdown.load(Ordering::Acquire) {
            return Err(ServoError::ControllerStopped(self.inner.name.clone()));
        }
        self.inner
            .work_tx
            .send(item)
            .map_err(|_| ServoError::ControllerStopped(self.inner.name.clone()))
    }

    /// Abort the operation in flight and drain every queued request.
    pub fn abort(&self) {
        self.abort_requested_by("controller");
    }

    pub(crate) fn abort_requested_by(&self, who: &str) {
        tracing::info!(controller = %self.inner.name, requested_by = %who, "Abort requested");
        self.inner.signals.abort.store(true, Ordering::Release);
        self.inner.signals.wake.notify_one();
    }

    /// Current protocol state of the dispatcher.
    pub fn state(&self) -> ProtocolState {
        *self.inner.signals.state.borrow()
    }

    /// Receiver notified on every protocol state transition.
    pub fn subscribe_state(&self) -> watch::Receiver<ProtocolState> {
        self.inner.signals.state.subscribe()
    }

    /// Stop the dispatcher.
    ///
    /// An operation in flight is aborted; when the device never confirms the stop the
    /// dispatcher gives up after a few attempts. Queued requests are retired as skipped.
    pub async fn shutdown(&self) {
        self.inner.signals.shutdown.store(true, Ordering::Release);
        self.inner.signals.wake.notify_one();
        let task = self.inner.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!(controller = %self.inner.name, error = %e, "Dispatcher task ended abnormally");
            }
        }
    }
}

// =============================================================================
// Dispatcher
// =============================================================================

struct Dispatcher {
    name: String,
    transport: Box<dyn Transport>,
    responses: mpsc::UnboundedReceiver<String>,
    work_rx: mpsc::UnboundedReceiver<WorkItem>,
    signals: Arc<Signals>,
    options: DispatchOptions,
}

impl Dispatcher {
    async fn run(mut self) {
        loop {
            if self.shutting_down() {
                break;
            }

            let item = tokio::select! {
                biased;
                _ = self.signals.wake.notified() => {
                    if self.signals.take_abort() {
                        self.drain_queue();
                    }
                    continue;
                }
                item = self.work_rx.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
            };

            if self.signals.take_abort() {
                self.skip(item);
                self.drain_queue();
                continue;
            }
            self.service(item).await;
        }

        self.work_rx.close();
        self.drain_queue();
        tracing::info!(controller = %self.name, "Servo dispatcher stopped");
    }

    async fn service(&mut self, item: WorkItem) {
        let WorkItem {
            actuator,
            action,
            hook,
        } = item;

        actuator.activate(action.clone());
        self.set_state(ProtocolState::Configuring);

        let outcome = match action.as_ref() {
            // channel select only: nothing is sent
            None => Outcome::Succeeded,
            Some(action) => self.drive(&actuator, action).await,
        };

        let completion = Completion {
            outcome,
            action,
            telemetry: actuator.telemetry(),
        };
        if let Some(hook) = hook {
            hook(&completion);
        }
        // state reads Free before the pending count drops
        self.set_state(ProtocolState::Free);
        actuator.deactivate();

        tracing::info!(
            controller = %self.name,
            actuator = %actuator.name(),
            action = ?completion.action.as_ref().map(|a| &a.name),
            ?outcome,
            "Request retired"
        );
    }

    /// Run the protocol state machine for one configured action.
    async fn drive(&mut self, actuator: &Actuator, action: &ActuatorAction) -> Outcome {
        let channel = actuator.channel();
        let mut state = ProtocolState::Configuring;
        let mut confirm_attempts: u32 = 0;
        let mut stop_attempts: u32 = 0;

        loop {
            if state != ProtocolState::Aborting {
                let aborted = self.signals.take_abort();
                if aborted || self.shutting_down() {
                    tracing::warn!(
                        controller = %self.name,
                        actuator = %actuator.name(),
                        interrupted = ?state,
                        shutdown = !aborted,
                        "Aborting operation in flight"
                    );
                    self.drain_queue();
                    state = ProtocolState::Aborting;
                }
            }
            self.set_state(state);

            state = match state {
                ProtocolState::Free | ProtocolState::Configuring => {
                    confirm_attempts += 1;
                    self.exchange(actuator, Exchange::configure(channel, action))
                        .await;
                    ProtocolState::Confirming
                }
                ProtocolState::Confirming => {
                    if actuator.configured() {
                        ProtocolState::Going
                    } else if self
                        .options
                        .max_confirm_attempts
                        .is_some_and(|max| confirm_attempts >= max)
                    {
                        tracing::error!(
                            controller = %self.name,
                            actuator = %actuator.name(),
                            action = %action,
                            attempts = confirm_attempts,
                            "Device never confirmed configuration; giving up"
                        );
                        return Outcome::Failed;
                    } else {
                        tracing::debug!(
                            controller = %self.name,
                            actuator = %actuator.name(),
                            attempt = confirm_attempts,
                            "Configuration not confirmed, resending"
                        );
                        ProtocolState::Configuring
                    }
                }
                ProtocolState::Going => {
                    self.exchange(actuator, Exchange::go(channel)).await;
                    ProtocolState::AwaitingMotion
                }
                ProtocolState::AwaitingMotion => {
                    let telemetry = actuator.telemetry();
                    if telemetry.in_motion() || telemetry.motion_inhibited() {
                        ProtocolState::AwaitingFinish
                    } else {
                        ProtocolState::Going
                    }
                }
                ProtocolState::AwaitingFinish => {
                    if actuator.telemetry().stopped() {
                        return if actuator.action_succeeded() {
                            Outcome::Succeeded
                        } else {
                            Outcome::Unconfirmed
                        };
                    }
                    self.exchange(actuator, Exchange::poll(channel)).await;
                    ProtocolState::AwaitingFinish
                }
                ProtocolState::Aborting => {
                    // only a report answering this stop can show the pulses are off
                    let before = actuator.telemetry().report_count;
                    self.exchange(actuator, Exchange::stop(channel)).await;
                    stop_attempts += 1;

                    let telemetry = actuator.telemetry();
                    if telemetry.report_count > before && telemetry.stopped() {
                        return Outcome::Aborted;
                    }
                    if self.shutting_down() && stop_attempts >= SHUTDOWN_STOP_ATTEMPTS {
                        tracing::error!(
                            controller = %self.name,
                            actuator = %actuator.name(),
                            attempts = stop_attempts,
                            "Stop never confirmed; abandoning actuator on shutdown"
                        );
                        return Outcome::Aborted;
                    }
                    ProtocolState::Aborting
                }
            };
        }
    }

    /// Send one exchange and apply its response, if one arrives in time.
    async fn exchange(&mut self, actuator: &Actuator, exchange: Exchange) {
        self.discard_stale_responses();

        let line = exchange.to_string();
        tracing::debug!(controller = %self.name, command = %line, "Sending exchange");
        if let Err(e) = self.transport.send(&line).await {
            // the link layer owns reconnection; pace retries at the response timeout
            tracing::warn!(controller = %self.name, error = %e, "Transport send failed");
            tokio::time::sleep(self.options.response_timeout).await;
            return;
        }

        match tokio::time::timeout(self.options.response_timeout, self.responses.recv()).await {
            Ok(Some(response)) => {
                if let Err(err) = actuator.apply_report(&response) {
                    tracing::warn!(
                        controller = %self.name,
                        actuator = %actuator.name(),
                        %err,
                        %response,
                        "Dropped report"
                    );
                }
            }
            Ok(None) => {
                tracing::warn!(controller = %self.name, "Response stream closed");
                tokio::time::sleep(self.options.response_timeout).await;
            }
            Err(_) => {
                tracing::debug!(
                    controller = %self.name,
                    command = %line,
                    "No response within timeout; treating command as lost"
                );
            }
        }
    }

    fn shutting_down(&self) -> bool {
        self.signals.shutdown.load(Ordering::Acquire)
    }

    fn discard_stale_responses(&mut self) {
        while let Ok(stale) = self.responses.try_recv() {
            tracing::debug!(controller = %self.name, response = %stale, "Discarding stale response");
        }
    }

    fn drain_queue(&mut self) {
        let mut drained = 0usize;
        while let Ok(item) = self.work_rx.try_recv() {
            self.skip(item);
            drained += 1;
        }
        if drained > 0 {
            tracing::warn!(controller = %self.name, drained, "Drained queued requests");
        }
    }

    /// Retire a request that never started.
    fn skip(&self, item: WorkItem) {
        let WorkItem {
            actuator,
            action,
            hook,
        } = item;
        if let Some(hook) = hook {
            hook(&Completion {
                outcome: Outcome::Skipped,
                action,
                telemetry: actuator.telemetry(),
            });
        }
        actuator.release();
    }

    fn set_state(&self, state: ProtocolState) {
        self.signals.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                tracing::trace!(controller = %self.name, from = ?*current, to = ?state, "Protocol state");
                *current = state;
                true
            }
        });
    }
}
