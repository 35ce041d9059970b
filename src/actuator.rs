//! Actuator: one addressable channel on a servo controller.
//!
//! Callers enqueue requests and observe the result; the owning controller's dispatcher is the
//! only code that marks an actuator active, writes its telemetry, and retires requests.
//!
//! Bookkeeping rules:
//! - `pending` goes up by one per accepted request and down by exactly one when the dispatcher
//!   retires that request, whatever the outcome (including requests drained by an abort).
//! - Telemetry changes only while the actuator is being serviced.

use crate::action::ActuatorAction;
use crate::controller::ServoController;
use crate::error::{ReportParseError, ServoError, ServoResult};
use crate::telemetry::ActuatorTelemetry;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::watch;
use tracing::instrument;

/// Stable identifier of an actuator within a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActuatorId(pub(crate) usize);

impl ActuatorId {
    /// Position in the line's actuator table.
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for ActuatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "actuator#{}", self.0)
    }
}

/// How the dispatcher retired a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Configured and a completion signal fired (or no motion was requested).
    Succeeded,
    /// Motion stopped without position, current or time evidence.
    Unconfirmed,
    /// Stopped by an abort while in flight.
    Aborted,
    /// The device never confirmed the configuration within the retry budget.
    Failed,
    /// Drained from the queue by an abort before it started.
    Skipped,
}

impl Outcome {
    /// True only for [`Outcome::Succeeded`].
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Succeeded)
    }
}

/// What a completion hook gets to see.
#[derive(Debug, Clone)]
pub struct Completion {
    /// How the request was retired.
    pub outcome: Outcome,
    /// The requested action; `None` for a poll.
    pub action: Option<ActuatorAction>,
    /// Telemetry at the moment of retirement.
    pub telemetry: ActuatorTelemetry,
}

/// Runs on the dispatcher task right before the request's pending count is released.
pub type CompletionHook = Box<dyn FnOnce(&Completion) + Send + 'static>;

/// One queued request.
pub(crate) struct WorkItem {
    pub(crate) actuator: Arc<Actuator>,
    pub(crate) action: Option<ActuatorAction>,
    pub(crate) hook: Option<CompletionHook>,
}

#[derive(Debug, Default)]
struct RequestedActions {
    current: Option<ActuatorAction>,
    previous: Option<ActuatorAction>,
}

/// One channel on a servo board, shared between callers and its dispatcher.
pub struct Actuator {
    id: ActuatorId,
    name: String,
    channel: u8,
    actions: HashMap<String, ActuatorAction>,
    controller: OnceLock<ServoController>,
    requested: RwLock<RequestedActions>,
    telemetry: watch::Sender<ActuatorTelemetry>,
    pending: watch::Sender<usize>,
    active: AtomicBool,
}

impl fmt::Debug for Actuator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Actuator")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("channel", &self.channel)
            .field("pending", &self.pending())
            .field("active", &self.is_active())
            .finish()
    }
}

impl Actuator {
    /// Create an actuator without named actions.
    pub fn new(id: ActuatorId, name: impl Into<String>, channel: u8) -> Self {
        Self::with_actions(id, name, channel, Vec::new())
    }

    /// Create an actuator with its named actions.
    pub fn with_actions(
        id: ActuatorId,
        name: impl Into<String>,
        channel: u8,
        actions: Vec<ActuatorAction>,
    ) -> Self {
        let (telemetry, _) = watch::channel(ActuatorTelemetry::default());
        let (pending, _) = watch::channel(0);
        Self {
            id,
            name: name.into(),
            channel,
            actions: actions.into_iter().map(|a| (a.name.clone(), a)).collect(),
            controller: OnceLock::new(),
            requested: RwLock::new(RequestedActions::default()),
            telemetry,
            pending,
            active: AtomicBool::new(false),
        }
    }

    /// Identifier assigned at registration.
    pub fn id(&self) -> ActuatorId {
        self.id
    }

    /// Actuator name, unique within a line.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Channel number on the owning controller.
    pub fn channel(&self) -> u8 {
        self.channel
    }

    /// Named action configured for this actuator.
    pub fn action(&self, name: &str) -> Option<&ActuatorAction> {
        self.actions.get(name)
    }

    /// The controller this actuator is registered with, if any.
    pub fn controller(&self) -> Option<&ServoController> {
        self.controller.get()
    }

    pub(crate) fn bind(&self, controller: &ServoController) -> ServoResult<()> {
        if let Some(existing) = self.controller.get() {
            if existing.same_as(controller) {
                return Ok(());
            }
            return Err(ServoError::AlreadyBound {
                actuator: self.name.clone(),
                controller: existing.name().to_string(),
            });
        }
        self.controller
            .set(controller.clone())
            .map_err(|_| ServoError::AlreadyBound {
                actuator: self.name.clone(),
                controller: controller.name().to_string(),
            })
    }

    /// Enqueue `action` (or a bare channel select for `None`) and return immediately.
    #[instrument(skip(self, action), fields(actuator = %self.name, action = ?action.as_ref().map(|a| &a.name)), err)]
    pub fn request(self: &Arc<Self>, action: Option<ActuatorAction>) -> ServoResult<()> {
        self.submit(action, None)
    }

    /// Enqueue one of this actuator's named actions.
    pub fn request_named(self: &Arc<Self>, name: &str) -> ServoResult<()> {
        let action = self
            .action(name)
            .cloned()
            .ok_or_else(|| ServoError::UnknownAction {
                actuator: self.name.clone(),
                action: name.to_string(),
            })?;
        self.request(Some(action))
    }

    /// Enqueue `action` and run `hook` on the dispatcher when it is retired.
    pub fn request_then(
        self: &Arc<Self>,
        action: Option<ActuatorAction>,
        hook: CompletionHook,
    ) -> ServoResult<()> {
        self.submit(action, Some(hook))
    }

    fn submit(
        self: &Arc<Self>,
        action: Option<ActuatorAction>,
        hook: Option<CompletionHook>,
    ) -> ServoResult<()> {
        let controller = self
            .controller
            .get()
            .ok_or_else(|| ServoError::Unbound(self.name.clone()))?;

        self.pending.send_modify(|n| *n += 1);
        let item = WorkItem {
            actuator: Arc::clone(self),
            action,
            hook,
        };
        if let Err(err) = controller.enqueue(item) {
            // never reached the queue, so the dispatcher will not release it
            self.release();
            return Err(err);
        }
        Ok(())
    }

    /// Ask the owning controller to abort.
    ///
    /// The abort is controller-wide: the operation in flight is stopped and every queued,
    /// not-yet-started request on the controller is retired as [`Outcome::Skipped`].
    pub fn stop(&self) -> ServoResult<()> {
        let controller = self
            .controller
            .get()
            .ok_or_else(|| ServoError::Unbound(self.name.clone()))?;
        controller.abort_requested_by(&self.name);
        Ok(())
    }

    /// Action currently (or most recently) being serviced.
    pub fn requested_action(&self) -> Option<ActuatorAction> {
        self.requested.read().current.clone()
    }

    /// Action serviced before the current one.
    pub fn previous_action(&self) -> Option<ActuatorAction> {
        self.requested.read().previous.clone()
    }

    /// Snapshot of the latest telemetry.
    pub fn telemetry(&self) -> ActuatorTelemetry {
        self.telemetry.borrow().clone()
    }

    /// Receiver that is notified whenever a report is accepted for this actuator.
    pub fn subscribe_telemetry(&self) -> watch::Receiver<ActuatorTelemetry> {
        self.telemetry.subscribe()
    }

    /// The device holds exactly the configuration of the requested action.
    ///
    /// False when nothing is requested.
    pub fn configured(&self) -> bool {
        match self.requested.read().current.as_ref() {
            Some(action) => self.telemetry.borrow().matches(action),
            None => false,
        }
    }

    /// Nothing was requested, or the device is configured and any completion signal fired.
    pub fn action_succeeded(&self) -> bool {
        let requested = self.requested.read();
        match requested.current.as_ref() {
            None => true,
            Some(action) => {
                let telemetry = self.telemetry.borrow();
                telemetry.matches(action) && telemetry.completion_detected()
            }
        }
    }

    /// Requests accepted but not yet retired.
    pub fn pending(&self) -> usize {
        *self.pending.borrow()
    }

    /// True when nothing is queued or in flight.
    pub fn idle(&self) -> bool {
        self.pending() == 0
    }

    /// Wait until every request submitted so far has been retired.
    ///
    /// Blocks the calling task only; the dispatcher keeps running.
    pub async fn wait_idle(&self) {
        let mut rx = self.pending.subscribe();
        // the sender lives in `self`, so the channel cannot close under us
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    /// True while the dispatcher is servicing this actuator.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    // ---------------------------------------------------------------------
    // Dispatcher side
    // ---------------------------------------------------------------------

    /// Mark active and make `action` the requested action.
    pub(crate) fn activate(&self, action: Option<ActuatorAction>) {
        {
            let mut requested = self.requested.write();
            let previous = requested.current.take();
            if previous.is_some() {
                requested.previous = previous;
            }
            requested.current = action;
        }
        self.active.store(true, Ordering::Release);
    }

    /// Apply a report received while this actuator is being serviced.
    ///
    /// Subscribers are notified only when the report is accepted.
    pub(crate) fn apply_report(&self, line: &str) -> Result<(), ReportParseError> {
        let mut result = Ok(());
        let channel = self.channel;
        self.telemetry.send_if_modified(|telemetry| match telemetry.apply(line, channel) {
            Ok(()) => true,
            Err(err) => {
                result = Err(err);
                false
            }
        });

        if result.is_ok() {
            let telemetry = self.telemetry.borrow();
            if telemetry.error_bits != 0 {
                tracing::warn!(
                    actuator = %self.name,
                    channel = self.channel,
                    error_bits = telemetry.error_bits,
                    "Device reports error bits"
                );
            }
        }
        result
    }

    /// Clear the active flag and retire one request.
    pub(crate) fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
        self.release();
    }

    /// Retire one request that never became active.
    pub(crate) fn release(&self) {
        self.pending.send_modify(|n| {
            if *n == 0 {
                tracing::warn!(actuator = %self.name, "Pending count already zero on release");
            } else {
                *n -= 1;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn actuator() -> Actuator {
        Actuator::with_actions(
            ActuatorId(0),
            "v1",
            1,
            vec![ActuatorAction::new("open", 2000)
                .with_limits(false, true)
                .with_time_limit(5.0)],
        )
    }

    #[test]
    fn test_no_action_counts_as_succeeded() {
        let a = actuator();
        assert!(a.action_succeeded());
        assert!(!a.configured());
    }

    #[test]
    fn test_activation_rotates_requested_actions() {
        let a = actuator();
        let open = a.action("open").cloned();
        a.activate(open.clone());
        assert!(a.is_active());
        assert_eq!(a.requested_action(), open);
        assert_eq!(a.previous_action(), None);

        let close = ActuatorAction::new("close", 1000);
        a.activate(Some(close.clone()));
        assert_eq!(a.requested_action(), Some(close));
        assert_eq!(a.previous_action(), open);
    }

    #[test]
    fn test_action_succeeded_requires_configuration() {
        let a = actuator();
        a.activate(a.action("open").cloned());

        // limit 1 engaged, but the board still holds another drive signal
        a.apply_report("01 1000 0 00 11 0000 0000 005.00 000.00 24.00 00")
            .unwrap();
        assert!(!a.configured());
        assert!(!a.action_succeeded());

        a.apply_report("01 2000 0 00 11 0000 0000 005.00 000.00 24.00 00")
            .unwrap();
        assert!(a.configured());
        assert!(a.action_succeeded());
    }

    #[test]
    fn test_rejected_report_does_not_notify() {
        let a = actuator();
        a.activate(None);
        let rx = a.subscribe_telemetry();

        assert!(a.apply_report("garbage").is_err());
        assert!(!rx.has_changed().unwrap());

        a.apply_report("01 2000 0 00 11 0000 0000 005.00 000.00 24.00 00")
            .unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(a.telemetry().report_count, 1);
    }

    #[test]
    fn test_release_never_goes_negative() {
        let a = actuator();
        a.release();
        assert_eq!(a.pending(), 0);
        assert!(a.idle());
    }

    #[test]
    fn test_unbound_request_is_refused() {
        let a = Arc::new(actuator());
        let err = a.request(None).unwrap_err();
        assert!(matches!(err, ServoError::Unbound(_)));
        assert_eq!(a.pending(), 0);
        assert!(matches!(a.request_named("nope"), Err(ServoError::UnknownAction { .. })));
    }
}
