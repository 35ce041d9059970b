//! Line registry: every controller, actuator and valve of one processing line.
//!
//! Objects live in arenas addressed by typed ids. Names are resolved once, while the line is
//! assembled; after that callers hold ids (or the `Arc`s the registry hands out).

use crate::action::ActuatorAction;
use crate::actuator::{Actuator, ActuatorId};
use crate::config::{LineConfig, ValveConfig};
use crate::controller::{DispatchOptions, ServoController};
use crate::error::{ServoError, ServoResult};
use crate::transport::Link;
use crate::valve::{MeteringConfig, Valve, ValveId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Stable identifier of a controller within a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ControllerId(usize);

impl ControllerId {
    /// Position in the line's controller table.
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for ControllerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "controller#{}", self.0)
    }
}

/// Owns every controller, actuator and valve of a line.
#[derive(Debug, Default)]
pub struct LineRegistry {
    controllers: Vec<ServoController>,
    actuators: Vec<Arc<Actuator>>,
    valves: Vec<Valve>,
}

impl LineRegistry {
    /// An empty line.
    pub fn new() -> Self {
        Self::default()
    }

    /// Assemble a validated configuration.
    ///
    /// `links` holds one open link per controller name. Must be called within a Tokio runtime,
    /// since every controller starts its dispatcher task here.
    pub fn assemble(config: &LineConfig, mut links: HashMap<String, Link>) -> ServoResult<Self> {
        config.validate().map_err(ServoError::Configuration)?;

        let options = config.dispatch.options();
        let mut registry = Self::new();

        for controller in &config.controllers {
            let link = links.remove(&controller.name).ok_or_else(|| ServoError::UnknownName {
                kind: "link for controller",
                name: controller.name.clone(),
            })?;
            registry.spawn_controller(&controller.name, link, options.clone());
        }

        for actuator in &config.actuators {
            let controller = registry.controller_id(&actuator.controller).ok_or_else(|| {
                ServoError::UnknownName {
                    kind: "controller",
                    name: actuator.controller.clone(),
                }
            })?;
            registry.add_actuator(
                controller,
                &actuator.name,
                actuator.channel,
                actuator.actions.clone(),
            )?;
        }

        for valve in &config.valves {
            registry.add_valve_from_config(valve)?;
        }

        tracing::info!(
            line = %config.application.name,
            controllers = registry.controllers.len(),
            actuators = registry.actuators.len(),
            valves = registry.valves.len(),
            "Line assembled"
        );
        Ok(registry)
    }

    /// Start a controller on `link` and add it to the line.
    pub fn spawn_controller(
        &mut self,
        name: &str,
        link: Link,
        options: DispatchOptions,
    ) -> ControllerId {
        let id = ControllerId(self.controllers.len());
        self.controllers
            .push(ServoController::spawn(name, link, options));
        id
    }

    /// Create an actuator and register it on its controller's channel.
    ///
    /// Nothing is added when registration is refused.
    pub fn add_actuator(
        &mut self,
        controller: ControllerId,
        name: &str,
        channel: u8,
        actions: Vec<ActuatorAction>,
    ) -> ServoResult<ActuatorId> {
        let owner = self
            .controller(controller)
            .ok_or_else(|| ServoError::UnknownName {
                kind: "controller",
                name: controller.to_string(),
            })?
            .clone();

        let id = ActuatorId(self.actuators.len());
        let actuator = Arc::new(Actuator::with_actions(id, name, channel, actions));
        owner.register(&actuator)?;
        self.actuators.push(actuator);
        Ok(id)
    }

    /// Add a valve driven by `actuator`, using two of its named actions.
    pub fn add_valve(
        &mut self,
        actuator: ActuatorId,
        name: &str,
        open_action: &str,
        close_action: &str,
        neutral_signal: u16,
    ) -> ServoResult<ValveId> {
        let actuator = self
            .actuator(actuator)
            .cloned()
            .ok_or_else(|| ServoError::UnknownName {
                kind: "actuator",
                name: actuator.to_string(),
            })?;
        let open = named_action(&actuator, open_action)?;
        let close = named_action(&actuator, close_action)?;

        let id = ValveId(self.valves.len());
        self.valves
            .push(Valve::new(id, name, actuator, open, close, neutral_signal));
        Ok(id)
    }

    /// Turn an existing valve into a metering valve.
    pub fn make_metering(&mut self, valve: ValveId, config: MeteringConfig) -> ServoResult<()> {
        let valve = self
            .valves
            .get_mut(valve.index())
            .ok_or_else(|| ServoError::UnknownName {
                kind: "valve",
                name: format!("valve#{}", valve.index()),
            })?;
        valve.set_metering(config);
        Ok(())
    }

    fn add_valve_from_config(&mut self, valve: &ValveConfig) -> ServoResult<ValveId> {
        let actuator = self
            .actuator_id(&valve.actuator)
            .ok_or_else(|| ServoError::UnknownName {
                kind: "actuator",
                name: valve.actuator.clone(),
            })?;
        let id = self.add_valve(
            actuator,
            &valve.name,
            &valve.open_action,
            &valve.close_action,
            valve.neutral_signal,
        )?;

        if let Some(metering) = &valve.metering {
            let move_action = self
                .actuator(actuator)
                .map(|a| named_action(a, &metering.move_action))
                .transpose()?
                .ok_or_else(|| ServoError::UnknownName {
                    kind: "actuator",
                    name: valve.actuator.clone(),
                })?;
            self.make_metering(
                id,
                MeteringConfig {
                    open_position: metering.open_position,
                    max_increment: metering.max_increment,
                    signal_per_step: metering.signal_per_step,
                    move_action,
                },
            )?;
        }
        Ok(id)
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    /// Controller by identifier.
    pub fn controller(&self, id: ControllerId) -> Option<&ServoController> {
        self.controllers.get(id.0)
    }

    /// Actuator by identifier.
    pub fn actuator(&self, id: ActuatorId) -> Option<&Arc<Actuator>> {
        self.actuators.get(id.index())
    }

    /// Valve by identifier.
    pub fn valve(&self, id: ValveId) -> Option<&Valve> {
        self.valves.get(id.index())
    }

    /// Look up a controller by name.
    pub fn controller_id(&self, name: &str) -> Option<ControllerId> {
        self.controllers
            .iter()
            .position(|c| c.name() == name)
            .map(ControllerId)
    }

    /// Look up an actuator by name.
    pub fn actuator_id(&self, name: &str) -> Option<ActuatorId> {
        self.actuators
            .iter()
            .find(|a| a.name() == name)
            .map(|a| a.id())
    }

    /// Look up a valve by name.
    pub fn valve_id(&self, name: &str) -> Option<ValveId> {
        self.valves.iter().find(|v| v.name() == name).map(|v| v.id())
    }

    /// Controllers in registration order.
    pub fn controllers(&self) -> impl Iterator<Item = &ServoController> {
        self.controllers.iter()
    }

    /// Actuators in registration order.
    pub fn actuators(&self) -> impl Iterator<Item = &Arc<Actuator>> {
        self.actuators.iter()
    }

    /// Valves in registration order.
    pub fn valves(&self) -> impl Iterator<Item = &Valve> {
        self.valves.iter()
    }

    /// Wait until every actuator on the line is idle.
    pub async fn wait_idle(&self) {
        for actuator in &self.actuators {
            actuator.wait_idle().await;
        }
    }

    /// Abort every controller.
    pub fn abort_all(&self) {
        for controller in &self.controllers {
            controller.abort();
        }
    }

    /// Stop every dispatcher task.
    pub async fn shutdown(&self) {
        for controller in &self.controllers {
            controller.shutdown().await;
        }
    }
}

fn named_action(actuator: &Actuator, name: &str) -> ServoResult<ActuatorAction> {
    actuator
        .action(name)
        .cloned()
        .ok_or_else(|| ServoError::UnknownAction {
            actuator: actuator.name().to_string(),
            action: name.to_string(),
        })
}
