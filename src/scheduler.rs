//! Concurrent polling engine.
//!
//! This module implements the actor that owns every piece of mutable engine
//! state: the per-axis state map, the errored and status-disabled sets, and
//! the map from axis name to its single active task.
//!
//! # Architecture
//!
//! ```text
//! AxisEngine (cloneable handle)
//!     │  EngineCommand (mpsc)
//!     ▼
//! SchedulerActor ──spawns──► round task ──► ControllerClient ──► ExclusiveChannel
//!     ▲                      timer task
//!     │  EngineEvent         move task
//!     └──────────────────────────┘
//!     │
//!     ▼ AxisUpdate (broadcast)
//! subscribers
//! ```
//!
//! Every spawned task belongs to one axis and carries a generation number.
//! Starting a poll aborts the axis's current task and hands out a new
//! generation; events from older generations are dropped, so subscribers
//! never see a superseded result after a newer one.
//!
//! # Round lifecycle
//!
//! 1. Errored axes skip the round unless it follows a move.
//! 2. Read state and position (one lock hold).
//! 3. Unless status is disabled for the axis, read status (second lock hold).
//! 4. Deliver the update, then:
//!    - read failed: add to the errored set, stop;
//!    - post-move, inactive, off target by more than the tolerance, and
//!      retries left: re-run after the confirm delay;
//!    - state error: re-run after the error interval if still not errored;
//!    - moving: re-run after the moving interval;
//!    - inactive: stop.

use crate::axis::{AxisDefinition, AxisState};
use crate::client::ControllerClient;
use crate::conversion::{self, Direction, DisplayMode, MotionState, MoveTarget, PollOutcome};
use crate::error::{AppResult, AxisError};
use crate::messages::{
    stopped, AxisSnapshot, AxisUpdate, EngineCommand, EngineEvent, PollRequest, ResetSummary, RoundReport,
};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

/// Timing parameters of the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub struct PollingConfig {
    /// Delay between rounds while an axis is moving. At most one second.
    pub moving_interval: Duration,
    /// Delay before re-polling an axis that reported an error state.
    pub error_interval: Duration,
    /// Delay before a post-move confirmation retry.
    pub confirm_delay: Duration,
    /// Confirmation retries after a move.
    pub confirm_max_retries: u32,
    /// Allowed deviation from the expected raw position, in pulses.
    pub confirm_tolerance: f64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            moving_interval: Duration::from_millis(300),
            error_interval: Duration::from_secs(5),
            confirm_delay: Duration::from_millis(100),
            confirm_max_retries: 3,
            confirm_tolerance: 10.0,
        }
    }
}

const COMMAND_CAPACITY: usize = 64;
const UPDATE_CAPACITY: usize = 256;

// =============================================================================
// Handle
// =============================================================================

/// Handle to a running polling engine.
///
/// Cloning is cheap. The actor stops when the last handle is dropped or
/// [`shutdown`](Self::shutdown) is called.
#[derive(Debug, Clone)]
pub struct AxisEngine {
    commands: mpsc::Sender<EngineCommand>,
    updates: broadcast::Sender<AxisUpdate>,
}

impl AxisEngine {
    /// Validate the definitions and spawn the actor on the current runtime.
    ///
    /// # Errors
    /// [`AxisError::Configuration`] for an invalid definition or a duplicate
    /// axis name.
    pub fn spawn(
        definitions: impl IntoIterator<Item = AxisDefinition>,
        client: ControllerClient,
        config: PollingConfig,
    ) -> AppResult<Self> {
        let mut catalog = HashMap::new();
        for definition in definitions {
            definition.validate()?;
            if catalog.contains_key(&definition.name) {
                return Err(AxisError::Configuration(format!(
                    "duplicate axis definition '{}'",
                    definition.name
                )));
            }
            catalog.insert(definition.name.clone(), definition);
        }

        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (update_tx, _) = broadcast::channel(UPDATE_CAPACITY);
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        info!(
            target: "axis_tool::scheduler",
            axes = catalog.len(),
            endpoint = %client.describe(),
            "polling engine starting"
        );
        let actor = SchedulerActor::new(catalog, client, config, update_tx.clone(), event_tx);
        tokio::spawn(actor.run(command_rx, event_rx).in_current_span());

        Ok(Self {
            commands: command_tx,
            updates: update_tx,
        })
    }

    /// Receive every update delivered from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<AxisUpdate> {
        self.updates.subscribe()
    }

    async fn request<T>(
        &self,
        (command, rx): (EngineCommand, tokio::sync::oneshot::Receiver<T>),
    ) -> AppResult<T> {
        self.commands
            .send(command)
            .await
            .map_err(|_| AxisError::EngineStopped)?;
        rx.await.map_err(stopped)
    }

    /// Start polling one axis, superseding its current task.
    pub async fn poll(&self, axis: &str) -> AppResult<()> {
        self.request(EngineCommand::poll(axis.to_string())).await?
    }

    /// Restart polling of every axis observed so far. Returns their names.
    pub async fn poll_all(&self) -> AppResult<Vec<String>> {
        self.request(EngineCommand::poll_all()).await
    }

    /// Start polling several axes.
    pub async fn poll_axes<S: AsRef<str>>(&self, axes: &[S]) -> AppResult<()> {
        let axes = axes.iter().map(|a| a.as_ref().to_string()).collect();
        self.request(EngineCommand::poll_axes(axes)).await?
    }

    /// Move to an absolute position. Resolves once the controller
    /// acknowledged the command; the post-move poll is already queued then.
    pub async fn move_absolute(&self, axis: &str, value: f64, mode: DisplayMode) -> AppResult<MoveTarget> {
        self.request(EngineCommand::move_absolute(axis.to_string(), value, mode))
            .await?
    }

    /// Move by a delta from the position the controller reports now.
    pub async fn move_relative(
        &self,
        axis: &str,
        delta: f64,
        mode: DisplayMode,
        direction: Direction,
    ) -> AppResult<MoveTarget> {
        self.request(EngineCommand::move_relative(axis.to_string(), delta, mode, direction))
            .await?
    }

    /// Stop an axis.
    pub async fn stop(&self, axis: &str) -> AppResult<()> {
        self.request(EngineCommand::stop(axis.to_string())).await?
    }

    /// Clear both suppression sets, cancel every task and restart polling of
    /// every observed axis.
    pub async fn reset_suppressions(&self) -> AppResult<ResetSummary> {
        self.request(EngineCommand::reset_suppressions()).await
    }

    /// Current state of one axis, if it has been polled or moved.
    pub async fn snapshot(&self, axis: &str) -> AppResult<Option<AxisSnapshot>> {
        self.request(EngineCommand::snapshot(axis.to_string())).await
    }

    /// Cancel every task and stop the actor.
    pub async fn shutdown(&self) -> AppResult<()> {
        self.request(EngineCommand::shutdown()).await
    }
}

// =============================================================================
// Actor
// =============================================================================

struct AxisTask {
    generation: u64,
    handle: JoinHandle<()>,
}

/// Single owner of all engine state.
struct SchedulerActor {
    catalog: HashMap<String, AxisDefinition>,
    axes: HashMap<String, AxisState>,
    errored: HashSet<String>,
    status_disabled: HashSet<String>,
    observed: BTreeSet<String>,
    tasks: HashMap<String, AxisTask>,
    last_outcomes: HashMap<String, PollOutcome>,
    command_tasks: Vec<JoinHandle<()>>,
    next_generation: u64,
    client: ControllerClient,
    config: PollingConfig,
    updates: broadcast::Sender<AxisUpdate>,
    events: mpsc::UnboundedSender<EngineEvent>,
}

impl SchedulerActor {
    fn new(
        catalog: HashMap<String, AxisDefinition>,
        client: ControllerClient,
        config: PollingConfig,
        updates: broadcast::Sender<AxisUpdate>,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Self {
        Self {
            catalog,
            axes: HashMap::new(),
            errored: HashSet::new(),
            status_disabled: HashSet::new(),
            observed: BTreeSet::new(),
            tasks: HashMap::new(),
            last_outcomes: HashMap::new(),
            command_tasks: Vec::new(),
            next_generation: 0,
            client,
            config,
            updates,
            events,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<EngineCommand>,
        mut events: mpsc::UnboundedReceiver<EngineEvent>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(EngineCommand::Shutdown { response }) => {
                        self.abort_all();
                        let _ = response.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(event) = events.recv() => self.handle_event(event),
            }
        }
        self.abort_all();
        info!(target: "axis_tool::scheduler", "polling engine stopped");
    }

    fn handle_command(&mut self, command: EngineCommand) {
        self.command_tasks.retain(|task| !task.is_finished());
        match command {
            EngineCommand::Poll { axis, response } => {
                let result = self.require_known(&axis).map(|_| ());
                if result.is_ok() {
                    self.start_poll(PollRequest::plain(axis));
                }
                let _ = response.send(result);
            }
            EngineCommand::PollAll { response } => {
                let axes: Vec<String> = self.observed.iter().cloned().collect();
                for axis in &axes {
                    self.start_poll(PollRequest::plain(axis.clone()));
                }
                let _ = response.send(axes);
            }
            EngineCommand::PollAxes { axes, response } => {
                let result = axes.iter().try_for_each(|axis| self.require_known(axis).map(|_| ()));
                if result.is_ok() {
                    for axis in axes {
                        self.start_poll(PollRequest::plain(axis));
                    }
                }
                let _ = response.send(result);
            }
            EngineCommand::MoveAbsolute {
                axis,
                value,
                mode,
                response,
            } => self.move_absolute(axis, value, mode, response),
            EngineCommand::MoveRelative {
                axis,
                delta,
                mode,
                direction,
                response,
            } => self.move_relative(axis, delta, mode, direction, response),
            EngineCommand::Stop { axis, response } => self.stop(axis, response),
            EngineCommand::ResetSuppressions { response } => {
                let summary = self.reset_suppressions();
                let _ = response.send(summary);
            }
            EngineCommand::Snapshot { axis, response } => {
                let _ = response.send(self.snapshot(&axis));
            }
            EngineCommand::Shutdown { response } => {
                // Handled in the run loop.
                let _ = response.send(());
            }
        }
    }

    fn handle_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::RoundComplete {
                generation,
                request,
                report,
            } => self.round_complete(generation, request, report),
            EngineEvent::TimerFired {
                generation,
                request,
                require_not_errored,
            } => {
                if !self.is_current(&request.axis, generation) {
                    return;
                }
                if require_not_errored && self.errored.contains(&request.axis) {
                    debug!(target: "axis_tool::scheduler", axis = %request.axis, "axis errored meanwhile, not rescheduling");
                    self.tasks.remove(&request.axis);
                    return;
                }
                self.run_round(generation, request);
            }
            EngineEvent::MoveConfirmed {
                axis,
                expected_raw,
                learned_unit,
            } => {
                if let (Some(unit), Some(state)) = (learned_unit, self.axes.get_mut(&axis)) {
                    state.learn_unit(unit);
                }
                self.start_poll(PollRequest::after_move(axis, expected_raw));
            }
        }
    }

    fn require_known(&self, axis: &str) -> AppResult<&AxisDefinition> {
        self.catalog
            .get(axis)
            .ok_or_else(|| AxisError::UnknownAxis(axis.to_string()))
    }

    /// Lazily create the state for a known axis.
    fn ensure_state(&mut self, axis: &str) -> Option<&mut AxisState> {
        if !self.axes.contains_key(axis) {
            let definition = self.catalog.get(axis)?.clone();
            self.axes.insert(axis.to_string(), AxisState::new(definition));
        }
        self.axes.get_mut(axis)
    }

    fn is_current(&self, axis: &str, generation: u64) -> bool {
        self.tasks.get(axis).is_some_and(|task| task.generation == generation)
    }

    /// Cancel the axis's current task and start a new one.
    fn start_poll(&mut self, request: PollRequest) {
        if let Some(old) = self.tasks.remove(&request.axis) {
            old.handle.abort();
            debug!(
                target: "axis_tool::scheduler",
                axis = %request.axis,
                generation = old.generation,
                "superseded polling task"
            );
        }
        if self.ensure_state(&request.axis).is_none() {
            return;
        }
        self.observed.insert(request.axis.clone());
        self.next_generation += 1;
        let generation = self.next_generation;
        self.run_round(generation, request);
    }

    fn run_round(&mut self, generation: u64, request: PollRequest) {
        if self.errored.contains(&request.axis) && !request.post_move {
            debug!(target: "axis_tool::scheduler", axis = %request.axis, "skipping errored axis");
            self.tasks.remove(&request.axis);
            return;
        }
        let Some(state) = self.axes.get(&request.axis) else {
            return;
        };
        let unit = state.unit;
        let read_status = !self.status_disabled.contains(&request.axis);
        let client = self.client.clone();
        let events = self.events.clone();
        let axis = request.axis.clone();

        let handle = tokio::spawn(async move {
            let position = client.read_position(&request.axis, unit).await;
            let status = match (&position, read_status) {
                (Ok(_), true) => Some(client.read_status(&request.axis).await),
                _ => None,
            };
            let _ = events.send(EngineEvent::RoundComplete {
                generation,
                request,
                report: RoundReport { position, status },
            });
        });
        self.tasks.insert(axis, AxisTask { generation, handle });
    }

    fn schedule(&mut self, generation: u64, delay: Duration, request: PollRequest, require_not_errored: bool) {
        let events = self.events.clone();
        let axis = request.axis.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(EngineEvent::TimerFired {
                generation,
                request,
                require_not_errored,
            });
        });
        self.tasks.insert(axis, AxisTask { generation, handle });
    }

    fn round_complete(&mut self, generation: u64, request: PollRequest, report: RoundReport) {
        let axis = request.axis.clone();
        if !self.is_current(&axis, generation) {
            debug!(target: "axis_tool::scheduler", %axis, generation, "discarding stale round");
            return;
        }

        let read = match report.position {
            Ok(read) => read,
            Err(err) => {
                warn!(
                    target: "axis_tool::scheduler",
                    %axis,
                    category = %err.category(),
                    error = %err,
                    "poll failed, suppressing automatic polling"
                );
                self.errored.insert(axis.clone());
                self.tasks.remove(&axis);
                self.deliver(generation, &axis, PollOutcome::communication_failure());
                return;
            }
        };

        if request.post_move && self.errored.remove(&axis) {
            info!(target: "axis_tool::scheduler", %axis, "axis answered after move, resuming polling");
        }

        let status = match report.status {
            Some(Err(err)) => {
                info!(
                    target: "axis_tool::scheduler",
                    %axis,
                    error = %err,
                    "status request failed, disabling status polling for this axis"
                );
                self.status_disabled.insert(axis.clone());
                None
            }
            other => other.map(|status| status.map_err(|_| ())),
        };

        let Some(state) = self.axes.get_mut(&axis) else {
            return;
        };
        if state.learn_unit(read.reading.unit) {
            debug!(target: "axis_tool::scheduler", %axis, unit = %state.unit, "learned unit");
        }
        match status {
            Some(Ok((bits, limits))) => state.apply_status(bits, limits),
            _ => state.clear_status(),
        }
        let outcome = PollOutcome::from_reading(&state.definition, read.state, read.reading);
        self.deliver(generation, &axis, outcome.clone());

        let config = &self.config;
        let off_target = request
            .expected_raw
            .is_some_and(|expected| (outcome.raw_position - expected).abs() > config.confirm_tolerance);
        if request.post_move && outcome.state.is_inactive() && off_target && request.retry < config.confirm_max_retries {
            debug!(
                target: "axis_tool::scheduler",
                %axis,
                retry = request.retry + 1,
                raw = outcome.raw_position,
                expected = request.expected_raw,
                "position not settled after move, confirming again"
            );
            let delay = config.confirm_delay;
            self.schedule(generation, delay, request.next_retry(), false);
            return;
        }

        match outcome.state {
            // Error replies fail to decode and take the suppression path above,
            // so only a device-reported error state lands here.
            MotionState::Error => {
                let delay = self.config.error_interval;
                self.schedule(generation, delay, PollRequest::plain(axis), true);
            }
            MotionState::Moving(_) => {
                let delay = self.config.moving_interval;
                self.schedule(generation, delay, PollRequest::plain(axis), false);
            }
            MotionState::Inactive => {
                self.tasks.remove(&axis);
            }
        }
    }

    fn deliver(&mut self, generation: u64, axis: &str, outcome: PollOutcome) {
        let (unit, status_bits, limits) = match self.axes.get(axis) {
            Some(state) => (state.unit, state.status_bits, state.limits),
            None => return,
        };
        self.last_outcomes.insert(axis.to_string(), outcome.clone());
        let update = AxisUpdate {
            axis: axis.to_string(),
            generation,
            outcome,
            limits,
            status_bits,
            unit,
        };
        // No subscribers is fine.
        let _ = self.updates.send(update);
    }

    fn move_absolute(
        &mut self,
        axis: String,
        value: f64,
        mode: DisplayMode,
        response: tokio::sync::oneshot::Sender<AppResult<MoveTarget>>,
    ) {
        let (definition, unit) = match self.prepare_command(&axis) {
            Ok(found) => found,
            Err(err) => {
                let _ = response.send(Err(err));
                return;
            }
        };
        let target = conversion::resolve_absolute(&definition, unit, value, mode);
        info!(target: "axis_tool::scheduler", %axis, command = %target.command.wire_value(), "move absolute");

        let client = self.client.clone();
        let events = self.events.clone();
        self.command_tasks.push(tokio::spawn(async move {
            let result = client.move_to(&axis, target.command).await;
            if result.is_ok() {
                let _ = events.send(EngineEvent::MoveConfirmed {
                    axis,
                    expected_raw: target.expected_raw,
                    learned_unit: None,
                });
            }
            let _ = response.send(result.map(|_| target));
        }));
    }

    fn move_relative(
        &mut self,
        axis: String,
        delta: f64,
        mode: DisplayMode,
        direction: Direction,
        response: tokio::sync::oneshot::Sender<AppResult<MoveTarget>>,
    ) {
        let (definition, unit) = match self.prepare_command(&axis) {
            Ok(found) => found,
            Err(err) => {
                let _ = response.send(Err(err));
                return;
            }
        };

        let client = self.client.clone();
        let events = self.events.clone();
        self.command_tasks.push(tokio::spawn(async move {
            let current = match client.read_position(&axis, unit).await {
                Ok(read) => read.reading,
                Err(err) => {
                    warn!(target: "axis_tool::scheduler", %axis, error = %err, "could not read current position");
                    let _ = response.send(Err(err));
                    return;
                }
            };
            let learned_unit = current.unit.is_physical().then_some(current.unit);
            let unit = learned_unit.unwrap_or(unit);
            let target = conversion::resolve_relative(&definition, unit, current, delta, mode, direction);
            info!(target: "axis_tool::scheduler", %axis, command = %target.command.wire_value(), "move relative");

            let result = client.move_to(&axis, target.command).await;
            if result.is_ok() {
                let _ = events.send(EngineEvent::MoveConfirmed {
                    axis,
                    expected_raw: target.expected_raw,
                    learned_unit,
                });
            }
            let _ = response.send(result.map(|_| target));
        }));
    }

    fn stop(&mut self, axis: String, response: tokio::sync::oneshot::Sender<AppResult<()>>) {
        if let Err(err) = self.require_known(&axis) {
            let _ = response.send(Err(err));
            return;
        }
        info!(target: "axis_tool::scheduler", %axis, "stop");
        let client = self.client.clone();
        self.command_tasks.push(tokio::spawn(async move {
            let _ = response.send(client.stop(&axis).await);
        }));
    }

    /// Definition and cached unit for a command, creating state on first use.
    fn prepare_command(&mut self, axis: &str) -> AppResult<(AxisDefinition, crate::axis::Unit)> {
        self.require_known(axis)?;
        self.observed.insert(axis.to_string());
        let state = self
            .ensure_state(axis)
            .ok_or_else(|| AxisError::UnknownAxis(axis.to_string()))?;
        Ok((state.definition.clone(), state.unit))
    }

    fn reset_suppressions(&mut self) -> ResetSummary {
        let mut errored: Vec<String> = self.errored.drain().collect();
        let mut status_disabled: Vec<String> = self.status_disabled.drain().collect();
        errored.sort();
        status_disabled.sort();

        for (_, task) in self.tasks.drain() {
            task.handle.abort();
        }
        let restarted: Vec<String> = self.observed.iter().cloned().collect();
        info!(
            target: "axis_tool::scheduler",
            errored = errored.len(),
            status_disabled = status_disabled.len(),
            restarted = restarted.len(),
            "suppressions reset"
        );
        for axis in &restarted {
            self.start_poll(PollRequest::plain(axis.clone()));
        }
        ResetSummary {
            errored,
            status_disabled,
            restarted,
        }
    }

    fn snapshot(&self, axis: &str) -> Option<AxisSnapshot> {
        let state = self.axes.get(axis)?;
        Some(AxisSnapshot {
            definition: state.definition.clone(),
            unit: state.unit,
            status_bits: state.status_bits,
            limits: state.limits,
            errored: self.errored.contains(axis),
            status_disabled: self.status_disabled.contains(axis),
            polling: self.tasks.contains_key(axis),
            last_outcome: self.last_outcomes.get(axis).cloned(),
        })
    }

    fn abort_all(&mut self) {
        for (_, task) in self.tasks.drain() {
            task.handle.abort();
        }
        for task in self.command_tasks.drain(..) {
            task.abort();
        }
    }
}
