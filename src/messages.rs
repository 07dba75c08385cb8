//! Message types for the polling engine.
//!
//! The engine is an actor (see [`crate::scheduler`]). Callers hold an
//! [`AxisEngine`](crate::scheduler::AxisEngine) handle that turns method calls
//! into [`EngineCommand`]s; every command carries a oneshot sender for its
//! response. Work the actor spawns (polling rounds, reschedule timers, move
//! commands) reports back through [`EngineEvent`]s on a second, internal
//! channel.
//!
//! # Message Flow
//!
//! ```text
//! Caller                        Actor                         Spawned task
//! ------                        -----                         ------------
//! 1. command + oneshot  ----->
//!                               2. mutate state, spawn  --->
//!                               3. respond via oneshot
//! 4. await response     <-----
//!                                                            5. exchange under
//!                                                               channel lock
//!                               6. EngineEvent         <---
//!                               7. generation check,
//!                                  deliver AxisUpdate,
//!                                  reschedule
//! ```
//!
//! # Helper Methods
//!
//! Each command variant has a constructor returning the command and the
//! receiver for its response:
//!
//! ```rust
//! use axis_tool::messages::EngineCommand;
//!
//! let (cmd, rx) = EngineCommand::poll("st2_coll_1_x".to_string());
//! // commands.send(cmd).await?;
//! // let accepted = rx.await?;
//! ```

use crate::axis::{AxisDefinition, Unit};
use crate::client::PositionRead;
use crate::conversion::{Direction, DisplayMode, MoveTarget, PollOutcome};
use crate::error::{AppResult, AxisError};
use crate::status::LimitFlags;
use serde::Serialize;
use tokio::sync::oneshot;

/// One result delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AxisUpdate {
    /// Axis name.
    pub axis: String,
    /// Identity of the polling task that produced this result.
    pub generation: u64,
    /// State and position.
    pub outcome: PollOutcome,
    /// Limit flags (all clear while status polling is disabled).
    pub limits: LimitFlags,
    /// Raw status value.
    pub status_bits: u8,
    /// Unit the controller currently reports for this axis.
    pub unit: Unit,
}

/// Point-in-time view of one axis.
#[derive(Debug, Clone, PartialEq)]
pub struct AxisSnapshot {
    /// The axis definition.
    pub definition: AxisDefinition,
    /// Cached unit.
    pub unit: Unit,
    /// Raw status value.
    pub status_bits: u8,
    /// Limit flags.
    pub limits: LimitFlags,
    /// Member of the errored set.
    pub errored: bool,
    /// Member of the status-disabled set.
    pub status_disabled: bool,
    /// A polling task (round or timer) is active.
    pub polling: bool,
    /// Last delivered outcome.
    pub last_outcome: Option<PollOutcome>,
}

/// What a suppression reset cleared and restarted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResetSummary {
    /// Axes removed from the errored set.
    pub errored: Vec<String>,
    /// Axes removed from the status-disabled set.
    pub status_disabled: Vec<String>,
    /// Axes whose polling was restarted.
    pub restarted: Vec<String>,
}

/// Parameters of one polling round.
#[derive(Debug, Clone, PartialEq)]
pub struct PollRequest {
    /// Axis name.
    pub axis: String,
    /// Expected raw position after a move.
    pub expected_raw: Option<f64>,
    /// Round belongs to a post-move confirmation.
    pub post_move: bool,
    /// Confirmation retries already spent.
    pub retry: u32,
}

impl PollRequest {
    /// An ordinary poll.
    pub fn plain(axis: impl Into<String>) -> Self {
        Self {
            axis: axis.into(),
            expected_raw: None,
            post_move: false,
            retry: 0,
        }
    }

    /// First round after an acknowledged move.
    pub fn after_move(axis: impl Into<String>, expected_raw: f64) -> Self {
        Self {
            axis: axis.into(),
            expected_raw: Some(expected_raw),
            post_move: true,
            retry: 0,
        }
    }

    /// The next confirmation round.
    pub fn next_retry(&self) -> Self {
        Self {
            retry: self.retry + 1,
            ..self.clone()
        }
    }
}

/// What a polling round brought back from the controller.
#[derive(Debug)]
pub struct RoundReport {
    /// State and position, or why they could not be read.
    pub position: AppResult<PositionRead>,
    /// Status result; `None` when status was not requested.
    pub status: Option<AppResult<(u8, LimitFlags)>>,
}

/// Commands accepted by the engine actor.
#[derive(Debug)]
pub enum EngineCommand {
    /// Start (or supersede) polling of one axis.
    Poll {
        /// Axis name.
        axis: String,
        /// `Err(UnknownAxis)` for names not in the catalog.
        response: oneshot::Sender<AppResult<()>>,
    },

    /// Restart polling of every axis observed so far.
    PollAll {
        /// Names of the axes restarted.
        response: oneshot::Sender<Vec<String>>,
    },

    /// Start polling of several axes.
    PollAxes {
        /// Axis names.
        axes: Vec<String>,
        /// Fails before starting anything if a name is unknown.
        response: oneshot::Sender<AppResult<()>>,
    },

    /// Move to an absolute position.
    MoveAbsolute {
        /// Axis name.
        axis: String,
        /// Target in the caller's display mode.
        value: f64,
        /// Unit mode of `value`.
        mode: DisplayMode,
        /// Resolved target once the controller acknowledged it.
        response: oneshot::Sender<AppResult<MoveTarget>>,
    },

    /// Move by a delta from the current position.
    MoveRelative {
        /// Axis name.
        axis: String,
        /// Step in the caller's display mode.
        delta: f64,
        /// Unit mode of `delta`.
        mode: DisplayMode,
        /// Plus or minus.
        direction: Direction,
        /// Resolved target once the controller acknowledged it.
        response: oneshot::Sender<AppResult<MoveTarget>>,
    },

    /// Stop an axis.
    Stop {
        /// Axis name.
        axis: String,
        /// Acknowledgement.
        response: oneshot::Sender<AppResult<()>>,
    },

    /// Clear both suppression sets and restart polling.
    ResetSuppressions {
        /// What was cleared.
        response: oneshot::Sender<ResetSummary>,
    },

    /// Read the state of one axis.
    Snapshot {
        /// Axis name.
        axis: String,
        /// `None` until the axis has been polled or moved.
        response: oneshot::Sender<Option<AxisSnapshot>>,
    },

    /// Cancel every task and stop the actor.
    Shutdown {
        /// Sent once everything is cancelled.
        response: oneshot::Sender<()>,
    },
}

impl EngineCommand {
    /// Helper to create a Poll command
    pub fn poll(axis: String) -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::Poll { axis, response: tx }, rx)
    }

    /// Helper to create a PollAll command
    pub fn poll_all() -> (Self, oneshot::Receiver<Vec<String>>) {
        let (tx, rx) = oneshot::channel();
        (Self::PollAll { response: tx }, rx)
    }

    /// Helper to create a PollAxes command
    pub fn poll_axes(axes: Vec<String>) -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::PollAxes { axes, response: tx }, rx)
    }

    /// Helper to create a MoveAbsolute command
    pub fn move_absolute(
        axis: String,
        value: f64,
        mode: DisplayMode,
    ) -> (Self, oneshot::Receiver<AppResult<MoveTarget>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::MoveAbsolute {
                axis,
                value,
                mode,
                response: tx,
            },
            rx,
        )
    }

    /// Helper to create a MoveRelative command
    pub fn move_relative(
        axis: String,
        delta: f64,
        mode: DisplayMode,
        direction: Direction,
    ) -> (Self, oneshot::Receiver<AppResult<MoveTarget>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::MoveRelative {
                axis,
                delta,
                mode,
                direction,
                response: tx,
            },
            rx,
        )
    }

    /// Helper to create a Stop command
    pub fn stop(axis: String) -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::Stop { axis, response: tx }, rx)
    }

    /// Helper to create a ResetSuppressions command
    pub fn reset_suppressions() -> (Self, oneshot::Receiver<ResetSummary>) {
        let (tx, rx) = oneshot::channel();
        (Self::ResetSuppressions { response: tx }, rx)
    }

    /// Helper to create a Snapshot command
    pub fn snapshot(axis: String) -> (Self, oneshot::Receiver<Option<AxisSnapshot>>) {
        let (tx, rx) = oneshot::channel();
        (Self::Snapshot { axis, response: tx }, rx)
    }

    /// Helper to create a Shutdown command
    pub fn shutdown() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self::Shutdown { response: tx }, rx)
    }
}

/// Reports from tasks spawned by the actor.
#[derive(Debug)]
pub enum EngineEvent {
    /// A polling round finished its exchanges.
    RoundComplete {
        /// Task identity the round ran under.
        generation: u64,
        /// The round's parameters.
        request: PollRequest,
        /// What came back.
        report: RoundReport,
    },

    /// A reschedule delay elapsed.
    TimerFired {
        /// Task identity the timer belongs to.
        generation: u64,
        /// Round to run next.
        request: PollRequest,
        /// Only run if the axis is not errored by now.
        require_not_errored: bool,
    },

    /// The controller acknowledged a move.
    MoveConfirmed {
        /// Axis name.
        axis: String,
        /// Expected raw position.
        expected_raw: f64,
        /// Unit learned while reading the current position, if any.
        learned_unit: Option<Unit>,
    },
}

/// Error for a response channel whose sender was dropped.
pub(crate) fn stopped(_: oneshot::error::RecvError) -> AxisError {
    AxisError::EngineStopped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_request_helpers() {
        let request = PollRequest::after_move("x", 1000.0);
        assert!(request.post_move);
        assert_eq!(request.retry, 0);

        let next = request.next_retry().next_retry();
        assert_eq!(next.retry, 2);
        assert_eq!(next.expected_raw, Some(1000.0));
        assert!(next.post_move);

        let plain = PollRequest::plain("y");
        assert!(!plain.post_move);
        assert_eq!(plain.expected_raw, None);
    }

    #[tokio::test]
    async fn helpers_pair_command_with_receiver() {
        let (cmd, rx) = EngineCommand::stop("x".into());
        match cmd {
            EngineCommand::Stop { axis, response } => {
                assert_eq!(axis, "x");
                response.send(Ok(())).unwrap();
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(rx.await.unwrap().is_ok());

        let (cmd, rx) = EngineCommand::reset_suppressions();
        drop(cmd);
        assert!(matches!(rx.await.map_err(stopped), Err(AxisError::EngineStopped)));
    }
}
