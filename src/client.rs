//! Device operations built from the codec and the exclusive channel.
//!
//! Each operation holds the channel lock for its whole exchange sequence and
//! nothing else. A position read that needs the positional fallback sends
//! both requests on the same connection under one lock hold, so no other
//! exchange can slip between them.

use crate::axis::Unit;
use crate::channel::ExclusiveChannel;
use crate::conversion::{CommandValue, DeviceReading, MotionState};
use crate::error::{AppResult, AxisError};
use crate::protocol::{self, PositionEndpoint, QueryReply, Request};
use crate::status::LimitFlags;
use tracing::{debug, instrument};

/// State and position from one read.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionRead {
    /// Motion state.
    pub state: MotionState,
    /// Reported position.
    pub reading: DeviceReading,
}

/// Client for one controller.
#[derive(Debug, Clone)]
pub struct ControllerClient {
    channel: ExclusiveChannel,
    device_object: String,
}

impl ControllerClient {
    /// Client addressing `device_object` (for example `bl_41in`) through `channel`.
    pub fn new(channel: ExclusiveChannel, device_object: impl Into<String>) -> Self {
        Self {
            channel,
            device_object: device_object.into(),
        }
    }

    /// Device object prefix used in every request.
    pub fn device_object(&self) -> &str {
        &self.device_object
    }

    /// Endpoint description.
    pub fn describe(&self) -> String {
        self.channel.describe()
    }

    /// Read state and position.
    ///
    /// `unit` is the unit currently cached for the axis. It picks the
    /// fallback endpoint and interprets a bare number in the fallback reply.
    #[instrument(skip(self), fields(object = %self.device_object))]
    pub async fn read_position(&self, axis: &str, unit: Unit) -> AppResult<PositionRead> {
        let mut session = self.channel.session().await?;

        let query = Request::Query.encode(&self.device_object, axis);
        debug!(target: "axis_tool::protocol", request = %query, "send");
        let reply = session.exchange(&query).await?;
        debug!(target: "axis_tool::protocol", response = %reply, "recv");

        match protocol::parse_query(&query, &reply)? {
            QueryReply::Reading { state, reading } => Ok(PositionRead { state, reading }),
            QueryReply::NeedsPosition { state } => {
                let endpoint = PositionEndpoint::for_axis(axis, unit);
                let request = Request::Position(endpoint).encode(&self.device_object, axis);
                debug!(target: "axis_tool::protocol", request = %request, "send");
                let reply = session.exchange(&request).await?;
                debug!(target: "axis_tool::protocol", response = %reply, "recv");
                let reading = protocol::parse_position(&request, &reply, unit)?;
                Ok(PositionRead { state, reading })
            }
        }
    }

    /// Read the limit-switch status.
    #[instrument(skip(self), fields(object = %self.device_object))]
    pub async fn read_status(&self, axis: &str) -> AppResult<(u8, LimitFlags)> {
        let mut session = self.channel.session().await?;
        let request = Request::Status.encode(&self.device_object, axis);
        debug!(target: "axis_tool::protocol", request = %request, "send");
        let reply = session.exchange(&request).await?;
        debug!(target: "axis_tool::protocol", response = %reply, "recv");
        protocol::parse_status(&request, &reply)
    }

    /// Send an absolute move.
    #[instrument(skip(self), fields(object = %self.device_object), err)]
    pub async fn move_to(&self, axis: &str, value: CommandValue) -> AppResult<()> {
        self.command(axis, Request::Move(value)).await
    }

    /// Stop an axis.
    #[instrument(skip(self), fields(object = %self.device_object), err)]
    pub async fn stop(&self, axis: &str) -> AppResult<()> {
        self.command(axis, Request::Stop).await
    }

    async fn command(&self, axis: &str, request: Request) -> AppResult<()> {
        let mut session = self.channel.session().await?;
        let line = request.encode(&self.device_object, axis);
        debug!(target: "axis_tool::protocol", request = %line, "send");
        let reply = session.exchange(&line).await?;
        debug!(target: "axis_tool::protocol", response = %reply, "recv");
        if protocol::is_acknowledged(&reply) {
            Ok(())
        } else {
            Err(AxisError::Rejected {
                request: line,
                response: reply,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::{Failure, SimulatedController, SimulatedTransport};
    use std::sync::Arc;
    use std::time::Duration;

    fn client_for(controller: &SimulatedController) -> (ControllerClient, Arc<SimulatedTransport>) {
        let transport = Arc::new(SimulatedTransport::new(controller.clone(), Duration::from_millis(100)));
        let client = ControllerClient::new(ExclusiveChannel::new(transport.clone()), "bl_41in");
        (client, transport)
    }

    #[tokio::test]
    async fn reads_combined_reply() {
        let controller = SimulatedController::new("bl_41in");
        controller.add_pulse_axis("st2_coll_1_x", 500.0);
        let (client, _) = client_for(&controller);

        let read = client.read_position("st2_coll_1_x", Unit::Pulse).await.unwrap();
        assert_eq!(read.state, MotionState::Inactive);
        assert_eq!(read.reading, DeviceReading::pulses(500.0));
    }

    #[tokio::test]
    async fn deferred_reply_uses_fallback_on_same_connection() {
        let controller = SimulatedController::new("bl_41in");
        controller.add_deferred_axis("slit_width", 2.5, Unit::Mm);
        let (client, transport) = client_for(&controller);

        let read = client.read_position("slit_width", Unit::Pulse).await.unwrap();
        assert_eq!(read.reading, DeviceReading::physical(2.5, Unit::Mm));
        assert_eq!(
            transport.request_log(),
            vec!["get/bl_41in_slit_width/query", "get/bl_41in_slit_width/aperture"]
        );
        assert_eq!(transport.connections_opened(), 1);
    }

    #[tokio::test]
    async fn move_and_stop_are_acknowledged() {
        let controller = SimulatedController::new("bl_41in");
        controller.add_pulse_axis("x", 0.0);
        let (client, transport) = client_for(&controller);

        client.move_to("x", CommandValue::Pulses(1500)).await.unwrap();
        client.stop("x").await.unwrap();
        assert_eq!(
            transport.request_log(),
            vec!["put/bl_41in_x/1500pulse", "put/bl_41in_x/stop"]
        );
    }

    #[tokio::test]
    async fn move_in_wrong_unit_is_rejected() {
        let controller = SimulatedController::new("bl_41in");
        controller.add_physical_axis("theta", 1.0, Unit::Deg);
        let (client, _) = client_for(&controller);

        let err = client.move_to("theta", CommandValue::Pulses(10)).await.unwrap_err();
        assert!(matches!(err, AxisError::Rejected { .. }));
    }

    #[tokio::test]
    async fn injected_failures_surface_as_communication_errors() {
        let controller = SimulatedController::new("bl_41in");
        controller.add_pulse_axis("x", 0.0);
        let (client, transport) = client_for(&controller);

        for failure in [Failure::Timeout, Failure::Hangup, Failure::Garbage] {
            controller.inject_failure("x", Some(failure));
            let err = client.read_position("x", Unit::Pulse).await.unwrap_err();
            assert!(err.is_communication_failure(), "{failure:?} gave {err}");
        }
        controller.inject_failure("x", None);
        assert!(client.read_position("x", Unit::Pulse).await.is_ok());

        transport.refuse_connections(true);
        let err = client.read_position("x", Unit::Pulse).await.unwrap_err();
        assert!(matches!(err, AxisError::ConnectionRefused { .. }));
    }

    #[tokio::test]
    async fn status_read_decodes_bits() {
        let controller = SimulatedController::new("bl_41in");
        controller.add_pulse_axis("x", 0.0);
        controller.set_status("x", Some(0b10101));
        let (client, _) = client_for(&controller);

        let (bits, flags) = client.read_status("x").await.unwrap();
        assert_eq!(bits, 21);
        assert!(flags.home);

        controller.set_status("x", None);
        assert!(client.read_status("x").await.is_err());
    }
}
