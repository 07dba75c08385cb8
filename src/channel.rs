//! Process-wide exclusive access to the controller.
//!
//! The protocol carries no request identifier, so at most one exchange may
//! be in flight against the controller at any time. [`ExclusiveChannel`]
//! pairs the transport with an async mutex; a [`ChannelSession`] holds the
//! mutex and one open connection for as long as it lives.
//!
//! Only the communication step holds the lock. Tasks waiting on it are
//! suspended without blocking the runtime.

use crate::error::AppResult;
use crate::transport::{Connection, Transport};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::trace;

/// Shared, lock-guarded access to the controller.
#[derive(Clone)]
pub struct ExclusiveChannel {
    transport: Arc<dyn Transport>,
    gate: Arc<Mutex<()>>,
}

impl std::fmt::Debug for ExclusiveChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExclusiveChannel")
            .field("transport", &self.transport.describe())
            .finish()
    }
}

impl ExclusiveChannel {
    /// Wrap a transport.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            gate: Arc::new(Mutex::new(())),
        }
    }

    /// Endpoint description.
    pub fn describe(&self) -> String {
        self.transport.describe()
    }

    /// Acquire the lock, then open a connection.
    ///
    /// The lock is released when the returned session is dropped, after its
    /// connection has been closed.
    pub async fn session(&self) -> AppResult<ChannelSession<'_>> {
        let guard = self.gate.lock().await;
        trace!(target: "axis_tool::channel", "channel lock acquired");
        let connection = self.transport.connect().await?;
        Ok(ChannelSession {
            connection,
            _guard: guard,
        })
    }
}

/// An open connection plus the channel lock.
///
/// Field order matters: the connection is dropped before the guard, so the
/// next holder never overlaps with a connection that is still closing.
pub struct ChannelSession<'a> {
    connection: Connection,
    _guard: MutexGuard<'a, ()>,
}

impl ChannelSession<'_> {
    /// Send one request line and read one reply line.
    pub async fn exchange(&mut self, request: &str) -> AppResult<String> {
        self.connection.exchange(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::{SimulatedController, SimulatedTransport};
    use std::time::Duration;

    #[tokio::test]
    async fn sessions_never_overlap() {
        let controller = SimulatedController::new("bl_41in");
        controller.add_pulse_axis("x", 0.0);
        controller.add_pulse_axis("y", 0.0);
        let transport = Arc::new(SimulatedTransport::new(controller, Duration::from_millis(500)));
        let channel = ExclusiveChannel::new(transport.clone());

        let mut tasks = Vec::new();
        for axis in ["x", "y", "x", "y", "x", "y"] {
            let channel = channel.clone();
            tasks.push(tokio::spawn(async move {
                let mut session = channel.session().await.unwrap();
                session
                    .exchange(&format!("get/bl_41in_{axis}/query"))
                    .await
                    .unwrap();
                tokio::task::yield_now().await;
                session
                    .exchange(&format!("get/bl_41in_{axis}/status"))
                    .await
                    .unwrap()
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(transport.max_concurrent_connections(), 1);
        let log = transport.request_log();
        assert_eq!(log.len(), 12);
        // Each query is immediately followed by the status request of the same axis.
        for pair in log.chunks(2) {
            let axis = pair[0].trim_end_matches("/query");
            assert_eq!(pair[1], format!("{axis}/status"));
        }
    }
}
