//! Simulated motion controller.
//!
//! [`SimulatedController`] answers the controller protocol from an in-memory
//! axis table. It is used three ways:
//!
//! - directly, through [`SimulatedController::handle_line`];
//! - as an in-memory [`Transport`] via [`SimulatedTransport`], which serves
//!   each connection over a `tokio::io::duplex` pipe and records the order of
//!   requests and the peak number of simultaneously open connections;
//! - over TCP via [`serve`], for the `simulate` CLI command and end-to-end
//!   tests.
//!
//! # Motion model
//!
//! A move sets a target. The next `late_start` queries still report the axis
//! inactive at its old position (a controller that has not registered the
//! move yet). The following `settle_queries` queries report it moving; the
//! last of these lands it on the target.
//!
//! # Example
//!
//! ```rust,ignore
//! let controller = SimulatedController::new("bl_41in");
//! controller.add_pulse_axis("st2_coll_1_x", 500.0);
//! assert_eq!(
//!     controller.handle_line("get/bl_41in_st2_coll_1_x/query"),
//!     SimReply::Line("get/bl_41in_st2_coll_1_x/query/inactive_500pulse".into()),
//! );
//! ```

use crate::axis::Unit;
use crate::conversion::format_decimal;
use crate::error::{AppResult, AxisError};
use crate::protocol::split_unit;
use crate::transport::{Connection, Transport};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

/// How an axis answers a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyStyle {
    /// State and position in one field (`inactive_500pulse`, `moving_1.5deg`).
    Combined,
    /// `ok` or `active/0`, position only from the positional endpoint.
    Deferred,
    /// Physical value alone while at rest (`7.150mm`), combined while moving.
    Bare,
}

/// Failure injected for one axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    /// Read the request and never answer.
    Timeout,
    /// Close the connection without answering.
    Hangup,
    /// Answer with an undecodable line.
    Garbage,
}

/// What the simulator does with one request line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimReply {
    /// Send this line back.
    Line(String),
    /// Send nothing.
    Silent,
    /// Close the connection.
    Hangup,
}

#[derive(Debug, Clone)]
struct SimAxis {
    unit: Unit,
    style: ReplyStyle,
    position: f64,
    target: f64,
    late_queries: u32,
    moving_queries: u32,
    status: Option<u8>,
    failure: Option<Failure>,
    queries: u64,
}

impl SimAxis {
    fn new(position: f64, unit: Unit, style: ReplyStyle) -> Self {
        Self {
            unit,
            style,
            position,
            target: position,
            late_queries: 0,
            moving_queries: 0,
            status: Some(0),
            failure: None,
            queries: 0,
        }
    }

    /// Advance the motion model by one query and report the state token.
    fn step(&mut self) -> &'static str {
        self.queries += 1;
        if self.late_queries > 0 {
            self.late_queries -= 1;
            return "inactive";
        }
        if self.moving_queries > 0 {
            self.moving_queries -= 1;
            if self.moving_queries == 0 {
                self.position = self.target;
            } else {
                self.position += (self.target - self.position) / 2.0;
            }
            return "moving";
        }
        "inactive"
    }

    fn render_value(&self) -> String {
        if self.unit.is_physical() {
            format!("{}{}", format_decimal(self.position), self.unit)
        } else {
            format!("{}pulse", self.position.trunc() as i64)
        }
    }
}

#[derive(Debug, Default)]
struct ControllerState {
    axes: HashMap<String, SimAxis>,
    settle_queries: u32,
    late_start: u32,
    reply_delay: Duration,
}

/// In-memory controller. Cloning shares the same axis table.
#[derive(Debug, Clone)]
pub struct SimulatedController {
    device_object: Arc<str>,
    state: Arc<Mutex<ControllerState>>,
}

impl SimulatedController {
    /// Controller answering requests for `device_object`.
    pub fn new(device_object: &str) -> Self {
        Self {
            device_object: Arc::from(device_object),
            state: Arc::new(Mutex::new(ControllerState {
                settle_queries: 2,
                ..ControllerState::default()
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, ControllerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn with_axis<R>(&self, axis: &str, f: impl FnOnce(&mut SimAxis) -> R) -> Option<R> {
        self.state().axes.get_mut(axis).map(f)
    }

    /// Add a pulse axis answering in combined style.
    pub fn add_pulse_axis(&self, name: &str, position: f64) {
        self.add_axis(name, position, Unit::Pulse, ReplyStyle::Combined);
    }

    /// Add a physical axis answering in combined style.
    pub fn add_physical_axis(&self, name: &str, value: f64, unit: Unit) {
        self.add_axis(name, value, unit, ReplyStyle::Combined);
    }

    /// Add an axis that only reports its position from the positional endpoint.
    pub fn add_deferred_axis(&self, name: &str, value: f64, unit: Unit) {
        self.add_axis(name, value, unit, ReplyStyle::Deferred);
    }

    /// Add an axis with an explicit reply style.
    pub fn add_axis(&self, name: &str, position: f64, unit: Unit, style: ReplyStyle) {
        self.state()
            .axes
            .insert(name.to_string(), SimAxis::new(position, unit, style));
    }

    /// Number of queries an axis reports moving after a move.
    pub fn set_settle_queries(&self, queries: u32) {
        self.state().settle_queries = queries;
    }

    /// Number of queries an axis still reports inactive at its old position
    /// right after a move.
    pub fn set_late_start(&self, queries: u32) {
        self.state().late_start = queries;
    }

    /// Delay before each reply, applied by the stream servers.
    pub fn set_reply_delay(&self, delay: Duration) {
        self.state().reply_delay = delay;
    }

    /// Status bits for an axis; `None` makes status requests undecodable.
    pub fn set_status(&self, axis: &str, status: Option<u8>) {
        self.with_axis(axis, |a| a.status = status);
    }

    /// Inject or clear a failure for an axis.
    pub fn inject_failure(&self, axis: &str, failure: Option<Failure>) {
        self.with_axis(axis, |a| a.failure = failure);
    }

    /// Current position of an axis in its own unit.
    pub fn position(&self, axis: &str) -> Option<f64> {
        self.with_axis(axis, |a| a.position)
    }

    /// Queries answered so far for an axis.
    pub fn query_count(&self, axis: &str) -> u64 {
        self.with_axis(axis, |a| a.queries).unwrap_or(0)
    }

    fn reply_delay(&self) -> Duration {
        self.state().reply_delay
    }

    /// Answer one request line.
    pub fn handle_line(&self, line: &str) -> SimReply {
        let line = line.trim();
        let mut fields = line.splitn(3, '/');
        let (Some(verb), Some(target), Some(rest)) = (fields.next(), fields.next(), fields.next()) else {
            return SimReply::Line(format!("{line}/error"));
        };
        let prefix = format!("{}_", self.device_object);
        let Some(axis_name) = target.strip_prefix(&prefix) else {
            return SimReply::Line(format!("{line}/error"));
        };

        let mut state = self.state();
        let settle = state.settle_queries;
        let late_start = state.late_start;
        let Some(axis) = state.axes.get_mut(axis_name) else {
            return SimReply::Line(format!("{line}/error"));
        };

        match axis.failure {
            Some(Failure::Timeout) => return SimReply::Silent,
            Some(Failure::Hangup) => return SimReply::Hangup,
            Some(Failure::Garbage) => return SimReply::Line("#?!garbage".to_string()),
            None => {}
        }

        match (verb, rest) {
            ("get", "query") => {
                let token = axis.step();
                let reply = match (axis.style, token) {
                    (ReplyStyle::Bare, "inactive") => format!("{line}/{}", axis.render_value()),
                    (ReplyStyle::Combined | ReplyStyle::Bare, token) => {
                        format!("{line}/{token}_{}", axis.render_value())
                    }
                    (ReplyStyle::Deferred, "inactive") => format!("{line}/ok"),
                    (ReplyStyle::Deferred, _) => format!("get/{target}/active/0"),
                };
                SimReply::Line(reply)
            }
            ("get", "position" | "aperture" | "angle") => SimReply::Line(format!("{line}/{}", axis.render_value())),
            ("get", "status") => match axis.status {
                Some(bits) => SimReply::Line(format!("{line}/{bits}")),
                None => SimReply::Line(format!("{line}/none")),
            },
            ("put", "stop") => {
                axis.target = axis.position;
                axis.late_queries = 0;
                axis.moving_queries = 0;
                SimReply::Line(format!("{line}/0"))
            }
            ("put", value) => {
                let (number, unit) = split_unit(value);
                let accepted = unit.is_some_and(|u| u.is_physical() == axis.unit.is_physical());
                match number.parse::<f64>() {
                    Ok(target) if accepted => {
                        axis.target = target;
                        axis.late_queries = late_start;
                        axis.moving_queries = settle;
                        if settle == 0 {
                            axis.position = target;
                        }
                        SimReply::Line(format!("{line}/0"))
                    }
                    _ => SimReply::Line(format!("{line}/1")),
                }
            }
            _ => SimReply::Line(format!("{line}/error")),
        }
    }
}

/// Serve the protocol over one byte stream until the peer closes it.
pub async fn serve_stream<S>(controller: SimulatedController, stream: S, log: Option<Arc<Mutex<Vec<String>>>>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(err) => {
                debug!(target: "axis_tool::simulator", error = %err, "read failed");
                break;
            }
        }
        let request = line.trim().to_string();
        if let Some(log) = &log {
            log.lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push(request.clone());
        }
        let delay = controller.reply_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match controller.handle_line(&request) {
            SimReply::Line(reply) => {
                let writer = reader.get_mut();
                if writer.write_all(format!("{reply}\n").as_bytes()).await.is_err() {
                    break;
                }
                let _ = writer.flush().await;
            }
            SimReply::Silent => {}
            SimReply::Hangup => break,
        }
    }
}

/// Accept TCP connections forever and serve each one.
pub async fn serve(listener: TcpListener, controller: SimulatedController) -> std::io::Result<()> {
    info!(target: "axis_tool::simulator", address = %listener.local_addr()?, "simulated controller listening");
    loop {
        let (socket, peer) = listener.accept().await?;
        debug!(target: "axis_tool::simulator", %peer, "connection accepted");
        tokio::spawn(serve_stream(controller.clone(), socket, None));
    }
}

/// Decrements the open-connection count when the client side goes away.
struct OpenConnection {
    open: Arc<AtomicUsize>,
}

impl Drop for OpenConnection {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
    }
}

/// In-memory transport backed by a [`SimulatedController`].
#[derive(Debug)]
pub struct SimulatedTransport {
    controller: SimulatedController,
    timeout: Duration,
    refusing: AtomicBool,
    open: Arc<AtomicUsize>,
    peak_open: AtomicUsize,
    opened: AtomicUsize,
    log: Arc<Mutex<Vec<String>>>,
}

impl SimulatedTransport {
    /// Transport with a per-operation timeout.
    pub fn new(controller: SimulatedController, timeout: Duration) -> Self {
        Self {
            controller,
            timeout,
            refusing: AtomicBool::new(false),
            open: Arc::new(AtomicUsize::new(0)),
            peak_open: AtomicUsize::new(0),
            opened: AtomicUsize::new(0),
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// The controller behind this transport.
    pub fn controller(&self) -> &SimulatedController {
        &self.controller
    }

    /// Refuse every new connection while set.
    pub fn refuse_connections(&self, refuse: bool) {
        self.refusing.store(refuse, Ordering::SeqCst);
    }

    /// Every request line received, in arrival order.
    pub fn request_log(&self) -> Vec<String> {
        self.log
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Forget recorded requests.
    pub fn clear_log(&self) {
        self.log
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }

    /// Largest number of connections that were open at the same time.
    pub fn max_concurrent_connections(&self) -> usize {
        self.peak_open.load(Ordering::SeqCst)
    }

    /// Total connections opened.
    pub fn connections_opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for SimulatedTransport {
    async fn connect(&self) -> AppResult<Connection> {
        if self.refusing.load(Ordering::SeqCst) {
            warn!(target: "axis_tool::simulator", "refusing connection");
            return Err(AxisError::ConnectionRefused {
                endpoint: self.describe(),
                reason: "simulated refusal".to_string(),
            });
        }
        let (client, server) = tokio::io::duplex(4096);
        tokio::spawn(serve_stream(self.controller.clone(), server, Some(self.log.clone())));

        let now_open = self.open.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_open.fetch_max(now_open, Ordering::SeqCst);
        self.opened.fetch_add(1, Ordering::SeqCst);

        let lease = OpenConnection {
            open: self.open.clone(),
        };
        Ok(Connection::new(Box::new(client), self.timeout, self.describe()).with_lease(lease))
    }

    fn describe(&self) -> String {
        format!("simulator://{}", self.controller.device_object)
    }
}
