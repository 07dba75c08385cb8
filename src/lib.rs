//! # axis-tool
//!
//! Communication and polling engine for beamline motion axes driven by a
//! line-oriented controller (`get/bl_41in_<axis>/query`, `put/.../1500pulse`).
//!
//! ## Crate Structure
//!
//! - **`axis`**: axis definitions, units, sense and the engine-side per-axis state.
//! - **`status`**: decoding of the 5-bit limit-switch status.
//! - **`conversion`**: pulse/physical conversion, move-target resolution and
//!   position formatting.
//! - **`protocol`**: request encoding and reply decoding.
//! - **`transport`**: the `Transport` trait, `Connection` and the TCP implementation.
//! - **`channel`**: the process-wide lock that serialises every exchange.
//! - **`client`**: device operations (read position, read status, move, stop).
//! - **`messages`**: commands and events of the polling engine.
//! - **`scheduler`**: the polling engine actor and its `AxisEngine` handle.
//! - **`config`**, **`bss`**, **`groups`**: configuration, beamline bss.config
//!   and YAML axis groups.
//! - **`logging`**: tracing initialisation.
//! - **`simulator`**: an in-memory and TCP controller for tests and demos.
//! - **`error`**: the `AxisError` type.
//!
//! ## Example
//!
//! ```no_run
//! use axis_tool::axis::AxisDefinition;
//! use axis_tool::channel::ExclusiveChannel;
//! use axis_tool::client::ControllerClient;
//! use axis_tool::scheduler::{AxisEngine, PollingConfig};
//! use axis_tool::transport::TcpTransport;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn run() -> axis_tool::error::AppResult<()> {
//! let transport = TcpTransport::new("10.178.215.3", 10101, Duration::from_secs(2));
//! let client = ControllerClient::new(ExclusiveChannel::new(Arc::new(transport)), "bl_41in");
//! let engine = AxisEngine::spawn(
//!     [AxisDefinition::with_defaults("st2_coll_1_x")],
//!     client,
//!     PollingConfig::default(),
//! )?;
//!
//! let mut updates = engine.subscribe();
//! engine.poll("st2_coll_1_x").await?;
//! if let Ok(update) = updates.recv().await {
//!     println!("{} at {} pulse", update.axis, update.outcome.raw_position);
//! }
//! # Ok(())
//! # }
//! ```

pub mod axis;
pub mod bss;
pub mod channel;
pub mod client;
pub mod config;
pub mod conversion;
pub mod error;
pub mod groups;
pub mod logging;
pub mod messages;
pub mod protocol;
pub mod scheduler;
pub mod simulator;
pub mod status;
pub mod transport;

pub use error::{AppResult, AxisError};
pub use scheduler::{AxisEngine, PollingConfig};
