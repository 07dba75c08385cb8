//! Polling engine behaviour against the in-memory simulated controller.

use axis_tool::axis::{AxisDefinition, Sense, Unit};
use axis_tool::channel::ExclusiveChannel;
use axis_tool::client::ControllerClient;
use axis_tool::conversion::{Direction, DisplayMode, MotionState};
use axis_tool::messages::AxisUpdate;
use axis_tool::scheduler::{AxisEngine, PollingConfig};
use axis_tool::simulator::{Failure, SimulatedController, SimulatedTransport};
use axis_tool::AxisError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

struct Harness {
    controller: SimulatedController,
    transport: Arc<SimulatedTransport>,
    engine: AxisEngine,
}

fn fast_config() -> PollingConfig {
    PollingConfig {
        moving_interval: Duration::from_millis(5),
        error_interval: Duration::from_millis(20),
        confirm_delay: Duration::from_millis(5),
        confirm_max_retries: 3,
        confirm_tolerance: 10.0,
    }
}

fn harness(controller: SimulatedController, definitions: Vec<AxisDefinition>) -> Harness {
    let transport = Arc::new(SimulatedTransport::new(controller.clone(), Duration::from_millis(200)));
    let client = ControllerClient::new(ExclusiveChannel::new(transport.clone()), "bl_41in");
    let engine = AxisEngine::spawn(definitions, client, fast_config()).unwrap();
    Harness {
        controller,
        transport,
        engine,
    }
}

fn pulse_axes(names: &[&str]) -> Vec<AxisDefinition> {
    names.iter().map(|name| AxisDefinition::with_defaults(*name)).collect()
}

async fn next_update(rx: &mut broadcast::Receiver<AxisUpdate>) -> AxisUpdate {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for an update")
        .expect("update channel closed")
}

/// Updates for `axis` up to and including the first inactive one.
async fn until_idle(rx: &mut broadcast::Receiver<AxisUpdate>, axis: &str) -> Vec<AxisUpdate> {
    let mut seen = Vec::new();
    loop {
        let update = next_update(rx).await;
        if update.axis != axis {
            continue;
        }
        let idle = update.outcome.state.is_inactive();
        seen.push(update);
        if idle {
            return seen;
        }
    }
}

async fn assert_quiet(rx: &mut broadcast::Receiver<AxisUpdate>) {
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(rx.try_recv().is_err(), "unexpected update");
}

#[tokio::test]
async fn test_newer_poll_supersedes_older() {
    let controller = SimulatedController::new("bl_41in");
    controller.add_pulse_axis("x", 100.0);
    controller.set_reply_delay(Duration::from_millis(30));
    let h = harness(controller, pulse_axes(&["x"]));
    let mut rx = h.engine.subscribe();

    h.engine.poll("x").await.unwrap();
    h.engine.poll("x").await.unwrap();

    let update = next_update(&mut rx).await;
    assert_eq!(update.generation, 2);
    assert_eq!(update.outcome.raw_position, 100.0);
    assert_quiet(&mut rx).await;
}

#[tokio::test]
async fn test_post_move_confirmation_stops_after_max_retries() {
    let controller = SimulatedController::new("bl_41in");
    controller.add_pulse_axis("x", 500.0);
    controller.set_late_start(10);
    controller.set_settle_queries(1);
    let h = harness(controller, pulse_axes(&["x"]));
    let mut rx = h.engine.subscribe();

    let target = h.engine.move_absolute("x", 1000.0, DisplayMode::Pulse).await.unwrap();
    assert_eq!(target.expected_raw, 1000.0);

    // One post-move round plus three confirmation retries, all still at
    // the old position because the controller has not started moving.
    for _ in 0..4 {
        let update = next_update(&mut rx).await;
        assert_eq!(update.outcome.state, MotionState::Inactive);
        assert_eq!(update.outcome.raw_position, 500.0);
    }
    assert_quiet(&mut rx).await;
    assert_eq!(h.controller.query_count("x"), 4);

    let snapshot = h.engine.snapshot("x").await.unwrap().unwrap();
    assert!(!snapshot.polling);
    assert!(!snapshot.errored);
}

#[tokio::test]
async fn test_confirmation_hands_over_to_moving_polls() {
    let controller = SimulatedController::new("bl_41in");
    controller.add_pulse_axis("x", 0.0);
    controller.set_late_start(1);
    controller.set_settle_queries(1);
    let h = harness(controller, pulse_axes(&["x"]));
    let mut rx = h.engine.subscribe();

    h.engine.move_absolute("x", 2000.0, DisplayMode::Pulse).await.unwrap();
    let updates = until_idle(&mut rx, "x").await;
    let seen: Vec<_> = updates
        .iter()
        .map(|u| (u.outcome.state.is_moving(), u.outcome.raw_position))
        .collect();
    assert_eq!(seen, vec![(false, 0.0), (true, 2000.0), (false, 2000.0)]);
    assert_quiet(&mut rx).await;
    assert_eq!(h.controller.query_count("x"), 3);
}

#[tokio::test]
async fn test_errored_axis_is_suppressed_until_move() {
    let controller = SimulatedController::new("bl_41in");
    controller.add_pulse_axis("x", 10.0);
    controller.set_settle_queries(0);
    controller.inject_failure("x", Some(Failure::Garbage));
    let h = harness(controller, pulse_axes(&["x"]));
    let mut rx = h.engine.subscribe();

    h.engine.poll("x").await.unwrap();
    let failed = next_update(&mut rx).await;
    assert!(failed.outcome.communication_failed);

    h.engine.poll("x").await.unwrap();
    h.engine.poll_all().await.unwrap();
    assert_quiet(&mut rx).await;

    h.controller.inject_failure("x", None);
    h.engine.move_absolute("x", 40.0, DisplayMode::Pulse).await.unwrap();
    let update = next_update(&mut rx).await;
    assert!(!update.outcome.communication_failed);
    assert_eq!(update.outcome.raw_position, 40.0);
    assert!(!h.engine.snapshot("x").await.unwrap().unwrap().errored);
}

#[tokio::test]
async fn test_reset_clears_both_sets_and_restarts_observed_axes() {
    let controller = SimulatedController::new("bl_41in");
    controller.add_pulse_axis("x", 1.0);
    controller.add_pulse_axis("y", 2.0);
    controller.add_pulse_axis("z", 3.0);
    controller.inject_failure("x", Some(Failure::Timeout));
    controller.set_status("y", None);
    let h = harness(controller, pulse_axes(&["x", "y", "z"]));
    let mut rx = h.engine.subscribe();

    h.engine.poll_axes(&["x", "y"]).await.unwrap();
    let mut first = vec![next_update(&mut rx).await, next_update(&mut rx).await];
    first.sort_by(|a, b| a.axis.cmp(&b.axis));
    assert!(first[0].outcome.communication_failed);
    assert!(!first[1].outcome.communication_failed);

    h.controller.inject_failure("x", None);
    h.controller.set_status("y", Some(16));
    let summary = h.engine.reset_suppressions().await.unwrap();
    assert_eq!(summary.errored, vec!["x"]);
    assert_eq!(summary.status_disabled, vec!["y"]);
    assert_eq!(summary.restarted, vec!["x", "y"]);

    let mut second = vec![next_update(&mut rx).await, next_update(&mut rx).await];
    second.sort_by(|a, b| a.axis.cmp(&b.axis));
    assert!(!second[0].outcome.communication_failed);
    assert!(second[1].limits.home);

    let z = h.engine.snapshot("z").await.unwrap();
    assert!(z.is_none());
}

#[tokio::test]
async fn test_status_disabled_axis_reports_clear_limits() {
    let controller = SimulatedController::new("bl_41in");
    controller.add_pulse_axis("x", 0.0);
    controller.set_status("x", Some(40));
    let h = harness(controller, pulse_axes(&["x"]));
    let mut rx = h.engine.subscribe();

    h.engine.poll("x").await.unwrap();
    let update = next_update(&mut rx).await;
    assert!(!update.outcome.communication_failed);
    assert_eq!(update.status_bits, 0);
    assert!(!update.limits.any_limit());

    let snapshot = h.engine.snapshot("x").await.unwrap().unwrap();
    assert!(snapshot.status_disabled);
    assert!(!snapshot.errored);
}

#[tokio::test]
async fn test_concurrent_moves_never_overlap_on_the_channel() {
    let controller = SimulatedController::new("bl_41in");
    let names = ["a", "b", "c", "d", "e"];
    for name in names {
        controller.add_pulse_axis(name, 0.0);
    }
    controller.set_settle_queries(3);
    let h = harness(controller, pulse_axes(&names));
    let mut rx = h.engine.subscribe();

    let moves = names
        .iter()
        .enumerate()
        .map(|(i, name)| h.engine.move_absolute(name, 100.0 * (i as f64 + 1.0), DisplayMode::Pulse));
    for result in futures::future::join_all(moves).await {
        result.unwrap();
    }

    let mut idle = std::collections::HashSet::new();
    while idle.len() < names.len() {
        let update = next_update(&mut rx).await;
        if update.outcome.state.is_inactive() {
            idle.insert(update.axis.clone());
        }
    }
    assert_eq!(h.transport.max_concurrent_connections(), 1);
    for (i, name) in names.iter().enumerate() {
        assert_eq!(h.controller.position(name), Some(100.0 * (i as f64 + 1.0)));
    }
}

#[tokio::test]
async fn test_relative_moves_start_from_device_position() {
    let controller = SimulatedController::new("bl_41in");
    controller.add_pulse_axis("x", 1000.0);
    controller.add_physical_axis("gap", 2.0, Unit::Mm);
    controller.set_settle_queries(0);
    let gap = AxisDefinition::new("gap", "Gap", 1000.0, Sense::Negative, Unit::Mm).unwrap();
    let mut definitions = pulse_axes(&["x"]);
    definitions.push(gap);
    let h = harness(controller, definitions);
    let mut rx = h.engine.subscribe();

    let target = h
        .engine
        .move_relative("x", 250.0, DisplayMode::Pulse, Direction::Minus)
        .await
        .unwrap();
    assert_eq!(target.command.wire_value(), "750pulse");
    until_idle(&mut rx, "x").await;

    let target = h
        .engine
        .move_relative("x", 0.5, DisplayMode::Physical, Direction::Plus)
        .await
        .unwrap();
    assert_eq!(target.command.wire_value(), "1250pulse");
    until_idle(&mut rx, "x").await;
    assert_eq!(h.controller.position("x"), Some(1250.0));

    let target = h
        .engine
        .move_relative("gap", 0.5, DisplayMode::Physical, Direction::Plus)
        .await
        .unwrap();
    assert_eq!(target.command.wire_value(), "1.5mm");
    let updates = until_idle(&mut rx, "gap").await;
    assert_eq!(updates.last().unwrap().unit, Unit::Mm);
    assert_eq!(h.controller.position("gap"), Some(1.5));
}

#[tokio::test]
async fn test_relative_move_fails_when_position_unreadable() {
    let controller = SimulatedController::new("bl_41in");
    controller.add_pulse_axis("x", 0.0);
    controller.inject_failure("x", Some(Failure::Hangup));
    let h = harness(controller, pulse_axes(&["x"]));

    let err = h
        .engine
        .move_relative("x", 1.0, DisplayMode::Pulse, Direction::Plus)
        .await
        .unwrap_err();
    assert!(err.is_communication_failure());
    assert!(!h.transport.request_log().iter().any(|line| line.starts_with("put/")));
}

#[tokio::test]
async fn test_stop_halts_a_moving_axis() {
    let controller = SimulatedController::new("bl_41in");
    controller.add_pulse_axis("x", 0.0);
    controller.set_settle_queries(1000);
    let h = harness(controller, pulse_axes(&["x"]));
    let mut rx = h.engine.subscribe();

    h.engine.move_absolute("x", 1.0e6, DisplayMode::Pulse).await.unwrap();
    let moving = next_update(&mut rx).await;
    assert!(moving.outcome.state.is_moving());

    h.engine.stop("x").await.unwrap();
    let updates = until_idle(&mut rx, "x").await;
    let stopped_at = updates.last().unwrap().outcome.raw_position;
    assert!(stopped_at < 1.0e6);
    assert!(h.transport.request_log().contains(&"put/bl_41in_x/stop".to_string()));
}

#[tokio::test]
async fn test_deferred_axis_uses_positional_fallback() {
    let controller = SimulatedController::new("bl_41in");
    controller.add_deferred_axis("slit_width", 2.5, Unit::Mm);
    let h = harness(controller, pulse_axes(&["slit_width"]));
    let mut rx = h.engine.subscribe();

    h.engine.poll("slit_width").await.unwrap();
    let update = next_update(&mut rx).await;
    assert_eq!(update.unit, Unit::Mm);
    assert_eq!(update.outcome.physical_position, 2.5);
    assert_eq!(update.outcome.raw_position, 2500.0);
    assert_eq!(
        h.transport.request_log(),
        vec![
            "get/bl_41in_slit_width/query",
            "get/bl_41in_slit_width/aperture",
            "get/bl_41in_slit_width/status",
        ]
    );
}

#[tokio::test]
async fn test_unknown_axes_are_rejected() {
    let controller = SimulatedController::new("bl_41in");
    controller.add_pulse_axis("x", 0.0);
    let h = harness(controller, pulse_axes(&["x"]));

    assert!(matches!(h.engine.poll("nope").await, Err(AxisError::UnknownAxis(_))));
    assert!(matches!(
        h.engine.poll_axes(&["x", "nope"]).await,
        Err(AxisError::UnknownAxis(_))
    ));
    assert!(matches!(
        h.engine
            .move_relative("nope", 1.0, DisplayMode::Pulse, Direction::Plus)
            .await,
        Err(AxisError::UnknownAxis(_))
    ));
    // Nothing was started for the known axis either.
    assert!(h.engine.snapshot("x").await.unwrap().is_none());
}

#[tokio::test]
async fn test_dropping_every_handle_stops_the_engine() {
    let controller = SimulatedController::new("bl_41in");
    controller.add_pulse_axis("x", 0.0);
    let h = harness(controller, pulse_axes(&["x"]));
    let mut rx = h.engine.subscribe();
    drop(h.engine);

    let closed = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
    assert!(matches!(closed, Err(broadcast::error::RecvError::Closed)));
}
