//! Integration tests for a single controller session.
//!
//! Each test plays the controller over an in-memory duplex link: the session
//! writes JSON lines to the device end and the test answers like firmware
//! would (or deliberately does not).

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use ledlink_core::protocol::messages::DriverChannels;
use ledlink_core::{ControllerInput, DeviceCommand, Direction, LinkState};
use ledlink_host::application::registry_store::RegistryStore;
use ledlink_host::application::session::{spawn_session, PollingAck, SessionConfig, SessionError, SessionHandle};
use ledlink_host::infrastructure::transport::mock::{DeviceEnd, DuplexConnector};

struct Harness {
    handle: SessionHandle,
    devices: mpsc::UnboundedReceiver<DeviceEnd>,
    connector: Arc<DuplexConnector>,
    store: RegistryStore,
    cancel: CancellationToken,
}

async fn start(config: SessionConfig) -> Harness {
    let store = RegistryStore::default();
    store
        .seed_controllers([ControllerInput {
            id: Some("c".into()),
            ..Default::default()
        }])
        .await
        .expect("seed");
    let (connector, devices) = DuplexConnector::new("c");
    let connector = Arc::new(connector);
    let cancel = CancellationToken::new();
    let (handle, _task) = spawn_session(
        "c",
        connector.clone(),
        store.clone(),
        config,
        None,
        cancel.clone(),
    );
    Harness {
        handle,
        devices,
        connector,
        store,
        cancel,
    }
}

fn pwm_command() -> DeviceCommand {
    DeviceCommand::LedPwm {
        pwm: 40,
        drivers: vec![DriverChannels { driver: 0, channels: vec![1] }],
    }
}

#[tokio::test]
async fn test_acknowledged_command_resolves_with_reply() {
    // Arrange
    let mut h = start(SessionConfig::default()).await;
    let mut device = h.devices.recv().await.expect("device end");
    let session = h.handle.clone();
    let call = tokio::spawn(async move { session.execute(pwm_command()).await });

    // Act
    let sent = device.recv().await.expect("read").expect("frame");
    device.send(&json!({"t": "ok"})).await.expect("reply");
    let ack = call.await.expect("join").expect("ack");

    // Assert
    assert_eq!(sent, json!({"cm": "led", "a": "pwm", "drvs": [{"dvr": 0, "cs": [1]}], "pwm": 40}));
    assert_eq!(ack.command, "led.pwm");
    h.cancel.cancel();
}

#[tokio::test]
async fn test_two_rapid_poll_toggles_are_served_in_order() {
    // Arrange
    let h = start(SessionConfig::default()).await;
    h.handle
        .wait_for_link(LinkState::is_up)
        .await
        .expect("link up");

    // Act
    let (first, second) = tokio::join!(h.handle.set_polling(true), h.handle.set_polling(false));

    // Assert
    assert_eq!(first, Ok(PollingAck { previous: false, enabled: true }));
    assert_eq!(second, Ok(PollingAck { previous: true, enabled: false }));
    let reg = h.store.read().await;
    assert!(reg.controller("c").is_some_and(|c| !c.polling_enabled));
    h.cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_silent_controller_times_out() {
    // Arrange
    let mut h = start(SessionConfig {
        command_timeout: Duration::from_secs(2),
        ..SessionConfig::default()
    })
    .await;
    let _device = h.devices.recv().await.expect("device end");

    // Act
    let result = h.handle.execute(pwm_command()).await;

    // Assert
    assert_eq!(
        result.map(|a| a.command),
        Err(SessionError::CommandTimeout {
            command: "led.pwm",
            timeout_ms: 2_000,
        })
    );
    h.cancel.cancel();
}

#[tokio::test]
async fn test_channel_events_settle_led_command() {
    // Arrange
    let mut h = start(SessionConfig::default()).await;
    let mut device = h.devices.recv().await.expect("device end");
    let session = h.handle.clone();
    let call = tokio::spawn(async move {
        session
            .execute(DeviceCommand::LedPwm {
                pwm: 40,
                drivers: vec![DriverChannels { driver: 0, channels: vec![0, 1] }],
            })
            .await
    });

    // Act
    device.recv().await.expect("read").expect("frame");
    for channel in [0, 1] {
        device
            .send(&json!({"t": "event", "ev": "led.channel_state", "dvr": 0, "c": channel, "level": 1, "pwm": 40}))
            .await
            .expect("event");
    }
    let ack = call.await.expect("join").expect("ack");

    // Assert
    assert_eq!(ack.reply, None);
    h.cancel.cancel();
}

#[tokio::test]
async fn test_corrupt_line_is_skipped_and_link_stays_up() {
    // Arrange
    let mut h = start(SessionConfig::default()).await;
    let mut device = h.devices.recv().await.expect("device end");
    let session = h.handle.clone();
    let call = tokio::spawn(async move { session.execute(pwm_command()).await });

    // Act
    device.recv().await.expect("read").expect("frame");
    device.send_raw(b"{\"t\":\"ok\",\x01garbage\r\n").await.expect("garbage");
    device.send(&json!({"t": "ok"})).await.expect("reply");
    let result = call.await.expect("join");

    // Assert
    assert!(result.is_ok(), "got {result:?}");
    assert!(h.handle.link_state().is_up());
    let log = h.handle.log_entries();
    assert!(log.iter().any(|e| e.direction == Direction::Tx));
    assert!(log.iter().any(|e| e.direction == Direction::Rx));
    h.cancel.cancel();
}

#[tokio::test]
async fn test_device_error_reply_is_a_rejection() {
    let mut h = start(SessionConfig::default()).await;
    let mut device = h.devices.recv().await.expect("device end");
    let session = h.handle.clone();
    let call = tokio::spawn(async move { session.execute(pwm_command()).await });

    device.recv().await.expect("read").expect("frame");
    device
        .send(&json!({"t": "error", "reason": "driver offline"}))
        .await
        .expect("reply");

    assert_eq!(
        call.await.expect("join").map(|a| a.command),
        Err(SessionError::Rejected {
            command: "led.pwm",
            reason: "driver offline".into(),
        })
    );
    h.cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_reconnects_after_refusals_and_link_loss() {
    // Arrange
    let mut h = start(SessionConfig::default()).await;
    let first = h.devices.recv().await.expect("device end");
    h.handle
        .wait_for_link(LinkState::is_up)
        .await
        .expect("link up");
    h.connector.refuse_next(2);

    // Act: the device hangs up, two reconnects are refused, the third works.
    drop(first);
    h.handle
        .wait_for_link(|s| s == LinkState::Disconnected)
        .await
        .expect("down");
    let _second = h.devices.recv().await.expect("second device end");
    let state = h
        .handle
        .wait_for_link(LinkState::is_up)
        .await
        .expect("link back up");

    // Assert
    assert_eq!(state, LinkState::Connected);
    let reg = h.store.read().await;
    assert_eq!(reg.controller("c").map(|c| c.status.link), Some(LinkState::Connected));
    h.cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_commands_are_refused_while_disconnected() {
    // Arrange
    let mut h = start(SessionConfig::default()).await;
    let first = h.devices.recv().await.expect("device end");
    h.handle
        .wait_for_link(LinkState::is_up)
        .await
        .expect("link up");
    h.connector.refuse_next(usize::MAX);

    // Act
    drop(first);
    h.handle
        .wait_for_link(|s| s == LinkState::Disconnected)
        .await
        .expect("down");
    let result = h.handle.execute(pwm_command()).await;
    let polling = h.handle.set_polling(true).await;

    // Assert
    assert!(matches!(result, Err(SessionError::LinkDown { .. })));
    assert_eq!(polling, Ok(PollingAck { previous: false, enabled: true }));
    h.cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_poll_holds_the_slot_until_status_reply() {
    // Arrange
    let mut h = start(SessionConfig {
        poll_interval: Duration::from_millis(100),
        ..SessionConfig::default()
    })
    .await;
    let mut device = h.devices.recv().await.expect("device end");
    h.handle.set_polling(true).await.expect("polling on");
    let poll = device.recv().await.expect("read").expect("frame");
    let session = h.handle.clone();
    let call = tokio::spawn(async move { session.execute(pwm_command()).await });

    // Act: leave the poll unanswered for a while, then answer it.
    let early = tokio::time::timeout(Duration::from_millis(50), device.recv()).await;
    device.send(&json!({"t": "status"})).await.expect("status");
    let sent = device.recv().await.expect("read").expect("frame");
    device.send(&json!({"t": "ok"})).await.expect("reply");

    // Assert
    assert_eq!(poll, json!({"cm": "status"}));
    assert!(early.is_err(), "command written while the poll was unanswered");
    assert_eq!(sent["a"], "pwm");
    assert!(call.await.expect("join").is_ok());
    h.cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_late_reply_after_timeout_does_not_settle_next_command() {
    // Arrange
    let mut h = start(SessionConfig {
        command_timeout: Duration::from_secs(2),
        ..SessionConfig::default()
    })
    .await;
    let mut device = h.devices.recv().await.expect("device end");
    let session = h.handle.clone();
    let first = tokio::spawn(async move { session.execute(pwm_command()).await });
    device.recv().await.expect("read").expect("frame");
    let first = first.await.expect("join");
    let session = h.handle.clone();
    let second = tokio::spawn(async move {
        session
            .execute(DeviceCommand::LedPwm {
                pwm: 90,
                drivers: vec![DriverChannels { driver: 0, channels: vec![2] }],
            })
            .await
    });

    // Act: the first command's reply turns up after its timeout.
    device.send(&json!({"t": "ok", "n": 1})).await.expect("late reply");
    let sent = device.recv().await.expect("read").expect("frame");
    let still_waiting = !second.is_finished();
    device.send(&json!({"t": "ok", "n": 2})).await.expect("reply");
    let ack = second.await.expect("join").expect("ack");

    // Assert
    assert!(matches!(first, Err(SessionError::CommandTimeout { .. })));
    assert_eq!(sent["pwm"], 90);
    assert!(still_waiting);
    assert_eq!(ack.reply, Some(json!({"t": "ok", "n": 2})));
    h.cancel.cancel();
}
