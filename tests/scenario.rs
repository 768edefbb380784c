use padhub::config::{DriverSettings, SessionSettings};
use padhub::driver::hid::mock::{MockHidPort, MockPad};
use padhub::driver::{DeviceDriver, HidPort};
use padhub::protocol::{PadConfigurationReport, ReportCodec};
use padhub::session::{
    ChannelTransport, ClientCommand, DeviceDescription, ServerMessage, SessionEngine,
};
use padhub::signal::LinearizationTable;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

fn driver_settings() -> DriverSettings {
    DriverSettings {
        button_count: 2,
        sensor_count: 4,
        connect_grace_ms: 0,
        scan_interval_ms: 20,
        write_gap_ms: 1,
        read_timeout_ms: 2,
        event_rate_interval_ms: 200,
        ..DriverSettings::default()
    }
}

fn pad(table: &LinearizationTable) -> MockPad {
    let configuration = PadConfigurationReport {
        sensor_thresholds: vec![table.unit_to_raw(0.5); 4],
        release_threshold: 0.8,
        sensor_to_button_mapping: vec![0, 1, 0, 1],
    };
    MockPad::new("/dev/hidraw0", ReportCodec::new(4), &configuration, "front pad").unwrap()
}

async fn next_matching(
    rx: &mut mpsc::Receiver<ServerMessage>,
    wanted: impl Fn(&ServerMessage) -> bool,
) -> ServerMessage {
    timeout(Duration::from_secs(3), async {
        loop {
            match rx.recv().await {
                Some(message) if wanted(&message) => return message,
                Some(_) => continue,
                None => panic!("peer channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for message")
}

async fn devices_updated(
    rx: &mut mpsc::Receiver<ServerMessage>,
    wanted: impl Fn(&[DeviceDescription]) -> bool,
) -> Vec<DeviceDescription> {
    match next_matching(rx, |m| {
        matches!(m, ServerMessage::DevicesUpdated { devices } if wanted(devices))
    })
    .await
    {
        ServerMessage::DevicesUpdated { devices } => devices,
        _ => unreachable!(),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pad_lifecycle_through_session() {
    let table = Arc::new(LinearizationTable::default());
    let pad = pad(&table);
    let mock = MockHidPort::new();
    mock.add(pad.clone());
    let port: Arc<dyn HidPort> = Arc::new(mock);

    let transport = Arc::new(ChannelTransport::new(256));
    let (engine, session) = SessionEngine::new(transport.clone(), SessionSettings::default());
    let (driver_tx, driver_rx) = mpsc::channel(8);
    let driver = DeviceDriver::spawn(port, driver_settings(), table.clone(), driver_tx);
    let engine_task = tokio::spawn(engine.run(driver_rx));

    let (peer, mut rx) = transport.connect();
    session.peer_connected(peer).await.unwrap();

    let devices = devices_updated(&mut rx, |d| d.len() == 1).await;
    let device_id = devices[0].id.clone();
    assert_eq!(device_id, "teensy2:/dev/hidraw0#1");
    assert_eq!(devices[0].configuration.name, "front pad");

    session
        .command(
            peer,
            ClientCommand::SubscribeToDevice {
                device_id: device_id.clone(),
            },
        )
        .await
        .unwrap();
    // subscription is processed before anything queued after it
    session.describe_devices().await.unwrap();

    pad.queue_sensor_values(0b0001, &[1023, 0, 0, 0]);
    match next_matching(&mut rx, |m| matches!(m, ServerMessage::InputEvent { .. })).await {
        ServerMessage::InputEvent {
            device_id: id,
            input_data,
        } => {
            assert_eq!(id, device_id);
            assert_eq!(input_data.buttons, vec![true, false]);
            assert!((input_data.sensors[0] - 1.0).abs() < 1e-9);
        }
        _ => unreachable!(),
    }
    next_matching(&mut rx, |m| matches!(m, ServerMessage::EventRate { .. })).await;

    session
        .command(
            peer,
            ClientCommand::UpdateSensorThreshold {
                device_id: device_id.clone(),
                sensor_index: 0,
                new_threshold: 0.7,
            },
        )
        .await
        .unwrap();
    let described = session.describe_devices().await.unwrap();
    let thresholds = &described[0].configuration.sensor_thresholds;
    assert_eq!(thresholds[0], 0.7);
    assert_eq!(&thresholds[1..], &devices[0].configuration.sensor_thresholds[1..]);

    pad.unplug();
    devices_updated(&mut rx, |d| d.is_empty()).await;
    assert_eq!(pad.open_handles(), 0);

    session
        .command(
            peer,
            ClientCommand::SaveConfiguration {
                device_id: device_id.clone(),
            },
        )
        .await
        .unwrap();
    match next_matching(&mut rx, |m| matches!(m, ServerMessage::CommandRejected { .. })).await {
        ServerMessage::CommandRejected { device_id: id, error } => {
            assert_eq!(id, device_id);
            assert!(error.contains("Unknown device"));
        }
        _ => unreachable!(),
    }

    session.shutdown().await.unwrap();
    engine_task.await.unwrap();
    driver.shutdown().await;
}
