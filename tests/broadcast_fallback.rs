//! Direct reads, broadcast fallback and freshness tracking

mod integration;

use heatlink_core::core::broadcast::{BroadcastKey, BroadcastMap};
use heatlink_core::core::discovery::RegistrySource;
use heatlink_core::core::frame::{response_id, CanFrame, RESPONSE_BASE};
use heatlink_core::core::transport::{FrameRecording, ReplayControl};
use heatlink_core::{
    BroadcastMonitor, ClientConfig, ElementRegistry, Error, HeatPump, Param, Value, ValueFormat, ValueSource,
};
use integration::{connect, element, Controller};
use std::time::Duration;
use tokio::time::Instant;

fn broadcast(index: u16, data: &[u8]) -> CanFrame {
    CanFrame::new_extended(response_id(index), data).unwrap()
}

async fn pump(controller: &Controller) -> (ReplayControl, HeatPump) {
    let (control, conn) = connect(controller).await;
    let registry = ElementRegistry::new();
    registry.apply(
        vec![element(1, "GT1_T"), element(2, "GT2_T"), element(3, "GT3_T")],
        RegistrySource::Discovery,
    );
    (control, HeatPump::new(conn, registry, ClientConfig::default()))
}

#[tokio::test(start_paused = true)]
async fn test_direct_reply_is_used_when_it_fits() {
    let controller = Controller::default();
    controller.set_value(2, &[0x01, 0x23]);
    let (_control, pump) = pump(&controller).await;

    let before = Instant::now();
    let reading = pump.read_value(&Param::from("GT2_T"), ValueFormat::Temp).await.unwrap();
    assert_eq!(before.elapsed(), Duration::ZERO);
    assert_eq!(reading.source, ValueSource::Direct);
    assert_eq!(reading.value, Value::Temperature(29.1));
    assert_eq!(reading.raw, vec![0x01, 0x23]);
}

#[tokio::test(start_paused = true)]
async fn test_short_reply_falls_back_to_broadcast() {
    let controller = Controller::default();
    controller.set_value(1, &[0x01]);
    let (control, pump) = pump(&controller).await;
    control.schedule_in(Duration::from_secs(2), broadcast(1, &[0x00, 0xD7]));

    let before = Instant::now();
    let reading = pump.read_value(&Param::from("GT1_T"), ValueFormat::Temp).await.unwrap();
    assert_eq!(before.elapsed(), Duration::from_secs(5));
    assert_eq!(reading.source, ValueSource::Broadcast);
    assert_eq!(reading.value, Value::Temperature(21.5));
    assert_eq!(reading.index, 1);
}

#[tokio::test(start_paused = true)]
async fn test_fallback_uses_configured_broadcast_key() {
    let controller = Controller::default();
    controller.set_value(1, &[0x01]);
    let (control, conn) = connect(&controller).await;
    let registry = ElementRegistry::new();
    registry.apply(vec![element(1, "GT1_T")], RegistrySource::Discovery);
    let key = BroadcastKey::new(0x1C00_3FE0, 66);
    let pump = HeatPump::new(conn, registry, ClientConfig::default().broadcast_key("GT1_T", key));

    // the response identifier carries something else for this parameter
    control.schedule_in(Duration::from_secs(1), broadcast(1, &[0x00, 0x64]));
    control.schedule_in(Duration::from_secs(2), CanFrame::new_extended(key.id(), &[0x00, 0xD7]).unwrap());

    let reading = pump.read_value(&Param::from("GT1_T"), ValueFormat::Temp).await.unwrap();
    assert_eq!(reading.source, ValueSource::Broadcast);
    assert_eq!(reading.value, Value::Temperature(21.5));
    assert_eq!(reading.index, 1);
    assert!(pump.monitor().get(RESPONSE_BASE, 1).is_none());
    assert_eq!(pump.monitor().get(0x1C00_3FE0, 66).unwrap().raw, vec![0x00, 0xD7]);
}

#[tokio::test(start_paused = true)]
async fn test_latest_broadcast_in_window_wins() {
    let controller = Controller::default();
    controller.set_value(1, &[0x01]);
    let (control, pump) = pump(&controller).await;
    control.schedule_in(Duration::from_secs(1), broadcast(1, &[0x00, 0xC8]));
    control.schedule_in(Duration::from_secs(3), broadcast(1, &[0x00, 0xD2]));

    let reading = pump.read_value(&Param::from(1u16), ValueFormat::Temp).await.unwrap();
    assert_eq!(reading.value, Value::Temperature(21.0));
}

#[tokio::test(start_paused = true)]
async fn test_broadcast_from_before_the_window_is_not_reused() {
    let controller = Controller::default();
    controller.set_value(1, &[0x01]);
    let (_control, pump) = pump(&controller).await;

    pump.monitor()
        .watch(BroadcastKey::new(RESPONSE_BASE, 1), "GT1_T", ValueFormat::Temp);
    assert!(pump.monitor().ingest(&broadcast(1, &[0x00, 0xD7])).is_some());
    tokio::time::sleep(Duration::from_secs(1)).await;

    let err = pump.read_value(&Param::from("GT1_T"), ValueFormat::Temp).await.unwrap_err();
    assert!(matches!(err, Error::NoValue { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_repeated_failures_mark_value_stale() {
    let controller = Controller::default();
    controller.set_value(3, &[0x00, 0xC8]);
    let (_control, pump) = pump(&controller).await;

    pump.read_value(&Param::from("GT3_T"), ValueFormat::Temp).await.unwrap();
    controller.set_value(3, &[0x05]);

    for failures in 1..=3 {
        let err = pump.read_value(&Param::from("GT3_T"), ValueFormat::Temp).await.unwrap_err();
        assert!(matches!(err, Error::NoValue { .. }));
        assert_eq!(pump.status("GT3_T").is_stale(), failures >= 3);
    }
    assert_eq!(pump.status("GT3_T").value(), Some(Value::Temperature(20.0)));

    controller.set_value(3, &[0x00, 0xD2]);
    pump.read_value(&Param::from("GT3_T"), ValueFormat::Temp).await.unwrap();
    assert!(!pump.status("GT3_T").is_stale());
}

#[tokio::test(start_paused = true)]
async fn test_unknown_parameter_is_rejected_without_traffic() {
    let controller = Controller::default();
    let (control, pump) = pump(&controller).await;

    let err = pump.read_value(&Param::from("GT99_T"), ValueFormat::Temp).await.unwrap_err();
    assert!(matches!(err, Error::UnknownParameter(ref name) if name == "GT99_T"));
    assert!(control.sent().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_write_sends_encoded_value_on_response_id() {
    let controller = Controller::default();
    let (_control, pump) = pump(&controller).await;

    let ack = pump
        .write_value(&Param::from("GT2_T"), ValueFormat::Temp, &Value::Temperature(21.5))
        .await
        .unwrap();
    assert_eq!(ack.can_id, response_id(2));
    assert_eq!(ack.payload, vec![0x00, 0xD7]);

    let writes = controller.writes();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].id(), response_id(2));
    assert_eq!(writes[0].data(), &[0x00, 0xD7]);
}

#[tokio::test(start_paused = true)]
async fn test_monitor_collects_recorded_traffic() {
    let mut recording = FrameRecording::new("outdoor and flow temperatures");
    recording.push(Duration::from_millis(100), &broadcast(1, &[0xFF, 0x9C]));
    recording.push(Duration::from_millis(400), &broadcast(7, &[0x12]));
    recording.push(Duration::from_millis(900), &broadcast(2, &[0x01, 0x23]));
    recording.push(Duration::from_millis(1_500), &broadcast(1, &[0xFF, 0xA6]));

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("capture.json");
    recording.save_json(&path).unwrap();
    let recording = FrameRecording::load_json(&path).unwrap();

    let controller = Controller::default();
    let (control, conn) = connect(&controller).await;
    assert_eq!(control.schedule_recording(&recording).unwrap(), 4);

    let mut map = BroadcastMap::new();
    map.insert(BroadcastKey::new(RESPONSE_BASE, 1), "GT1_T", ValueFormat::Temp);
    map.insert(BroadcastKey::new(RESPONSE_BASE, 2), "GT2_T", ValueFormat::Temp);
    let monitor = BroadcastMonitor::new(conn, map);

    let snapshot = monitor.collect(Duration::from_secs(2)).await.unwrap();
    assert_eq!(snapshot.frames_seen, 4);
    assert_eq!(snapshot.frames_matched, 3);
    assert_eq!(snapshot.get(RESPONSE_BASE, 1).unwrap().value, Value::Temperature(-9.0));
    assert_eq!(snapshot.get(RESPONSE_BASE, 2).unwrap().value, Value::Temperature(29.1));
    assert!(snapshot.get(RESPONSE_BASE, 7).is_none());
}
