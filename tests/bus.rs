//! Hub integration tests
//!
//! Runs the hub over the in-memory bus: fan-out, input resilience,
//! registry admission and liveness.

use std::sync::Arc;
use std::time::Duration;

use etbus::{Hub, HubConfig, MemoryBus, MessageType};
use serde_json::json;

mod common;
use common::{device_addr, next_message, raw, start_hub, start_hub_with};

#[tokio::test]
async fn every_subscriber_sees_every_message_in_order() {
    let bus = MemoryBus::new();
    let hub = start_hub(&bus);
    let mut first = hub.subscribe();
    let mut second = hub.subscribe();

    for seq in 0..50 {
        bus.inject(
            raw("state", "sensor-1", "sensor.temp", json!({"value": seq})),
            device_addr(7),
        );
    }

    for rx in [&mut first, &mut second] {
        for seq in 0..50 {
            let message = next_message(rx).await;
            assert_eq!(message.envelope.payload.get("value"), Some(&json!(seq)));
            assert_eq!(message.source, device_addr(7));
        }
        assert!(rx.try_recv().is_err(), "no duplicates");
    }

    hub.stop().await;
}

#[tokio::test]
async fn dropped_subscriber_does_not_affect_others() {
    let bus = MemoryBus::new();
    let hub = start_hub(&bus);
    let gone = hub.subscribe();
    let mut kept = hub.subscribe();
    drop(gone);

    bus.inject(raw("discover", "a", "switch.relay", json!({})), device_addr(1));
    bus.inject(raw("discover", "b", "switch.relay", json!({})), device_addr(2));

    assert_eq!(next_message(&mut kept).await.envelope.id, "a");
    assert_eq!(next_message(&mut kept).await.envelope.id, "b");

    hub.stop().await;
}

#[tokio::test]
async fn malformed_input_leaves_loop_and_registry_intact() {
    let bus = MemoryBus::new();
    let hub = start_hub(&bus);
    let mut rx = hub.subscribe();

    let junk: [&[u8]; 6] = [
        b"\x00\x01\x02",
        b"not json",
        b"[]",
        br#"{"type":"state","id":"x","class":"switch.relay","payload":{}}"#,
        br#"{"v":2,"type":"state","id":"x","class":"switch.relay","payload":{}}"#,
        br#"{"v":1,"type":"state","id":"x","payload":"oops"}"#,
    ];
    for bytes in junk {
        bus.inject(bytes.to_vec(), device_addr(3));
    }
    bus.inject(raw("state", "relay-01", "switch.relay", json!({"on": true})), device_addr(4));

    let message = next_message(&mut rx).await;
    assert_eq!(message.envelope.id, "relay-01");
    assert!(rx.try_recv().is_err());

    let devices = hub.devices();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].id, "relay-01");
    assert!(hub.is_running());

    hub.stop().await;
}

#[tokio::test]
async fn hub_identity_is_forwarded_but_never_admitted() {
    let bus = MemoryBus::new();
    let hub = start_hub(&bus);
    let mut rx = hub.subscribe();

    for kind in ["discover", "state", "command", "ping", "pong", "reboot"] {
        bus.inject(raw(kind, "hub", "hub", json!({})), device_addr(9));
    }
    for _ in 0..6 {
        assert_eq!(next_message(&mut rx).await.envelope.id, "hub");
    }
    assert!(hub.devices().is_empty());

    hub.stop().await;
}

#[tokio::test]
async fn configured_hub_id_hearing_itself_is_not_admitted() {
    let bus = MemoryBus::new();
    let config = HubConfig {
        id: "kitchen-hub".to_string(),
        ..HubConfig::default()
    };
    let hub = Hub::new(config, Arc::new(bus.transport().with_loopback(true)));
    let mut rx = hub.subscribe();
    hub.start().unwrap();

    hub.ping();
    let own = next_message(&mut rx).await;
    assert_eq!(own.envelope.kind, MessageType::Ping);
    assert_eq!(own.envelope.id, "kitchen-hub");
    assert!(hub.devices().is_empty());

    bus.inject(raw("pong", "relay-01", "switch.relay", json!({})), device_addr(8));
    assert_eq!(next_message(&mut rx).await.envelope.id, "relay-01");
    let ids: Vec<_> = hub.devices().into_iter().map(|d| d.id).collect();
    assert_eq!(ids, ["relay-01"]);

    hub.stop().await;
}

#[tokio::test]
async fn unknown_types_and_missing_ids_pass_through() {
    let bus = MemoryBus::new();
    let hub = start_hub(&bus);
    let mut rx = hub.subscribe();

    bus.inject(raw("ota_begin", "node-5", "ota.v2", json!({"size": 1024})), device_addr(5));
    bus.inject(r#"{"v":1,"type":"state","class":"switch.relay","payload":{"on":true}}"#, device_addr(6));

    let unknown = next_message(&mut rx).await;
    assert_eq!(unknown.envelope.kind, MessageType::Unknown);
    assert_eq!(unknown.envelope.class, "ota.v2");

    let anonymous = next_message(&mut rx).await;
    assert!(anonymous.envelope.id.is_empty());

    // The unknown type still proves the device is alive; the anonymous one is not admitted
    let devices = hub.devices();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].id, "node-5");

    hub.stop().await;
}

#[tokio::test]
async fn pong_telemetry_and_firmware_land_in_registry() {
    let bus = MemoryBus::new();
    let hub = start_hub(&bus);
    let mut rx = hub.subscribe();

    bus.inject(raw("discover", "fan-1", "fan.speed", json!({"name": "Attic fan", "fw": "2.1.0"})), device_addr(20));
    bus.inject(raw("pong", "fan-1", "fan.speed", json!({"uptime": 120, "rssi": -70})), device_addr(20));
    next_message(&mut rx).await;
    next_message(&mut rx).await;

    let dev = hub.device("fan-1").unwrap();
    assert_eq!(dev.name, "Attic fan");
    assert_eq!(dev.firmware.as_deref(), Some("2.1.0"));
    assert_eq!(dev.uptime, Some(120));
    assert_eq!(dev.rssi, Some(-70));
    assert_eq!(dev.last_addr, device_addr(20).ip());

    hub.stop().await;
}

#[tokio::test(start_paused = true)]
async fn heartbeat_pings_on_schedule() {
    let bus = MemoryBus::new();
    let mut tap = bus.tap();
    let hub = start_hub(&bus);

    tokio::time::sleep(Duration::from_secs(29)).await;
    assert!(common::drain_tap(&mut tap).is_empty());

    tokio::time::sleep(Duration::from_secs(62)).await;
    let pings = common::drain_tap(&mut tap);
    assert_eq!(pings.len(), 3);
    for ping in pings {
        assert_eq!(ping.kind, MessageType::Ping);
        assert_eq!(ping.id, "hub");
        assert_eq!(ping.class, "hub");
        assert!(ping.payload.get("ts").and_then(serde_json::Value::as_i64).is_some());
    }

    hub.stop().await;
}

#[tokio::test(start_paused = true)]
async fn silent_device_goes_offline_once_and_returns_on_next_message() {
    let bus = MemoryBus::new();
    let hub = start_hub(&bus);
    let mut rx = hub.subscribe();

    bus.inject(raw("discover", "relay-01", "switch.relay", json!({})), device_addr(10));
    next_message(&mut rx).await;
    assert!(hub.device("relay-01").unwrap().online);

    // Tick at 30s: still within the timeout
    tokio::time::sleep(Duration::from_secs(31)).await;
    assert!(hub.device("relay-01").unwrap().online);

    // Tick at 60s crosses it
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(!hub.device("relay-01").unwrap().online);
    assert!(hub.sweep_liveness().is_empty(), "already flipped by the heartbeat");

    // Back online without waiting for a heartbeat
    tokio::time::sleep(Duration::from_secs(5)).await;
    bus.inject(raw("state", "relay-01", "switch.relay", json!({"on": false})), device_addr(10));
    next_message(&mut rx).await;
    assert!(hub.device("relay-01").unwrap().online);

    hub.stop().await;
}

#[tokio::test(start_paused = true)]
async fn liveness_follows_configured_timings() {
    let bus = MemoryBus::new();
    let config = HubConfig {
        ping_interval: Duration::from_secs(5),
        offline_timeout: Duration::from_secs(10),
        ..HubConfig::default()
    };
    let hub = start_hub_with(&bus, config);
    let mut rx = hub.subscribe();

    bus.inject(raw("pong", "n1", "switch.relay", json!({})), device_addr(11));
    next_message(&mut rx).await;

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert!(hub.device("n1").unwrap().online);
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(!hub.device("n1").unwrap().online);

    hub.stop().await;
}

#[tokio::test(start_paused = true)]
async fn receive_error_backs_off_and_loop_continues() {
    let bus = MemoryBus::new();
    let backoff = Duration::from_millis(50);
    let config = HubConfig {
        recv_error_backoff: backoff,
        ..HubConfig::default()
    };
    let hub = start_hub_with(&bus, config);
    let mut rx = hub.subscribe();
    let started = tokio::time::Instant::now();

    // More than the medium buffers, so the hub's receiver lags
    for seq in 0..1100 {
        bus.inject(
            raw("state", "flood", "sensor.temp", json!({"value": seq})),
            device_addr(30),
        );
    }
    bus.inject(raw("discover", "after", "switch.relay", json!({})), device_addr(31));

    let mut delivered = 0;
    loop {
        let message = next_message(&mut rx).await;
        if message.envelope.id == "after" {
            break;
        }
        delivered += 1;
    }

    assert!(delivered < 1100, "some datagrams were lost to the lag");
    assert!(started.elapsed() >= backoff);
    assert!(hub.is_running());
    assert!(hub.device("after").unwrap().online);

    hub.stop().await;
}

#[tokio::test]
async fn stop_is_idempotent_and_ends_subscriptions() {
    let bus = MemoryBus::new();
    let hub = start_hub(&bus);
    let mut rx = hub.subscribe();

    hub.stop().await;
    hub.stop().await;
    assert!(rx.recv().await.is_none());

    // Nothing reaches the stopped hub
    bus.inject(raw("discover", "late", "switch.relay", json!({})), device_addr(12));
    tokio::task::yield_now().await;
    assert!(hub.device("late").is_none());
}
