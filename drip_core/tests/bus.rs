use std::sync::{Arc, Mutex};
use std::time::Duration;

use drip_core::bus::{EventBus, MAX_SUBSCRIBERS_PER_TOPIC, Payload, Topic};
use drip_core::error::BusError;
use drip_core::flow::FlowData;
use drip_core::state::DeviceState;
use drip_core::types::{AlarmKind, DeviceStatus};

#[test]
fn ninth_subscriber_is_refused_and_others_keep_working() {
    let bus = EventBus::new();
    let subs: Vec<_> = (0..MAX_SUBSCRIBERS_PER_TOPIC)
        .map(|_| bus.subscribe(Topic::Alarm).unwrap())
        .collect();
    let err = bus.subscribe(Topic::Alarm).unwrap_err();
    assert_eq!(
        err,
        BusError::TopicFull {
            topic: Topic::Alarm,
            max: MAX_SUBSCRIBERS_PER_TOPIC
        }
    );
    assert_eq!(bus.publish(Topic::Alarm, Payload::Alarm(AlarmKind::LowFluid)), Ok(8));
    for s in &subs {
        assert_eq!(s.try_recv().map(|e| e.payload), Some(Payload::Alarm(AlarmKind::LowFluid)));
    }
    // Other topics have their own limit.
    assert!(bus.subscribe(Topic::WeightUpdate).is_ok());
}

#[test]
fn unsubscribing_frees_a_slot() {
    let bus = EventBus::new();
    let subs: Vec<_> = (0..MAX_SUBSCRIBERS_PER_TOPIC)
        .map(|_| bus.subscribe(Topic::ButtonPress).unwrap())
        .collect();
    assert!(bus.unsubscribe(Topic::ButtonPress, subs[3].id()));
    assert!(!bus.unsubscribe(Topic::ButtonPress, subs[3].id()));
    assert!(bus.subscribe(Topic::ButtonPress).is_ok());
}

#[test]
fn dropped_subscription_is_reaped() {
    let bus = EventBus::new();
    let gone = bus.subscribe(Topic::WifiStatus).unwrap();
    let kept = bus.subscribe(Topic::WifiStatus).unwrap();
    drop(gone);
    assert_eq!(bus.emit(Payload::Wifi(true)), 1);
    assert_eq!(bus.subscriber_count(Topic::WifiStatus), 1);
    assert_eq!(kept.try_recv().map(|e| e.payload), Some(Payload::Wifi(true)));
}

#[test]
fn delivery_keeps_publish_order() {
    let bus = EventBus::new();
    let sub = bus.subscribe(Topic::WeightUpdate).unwrap();
    for w in [3.0, 2.0, 1.0] {
        bus.emit(Payload::Weight(w));
    }
    let got: Vec<_> = sub.drain().map(|e| e.payload).collect();
    assert_eq!(
        got,
        vec![Payload::Weight(3.0), Payload::Weight(2.0), Payload::Weight(1.0)]
    );
}

#[test]
fn slow_subscriber_never_blocks_the_publisher() {
    let bus = EventBus::with_queue_depth(2);
    let slow = bus.subscribe(Topic::WeightUpdate).unwrap();
    let delivered: usize = (0..10).map(|i| bus.emit(Payload::Weight(i as f32))).sum();
    assert_eq!(delivered, 2);
    assert_eq!(bus.dropped(), 8);
    assert_eq!(slow.drain().count(), 2);
}

#[test]
fn mismatched_payload_is_refused() {
    let bus = EventBus::new();
    let err = bus
        .publish(Topic::StateChange, Payload::Wifi(false))
        .unwrap_err();
    assert!(matches!(err, BusError::PayloadMismatch { topic: Topic::StateChange, .. }));
}

#[test]
fn callback_subscribers_run_off_thread() {
    let bus = Arc::new(EventBus::new());
    let status = Arc::new(Mutex::new(DeviceStatus::default()));
    let mut dispatchers = Vec::new();
    for topic in [Topic::WeightUpdate, Topic::FlowUpdate, Topic::StateChange] {
        let status = status.clone();
        dispatchers.push(
            bus.subscribe_fn(topic, "status", move |ev| {
                if let Ok(mut s) = status.lock() {
                    s.apply(&ev);
                }
            })
            .unwrap(),
        );
    }
    bus.emit(Payload::Weight(250.0));
    bus.emit(Payload::Flow(FlowData {
        rate_ml_min: 50.0,
        time_to_empty_min: 5.0,
    }));
    bus.emit(Payload::State(DeviceState::Monitoring));

    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    loop {
        let s = *status.lock().unwrap();
        if s.state == DeviceState::Monitoring && s.flow.is_some() && s.weight_g == Some(250.0) {
            assert_eq!(s.eta_min(), Some(5.0));
            break;
        }
        assert!(std::time::Instant::now() < deadline, "dispatchers did not deliver");
        std::thread::sleep(Duration::from_millis(5));
    }

    for d in dispatchers {
        assert!(bus.unsubscribe(d.topic(), d.id()));
        d.join();
    }
}

#[test]
fn concurrent_publishers_and_subscribers() {
    let bus = Arc::new(EventBus::with_queue_depth(1024));
    let sub = bus.subscribe(Topic::WeightUpdate).unwrap();
    let publishers: Vec<_> = (0..4)
        .map(|_| {
            let bus = bus.clone();
            std::thread::spawn(move || {
                for i in 0..100 {
                    bus.emit(Payload::Weight(i as f32));
                }
            })
        })
        .collect();
    let joiner = {
        let bus = bus.clone();
        std::thread::spawn(move || {
            for _ in 0..4 {
                let _ = bus.subscribe(Topic::WeightUpdate);
            }
        })
    };
    for p in publishers {
        p.join().unwrap();
    }
    joiner.join().unwrap();
    assert_eq!(sub.drain().count(), 400);
}
