use anyhow::Result;
use sockmux_core::{AsyncNotificationCenter, DispatchMode, Notification};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

#[test]
fn many_producers_one_subscriber() -> Result<()> {
    let center = Arc::new(AsyncNotificationCenter::new(DispatchMode::Ordered));
    let (tx, rx) = mpsc::channel();
    _ = center.subscribe("progress", move |n| {
        tx.send(*n.payload::<usize>().unwrap()).unwrap();
    });
    let mut producers = Vec::new();
    for p in 0..4usize {
        let poster = center.clone();
        producers.push(std::thread::spawn(move || {
            for i in 0..25usize {
                poster.post(Notification::with_payload("progress", p * 25 + i));
            }
        }));
    }
    for producer in producers {
        producer.join().unwrap();
    }
    let mut seen = Vec::with_capacity(100);
    for _ in 0..100 {
        seen.push(rx.recv_timeout(Duration::from_secs(2))?);
    }
    seen.sort_unstable();
    assert_eq!((0..100).collect::<Vec<_>>(), seen);
    Ok(())
}

#[test]
fn prefix_matcher_selects_a_topic_family() -> Result<()> {
    let center = AsyncNotificationCenter::default();
    let (tx, rx) = mpsc::channel();
    _ = center.add_observer(
        |name| name.starts_with("net."),
        move |n| tx.send(n.name().to_owned()).unwrap(),
    );
    center.post(Notification::new("disk.full"));
    center.post(Notification::new("net.connected"));
    center.post(Notification::new("net.closed"));
    assert_eq!("net.connected", rx.recv_timeout(Duration::from_secs(2))?);
    assert_eq!("net.closed", rx.recv_timeout(Duration::from_secs(2))?);
    Ok(())
}

#[test]
fn every_matching_observer_gets_each_notification() {
    let center = AsyncNotificationCenter::default();
    let hits = Arc::new(AtomicUsize::new(0));
    for _ in 0..3 {
        let counter = hits.clone();
        _ = center.subscribe("fan-out", move |_| {
            _ = counter.fetch_add(1, Ordering::Relaxed);
        });
    }
    assert_eq!(3, center.observer_count());
    center.post(Notification::new("fan-out"));
    drop(center);
    assert_eq!(3, hits.load(Ordering::Relaxed));
}

#[test]
fn shared_payload_is_not_copied_per_observer() {
    let center = AsyncNotificationCenter::default();
    let (tx, rx) = mpsc::channel();
    for _ in 0..2 {
        let tx = tx.clone();
        _ = center.subscribe("blob", move |n| {
            let payload = n.payload::<Vec<u8>>().unwrap();
            tx.send(Arc::as_ptr(&payload) as usize).unwrap();
        });
    }
    center.post(Notification::with_payload("blob", vec![0u8; 4096]));
    let first = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    let second = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(first, second);
}
