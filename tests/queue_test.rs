//! In-memory delay/deadline queue behaviour.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{TimeDelta, Utc};

use deployd_rs::error::Error;
use deployd_rs::model::ServiceInstance;
use deployd_rs::queue::{DelayDeadlineQueue, MemoryQueue};

fn item(service: &str) -> ServiceInstance {
    ServiceInstance::new(service, "main", "test")
}

#[test]
fn due_items_come_out_by_bounce_by() {
    let queue = MemoryQueue::new().unwrap();
    let now = Utc::now();
    let past = now - TimeDelta::seconds(1);

    queue
        .put(item("b").wait_until(past).bounce_by(now + TimeDelta::seconds(10)))
        .unwrap();
    queue.put(item("a").wait_until(past).bounce_by(now)).unwrap();

    let first = queue.get(false, None).unwrap();
    assert_eq!(first.service, "a");
    first.commit().unwrap();
    let second = queue.get(false, None).unwrap();
    assert_eq!(second.service, "b");
    second.commit().unwrap();
}

#[test]
fn blocked_get_wakes_for_item_put_later() {
    let queue = MemoryQueue::new().unwrap();
    let now = Utc::now();
    queue
        .put(
            item("c")
                .wait_until(now + TimeDelta::seconds(100))
                .bounce_by(now + TimeDelta::seconds(100)),
        )
        .unwrap();

    assert!(matches!(
        queue.get(true, Some(Duration::from_millis(1))),
        Err(Error::Empty)
    ));

    let soon = Utc::now() + TimeDelta::milliseconds(10);
    queue.put(item("d").wait_until(soon).bounce_by(soon)).unwrap();

    let started = Instant::now();
    let checkout = queue.get(true, Some(Duration::from_secs(1))).unwrap();
    let waited = started.elapsed();
    assert_eq!(checkout.service, "d");
    assert!(Utc::now() >= soon);
    assert!(waited < Duration::from_millis(500), "waited {waited:?}");
    checkout.commit().unwrap();
}

#[test]
fn get_from_another_thread_sees_put() {
    let queue = Arc::new(MemoryQueue::new().unwrap());
    let consumer = {
        let queue = Arc::clone(&queue);
        thread::spawn(move || {
            let checkout = queue.get(true, Some(Duration::from_secs(5))).unwrap();
            let service = checkout.service.clone();
            checkout.commit().unwrap();
            service
        })
    };
    thread::sleep(Duration::from_millis(20));
    queue.put(item("late")).unwrap();
    assert_eq!(consumer.join().unwrap(), "late");
}

#[test]
fn non_blocking_get_on_empty_queue() {
    let queue = MemoryQueue::new().unwrap();
    assert!(matches!(queue.get(false, None), Err(Error::Empty)));
}

#[test]
fn future_items_stay_hidden() {
    let queue = MemoryQueue::new().unwrap();
    queue
        .put(item("later").wait_until(Utc::now() + TimeDelta::seconds(60)))
        .unwrap();

    assert!(matches!(queue.get(false, None), Err(Error::Empty)));
    assert_eq!(queue.get_available_service_instances(false).unwrap().len(), 0);
    let waiting = queue.get_unavailable_service_instances(false).unwrap();
    assert_eq!(waiting.len(), 1);
    assert!(waiting[0].instance.is_none());
}

#[test]
fn dropped_checkout_returns_item_unchanged() {
    let queue = MemoryQueue::new().unwrap();
    let mut original = item("web");
    original.failures = 3;
    queue.put(original.clone()).unwrap();

    {
        let checkout = queue.get(false, None).unwrap();
        assert_eq!(*checkout, original);
        assert!(matches!(queue.get(false, None), Err(Error::Empty)));
    }

    let again = queue.get(false, None).unwrap();
    assert_eq!(*again, original);
    again.commit().unwrap();
    assert!(matches!(queue.get(false, None), Err(Error::Empty)));
}

#[test]
fn panicking_consumer_returns_item() {
    let queue = MemoryQueue::new().unwrap();
    queue.put(item("web")).unwrap();

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        let _checkout = queue.get(false, None).unwrap();
        panic!("consumer failed");
    }));
    assert!(result.is_err());
    assert_eq!(queue.get_available_service_instances(true).unwrap().len(), 1);
}

#[test]
fn snapshot_with_payloads() {
    let queue = MemoryQueue::new().unwrap();
    queue.put(item("a")).unwrap();
    queue.put(item("b")).unwrap();

    let rows = queue.get_available_service_instances(true).unwrap();
    let services: Vec<_> = rows
        .iter()
        .map(|row| row.instance.as_ref().unwrap().service.clone())
        .collect();
    assert_eq!(services, vec!["a", "b"]);
}

#[test]
fn coalesced_put_skips_instances_already_pending() {
    let queue = MemoryQueue::new().unwrap();
    let now = Utc::now();
    queue.put(item("web").wait_until(now).bounce_by(now)).unwrap();

    let later = now + TimeDelta::seconds(5);
    let put = queue
        .put_coalesced(vec![
            item("web").wait_until(later).bounce_by(later),
            item("api").wait_until(later).bounce_by(later),
            item("api").wait_until(later).bounce_by(later),
        ])
        .unwrap();
    assert_eq!(put, 1);
    let mut rows = queue.get_available_service_instances(true).unwrap();
    rows.extend(queue.get_unavailable_service_instances(true).unwrap());
    assert_eq!(rows.len(), 2);
}

#[test]
fn coalesced_put_keeps_a_more_urgent_copy() {
    let queue = MemoryQueue::new().unwrap();
    let now = Utc::now();
    let backed_off = now + TimeDelta::hours(1);
    queue
        .put(item("web").wait_until(backed_off).bounce_by(now))
        .unwrap();

    assert_eq!(
        queue
            .put_coalesced(vec![item("web").wait_until(now).bounce_by(now)])
            .unwrap(),
        1
    );
    let checkout = queue.get(false, None).unwrap();
    assert_eq!(checkout.wait_until, now);
    checkout.commit().unwrap();
}
