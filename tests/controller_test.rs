use std::sync::Arc;
use std::time::Duration;
use telemetry_agent::buffer::{
    Controller, ControllerConf, ControllerError, DELIVERY_FAILURE_NAME, DROP_REASON_HEAP, DrainFn,
    Item, ItemBatch, ItemKind, MemoryProbe, PriorityBuffer,
};

fn new_test_batch(n: usize) -> ItemBatch {
    (0..n).map(|i| Item::metric(format!("metric-{i}"))).collect()
}

fn channel_callback() -> (DrainFn, tokio::sync::mpsc::UnboundedReceiver<ItemBatch>) {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    let on_drain: DrainFn = Arc::new(move |batch: ItemBatch| {
        tx.send(batch).unwrap();
        Ok(())
    });
    (on_drain, rx)
}

fn conf(drain_interval: Duration, max_batch_len: usize, on_drain: DrainFn) -> ControllerConf {
    ControllerConf {
        drain_interval,
        max_batch_len,
        max_heap_alloc_bytes: 0,
        on_drain,
    }
}

struct FixedProbe(u64);

impl MemoryProbe for FixedProbe {
    fn heap_alloc_bytes(&self) -> Option<u64> {
        Some(self.0)
    }
}

#[tokio::test]
async fn one_tick_drains_a_full_batch() {
    let n = 5;
    let (on_drain, mut rx) = channel_callback();

    let buf = Arc::new(PriorityBuffer::new(Duration::ZERO).unwrap());
    let items = new_test_batch(n);
    buf.insert(items.clone()).unwrap();

    let mut ctrl = Controller::new(conf(Duration::from_millis(1), n, on_drain), buf.clone());
    ctrl.start();
    tokio::time::sleep(Duration::from_millis(100)).await;
    ctrl.stop().await;

    let batch = rx.recv().await.expect("drain callback never fired");
    assert_eq!(batch, items);
    assert!(rx.try_recv().is_err());
    assert_eq!(buf.len(), 0);
}

#[tokio::test]
async fn batch_limit_one_delivers_in_insertion_order() {
    let n = 5;
    let (on_drain, mut rx) = channel_callback();

    let buf = Arc::new(PriorityBuffer::new(Duration::ZERO).unwrap());
    let items = new_test_batch(n);
    buf.insert(items.clone()).unwrap();

    let mut ctrl = Controller::new(conf(Duration::from_millis(1), 1, on_drain), buf.clone());
    ctrl.start();
    tokio::time::sleep(Duration::from_millis(100)).await;
    ctrl.stop().await;

    assert_eq!(buf.len(), 0);
    for expected in &items {
        let batch = rx.recv().await.expect("drain callback never fired");
        assert_eq!(batch.len(), 1);
        assert_eq!(&batch[0], expected);
    }
}

#[tokio::test]
async fn undersized_buffer_drains_without_waiting_to_fill() {
    let n = 5;
    let (on_drain, mut rx) = channel_callback();

    let buf = Arc::new(PriorityBuffer::new(Duration::ZERO).unwrap());
    let items = new_test_batch(n);
    buf.insert(items.clone()).unwrap();

    let mut ctrl = Controller::new(conf(Duration::from_millis(1), 2 * n, on_drain), buf.clone());
    ctrl.start();
    tokio::time::sleep(Duration::from_millis(100)).await;
    ctrl.stop().await;

    let batch = rx.recv().await.expect("drain callback never fired");
    assert_eq!(batch, items);
    assert_eq!(buf.len(), 0);
}

#[tokio::test]
async fn events_drain_before_metrics() {
    let (on_drain, mut rx) = channel_callback();

    let buf = Arc::new(PriorityBuffer::new(Duration::ZERO).unwrap());
    let m1 = Item::metric("m1");
    let m2 = Item::metric("m2");
    let ev = Item::event("e1");
    buf.insert([m1.clone(), m2.clone(), ev.clone()]).unwrap();

    let mut ctrl = Controller::new(conf(Duration::from_millis(1), 3, on_drain), buf.clone());
    ctrl.start();
    tokio::time::sleep(Duration::from_millis(100)).await;
    ctrl.stop().await;

    let batch = rx.recv().await.expect("drain callback never fired");
    assert_eq!(batch, vec![ev, m1, m2]);
}

#[tokio::test]
async fn failed_delivery_requeues_batch_plus_failure_item() {
    let n = 5;
    let on_drain: DrainFn = Arc::new(|_| Err("drain test error".into()));

    let buf = Arc::new(PriorityBuffer::new(Duration::ZERO).unwrap());
    let items = new_test_batch(n);
    buf.insert(items.clone()).unwrap();

    // One tick fires at 75ms; stop before the second at 150ms.
    let mut ctrl = Controller::new(conf(Duration::from_millis(75), n, on_drain), buf.clone());
    ctrl.start();
    tokio::time::sleep(Duration::from_millis(100)).await;
    ctrl.stop().await;

    assert_eq!(buf.len(), n + 1);

    // The synthetic failure item is an event, so it outranks the requeued
    // metrics and drains first; the originals follow in insertion order.
    let requeued = buf.drain(n + 1);
    assert_eq!(requeued[1..], items[..]);

    let failure = &requeued[0];
    assert_eq!(failure.kind(), ItemKind::Event);
    let body: serde_json::Value = serde_json::from_slice(failure.payload()).unwrap();
    assert_eq!(body["name"], DELIVERY_FAILURE_NAME);
    assert_eq!(body["error"], "drain test error");
}

#[tokio::test]
async fn no_drain_fires_after_stop_returns() {
    let n = 50;
    let (on_drain, mut rx) = channel_callback();

    let buf = Arc::new(PriorityBuffer::new(Duration::ZERO).unwrap());
    buf.insert(new_test_batch(n)).unwrap();

    let mut ctrl = Controller::new(conf(Duration::from_millis(1), 1, on_drain), buf.clone());
    ctrl.start();
    tokio::time::sleep(Duration::from_millis(20)).await;
    ctrl.stop().await;

    let remaining = buf.len();
    let mut delivered = 0;
    while rx.try_recv().is_ok() {
        delivered += 1;
    }
    assert_eq!(delivered + remaining, n);

    // The loop is joined; nothing may drain afterwards.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err());
    assert_eq!(buf.len(), remaining);
}

#[tokio::test]
async fn stop_is_idempotent() {
    let (on_drain, _rx) = channel_callback();
    let buf = Arc::new(PriorityBuffer::new(Duration::ZERO).unwrap());

    let mut ctrl = Controller::new(conf(Duration::from_millis(1), 1, on_drain), buf);
    ctrl.start();
    ctrl.stop().await;
    ctrl.stop().await;
}

#[tokio::test]
async fn heap_pressure_rejects_insert() {
    let n = 5;
    let (on_drain, _rx) = channel_callback();

    let buf = Arc::new(PriorityBuffer::new(Duration::ZERO).unwrap());
    buf.insert(new_test_batch(n)).unwrap();

    let mut conf = conf(Duration::from_millis(1), 1, on_drain);
    conf.max_heap_alloc_bytes = 100;
    // Cached snapshot reads 200 bytes against a 100-byte ceiling.
    let ctrl = Controller::with_probe(conf, buf.clone(), Arc::new(FixedProbe(200)));

    let err = ctrl.buf_insert([Item::metric("rejected")]).unwrap_err();
    assert!(matches!(
        err,
        ControllerError::HeapAllocLimit {
            usage_bytes: 200,
            limit_bytes: 100,
        }
    ));
    assert!(err.is_backpressure());

    // The rejected item never entered the buffer, and the drop is accounted.
    assert_eq!(buf.len(), n);
    assert_eq!(buf.metrics().dropped(DROP_REASON_HEAP), 1);
}

#[tokio::test]
async fn zero_ceiling_disables_admission_control() {
    let (on_drain, _rx) = channel_callback();

    let buf = Arc::new(PriorityBuffer::new(Duration::ZERO).unwrap());
    let ctrl = Controller::with_probe(
        conf(Duration::from_millis(1), 1, on_drain),
        buf.clone(),
        Arc::new(FixedProbe(u64::MAX)),
    );

    ctrl.buf_insert([Item::metric("admitted")]).unwrap();
    assert_eq!(buf.len(), 1);
}
