use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::broker::{Broker, BrokerConfig, CategoryConfig};
use crate::client::{
    Consumer, ConsumerConfig, HandlerError, Message, ProducerConfig, StringCodec,
};

/// (consumer id, queue, offset, value)
type Delivery = (String, usize, u64, String);
type Log = Arc<Mutex<Vec<Delivery>>>;

fn broker() -> Arc<Broker> {
    Broker::new(BrokerConfig {
        rebalance_debounce: Duration::from_millis(50),
        ..BrokerConfig::default()
    })
}

fn config(id: &str, group: &str) -> ConsumerConfig {
    ConsumerConfig::new(id, group).poll_interval(Duration::from_millis(10))
}

fn recording_consumer(
    broker: &Arc<Broker>,
    config: ConsumerConfig,
    category: &str,
    log: &Log,
    delay: Duration,
) -> Consumer<String> {
    let consumer = broker.create_consumer(config, StringCodec);
    let id = consumer.client_id().to_string();
    let log = log.clone();
    consumer
        .subscribe(category, move |msg: Message<String>| {
            let log = log.clone();
            let id = id.clone();
            async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                log.lock()
                    .push((id, msg.queue(), msg.offset(), msg.value));
                Ok::<(), HandlerError>(())
            }
        })
        .unwrap();
    consumer
}

async fn publish_n(broker: &Arc<Broker>, category: &str, range: std::ops::Range<usize>) {
    let producer = broker.create_producer(ProducerConfig::new("producer"), StringCodec);
    for i in range {
        let key = format!("key-{}", i % 17);
        producer
            .send(category, Some(&key), &format!("msg-{i}"), None)
            .await
            .unwrap();
    }
    producer.close();
}

async fn wait_for(mut cond: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

fn values(log: &Log) -> Vec<String> {
    log.lock().iter().map(|d| d.3.clone()).collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn group_members_split_queues_and_see_each_message_once() {
    let broker = broker();
    broker
        .get_or_create_category("orders", CategoryConfig::with_queues(4))
        .unwrap();

    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let consumers: Vec<Consumer<String>> = ["c1", "c2", "c3"]
        .iter()
        .map(|id| recording_consumer(&broker, config(id, "billing"), "orders", &log, Duration::ZERO))
        .collect();

    // let the single debounced rebalance settle
    tokio::time::sleep(Duration::from_millis(200)).await;
    let group = broker.consumer_group("orders", "billing").unwrap();
    assert_eq!(group.generation(), 1);

    publish_n(&broker, "orders", 0..200).await;
    assert!(wait_for(|| log.lock().len() >= 200, Duration::from_secs(10)).await);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let delivered = values(&log);
    assert_eq!(delivered.len(), 200);
    let unique: HashSet<&String> = delivered.iter().collect();
    assert_eq!(unique.len(), 200);

    // every delivery came from a queue owned by its consumer
    let assignments = group.assignments();
    for (id, queue, _, _) in log.lock().iter() {
        assert!(assignments[id].contains(queue), "{id} got queue {queue}");
    }

    // a second group reads the same messages independently
    let audit_log: Log = Arc::new(Mutex::new(Vec::new()));
    let auditor = recording_consumer(
        &broker,
        config("auditor", "audit"),
        "orders",
        &audit_log,
        Duration::ZERO,
    );
    assert!(wait_for(|| audit_log.lock().len() >= 200, Duration::from_secs(10)).await);

    auditor.close().await;
    for consumer in &consumers {
        consumer.close().await;
    }
    broker.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn restarted_consumer_resumes_from_committed_offsets() {
    let broker = broker();
    broker
        .get_or_create_category("jobs", CategoryConfig::with_queues(3))
        .unwrap();
    publish_n(&broker, "jobs", 0..120).await;

    let first_log: Log = Arc::new(Mutex::new(Vec::new()));
    let first = recording_consumer(
        &broker,
        config("worker-1", "workers"),
        "jobs",
        &first_log,
        Duration::from_millis(5),
    );
    assert!(wait_for(|| first_log.lock().len() >= 60, Duration::from_secs(10)).await);
    first.close().await;

    let first_seen: HashSet<String> = values(&first_log).into_iter().collect();
    assert!(first_seen.len() >= 60 && first_seen.len() < 120);
    let committed: u64 = (0..3)
        .map(|q| {
            broker
                .get_committed_offset("jobs", "workers", q)
                .unwrap()
                .unwrap_or(0)
        })
        .sum();
    assert_eq!(committed as usize, first_seen.len());

    let second_log: Log = Arc::new(Mutex::new(Vec::new()));
    let second = recording_consumer(
        &broker,
        config("worker-1", "workers"),
        "jobs",
        &second_log,
        Duration::ZERO,
    );
    let remaining = 120 - first_seen.len();
    assert!(wait_for(|| second_log.lock().len() >= remaining, Duration::from_secs(10)).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    second.close().await;

    let second_seen = values(&second_log);
    assert_eq!(second_seen.len(), remaining);
    assert!(second_seen.iter().all(|v| !first_seen.contains(v)));

    let all: HashSet<String> = first_seen.into_iter().chain(second_seen).collect();
    assert_eq!(all.len(), 120);
    broker.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_handler_blocks_queue_until_success() {
    let broker = broker();
    publish_n(&broker, "payments", 0..5).await;

    let attempts: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
    let failures = Arc::new(AtomicUsize::new(0));
    let consumer = broker.create_consumer(config("c1", "g"), StringCodec);
    let (record, failed) = (attempts.clone(), failures.clone());
    consumer
        .subscribe("payments", move |msg: Message<String>| {
            let record = record.clone();
            let failed = failed.clone();
            async move {
                record.lock().push(msg.offset());
                if msg.offset() == 2 && failed.fetch_add(1, Ordering::SeqCst) < 2 {
                    return Err::<(), HandlerError>("downstream unavailable".into());
                }
                Ok(())
            }
        })
        .unwrap();

    assert!(wait_for(|| consumer.position("payments", 0) == Some(5), Duration::from_secs(5)).await);
    assert_eq!(*attempts.lock(), vec![0, 1, 2, 2, 2, 3, 4]);
    consumer.close().await;
    assert_eq!(broker.get_committed_offset("payments", "g", 0).unwrap(), Some(5));
    broker.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn paused_consumer_holds_messages_until_resumed() {
    let broker = broker();
    broker
        .get_or_create_category("alerts", CategoryConfig::with_queues(2))
        .unwrap();
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let consumer = recording_consumer(&broker, config("c1", "g"), "alerts", &log, Duration::ZERO);

    consumer.pause();
    assert!(consumer.is_paused());
    publish_n(&broker, "alerts", 0..10).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(log.lock().is_empty());
    // paused consumers still heartbeat
    assert!(broker.heartbeat("alerts", "g", "c1").is_ok());

    consumer.resume();
    assert!(wait_for(|| log.lock().len() == 10, Duration::from_secs(5)).await);
    consumer.close().await;
    broker.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn joining_member_takes_over_committed_queues() {
    let broker = broker();
    broker
        .get_or_create_category("events", CategoryConfig::with_queues(4))
        .unwrap();

    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let first = recording_consumer(
        &broker,
        config("a", "g").auto_commit_interval(Duration::from_millis(20)),
        "events",
        &log,
        Duration::ZERO,
    );
    publish_n(&broker, "events", 0..40).await;
    assert!(wait_for(|| log.lock().len() == 40, Duration::from_secs(5)).await);
    // give auto-commit time to record every position
    tokio::time::sleep(Duration::from_millis(150)).await;

    let second = recording_consumer(
        &broker,
        config("b", "g").auto_commit_interval(Duration::from_millis(20)),
        "events",
        &log,
        Duration::ZERO,
    );
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(broker.assignment("events", "g", "a"), vec![0, 2]);
    assert_eq!(broker.assignment("events", "g", "b"), vec![1, 3]);

    publish_n(&broker, "events", 40..80).await;
    assert!(wait_for(|| log.lock().len() >= 80, Duration::from_secs(5)).await);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let delivered = values(&log);
    assert_eq!(delivered.len(), 80);
    let unique: HashSet<&String> = delivered.iter().collect();
    assert_eq!(unique.len(), 80);

    let mut per_consumer: HashMap<String, usize> = HashMap::new();
    for (id, ..) in log.lock().iter().skip(40) {
        *per_consumer.entry(id.clone()).or_default() += 1;
    }
    assert!(per_consumer.get("b").copied().unwrap_or(0) > 0);

    first.close().await;
    second.close().await;
    broker.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn heartbeating_consumer_survives_maintenance() {
    let broker = Broker::new(BrokerConfig {
        rebalance_debounce: Duration::from_millis(20),
        maintenance_interval: Duration::from_millis(30),
        consumer_timeout: Duration::from_millis(100),
        ..BrokerConfig::default()
    });
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let consumer = recording_consumer(&broker, config("c1", "g"), "pings", &log, Duration::ZERO);

    // a member that never heartbeats is evicted
    broker
        .subscribe("pings", "g", "ghost", &ConsumerConfig::new("ghost", "g"))
        .unwrap();

    tokio::time::sleep(Duration::from_millis(400)).await;
    let group = broker.consumer_group("pings", "g").unwrap();
    assert!(group.is_member("c1"));
    assert!(!group.is_member("ghost"));
    assert_eq!(broker.assignment("pings", "g", "c1"), vec![0]);

    publish_n(&broker, "pings", 0..3).await;
    assert!(wait_for(|| log.lock().len() == 3, Duration::from_secs(5)).await);
    consumer.close().await;
    broker.shutdown().await;
}
