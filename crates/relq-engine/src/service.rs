use std::collections::HashMap;

use relq_config::Config;
use relq_domain::{EndpointId, MessageId, QueueKey};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::info;

use crate::error::EngineError;
use crate::handler::{MessageHandler, Subscription};
use crate::queue::QueueClient;
use crate::sender::SendOptions;

/// The queue service: one [`QueueClient`] per configured queue plus the
/// background workers (pull listeners and janitors). Lifecycle is
/// construct → start → shutdown.
pub struct ReliableQueueService {
    queues: HashMap<QueueKey, QueueClient>,
    shutdown_tx: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ReliableQueueService {
    /// Wire per-queue clients from configuration. Storage connections are
    /// resolved eagerly so misconfiguration surfaces at construction.
    pub fn new(config: Config) -> Result<Self, EngineError> {
        let endpoint = config.endpoint_id.unwrap_or_else(EndpointId::generate);
        let (shutdown_tx, _) = watch::channel(false);
        let mut queues = HashMap::new();
        for (key, settings) in config.queues {
            let client = QueueClient::new(key.clone(), settings, endpoint.clone())?;
            queues.insert(key, client);
        }
        Ok(ReliableQueueService {
            queues,
            shutdown_tx,
            workers: Mutex::new(Vec::new()),
        })
    }

    /// Per-queue façade lookup.
    pub fn queue(&self, key: &QueueKey) -> Result<QueueClient, EngineError> {
        self.queues
            .get(key)
            .cloned()
            .ok_or_else(|| EngineError::UnknownQueue(key.clone()))
    }

    /// Route an externally pushed notification payload to its queue.
    pub async fn on_received(&self, key: &QueueKey, payload: &str) -> Result<(), EngineError> {
        self.queue(key)?.on_received(payload).await
    }

    pub async fn send(
        &self,
        key: &QueueKey,
        body: &[u8],
        options: SendOptions,
    ) -> Result<MessageId, EngineError> {
        self.queue(key)?.send(body, options).await
    }

    pub fn subscribe<H: MessageHandler>(
        &self,
        key: &QueueKey,
        handler: H,
    ) -> Result<Subscription, EngineError> {
        self.queue(key)?.subscribe(handler)
    }

    /// Spawn the janitor for every storage-backed queue and the pull
    /// workers for queues configured with a listener.
    pub async fn start(&self) {
        let mut workers = self.workers.lock().await;
        for client in self.queues.values() {
            let settings = client.settings();
            if !settings.enabled || !client.has_storage() {
                continue;
            }
            {
                let client = client.clone();
                let shutdown = self.shutdown_tx.subscribe();
                workers.push(tokio::spawn(async move {
                    client.janitor_worker(shutdown).await
                }));
            }
            if settings.create_listener && settings.mode.permits_receive() {
                for _ in 0..settings.receive_concurrency {
                    let client = client.clone();
                    let shutdown = self.shutdown_tx.subscribe();
                    workers.push(tokio::spawn(
                        async move { client.pull_worker(shutdown).await },
                    ));
                }
                info!(
                    queue = %client.key(),
                    workers = settings.receive_concurrency,
                    "listener started"
                );
            }
        }
    }

    /// Signal the workers to stop and wait for them to wind down. An
    /// in-flight delivery that gets cut off is reclaimed through its lease.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let mut workers = self.workers.lock().await;
        for handle in workers.drain(..) {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::Delivery;
    use crate::sender::SendOptions;
    use relq_config::{Mode, QueueSettings};
    use relq_domain::{
        machine, MessageId, MessageRecord, MessageState, Notification, Topic, TransitionEvent,
    };
    use relq_store::{connect, Storage};
    use std::sync::{Arc, Mutex as StdMutex};
    use std::time::Duration;
    use uuid::Uuid;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    }

    /// (topic display, body, attempts) per successful handler invocation.
    type Log = Arc<StdMutex<Vec<(String, String, u32)>>>;

    fn new_log() -> Log {
        Arc::new(StdMutex::new(Vec::new()))
    }

    fn recording_handler(log: Log) -> impl crate::handler::MessageHandler {
        move |d: Delivery| {
            let log = log.clone();
            async move {
                log.lock().unwrap().push((
                    d.topic.display().to_string(),
                    String::from_utf8_lossy(d.body()).to_string(),
                    d.attempts,
                ));
                Ok::<bool, anyhow::Error>(true)
            }
        }
    }

    fn settings(conn: &str, configure: impl FnOnce(&mut QueueSettings)) -> QueueSettings {
        let mut s = QueueSettings::new(Mode::Both);
        s.storage = Some(conn.to_string());
        // Keep the janitor quiet unless a scenario relies on it.
        s.janitor_interval = Duration::from_secs(120);
        configure(&mut s);
        s
    }

    fn service_for(key: &QueueKey, settings: QueueSettings) -> ReliableQueueService {
        ReliableQueueService::new(Config::new().with_queue(key.clone(), settings)).unwrap()
    }

    fn storage_for(conn: &str, key: &QueueKey) -> Storage {
        Storage::new(connect(conn).unwrap(), key)
    }

    async fn wait_until(limit: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        while tokio::time::Instant::now() < deadline {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        cond()
    }

    async fn wait_for_state(
        storage: &Storage,
        topic: &Topic,
        id: MessageId,
        state: MessageState,
        limit: Duration,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            if let Some((record, _)) = storage.read_record(topic, id).await.unwrap() {
                if record.state == state {
                    return true;
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    #[tokio::test]
    async fn basic_round_trip_on_the_default_topic() {
        init_tracing();
        let key = QueueKey::new("TEST+1").unwrap();
        let conn = "memory://scenario-round-trip";
        let service = service_for(&key, settings(conn, |s| s.create_listener = true));
        let client = service.queue(&key).unwrap();

        let log = new_log();
        let _subscription = client.subscribe(recording_handler(log.clone())).unwrap();
        service.start().await;

        let id = client.send(b"hello", SendOptions::default()).await.unwrap();

        let reader = log.clone();
        assert!(wait_until(Duration::from_secs(5), move || reader.lock().unwrap().len() == 1).await);
        tokio::time::sleep(Duration::from_millis(300)).await;
        {
            let entries = log.lock().unwrap();
            assert_eq!(entries.len(), 1, "handler must run exactly once");
            assert_eq!(entries[0].0, "Default");
            assert_eq!(entries[0].1, "hello");
            assert_eq!(entries[0].2, 1);
        }

        let storage = storage_for(conn, &key);
        let (record, _) = storage
            .read_record(&Topic::default(), id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.state, MessageState::Delivered);
        assert!(storage
            .get_body(&record.body_blob_path)
            .await
            .unwrap()
            .is_none());

        service.shutdown().await;
    }

    #[tokio::test]
    async fn out_of_order_notifications_deliver_in_sequence() {
        init_tracing();
        let key = QueueKey::new("ORDERED").unwrap();
        let conn = "memory://scenario-reorder";
        let service = service_for(
            &key,
            settings(conn, |s| s.sliding_window = Duration::from_secs(5)),
        );
        let client = service.queue(&key).unwrap();
        let log = new_log();
        let _subscription = client.subscribe(recording_handler(log.clone())).unwrap();

        let topic = Topic::new("t");
        let mut ids = Vec::new();
        for body in [b"m1".as_slice(), b"m2".as_slice(), b"m3".as_slice()] {
            ids.push(
                client
                    .send(body, SendOptions::on_topic(topic.clone()))
                    .await
                    .unwrap(),
            );
        }
        let notify = |index: usize| Notification {
            queue_key: key.clone(),
            message_id: ids[index],
            topic: topic.clone(),
            sequence: (index + 1) as i64,
            attempt_hint: 0,
        };

        // Notifications arrive 2, 3, 1.
        client
            .on_received(&notify(1).to_json().unwrap())
            .await
            .unwrap();
        client
            .on_received(&notify(2).to_json().unwrap())
            .await
            .unwrap();
        assert!(log.lock().unwrap().is_empty(), "2 and 3 must wait for 1");

        client
            .on_received(&notify(0).to_json().unwrap())
            .await
            .unwrap();
        let reader = log.clone();
        assert!(wait_until(Duration::from_secs(5), move || reader.lock().unwrap().len() == 3).await);
        let bodies: Vec<String> = log.lock().unwrap().iter().map(|e| e.1.clone()).collect();
        assert_eq!(bodies, vec!["m1", "m2", "m3"]);
    }

    #[tokio::test]
    async fn missing_sequence_is_skipped_after_the_window() {
        init_tracing();
        let key = QueueKey::new("GAPPED").unwrap();
        let conn = "memory://scenario-gap";
        let service = service_for(
            &key,
            settings(conn, |s| s.sliding_window = Duration::from_secs(2)),
        );
        let client = service.queue(&key).unwrap();
        let log = new_log();
        let _subscription = client.subscribe(recording_handler(log.clone())).unwrap();

        let topic = Topic::new("t");
        let mut ids = Vec::new();
        for body in [b"m1".as_slice(), b"m2".as_slice(), b"m3".as_slice()] {
            ids.push(
                client
                    .send(body, SendOptions::on_topic(topic.clone()))
                    .await
                    .unwrap(),
            );
        }
        let notify = |index: usize| Notification {
            queue_key: key.clone(),
            message_id: ids[index],
            topic: topic.clone(),
            sequence: (index + 1) as i64,
            attempt_hint: 0,
        };

        client
            .on_received(&notify(1).to_json().unwrap())
            .await
            .unwrap();
        client
            .on_received(&notify(2).to_json().unwrap())
            .await
            .unwrap();

        // Sequence 1 vanishes before its notification ever lands.
        let storage = storage_for(conn, &key);
        storage.delete_record(&topic, ids[0], None).await.unwrap();

        let reader = log.clone();
        assert!(wait_until(Duration::from_secs(6), move || reader.lock().unwrap().len() == 2).await);
        let bodies: Vec<String> = log.lock().unwrap().iter().map(|e| e.1.clone()).collect();
        assert_eq!(bodies, vec!["m2", "m3"]);
    }

    #[tokio::test]
    async fn failing_handler_retries_then_poisons() {
        init_tracing();
        let key = QueueKey::new("RETRY").unwrap();
        let conn = "memory://scenario-poison";
        let service = service_for(&key, settings(conn, |s| s.create_listener = true));
        let client = service.queue(&key).unwrap();

        let attempts_seen: Arc<StdMutex<Vec<u32>>> = Arc::new(StdMutex::new(Vec::new()));
        let seen = attempts_seen.clone();
        let _subscription = client
            .subscribe(move |d: Delivery| {
                let seen = seen.clone();
                async move {
                    let round = {
                        let mut guard = seen.lock().unwrap();
                        guard.push(d.attempts);
                        guard.len()
                    };
                    if round <= 2 {
                        Err(anyhow::anyhow!("boom"))
                    } else {
                        Ok(false)
                    }
                }
            })
            .unwrap();
        service.start().await;

        let id = client.send(b"bad", SendOptions::default()).await.unwrap();

        let storage = storage_for(conn, &key);
        assert!(
            wait_for_state(
                &storage,
                &Topic::default(),
                id,
                MessageState::Poison,
                Duration::from_secs(10)
            )
            .await
        );
        let (record, _) = storage
            .read_record(&Topic::default(), id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.attempts, 3);
        assert_eq!(*attempts_seen.lock().unwrap(), vec![1, 2, 3]);
        // Poisoned messages keep their body for out-of-band inspection.
        assert!(storage
            .get_body(&record.body_blob_path)
            .await
            .unwrap()
            .is_some());

        service.shutdown().await;
    }

    #[tokio::test]
    async fn abandoned_lease_is_reclaimed_and_redelivered() {
        init_tracing();
        let key = QueueKey::new("FAILOVER").unwrap();
        let conn = "memory://scenario-reclaim";
        let service = service_for(
            &key,
            settings(conn, |s| {
                s.create_listener = true;
                s.janitor_interval = Duration::from_secs(1);
            }),
        );
        let client = service.queue(&key).unwrap();
        let log = new_log();
        let _subscription = client.subscribe(recording_handler(log.clone())).unwrap();

        let id = client.send(b"work", SendOptions::default()).await.unwrap();

        // A receiver on another node claims the message, consumes its
        // notification, then dies without renewing the lease.
        let storage = storage_for(conn, &key);
        let (record, etag) = storage
            .read_record(&Topic::default(), id)
            .await
            .unwrap()
            .unwrap();
        let now = chrono::Utc::now();
        let claim = TransitionEvent::Claim {
            endpoint: relq_domain::EndpointId::new("dead-node"),
            lease_expires_at: now + chrono::Duration::milliseconds(500),
            now,
        };
        let claimed = machine::transition(&record, &claim).unwrap();
        storage.replace_record(&claimed, &etag).await.unwrap();
        let msg = storage
            .dequeue_notification(Duration::from_secs(300))
            .await
            .unwrap()
            .unwrap();
        storage.ack_notification(&msg.handle).await.unwrap();

        service.start().await;

        let reader = log.clone();
        assert!(
            wait_until(Duration::from_secs(10), move || reader.lock().unwrap().len() == 1).await
        );
        let (record, _) = storage
            .read_record(&Topic::default(), id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.state, MessageState::Delivered);
        // Both claim events show in the attempt count.
        assert_eq!(record.attempts, 2);

        service.shutdown().await;
    }

    #[tokio::test]
    async fn unconsumed_message_expires() {
        init_tracing();
        let key = QueueKey::new("EPHEMERAL").unwrap();
        let conn = "memory://scenario-ttl";
        let service = service_for(
            &key,
            settings(conn, |s| {
                s.create_listener = true;
                s.message_ttl = Duration::from_secs(1);
                s.janitor_interval = Duration::from_secs(1);
            }),
        );
        let client = service.queue(&key).unwrap();
        let log = new_log();
        let _subscription = client.subscribe(recording_handler(log.clone())).unwrap();

        let id = client.send(b"gone", SendOptions::default()).await.unwrap();
        let storage = storage_for(conn, &key);
        let (record, _) = storage
            .read_record(&Topic::default(), id)
            .await
            .unwrap()
            .unwrap();
        let body_path = record.body_blob_path.clone();

        // The receiver comes up only after the TTL has long elapsed.
        tokio::time::sleep(Duration::from_secs(3)).await;
        service.start().await;

        assert!(
            wait_for_state(
                &storage,
                &Topic::default(),
                id,
                MessageState::Expired,
                Duration::from_secs(5)
            )
            .await
        );
        assert!(log.lock().unwrap().is_empty(), "handler must never run");
        assert!(storage.get_body(&body_path).await.unwrap().is_none());

        service.shutdown().await;
    }

    #[tokio::test]
    async fn queued_record_without_notification_is_revived() {
        init_tracing();
        let key = QueueKey::new("ORPHAN").unwrap();
        let conn = "memory://scenario-orphan";
        let service = service_for(
            &key,
            settings(conn, |s| {
                s.create_listener = true;
                s.janitor_interval = Duration::from_secs(1);
                s.notify_orphan_after = Duration::from_secs(1);
            }),
        );
        let client = service.queue(&key).unwrap();
        let log = new_log();
        let _subscription = client.subscribe(recording_handler(log.clone())).unwrap();

        // A sender crashed after the record insert and before the
        // notification enqueue; reproduce that state directly.
        let storage = storage_for(conn, &key);
        let id = Uuid::new_v4();
        let sequence = storage.next_sequence(&Topic::default()).await.unwrap();
        let record = MessageRecord::new(
            id,
            key.clone(),
            Topic::default(),
            sequence,
            storage.body_blob_path(id),
            6,
            "text/plain".to_string(),
            std::collections::HashMap::new(),
            chrono::Utc::now(),
            chrono::Duration::seconds(300),
        );
        let record = machine::transition(&record, &TransitionEvent::Send).unwrap();
        storage.put_body(id, b"orphan", "text/plain").await.unwrap();
        storage.insert_record(&record).await.unwrap();

        service.start().await;

        let reader = log.clone();
        assert!(
            wait_until(Duration::from_secs(10), move || reader.lock().unwrap().len() == 1).await
        );
        assert_eq!(log.lock().unwrap()[0].1, "orphan");
        let (record, _) = storage
            .read_record(&Topic::default(), id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.state, MessageState::Delivered);

        service.shutdown().await;
    }

    #[tokio::test]
    async fn duplicate_notifications_deliver_once() {
        init_tracing();
        let key = QueueKey::new("DEDUP").unwrap();
        let conn = "memory://scenario-dedup";
        let service = service_for(&key, settings(conn, |_| {}));
        let client = service.queue(&key).unwrap();

        let log = new_log();
        let recorder = log.clone();
        let _subscription = client
            .subscribe(move |d: Delivery| {
                let log = recorder.clone();
                async move {
                    // Stay in the handler long enough for the race to bite.
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    log.lock().unwrap().push((
                        d.topic.display().to_string(),
                        String::from_utf8_lossy(d.body()).to_string(),
                        d.attempts,
                    ));
                    Ok::<bool, anyhow::Error>(true)
                }
            })
            .unwrap();

        let id = client.send(b"once", SendOptions::default()).await.unwrap();
        let payload = Notification {
            queue_key: key.clone(),
            message_id: id,
            topic: Topic::default(),
            sequence: 1,
            attempt_hint: 0,
        }
        .to_json()
        .unwrap();

        let (a, b) = tokio::join!(client.on_received(&payload), client.on_received(&payload));
        a.unwrap();
        b.unwrap();

        let reader = log.clone();
        assert!(wait_until(Duration::from_secs(5), move || reader.lock().unwrap().len() == 1).await);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(log.lock().unwrap().len(), 1);

        let storage = storage_for(conn, &key);
        let (record, _) = storage
            .read_record(&Topic::default(), id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.state, MessageState::Delivered);
        assert_eq!(record.attempts, 1);
    }

    #[tokio::test]
    async fn foreign_affinity_defers_then_proceeds() {
        init_tracing();
        let key = QueueKey::new("TOPICAL").unwrap();
        let conn = "memory://scenario-affinity";
        let queue_settings = |conn: &str| {
            settings(conn, |s| s.sliding_window = Duration::from_millis(500))
        };

        let mut config_a = Config::new().with_queue(key.clone(), queue_settings(conn));
        config_a.endpoint_id = Some(relq_domain::EndpointId::new("node-a"));
        let service_a = ReliableQueueService::new(config_a).unwrap();
        let mut config_b = Config::new().with_queue(key.clone(), queue_settings(conn));
        config_b.endpoint_id = Some(relq_domain::EndpointId::new("node-b"));
        let service_b = ReliableQueueService::new(config_b).unwrap();

        let client_a = service_a.queue(&key).unwrap();
        let client_b = service_b.queue(&key).unwrap();
        let log_a = new_log();
        let log_b = new_log();
        let _sub_a = client_a.subscribe(recording_handler(log_a.clone())).unwrap();
        let _sub_b = client_b.subscribe(recording_handler(log_b.clone())).unwrap();

        let topic = Topic::new("t");
        let m1 = client_a
            .send(b"m1", SendOptions::on_topic(topic.clone()))
            .await
            .unwrap();
        let m2 = client_a
            .send(b"m2", SendOptions::on_topic(topic.clone()))
            .await
            .unwrap();

        // Node A delivers first and becomes the topic's preferred owner.
        let n1 = Notification {
            queue_key: key.clone(),
            message_id: m1,
            topic: topic.clone(),
            sequence: 1,
            attempt_hint: 0,
        };
        client_a.on_received(&n1.to_json().unwrap()).await.unwrap();
        assert_eq!(log_a.lock().unwrap().len(), 1);

        // Node B sees the live affinity, defers, then proceeds once it has
        // waited a full sliding window without the owner claiming.
        let n2 = Notification {
            queue_key: key.clone(),
            message_id: m2,
            topic: topic.clone(),
            sequence: 2,
            attempt_hint: 0,
        };
        client_b.on_received(&n2.to_json().unwrap()).await.unwrap();
        assert!(
            log_b.lock().unwrap().is_empty(),
            "node B must defer while the affinity is fresh"
        );

        let reader = log_b.clone();
        assert!(wait_until(Duration::from_secs(3), move || reader.lock().unwrap().len() == 1).await);
        assert_eq!(log_b.lock().unwrap()[0].1, "m2");
        assert_eq!(log_a.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn janitor_sweeps_expired_affinity_and_orphaned_blobs() {
        init_tracing();
        let key = QueueKey::new("SWEEP").unwrap();
        let conn = "memory://scenario-sweep";
        let service = service_for(
            &key,
            settings(conn, |s| s.blob_orphan_grace = Duration::from_millis(0)),
        );
        let client = service.queue(&key).unwrap();
        let storage = storage_for(conn, &key);

        let topic = Topic::new("t");
        let now = chrono::Utc::now();
        storage
            .write_affinity(
                &topic,
                &relq_domain::TopicAffinityRecord {
                    last_owner_endpoint_id: relq_domain::EndpointId::new("gone-node"),
                    last_activity_at: now - chrono::Duration::seconds(120),
                    expires_at: now - chrono::Duration::seconds(90),
                },
            )
            .await
            .unwrap();
        let stray = Uuid::new_v4();
        storage
            .put_body(stray, b"junk", "application/octet-stream")
            .await
            .unwrap();

        client.sweep_once().await.unwrap();

        assert!(storage.read_affinity(&topic).await.unwrap().is_none());
        assert!(storage
            .get_body(&storage.body_blob_path(stray))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn unknown_queue_is_refused() {
        let key = QueueKey::new("KNOWN").unwrap();
        let service = service_for(&key, settings("memory://scenario-unknown", |_| {}));
        let err = service
            .queue(&QueueKey::new("SOMETHING+ELSE").unwrap())
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownQueue(_)));
    }

    #[tokio::test]
    async fn service_builds_from_yaml_config() {
        let config = relq_config::from_yaml_str(
            r#"
endpoint_id: node-test
queues:
  "TEST+1":
    mode: both
    storage: "memory://scenario-yaml"
"#,
        )
        .unwrap();
        let service = ReliableQueueService::new(config).unwrap();
        let client = service.queue(&QueueKey::new("TEST+1").unwrap()).unwrap();
        assert_eq!(client.endpoint().as_str(), "node-test");
        client.send(b"ping", SendOptions::default()).await.unwrap();
    }
}
