//! In-process message broker.
//!
//! Every agent owns a bounded FIFO mailbox. Direct messages land in the
//! recipient's mailbox, broadcasts are copied into every other registered
//! mailbox, and topic publishes are copied to each subscriber. A full mailbox
//! drops its oldest message to make room. Direct messages for an agent that
//! has unregistered are dropped until it registers again.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::message::Message;
use crate::persistence::MessageArchive;
use crate::retry::{BackoffPolicy, Jitter};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub mailbox_capacity: usize,
    pub history_capacity: usize,
    pub poll_interval_ms: u64,
    pub ack_timeout_ms: u64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    /// Directory for the per-message audit trail; disabled when `None`
    pub archive_dir: Option<PathBuf>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: 1000,
            history_capacity: 1000,
            poll_interval_ms: 10,
            ack_timeout_ms: 5000,
            max_retries: 3,
            retry_base_delay_ms: 1000,
            archive_dir: None,
        }
    }
}

impl BrokerConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Resend delay: base * 2^attempt plus up to one base delay of jitter
    pub fn backoff(&self) -> BackoffPolicy {
        let base = Duration::from_millis(self.retry_base_delay_ms);
        BackoffPolicy::new(base, 2.0, base * 32, Jitter::Fixed(base))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerStats {
    pub sent: u64,
    pub delivered: u64,
    pub received: u64,
    pub dropped: u64,
    pub acknowledged: u64,
    pub ack_timeouts: u64,
    pub mailboxes: usize,
    pub pending_acks: usize,
}

#[derive(Debug)]
struct PendingAck {
    notify: Arc<Notify>,
    acknowledged: bool,
}

#[derive(Debug, Default)]
struct BrokerState {
    mailboxes: HashMap<String, VecDeque<Message>>,
    topics: HashMap<String, HashSet<String>>,
    history: VecDeque<Message>,
    pending_acks: HashMap<String, PendingAck>,
    /// Agents that unregistered and have not come back
    retired: HashSet<String>,
    stats: BrokerStats,
}

impl BrokerState {
    fn record_history(&mut self, message: &Message, capacity: usize) {
        if capacity == 0 {
            return;
        }
        while self.history.len() >= capacity {
            self.history.pop_front();
        }
        self.history.push_back(message.clone());
    }

    fn mailbox(&mut self, agent_id: &str) -> &mut VecDeque<Message> {
        self.retired.remove(agent_id);
        self.mailboxes.entry(agent_id.to_string()).or_default()
    }

    fn deliver(&mut self, recipient: &str, message: Message, capacity: usize) {
        if self.retired.contains(recipient) {
            debug!(agent_id = %recipient, message_id = %message.id, "Recipient unregistered, dropping message");
            self.stats.dropped += 1;
            return;
        }
        let mailbox = self.mailboxes.entry(recipient.to_string()).or_default();
        if mailbox.len() >= capacity.max(1) {
            if let Some(dropped) = mailbox.pop_front() {
                warn!(
                    agent_id = %recipient,
                    dropped_message_id = %dropped.id,
                    capacity,
                    "Mailbox full, dropped oldest message"
                );
                self.stats.dropped += 1;
            }
        }
        mailbox.push_back(message);
        self.stats.delivered += 1;
    }
}

#[derive(Debug)]
pub struct MessageBroker {
    config: BrokerConfig,
    backoff: BackoffPolicy,
    archive: Option<MessageArchive>,
    state: Mutex<BrokerState>,
}

impl Default for MessageBroker {
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}

impl MessageBroker {
    pub fn new(config: BrokerConfig) -> Self {
        let archive = config.archive_dir.clone().map(MessageArchive::new);
        Self {
            backoff: config.backoff(),
            archive,
            config,
            state: Mutex::new(BrokerState::default()),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn register(&self, agent_id: &str) {
        let mut state = self.lock();
        if !state.mailboxes.contains_key(agent_id) {
            state.mailbox(agent_id);
            debug!(agent_id = %agent_id, "Mailbox registered");
        }
    }

    /// Remove the mailbox and every topic subscription of `agent_id`.
    /// Returns the messages that were still queued.
    pub fn unregister(&self, agent_id: &str) -> Vec<Message> {
        let mut state = self.lock();
        for subscribers in state.topics.values_mut() {
            subscribers.remove(agent_id);
        }
        let leftover: Vec<Message> = state
            .mailboxes
            .remove(agent_id)
            .map(Vec::from)
            .unwrap_or_default();
        state.retired.insert(agent_id.to_string());
        debug!(agent_id = %agent_id, leftover = leftover.len(), "Mailbox unregistered");
        leftover
    }

    pub fn is_registered(&self, agent_id: &str) -> bool {
        self.lock().mailboxes.contains_key(agent_id)
    }

    pub fn subscribe(&self, agent_id: &str, topic: &str) {
        let mut state = self.lock();
        state
            .topics
            .entry(topic.to_string())
            .or_default()
            .insert(agent_id.to_string());
        state.mailbox(agent_id);
    }

    pub fn unsubscribe(&self, agent_id: &str, topic: &str) {
        let mut state = self.lock();
        if let Some(subscribers) = state.topics.get_mut(topic) {
            subscribers.remove(agent_id);
            if subscribers.is_empty() {
                state.topics.remove(topic);
            }
        }
    }

    async fn archive(&self, message: &Message) {
        if let Some(archive) = &self.archive {
            if let Err(e) = archive.store(message).await {
                warn!(message_id = %message.id, error = %e, "Failed to archive message");
            }
        }
    }

    /// Record, archive and route a message. Broadcasts reach every
    /// registered mailbox except the sender's.
    pub async fn send(&self, message: Message) {
        self.archive(&message).await;

        let capacity = self.config.mailbox_capacity;
        let mut state = self.lock();
        state.record_history(&message, self.config.history_capacity);
        state.stats.sent += 1;

        match message.to.clone() {
            Some(recipient) => {
                debug!(
                    message_id = %message.id,
                    message_type = ?message.message_type,
                    from = %message.from,
                    to = %recipient,
                    "Message routed"
                );
                state.deliver(&recipient, message, capacity);
            }
            None => {
                let recipients: Vec<String> = state
                    .mailboxes
                    .keys()
                    .filter(|id| **id != message.from)
                    .cloned()
                    .collect();
                debug!(
                    message_id = %message.id,
                    message_type = ?message.message_type,
                    from = %message.from,
                    recipients = recipients.len(),
                    "Broadcast fanned out"
                );
                for recipient in recipients {
                    state.deliver(&recipient, message.clone(), capacity);
                }
            }
        }
    }

    /// Copy `message` into every subscriber's mailbox. Returns the number
    /// of subscribers reached.
    pub async fn publish(&self, topic: &str, message: Message) -> usize {
        self.archive(&message).await;

        let capacity = self.config.mailbox_capacity;
        let mut state = self.lock();
        state.record_history(&message, self.config.history_capacity);
        state.stats.sent += 1;

        let subscribers: Vec<String> = state
            .topics
            .get(topic)
            .map(|subs| subs.iter().cloned().collect())
            .unwrap_or_default();

        for subscriber in &subscribers {
            let mut copy = message.clone();
            copy.to = Some(subscriber.clone());
            state.deliver(subscriber, copy, capacity);
        }

        debug!(topic = %topic, message_id = %message.id, subscribers = subscribers.len(), "Published to topic");
        subscribers.len()
    }

    /// Pop the oldest message without waiting
    pub fn try_receive(&self, agent_id: &str) -> Option<Message> {
        let mut state = self.lock();
        let message = state.mailbox(agent_id).pop_front();
        if message.is_some() {
            state.stats.received += 1;
        }
        message
    }

    /// Pop the oldest message, polling until `timeout` elapses. A timeout
    /// too large to represent waits indefinitely.
    pub async fn receive(&self, agent_id: &str, timeout: Duration) -> Option<Message> {
        let deadline = Instant::now().checked_add(timeout);
        loop {
            if let Some(message) = self.try_receive(agent_id) {
                return Some(message);
            }
            let mut pause = self.config.poll_interval();
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    return None;
                }
                pause = pause.min(deadline - now);
            }
            tokio::time::sleep(pause).await;
        }
    }

    /// Mark a message as acknowledged, waking a pending `send_with_ack`.
    /// Returns false when nothing was waiting on that id.
    pub fn acknowledge(&self, message_id: &str) -> bool {
        let mut state = self.lock();
        let Some(pending) = state.pending_acks.get_mut(message_id) else {
            return false;
        };
        if !pending.acknowledged {
            pending.acknowledged = true;
            pending.notify.notify_one();
        }
        true
    }

    fn is_acknowledged(&self, message_id: &str) -> bool {
        self.lock()
            .pending_acks
            .get(message_id)
            .is_some_and(|pending| pending.acknowledged)
    }

    fn finish_ack(&self, message_id: &str, acknowledged: bool) {
        let mut state = self.lock();
        state.pending_acks.remove(message_id);
        if acknowledged {
            state.stats.acknowledged += 1;
        }
    }

    /// Send and wait for the recipient to acknowledge. Unacknowledged
    /// messages are resent up to `max_retries` times with exponential
    /// backoff between attempts. The same message id is reused, so
    /// receivers may see duplicates.
    pub async fn send_with_ack(&self, message: Message, timeout: Duration) -> bool {
        let message_id = message.id.clone();
        let notify = Arc::new(Notify::new());
        self.lock().pending_acks.insert(
            message_id.clone(),
            PendingAck {
                notify: Arc::clone(&notify),
                acknowledged: false,
            },
        );

        let max_retries = self.config.max_retries;
        for attempt in 0..=max_retries {
            if attempt > 0 {
                let delay = self.backoff.delay_for(attempt - 1);
                debug!(
                    message_id = %message_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Backing off before resend"
                );
                tokio::time::sleep(delay).await;
                if self.is_acknowledged(&message_id) {
                    self.finish_ack(&message_id, true);
                    return true;
                }
            }

            self.send(message.clone()).await;

            let waited = tokio::time::timeout(timeout, notify.notified()).await;
            if waited.is_ok() || self.is_acknowledged(&message_id) {
                self.finish_ack(&message_id, true);
                return true;
            }

            self.lock().stats.ack_timeouts += 1;
            warn!(
                message_id = %message_id,
                to = ?message.to,
                attempt = attempt + 1,
                max_attempts = max_retries + 1,
                "Acknowledgement timed out"
            );
        }

        self.finish_ack(&message_id, false);
        info!(message_id = %message_id, to = ?message.to, "Giving up on unacknowledged message");
        false
    }

    pub fn mailbox_len(&self, agent_id: &str) -> usize {
        self.lock().mailboxes.get(agent_id).map_or(0, VecDeque::len)
    }

    /// Most recent `limit` messages, oldest first
    pub fn history(&self, limit: usize) -> Vec<Message> {
        let state = self.lock();
        let skip = state.history.len().saturating_sub(limit);
        state.history.iter().skip(skip).cloned().collect()
    }

    pub fn stats(&self) -> BrokerStats {
        let state = self.lock();
        BrokerStats {
            mailboxes: state.mailboxes.len(),
            pending_acks: state.pending_acks.len(),
            ..state.stats.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::MessageType;
    use tempfile::TempDir;

    fn fast_config() -> BrokerConfig {
        BrokerConfig {
            poll_interval_ms: 1,
            retry_base_delay_ms: 5,
            max_retries: 2,
            ..BrokerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_direct_messages_are_fifo() {
        let broker = MessageBroker::default();
        for n in 0..3 {
            broker
                .send(Message::direct(MessageType::Request, "a", "b").with_field("n", n))
                .await;
        }

        for n in 0..3 {
            let message = broker.try_receive("b").unwrap();
            assert_eq!(message.payload["n"], n);
        }
        assert!(broker.try_receive("b").is_none());
    }

    #[tokio::test]
    async fn test_broadcast_skips_sender() {
        let broker = MessageBroker::default();
        for agent in ["coordinator", "w1", "w2"] {
            broker.register(agent);
        }

        broker.send(Message::broadcast(MessageType::Shutdown, "coordinator")).await;

        assert_eq!(broker.mailbox_len("coordinator"), 0);
        assert_eq!(broker.mailbox_len("w1"), 1);
        assert_eq!(broker.mailbox_len("w2"), 1);
        assert_eq!(broker.stats().delivered, 2);
    }

    #[tokio::test]
    async fn test_full_mailbox_drops_oldest() {
        let broker = MessageBroker::new(BrokerConfig {
            mailbox_capacity: 2,
            ..BrokerConfig::default()
        });
        for n in 0..3 {
            broker
                .send(Message::direct(MessageType::Request, "a", "b").with_field("n", n))
                .await;
        }

        assert_eq!(broker.mailbox_len("b"), 2);
        assert_eq!(broker.try_receive("b").unwrap().payload["n"], 1);
        assert_eq!(broker.stats().dropped, 1);
    }

    #[tokio::test]
    async fn test_publish_reaches_only_subscribers() {
        let broker = MessageBroker::default();
        broker.subscribe("w1", "results");
        broker.subscribe("w2", "results");
        broker.register("w3");

        let reached = broker
            .publish("results", Message::broadcast(MessageType::Broadcast, "coordinator"))
            .await;
        assert_eq!(reached, 2);
        assert_eq!(broker.try_receive("w1").unwrap().to.as_deref(), Some("w1"));
        assert_eq!(broker.mailbox_len("w3"), 0);

        broker.unsubscribe("w2", "results");
        broker.unregister("w1");
        broker.try_receive("w2");
        let reached = broker
            .publish("results", Message::broadcast(MessageType::Broadcast, "coordinator"))
            .await;
        assert_eq!(reached, 0);
    }

    #[tokio::test]
    async fn test_receive_times_out_on_empty_mailbox() {
        let broker = MessageBroker::new(fast_config());
        let started = std::time::Instant::now();
        assert!(broker.receive("nobody", Duration::from_millis(20)).await.is_none());
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_send_with_ack_succeeds_when_acknowledged() {
        let broker = Arc::new(MessageBroker::new(fast_config()));

        let receiver = {
            let broker = Arc::clone(&broker);
            tokio::spawn(async move {
                let message = broker.receive("b", Duration::from_secs(1)).await.unwrap();
                assert!(broker.acknowledge(&message.id));
            })
        };

        let message = Message::direct(MessageType::TaskAssignment, "a", "b");
        assert!(broker.send_with_ack(message, Duration::from_millis(500)).await);
        receiver.await.unwrap();

        let stats = broker.stats();
        assert_eq!(stats.acknowledged, 1);
        assert_eq!(stats.pending_acks, 0);
        assert_eq!(stats.sent, 1);
    }

    #[tokio::test]
    async fn test_send_with_ack_resends_then_gives_up() {
        let broker = MessageBroker::new(fast_config());
        let message = Message::direct(MessageType::TaskAssignment, "a", "silent");
        let id = message.id.clone();

        assert!(!broker.send_with_ack(message, Duration::from_millis(10)).await);

        // one initial send plus two retries, all with the same id
        assert_eq!(broker.mailbox_len("silent"), 3);
        while let Some(copy) = broker.try_receive("silent") {
            assert_eq!(copy.id, id);
        }
        assert_eq!(broker.stats().ack_timeouts, 3);
        assert!(!broker.acknowledge(&id));
    }

    #[tokio::test]
    async fn test_unregistered_agent_gets_no_new_mail() {
        let broker = MessageBroker::default();
        for agent in ["coordinator", "w1", "w2"] {
            broker.register(agent);
        }
        broker.unregister("w1");

        // a late resend must not bring the mailbox back
        broker.send(Message::direct(MessageType::TaskAssignment, "coordinator", "w1")).await;
        assert!(!broker.is_registered("w1"));
        assert_eq!(broker.stats().dropped, 1);

        broker.send(Message::broadcast(MessageType::Shutdown, "coordinator")).await;
        assert_eq!(broker.mailbox_len("w1"), 0);
        assert_eq!(broker.mailbox_len("w2"), 1);

        broker.register("w1");
        broker.send(Message::direct(MessageType::Request, "coordinator", "w1")).await;
        assert_eq!(broker.mailbox_len("w1"), 1);
    }

    #[tokio::test]
    async fn test_receive_accepts_unbounded_timeout() {
        let broker = Arc::new(MessageBroker::new(fast_config()));
        let sender = {
            let broker = Arc::clone(&broker);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                broker.send(Message::direct(MessageType::Request, "a", "b")).await;
            })
        };

        let message = broker.receive("b", Duration::MAX).await;
        assert_eq!(message.map(|m| m.from), Some("a".to_string()));
        sender.await.unwrap();
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let broker = MessageBroker::new(BrokerConfig {
            history_capacity: 3,
            ..BrokerConfig::default()
        });
        for n in 0..5 {
            broker
                .send(Message::direct(MessageType::Request, "a", "b").with_field("n", n))
                .await;
        }

        let history = broker.history(10);
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].payload["n"], 2);
        assert_eq!(broker.history(1)[0].payload["n"], 4);
    }

    #[tokio::test]
    async fn test_archive_dir_records_messages() {
        let temp_dir = TempDir::new().unwrap();
        let broker = MessageBroker::new(BrokerConfig {
            archive_dir: Some(temp_dir.path().to_path_buf()),
            ..BrokerConfig::default()
        });
        broker.send(Message::direct(MessageType::Request, "a", "b")).await;
        assert_eq!(std::fs::read_dir(temp_dir.path()).unwrap().count(), 1);
    }
}
