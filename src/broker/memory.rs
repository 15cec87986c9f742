//! In-process broker with a group coordinator.
//!
//! Topics are lazily created with a fixed partition count. Each group tracks a
//! generation, its live members and committed offsets. Members heartbeat on
//! every pull; a member silent for longer than the session timeout is evicted
//! and its partitions move to the survivors, starting from the last commit.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::broker::partitioner::{partition_for_key, range_assign};
use crate::broker::{
    Broker, BrokerError, BrokerMessage, ConsumerEvent, GroupConsumer, PartitionId, Publish,
    ProducerRecord, RebalanceCallback, RebalanceEvent,
};

const MAX_POLL_WAIT: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
struct StoredRecord {
    key: String,
    payload: Bytes,
}

#[derive(Debug)]
struct Member {
    last_seen: Instant,
    assigned: Vec<PartitionId>,
}

#[derive(Debug)]
struct Group {
    topic: String,
    generation: u64,
    members: BTreeMap<String, Member>,
    /// Next offset to deliver, per partition.
    committed: HashMap<PartitionId, u64>,
}

impl Group {
    fn rebalance(&mut self, partitions: u32) {
        self.generation += 1;
        let assignment = range_assign(self.members.keys().map(String::as_str), partitions);
        for (id, partitions) in assignment {
            if let Some(member) = self.members.get_mut(&id) {
                member.assigned = partitions;
            }
        }
        tracing::debug!(
            generation = self.generation,
            members = self.members.len(),
            "Group rebalanced"
        );
    }

    fn evict_expired(&mut self, now: Instant, session_timeout: Duration) -> bool {
        let before = self.members.len();
        self.members.retain(|id, member| {
            let alive = now.duration_since(member.last_seen) <= session_timeout;
            if !alive {
                tracing::info!(member = %id, "Evicting member after session timeout");
            }
            alive
        });
        self.members.len() != before
    }
}

#[derive(Debug, Default)]
struct State {
    topics: HashMap<String, Vec<Vec<StoredRecord>>>,
    groups: HashMap<String, Group>,
    next_member: u64,
}

impl State {
    fn topic(&mut self, name: &str, partitions: u32) -> &mut Vec<Vec<StoredRecord>> {
        self.topics
            .entry(name.to_string())
            .or_insert_with(|| vec![Vec::new(); partitions as usize])
    }
}

#[derive(Debug)]
struct Inner {
    partitions: u32,
    session_timeout: Duration,
    state: Mutex<State>,
    notify: Notify,
    failing_publishes: AtomicU32,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        // A poisoned lock only means another thread panicked mid-update; the
        // state itself is still consistent at statement granularity.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Shared handle to an in-process broker.
#[derive(Debug, Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl MemoryBroker {
    pub fn new(partitions: u32, session_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                partitions: partitions.max(1),
                session_timeout,
                state: Mutex::new(State::default()),
                notify: Notify::new(),
                failing_publishes: AtomicU32::new(0),
            }),
        }
    }

    pub fn partitions(&self) -> u32 {
        self.inner.partitions
    }

    /// Make the next `count` publishes fail with a transient error.
    pub fn fail_next_publishes(&self, count: u32) {
        self.inner.failing_publishes.store(count, Ordering::SeqCst);
    }

    /// Number of records in one partition.
    pub fn partition_len(&self, topic: &str, partition: PartitionId) -> usize {
        self.inner
            .lock()
            .topics
            .get(topic)
            .and_then(|p| p.get(partition as usize))
            .map_or(0, Vec::len)
    }

    /// Number of records across all partitions of `topic`.
    pub fn topic_len(&self, topic: &str) -> usize {
        self.inner
            .lock()
            .topics
            .get(topic)
            .map_or(0, |p| p.iter().map(Vec::len).sum())
    }

    /// Committed position for a group's partition.
    pub fn committed_offset(&self, group_id: &str, partition: PartitionId) -> Option<u64> {
        self.inner
            .lock()
            .groups
            .get(group_id)
            .and_then(|g| g.committed.get(&partition).copied())
    }

    /// Live members of a group, sorted by id.
    pub fn members(&self, group_id: &str) -> Vec<String> {
        self.inner
            .lock()
            .groups
            .get(group_id)
            .map(|g| g.members.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn generation(&self, group_id: &str) -> u64 {
        self.inner
            .lock()
            .groups
            .get(group_id)
            .map_or(0, |g| g.generation)
    }

    fn append(&self, record: ProducerRecord) -> Result<(), BrokerError> {
        let pending = self.inner.failing_publishes.load(Ordering::SeqCst);
        if pending > 0 {
            self.inner.failing_publishes.store(pending - 1, Ordering::SeqCst);
            return Err(BrokerError::Unavailable("injected publish failure".to_string()));
        }

        let partitions = self.inner.partitions;
        let partition = partition_for_key(&record.key, partitions);
        {
            let mut state = self.inner.lock();
            state.topic(&record.topic, partitions)[partition as usize].push(StoredRecord {
                key: record.key,
                payload: record.payload,
            });
        }
        self.inner.notify.notify_waiters();
        Ok(())
    }
}

impl Broker for MemoryBroker {
    type Publisher = MemoryPublisher;
    type Consumer = MemoryConsumer;

    async fn ping(&self) -> Result<(), BrokerError> {
        Ok(())
    }

    fn publisher(&self) -> Result<MemoryPublisher, BrokerError> {
        Ok(MemoryPublisher {
            broker: self.clone(),
        })
    }

    fn join_group(&self, group_id: &str, topic: &str) -> Result<MemoryConsumer, BrokerError> {
        let partitions = self.inner.partitions;
        let member_id = {
            let mut state = self.inner.lock();
            state.topic(topic, partitions);
            state.next_member += 1;
            let member_id = format!("{group_id}-{:06}", state.next_member);

            let group = state.groups.entry(group_id.to_string()).or_insert_with(|| Group {
                topic: topic.to_string(),
                generation: 0,
                members: BTreeMap::new(),
                committed: HashMap::new(),
            });
            if group.topic != topic {
                return Err(BrokerError::Config(format!(
                    "group {group_id} already consumes topic {}",
                    group.topic
                )));
            }

            group.members.insert(
                member_id.clone(),
                Member {
                    last_seen: Instant::now(),
                    assigned: Vec::new(),
                },
            );
            group.rebalance(partitions);
            member_id
        };
        self.inner.notify.notify_waiters();

        tracing::info!(member = %member_id, group = group_id, topic, "Joined consumer group");

        Ok(MemoryConsumer {
            inner: self.inner.clone(),
            group_id: group_id.to_string(),
            topic: topic.to_string(),
            member_id,
            generation: 0,
            assigned: Vec::new(),
            positions: HashMap::new(),
            marks: HashMap::new(),
            on_rebalance: None,
            cursor: 0,
            closed: false,
        })
    }
}

/// Publishing handle for a [`MemoryBroker`].
#[derive(Debug, Clone)]
pub struct MemoryPublisher {
    broker: MemoryBroker,
}

impl Publish for MemoryPublisher {
    async fn publish(&self, record: ProducerRecord) -> Result<(), BrokerError> {
        self.broker.append(record)
    }

    async fn flush(&self, _timeout: Duration) -> Result<(), BrokerError> {
        Ok(())
    }
}

/// A group member. Dropping it without `close` behaves like a crash.
pub struct MemoryConsumer {
    inner: Arc<Inner>,
    group_id: String,
    topic: String,
    member_id: String,
    generation: u64,
    assigned: Vec<PartitionId>,
    positions: HashMap<PartitionId, u64>,
    marks: HashMap<PartitionId, u64>,
    on_rebalance: Option<RebalanceCallback>,
    cursor: usize,
    closed: bool,
}

impl MemoryConsumer {
    /// One non-blocking pass: heartbeat, react to membership changes, fetch.
    fn poll_once(&mut self) -> Option<ConsumerEvent> {
        let partitions = self.inner.partitions;
        let session_timeout = self.inner.session_timeout;
        let now = Instant::now();

        let mut state = self.inner.lock();
        let State { topics, groups, .. } = &mut *state;
        let Some(group) = groups.get_mut(&self.group_id) else {
            return Some(ConsumerEvent::Error(BrokerError::UnknownMember(
                self.member_id.clone(),
            )));
        };

        let mut changed = group.evict_expired(now, session_timeout);
        match group.members.get_mut(&self.member_id) {
            Some(member) => member.last_seen = now,
            None => {
                tracing::warn!(member = %self.member_id, "Member was evicted, rejoining");
                group.members.insert(
                    self.member_id.clone(),
                    Member {
                        last_seen: now,
                        assigned: Vec::new(),
                    },
                );
                changed = true;
            }
        }
        if changed {
            group.rebalance(partitions);
            self.inner.notify.notify_waiters();
        }

        if group.generation != self.generation {
            let assigned = group
                .members
                .get(&self.member_id)
                .map(|m| m.assigned.clone())
                .unwrap_or_default();
            let event = RebalanceEvent {
                generation: group.generation,
                assigned: assigned
                    .iter()
                    .copied()
                    .filter(|p| !self.assigned.contains(p))
                    .collect(),
                revoked: self
                    .assigned
                    .iter()
                    .copied()
                    .filter(|p| !assigned.contains(p))
                    .collect(),
            };

            for p in &event.revoked {
                self.positions.remove(p);
                self.marks.remove(p);
            }
            for p in &event.assigned {
                let start = group.committed.get(p).copied().unwrap_or(0);
                self.positions.insert(*p, start);
            }
            self.generation = group.generation;
            self.assigned = assigned;
            return Some(ConsumerEvent::Rebalanced(event));
        }

        let log = topics.get(&self.topic)?;
        let count = self.assigned.len();
        for step in 0..count {
            let partition = self.assigned[(self.cursor + step) % count];
            let position = self.positions.entry(partition).or_insert(0);
            if let Some(record) = log
                .get(partition as usize)
                .and_then(|records| records.get(*position as usize))
            {
                let message = BrokerMessage {
                    topic: self.topic.clone(),
                    partition,
                    offset: *position,
                    key: Some(record.key.clone()),
                    payload: record.payload.clone(),
                };
                *position += 1;
                self.cursor = (self.cursor + step + 1) % count;
                return Some(ConsumerEvent::Message(message));
            }
        }
        None
    }

    fn poll_interval(&self) -> Duration {
        (self.inner.session_timeout / 4).min(MAX_POLL_WAIT)
    }
}

impl GroupConsumer for MemoryConsumer {
    fn member_id(&self) -> &str {
        &self.member_id
    }

    fn assigned_partitions(&self) -> Vec<PartitionId> {
        self.assigned.clone()
    }

    fn on_rebalance(&mut self, callback: RebalanceCallback) {
        self.on_rebalance = Some(callback);
    }

    async fn pull(&mut self) -> ConsumerEvent {
        if self.closed {
            return ConsumerEvent::Error(BrokerError::Closed);
        }
        let inner = self.inner.clone();
        loop {
            let notified = inner.notify.notified();
            if let Some(event) = self.poll_once() {
                if let (ConsumerEvent::Rebalanced(rebalance), Some(callback)) =
                    (&event, &self.on_rebalance)
                {
                    callback(rebalance);
                }
                return event;
            }
            let _ = tokio::time::timeout(self.poll_interval(), notified).await;
        }
    }

    fn mark_offset(&mut self, message: &BrokerMessage) -> Result<(), BrokerError> {
        if !self.assigned.contains(&message.partition) {
            return Err(BrokerError::NotAssigned(message.partition));
        }
        let next = message.offset + 1;
        let mark = self.marks.entry(message.partition).or_insert(next);
        *mark = (*mark).max(next);
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), BrokerError> {
        if self.marks.is_empty() {
            return Ok(());
        }
        let marks = std::mem::take(&mut self.marks);

        let mut state = self.inner.lock();
        let group = state
            .groups
            .get_mut(&self.group_id)
            .ok_or_else(|| BrokerError::UnknownMember(self.member_id.clone()))?;
        let owned = group
            .members
            .get(&self.member_id)
            .map(|m| m.assigned.clone())
            .ok_or_else(|| BrokerError::UnknownMember(self.member_id.clone()))?;

        for (partition, offset) in marks {
            if !owned.contains(&partition) {
                tracing::debug!(partition, "Skipping commit for partition no longer owned");
                continue;
            }
            let committed = group.committed.entry(partition).or_insert(0);
            *committed = (*committed).max(offset);
        }
        Ok(())
    }

    async fn close(mut self) -> Result<(), BrokerError> {
        let committed = self.commit().await;
        self.closed = true;
        {
            let mut state = self.inner.lock();
            if let Some(group) = state.groups.get_mut(&self.group_id) {
                if group.members.remove(&self.member_id).is_some() {
                    group.rebalance(self.inner.partitions);
                }
            }
        }
        self.inner.notify.notify_waiters();
        tracing::info!(member = %self.member_id, "Left consumer group");
        committed
    }
}
