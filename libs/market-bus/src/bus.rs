//! Bus core: topic logs, group cursors, delivery.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::pattern::TopicPattern;
use crate::{BusError, Result};

const DEFAULT_RETENTION: usize = 65_536;

#[derive(Debug)]
struct Record {
    offset: u64,
    key: String,
    payload: Vec<u8>,
}

#[derive(Default)]
struct TopicLog {
    base_offset: u64,
    records: VecDeque<Arc<Record>>,
}

impl TopicLog {
    fn next_offset(&self) -> u64 {
        self.base_offset + self.records.len() as u64
    }

    fn get(&self, offset: u64) -> Option<Arc<Record>> {
        if offset < self.base_offset {
            return None;
        }
        self.records.get((offset - self.base_offset) as usize).cloned()
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Cursor {
    /// Next offset the group will be handed.
    delivered: u64,
    /// First offset not yet acknowledged as processed.
    committed: u64,
}

#[derive(Default)]
struct GroupState {
    cursors: Mutex<HashMap<String, Cursor>>,
}

struct Inner {
    topics: RwLock<HashMap<String, Arc<Mutex<TopicLog>>>>,
    groups: Mutex<HashMap<String, Arc<GroupState>>>,
    notify: Notify,
    closed: AtomicBool,
    retention: usize,
}

/// Process-wide bus handle; cheap to clone, thread-safe.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<Inner>,
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBus {
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_RETENTION)
    }

    /// Bus keeping at most `retention` records per topic.
    pub fn with_retention(retention: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                topics: RwLock::new(HashMap::new()),
                groups: Mutex::new(HashMap::new()),
                notify: Notify::new(),
                closed: AtomicBool::new(false),
                retention,
            }),
        }
    }

    /// Append a keyed record to `topic`. Returns the assigned offset.
    pub fn publish(&self, topic: &str, key: &str, payload: Vec<u8>) -> Result<u64> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(BusError::Closed);
        }

        let log = {
            let topics = self.inner.topics.read();
            topics.get(topic).cloned()
        };
        let log = match log {
            Some(log) => log,
            None => {
                let mut topics = self.inner.topics.write();
                topics
                    .entry(topic.to_string())
                    .or_insert_with(|| Arc::new(Mutex::new(TopicLog::default())))
                    .clone()
            }
        };

        let offset = {
            let mut log = log.lock();
            let offset = log.next_offset();
            log.records.push_back(Arc::new(Record {
                offset,
                key: key.to_string(),
                payload,
            }));
            while log.records.len() > self.inner.retention {
                log.records.pop_front();
                log.base_offset += 1;
            }
            offset
        };

        self.inner.notify.notify_waiters();
        Ok(offset)
    }

    /// Attach a consumer group to all topics matching `pattern`.
    ///
    /// Resubscribing an existing group rewinds its in-flight cursor to the
    /// last committed offset, redelivering anything unacknowledged.
    pub fn subscribe(&self, group: &str, pattern: &str) -> Result<Subscription> {
        let pattern = TopicPattern::parse(pattern)?;
        let state = {
            let mut groups = self.inner.groups.lock();
            groups.entry(group.to_string()).or_default().clone()
        };
        {
            let mut cursors = state.cursors.lock();
            for cursor in cursors.values_mut() {
                if cursor.delivered != cursor.committed {
                    debug!(
                        group,
                        redelivered = cursor.delivered - cursor.committed,
                        "rewinding uncommitted deliveries"
                    );
                }
                cursor.delivered = cursor.committed;
            }
        }
        Ok(Subscription {
            inner: Arc::clone(&self.inner),
            group: state,
            group_name: group.to_string(),
            pattern,
        })
    }

    /// Close the bus: publishes fail and blocked `recv` calls drain out.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

/// A record handed to a consumer group.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub topic: String,
    pub key: String,
    pub payload: Vec<u8>,
    pub offset: u64,
}

/// Single-consumer view of a group's cursor over matching topics.
pub struct Subscription {
    inner: Arc<Inner>,
    group: Arc<GroupState>,
    group_name: String,
    pattern: TopicPattern,
}

impl Subscription {
    /// Next unprocessed record, in topic order. `None` once the bus is
    /// closed and everything delivered.
    pub async fn recv(&self) -> Option<Delivery> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(delivery) = self.try_next() {
                return Some(delivery);
            }
            if self.inner.closed.load(Ordering::Acquire) {
                return None;
            }
            notified.await;
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_next(&self) -> Option<Delivery> {
        let matching: Vec<(String, Arc<Mutex<TopicLog>>)> = {
            let topics = self.inner.topics.read();
            topics
                .iter()
                .filter(|(name, _)| self.pattern.matches(name))
                .map(|(name, log)| (name.clone(), Arc::clone(log)))
                .collect()
        };

        let mut cursors = self.group.cursors.lock();
        for (name, log) in matching {
            let log = log.lock();
            let cursor = cursors.entry(name.clone()).or_default();
            if cursor.delivered < log.base_offset {
                warn!(
                    group = %self.group_name,
                    topic = %name,
                    skipped = log.base_offset - cursor.delivered,
                    "group fell behind retention, skipping forward"
                );
                cursor.delivered = log.base_offset;
                cursor.committed = cursor.committed.max(log.base_offset);
            }
            if let Some(record) = log.get(cursor.delivered) {
                cursor.delivered += 1;
                return Some(Delivery {
                    topic: name,
                    key: record.key.clone(),
                    payload: record.payload.clone(),
                    offset: record.offset,
                });
            }
        }
        None
    }

    /// Acknowledge a delivery as fully processed.
    pub fn commit(&self, delivery: &Delivery) {
        let mut cursors = self.group.cursors.lock();
        if let Some(cursor) = cursors.get_mut(&delivery.topic) {
            cursor.committed = cursor.committed.max(delivery.offset + 1);
        }
    }

    pub fn group(&self) -> &str {
        &self.group_name
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        // Rewind in-flight deliveries so a restarted consumer sees them again.
        let mut cursors = self.group.cursors.lock();
        for cursor in cursors.values_mut() {
            cursor.delivered = cursor.committed;
        }
    }
}
