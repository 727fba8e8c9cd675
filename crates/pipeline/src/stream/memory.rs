//! In-memory event stream for tests and database-less runs

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{EventStream, StreamError, StreamMessage};

#[derive(Default)]
struct State {
    pending: VecDeque<(u64, StreamMessage)>,
    in_flight: HashMap<String, (u64, StreamMessage)>,
    acked: Vec<String>,
    failed: Vec<(String, String)>,
}

/// Queue-backed stream with at-least-once semantics
#[derive(Default)]
pub struct InMemoryEventStream {
    state: Mutex<State>,
    notify: Notify,
    next_id: AtomicU64,
    fail_reads: AtomicU32,
}

impl InMemoryEventStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message and return its id
    pub fn publish(&self, fields: HashMap<String, String>) -> String {
        let seq = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("{seq}-0");
        self.state.lock().pending.push_back((
            seq,
            StreamMessage {
                id: id.clone(),
                fields,
            },
        ));
        self.notify.notify_one();
        id
    }

    /// Put every delivered-but-unacknowledged message back on the queue
    pub fn redeliver_unacked(&self) -> usize {
        let mut state = self.state.lock();
        let mut unacked: Vec<_> = state.in_flight.drain().map(|(_, entry)| entry).collect();
        unacked.sort_by_key(|(seq, _)| *seq);
        let count = unacked.len();
        for message in unacked.into_iter().rev() {
            state.pending.push_front(message);
        }
        drop(state);
        if count > 0 {
            self.notify.notify_one();
        }
        count
    }

    /// Make the next `n` reads fail (for testing)
    pub fn fail_next_reads(&self, n: u32) {
        self.fail_reads.store(n, Ordering::SeqCst);
    }

    pub fn acked(&self) -> Vec<String> {
        self.state.lock().acked.clone()
    }

    pub fn failed(&self) -> Vec<(String, String)> {
        self.state.lock().failed.clone()
    }

    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    fn take(&self, max: usize) -> Vec<StreamMessage> {
        let mut state = self.state.lock();
        let n = max.min(state.pending.len());
        let batch: Vec<_> = state.pending.drain(..n).collect();
        for (seq, message) in &batch {
            state
                .in_flight
                .insert(message.id.clone(), (*seq, message.clone()));
        }
        batch.into_iter().map(|(_, message)| message).collect()
    }
}

#[async_trait]
impl EventStream for InMemoryEventStream {
    async fn read(&self, max: usize, timeout: Duration) -> Result<Vec<StreamMessage>, StreamError> {
        let injected = self
            .fail_reads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StreamError::Unavailable("injected read failure".into()));
        }

        let deadline = Instant::now() + timeout;
        loop {
            let batch = self.take(max);
            if !batch.is_empty() {
                return Ok(batch);
            }
            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                return Ok(vec![]);
            }
        }
    }

    async fn ack(&self, id: &str) -> Result<(), StreamError> {
        let mut state = self.state.lock();
        state.in_flight.remove(id);
        state.acked.push(id.to_string());
        Ok(())
    }

    async fn fail(&self, id: &str, reason: &str) -> Result<(), StreamError> {
        let mut state = self.state.lock();
        state.in_flight.remove(id);
        state.failed.push((id.to_string(), reason.to_string()));
        Ok(())
    }
}
