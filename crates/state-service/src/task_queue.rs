//! Priority task queue.
//!
//! Tasks are JSON members of the sorted set `{queue}:pending`. The score is
//! `rank(priority) * 2^44 + sequence`, where `sequence` comes from an atomic
//! counter at `{queue}:sequence`. Popping the lowest score therefore yields
//! the highest priority first and, within a priority, enqueue order. Scores
//! stay below 2^53 and are exact as `f64`.
//!
//! Only production and retrieval live here. Workers, acknowledgement and
//! retries belong to the consumer.

use crate::clock::SharedClock;
use crate::errors::StateError;
use crate::observability::metrics;
use crate::store::StoreAdapter;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, error, instrument};
use uuid::Uuid;

/// Sequence numbers are packed below this bit.
const SEQUENCE_BITS: u32 = 44;
const SEQUENCE_LIMIT: u64 = 1 << SEQUENCE_BITS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    High,
    Medium,
    Low,
}

impl TaskPriority {
    /// Lower ranks are retrieved first.
    pub fn rank(&self) -> u64 {
        match self {
            TaskPriority::High => 0,
            TaskPriority::Medium => 1,
            TaskPriority::Low => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPriority::High => "high",
            TaskPriority::Medium => "medium",
            TaskPriority::Low => "low",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// Uploaded media awaiting processing.
    MediaProcessing,
    /// Analysis of processed media.
    MediaAnalysis,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::MediaProcessing => "media_processing",
            TaskType::MediaAnalysis => "media_analysis",
        }
    }

    /// Priority used when the producer does not choose one.
    pub fn default_priority(&self) -> TaskPriority {
        match self {
            TaskType::MediaProcessing => TaskPriority::High,
            TaskType::MediaAnalysis => TaskPriority::Medium,
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A queued unit of background work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub task_type: TaskType,
    pub payload: serde_json::Value,
    pub priority: TaskPriority,
    pub sequence: u64,
    pub enqueued_at: DateTime<Utc>,
}

fn score(priority: TaskPriority, sequence: u64) -> f64 {
    // Exact: rank <= 2 and sequence < 2^44 keep the value below 2^53
    #[allow(clippy::cast_precision_loss)]
    let score = (priority.rank() * SEQUENCE_LIMIT + sequence) as f64;
    score
}

/// Producer and retrieval side of a named queue.
#[derive(Debug, Clone)]
pub struct TaskQueue {
    store: StoreAdapter,
    clock: SharedClock,
    pending_key: String,
    sequence_key: String,
}

impl TaskQueue {
    pub fn new(store: StoreAdapter, clock: SharedClock, name: &str) -> Self {
        Self {
            store,
            clock,
            pending_key: format!("{name}:pending"),
            sequence_key: format!("{name}:sequence"),
        }
    }

    /// Queue a task and return its id.
    ///
    /// # Errors
    ///
    /// - `StateError::StoreUnavailable` if the task could not be stored; it
    ///   must be treated as not queued
    /// - `StateError::Internal` if the payload cannot be serialized
    #[instrument(skip_all, fields(task_type = %task_type, priority = priority.as_str()))]
    pub async fn enqueue<P: Serialize + ?Sized>(
        &self,
        task_type: TaskType,
        payload: &P,
        priority: TaskPriority,
    ) -> Result<Uuid, StateError> {
        let payload = serde_json::to_value(payload)?;

        let sequence = self.store.incr(&self.sequence_key, None).await?;
        let sequence = u64::try_from(sequence)
            .ok()
            .filter(|seq| *seq < SEQUENCE_LIMIT)
            .ok_or_else(|| {
                StateError::Internal(format!("task sequence out of range: {sequence}"))
            })?;

        let task = Task {
            id: Uuid::new_v4(),
            task_type,
            payload,
            priority,
            sequence,
            enqueued_at: self.clock.now(),
        };
        let member = serde_json::to_string(&task)?;
        self.store
            .sorted_add(&self.pending_key, &member, score(priority, sequence))
            .await?;

        metrics::record_task_enqueued(task_type.as_str(), priority.as_str());
        debug!(
            target: "state.task_queue",
            task_id = %task.id,
            sequence = sequence,
            "Task enqueued"
        );
        Ok(task.id)
    }

    /// [`TaskQueue::enqueue`] with the task type's default priority.
    ///
    /// # Errors
    ///
    /// Same as [`TaskQueue::enqueue`].
    pub async fn enqueue_default<P: Serialize + ?Sized>(
        &self,
        task_type: TaskType,
        payload: &P,
    ) -> Result<Uuid, StateError> {
        self.enqueue(task_type, payload, task_type.default_priority())
            .await
    }

    /// Remove and return the next task. Each task goes to exactly one caller.
    ///
    /// # Errors
    ///
    /// - `StateError::StoreUnavailable` if the store cannot be reached
    /// - `StateError::Malformed` if the popped member cannot be decoded; the
    ///   member is gone from the queue
    pub async fn dequeue(&self) -> Result<Option<Task>, StateError> {
        let popped = self.store.sorted_pop_min(&self.pending_key, 1).await?;
        match popped.into_iter().next() {
            Some((member, _)) => decode(&member).map(Some).ok_or_else(|| {
                StateError::Malformed("queued task could not be decoded".to_string())
            }),
            None => Ok(None),
        }
    }

    /// Remove and return up to `count` tasks in order. Undecodable members
    /// are logged and dropped.
    ///
    /// # Errors
    ///
    /// Returns `StateError::StoreUnavailable` if the store cannot be reached.
    pub async fn dequeue_batch(&self, count: usize) -> Result<Vec<Task>, StateError> {
        let popped = self.store.sorted_pop_min(&self.pending_key, count).await?;
        Ok(popped
            .into_iter()
            .filter_map(|(member, _)| decode(&member))
            .collect())
    }

    /// Return up to `count` tasks in retrieval order without removing them.
    ///
    /// # Errors
    ///
    /// Returns `StateError::StoreUnavailable` if the store cannot be reached.
    pub async fn peek(&self, count: usize) -> Result<Vec<Task>, StateError> {
        let members = self.store.sorted_range(&self.pending_key, count).await?;
        Ok(members.iter().filter_map(|m| decode(m)).collect())
    }

    /// Number of queued tasks.
    ///
    /// # Errors
    ///
    /// Returns `StateError::StoreUnavailable` if the store cannot be reached.
    pub async fn pending(&self) -> Result<u64, StateError> {
        self.store.sorted_len(&self.pending_key).await
    }
}

fn decode(member: &str) -> Option<Task> {
    match serde_json::from_str(member) {
        Ok(task) => Some(task),
        Err(e) => {
            error!(target: "state.task_queue", error = %e, "Queued task could not be decoded");
            None
        }
    }
}
