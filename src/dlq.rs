//! Dead letter queue for operations that exhausted their retry budget.
//!
//! Bounded, persistable store of failed operations awaiting re-delivery.
//! Re-delivery favors operations closest to success (lowest retry count
//! first), schedules retries through the same exponential backoff as the
//! in-call loop, and tracks lifecycle statistics. Snapshots travel through
//! the [`QueueStore`] trait; the concrete durable backend is an external
//! collaborator, with a JSON file implementation provided.
//!
//! All queue mutation is serialized behind one lock. `persist` snapshots
//! under the lock and writes outside it, so persistence never interleaves
//! with concurrent mutation. Items handed out by `get_next_item` are
//! claimed: a claimed item is ineligible for a second concurrent claim
//! until it is processed, re-counted, or released.

use crate::backoff::{BackoffConfig, BackoffConfigError, ExponentialBackoff};
use crate::classifier::ErrorClassification;
use crate::clock::{system_clock, SharedClock};
use crate::errors::{DlqError, DlqResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Configuration for dead letter queue behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeadLetterConfig {
    /// Maximum number of items the queue will hold.
    pub max_queue_size: usize,
    /// Retry count at which an item is considered permanently failed.
    pub max_retries: u32,
    /// Backoff schedule for re-delivery timing. Unjittered by default so
    /// retry times are exactly predictable; enable jitter for production
    /// scheduling if desired.
    pub backoff: BackoffConfig,
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 1000,
            max_retries: 5,
            backoff: BackoffConfig {
                base_delay: Duration::from_secs(60),
                max_delay: Duration::from_secs(3600),
                max_attempts: 5,
                multiplier: 2.0,
                jitter: false,
            },
        }
    }
}

impl DeadLetterConfig {
    /// Validate configuration parameters.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_queue_size == 0 {
            return Err("max_queue_size must be greater than 0".to_string());
        }

        if self.max_retries == 0 {
            return Err("max_retries must be greater than 0".to_string());
        }

        self.backoff.validate().map_err(|e| e.to_string())
    }
}

/// Lifecycle state of a queued operation, derived from its fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    /// Awaiting a retry.
    Pending,
    /// Successfully re-delivered.
    Processed,
    /// Retry budget exhausted; requires manual intervention.
    PermanentlyFailed,
}

/// An operation that failed permanently within a single call-attempt budget.
///
/// Owned exclusively by the queue. The payload is opaque: the queue never
/// interprets its contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedOperation {
    /// Unique identifier for this queued operation.
    pub operation_id: String,
    /// Caller-meaningful operation kind (e.g. "sync_attendance").
    pub operation_type: String,
    /// Classification of the final failure.
    pub error: ErrorClassification,
    /// When the operation was dead-lettered.
    pub failed_at: DateTime<Utc>,
    /// Re-delivery attempts made by the queue.
    pub retry_count: u32,
    /// Earliest time the next re-delivery may run.
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Opaque caller payload needed to re-execute the operation.
    pub payload: serde_json::Value,
    /// Set when re-delivery succeeded.
    pub processed_at: Option<DateTime<Utc>>,
}

impl FailedOperation {
    /// Build a fresh entry with a generated operation id.
    pub fn new(
        operation_type: impl Into<String>,
        error: ErrorClassification,
        payload: serde_json::Value,
        failed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            operation_id: Uuid::new_v4().to_string(),
            operation_type: operation_type.into(),
            error,
            failed_at,
            retry_count: 0,
            next_retry_at: None,
            payload,
            processed_at: None,
        }
    }

    /// Same entry with an explicit retry count (e.g. the exhausted in-call
    /// attempt count).
    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    /// Lifecycle status given the queue's retry limit.
    pub fn status(&self, max_retries: u32) -> OperationStatus {
        if self.processed_at.is_some() {
            OperationStatus::Processed
        } else if self.retry_count >= max_retries {
            OperationStatus::PermanentlyFailed
        } else {
            OperationStatus::Pending
        }
    }

    fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.next_retry_at.map_or(true, |at| at <= now)
    }
}

/// Derived lifecycle statistics. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    pub total_items: usize,
    pub pending_items: usize,
    pub processed_items: usize,
    pub permanently_failed_items: usize,
    pub average_retry_count: f64,
    pub oldest_item: Option<DateTime<Utc>>,
    /// Percentage of capacity in use (exact, e.g. 3/10 -> 30.0).
    pub queue_utilization: f64,
}

/// Serialized queue state handed to the storage backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub items: Vec<FailedOperation>,
    pub persisted_at: DateTime<Utc>,
}

/// Durable storage backend for queue snapshots.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Write a snapshot, replacing any previous one.
    async fn save(&self, snapshot: &QueueSnapshot) -> DlqResult<()>;

    /// Read the last snapshot, or `None` when the store is empty.
    async fn load(&self) -> DlqResult<Option<QueueSnapshot>>;
}

/// JSON-file storage backend.
///
/// Writes to a sibling temp file and renames over the target so a crash
/// mid-write never leaves a truncated snapshot.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl QueueStore for JsonFileStore {
    async fn save(&self, snapshot: &QueueSnapshot) -> DlqResult<()> {
        let encoded = serde_json::to_vec_pretty(snapshot)?;

        let tmp_path = self.path.with_extension("tmp");
        tokio::fs::write(&tmp_path, &encoded)
            .await
            .map_err(|e| DlqError::Storage {
                operation: "write".to_string(),
                reason: e.to_string(),
            })?;
        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .map_err(|e| DlqError::Storage {
                operation: "rename".to_string(),
                reason: e.to_string(),
            })?;

        Ok(())
    }

    async fn load(&self) -> DlqResult<Option<QueueSnapshot>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(DlqError::Storage {
                    operation: "read".to_string(),
                    reason: e.to_string(),
                })
            }
        };

        let snapshot: QueueSnapshot = serde_json::from_slice(&bytes)?;
        Ok(Some(snapshot))
    }
}

#[derive(Debug, Default)]
struct QueueState {
    items: HashMap<String, FailedOperation>,
    /// Operation ids handed out by `get_next_item` and not yet resolved.
    claimed: HashSet<String>,
}

/// Bounded, persistable dead letter queue.
pub struct DeadLetterQueue {
    config: DeadLetterConfig,
    backoff: ExponentialBackoff,
    state: Mutex<QueueState>,
    store: Box<dyn QueueStore>,
    clock: SharedClock,
}

impl std::fmt::Debug for DeadLetterQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadLetterQueue")
            .field("config", &self.config)
            .field("len", &self.state.lock().items.len())
            .finish()
    }
}

impl DeadLetterQueue {
    /// Create a queue over the given storage backend.
    pub fn new(
        config: DeadLetterConfig,
        store: Box<dyn QueueStore>,
    ) -> Result<Self, BackoffConfigError> {
        let backoff = ExponentialBackoff::new(config.backoff.clone())?;
        Ok(Self {
            config,
            backoff,
            state: Mutex::new(QueueState::default()),
            store,
            clock: system_clock(),
        })
    }

    /// Replace the clock, for deterministic scheduling tests.
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// The configuration this queue was built with.
    pub fn config(&self) -> &DeadLetterConfig {
        &self.config
    }

    /// Number of items currently held.
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    /// Add a failed operation to the queue.
    ///
    /// Fails with `QueueFull` at capacity. Items arriving with a retry
    /// count at or beyond the limit are accepted but immediately counted as
    /// permanently failed.
    pub fn add(&self, item: FailedOperation) -> DlqResult<()> {
        let mut state = self.state.lock();

        if state.items.len() >= self.config.max_queue_size
            && !state.items.contains_key(&item.operation_id)
        {
            warn!(
                operation_id = %item.operation_id,
                capacity = self.config.max_queue_size,
                "Rejecting dead letter: queue is full"
            );
            return Err(DlqError::QueueFull {
                capacity: self.config.max_queue_size,
            });
        }

        if item.status(self.config.max_retries) == OperationStatus::PermanentlyFailed {
            warn!(
                operation_id = %item.operation_id,
                operation_type = %item.operation_type,
                retry_count = item.retry_count,
                "Dead letter arrived already past its retry limit"
            );
        } else {
            info!(
                operation_id = %item.operation_id,
                operation_type = %item.operation_type,
                error_type = %item.error.error_type,
                "Operation added to dead letter queue"
            );
        }

        state.items.insert(item.operation_id.clone(), item);
        Ok(())
    }

    /// Claim the next eligible item for re-delivery.
    ///
    /// Eligible means pending, unclaimed, and past its `next_retry_at` (if
    /// any). Among eligible items, the lowest retry count wins; ties go to
    /// the oldest failure. Returns `None` when nothing is ready.
    pub fn get_next_item(&self) -> Option<FailedOperation> {
        let now = self.clock.now();
        let mut state = self.state.lock();

        let candidate = state
            .items
            .values()
            .filter(|item| {
                item.status(self.config.max_retries) == OperationStatus::Pending
                    && !state.claimed.contains(&item.operation_id)
                    && item.is_ready(now)
            })
            .min_by_key(|item| (item.retry_count, item.failed_at))
            .cloned();

        if let Some(ref item) = candidate {
            state.claimed.insert(item.operation_id.clone());
            debug!(
                operation_id = %item.operation_id,
                retry_count = item.retry_count,
                "Claimed dead letter for re-delivery"
            );
        }

        candidate
    }

    /// Record a successful re-delivery and release the claim.
    pub fn mark_as_processed(&self, operation_id: &str) -> DlqResult<()> {
        let now = self.clock.now();
        let mut state = self.state.lock();

        let item = state
            .items
            .get_mut(operation_id)
            .ok_or_else(|| DlqError::NotFound {
                operation_id: operation_id.to_string(),
            })?;

        item.processed_at = Some(now);
        state.claimed.remove(operation_id);

        info!(operation_id = %operation_id, "Dead letter processed successfully");
        Ok(())
    }

    /// Return a claimed item to the pool without progress (e.g. on sweep
    /// shutdown). Returns true when a claim was actually released.
    pub fn release(&self, operation_id: &str) -> bool {
        self.state.lock().claimed.remove(operation_id)
    }

    /// Record a failed re-delivery: bump the retry count, schedule the next
    /// attempt through the backoff curve, and release the claim.
    ///
    /// Returns the updated item. Once the retry count reaches the limit the
    /// item counts as permanently failed and is never claimed again.
    pub fn increment_retry_count(&self, operation_id: &str) -> DlqResult<FailedOperation> {
        let now = self.clock.now();
        let max_retries = self.config.max_retries;

        let mut state = self.state.lock();
        let item = state
            .items
            .get_mut(operation_id)
            .ok_or_else(|| DlqError::NotFound {
                operation_id: operation_id.to_string(),
            })?;

        item.retry_count += 1;
        let delay = self.backoff.calculate_delay(item.retry_count + 1);
        item.next_retry_at = Some(
            chrono::Duration::from_std(delay)
                .ok()
                .and_then(|delay| now.checked_add_signed(delay))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        );

        if item.status(max_retries) == OperationStatus::PermanentlyFailed {
            warn!(
                operation_id = %operation_id,
                retry_count = item.retry_count,
                max_retries,
                "Dead letter reached its retry limit, marking permanently failed"
            );
        } else {
            debug!(
                operation_id = %operation_id,
                retry_count = item.retry_count,
                next_retry_at = %item.next_retry_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
                "Rescheduled dead letter"
            );
        }

        let updated = item.clone();
        state.claimed.remove(operation_id);
        Ok(updated)
    }

    /// Delay before the next re-delivery of the given item, per the shared
    /// backoff schedule: `base_delay * multiplier^retry_count`.
    pub fn calculate_retry_delay(&self, item: &FailedOperation) -> Duration {
        self.backoff.calculate_delay(item.retry_count + 1)
    }

    /// Purge terminal items (processed or permanently failed) whose
    /// terminal timestamp is older than `max_age`. Returns the count removed.
    pub fn cleanup(&self, max_age: Duration) -> usize {
        // A max_age too large to subtract from the current time keeps everything.
        let Some(cutoff) = chrono::Duration::from_std(max_age)
            .ok()
            .and_then(|age| self.clock.now().checked_sub_signed(age))
        else {
            return 0;
        };
        let max_retries = self.config.max_retries;

        let mut state = self.state.lock();
        let before = state.items.len();

        state.items.retain(|_, item| {
            let terminal_at = match item.status(max_retries) {
                OperationStatus::Processed => item.processed_at,
                OperationStatus::PermanentlyFailed => {
                    Some(item.next_retry_at.unwrap_or(item.failed_at))
                }
                OperationStatus::Pending => None,
            };
            terminal_at.map_or(true, |at| at >= cutoff)
        });

        let removed = before - state.items.len();
        let remaining = state.items.len();
        let claimed: Vec<String> = state
            .claimed
            .iter()
            .filter(|id| !state.items.contains_key(*id))
            .cloned()
            .collect();
        for id in claimed {
            state.claimed.remove(&id);
        }
        drop(state);

        if removed > 0 {
            info!(removed, remaining, "Dead letter queue cleanup completed");
        }
        removed
    }

    /// Write the full queue state to the durable store.
    ///
    /// State is snapshotted under the lock; the write happens outside it.
    pub async fn persist(&self) -> DlqResult<()> {
        let snapshot = {
            let state = self.state.lock();
            let mut items: Vec<FailedOperation> = state.items.values().cloned().collect();
            items.sort_by(|a, b| a.failed_at.cmp(&b.failed_at));
            QueueSnapshot {
                items,
                persisted_at: self.clock.now(),
            }
        };

        self.store.save(&snapshot).await?;
        debug!(items = snapshot.items.len(), "Dead letter queue persisted");
        Ok(())
    }

    /// Replace in-memory state from the durable store.
    ///
    /// A freshly constructed queue pointed at the same store recovers
    /// identical statistics. Claims are not persisted: a restored queue
    /// starts with every item unclaimed.
    pub async fn restore(&self) -> DlqResult<()> {
        let Some(snapshot) = self.store.load().await? else {
            debug!("No dead letter snapshot found, starting empty");
            return Ok(());
        };

        let restored = snapshot.items.len();
        let mut state = self.state.lock();
        state.items = snapshot
            .items
            .into_iter()
            .map(|item| (item.operation_id.clone(), item))
            .collect();
        state.claimed.clear();
        drop(state);

        info!(items = restored, "Dead letter queue restored from snapshot");
        Ok(())
    }

    /// Derived lifecycle statistics.
    pub fn get_stats(&self) -> QueueStats {
        let state = self.state.lock();
        let max_retries = self.config.max_retries;

        let total_items = state.items.len();
        let mut pending_items = 0;
        let mut processed_items = 0;
        let mut permanently_failed_items = 0;
        let mut retry_sum: u64 = 0;
        let mut oldest_item: Option<DateTime<Utc>> = None;

        for item in state.items.values() {
            match item.status(max_retries) {
                OperationStatus::Pending => pending_items += 1,
                OperationStatus::Processed => processed_items += 1,
                OperationStatus::PermanentlyFailed => permanently_failed_items += 1,
            }
            retry_sum += u64::from(item.retry_count);
            oldest_item = match oldest_item {
                Some(current) if current <= item.failed_at => Some(current),
                _ => Some(item.failed_at),
            };
        }

        let average_retry_count = if total_items > 0 {
            retry_sum as f64 / total_items as f64
        } else {
            0.0
        };

        QueueStats {
            total_items,
            pending_items,
            processed_items,
            permanently_failed_items,
            average_retry_count,
            oldest_item,
            queue_utilization: total_items as f64 / self.config.max_queue_size as f64 * 100.0,
        }
    }
}
