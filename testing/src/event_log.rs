//! In-memory event log.
//!
//! Implements the full [`EventLogClient`] contract in process:
//!
//! - streams with optimistic versioning, metadata and hard deletion
//! - `$ce-<category>` and `$et-<type>` link streams, maintained on append
//! - catch-up subscriptions, one tokio task each, delivering sequentially
//! - persistent groups that track their position and write the group
//!   checkpoint stream on every acknowledgement
//!
//! Every consumer connected to a persistent group receives every record of
//! the group; consumer strategies are recorded but not applied.
//!
//! Failure injection: [`InMemoryEventLog::fail_next_subscriptions`],
//! [`InMemoryEventLog::fail_acknowledgements`] and
//! [`InMemoryEventLog::disconnect_all`].

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity

use chrono::Utc;
use eventstore_tools_core::BoxError;
use eventstore_tools_core::event_log::{
    CatchUpListener, EventLogClient, EventLogError, PersistentListener,
    PersistentSubscriptionAck, PersistentSubscriptionSettings, SubscriptionDropReason,
    SubscriptionHandle,
};
use eventstore_tools_core::position::persistent_checkpoint_stream;
use eventstore_tools_core::record::{AppendResult, NewRecord, ResolvedRecord, StreamRecord};
use eventstore_tools_core::stream::{
    ExpectedVersion, StreamId, StreamMetadata, StreamMetadataResult,
};
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Type tag of link records.
pub const LINK_EVENT_TYPE: &str = "$>";

/// Records handed to a subscription per wake-up.
const DELIVERY_BATCH: usize = 256;

type GroupKey = (String, String);
type StopSignal = Arc<watch::Sender<Option<SubscriptionDropReason>>>;

#[derive(Default)]
struct StreamData {
    records: Vec<StreamRecord>,
    metadata: StreamMetadata,
    meta_version: Option<u64>,
    deleted: bool,
}

impl StreamData {
    fn last_sequence(&self) -> Option<u64> {
        self.records.last().map(|record| record.sequence)
    }
}

struct Group {
    settings: PersistentSubscriptionSettings,
    next: u64,
}

#[derive(Default)]
struct LogState {
    streams: HashMap<String, StreamData>,
    groups: HashMap<GroupKey, Group>,
    live: HashMap<u64, StopSignal>,
}

struct Inner {
    state: Mutex<LogState>,
    appends: watch::Sender<u64>,
    next_subscription: AtomicU64,
    failing_subscriptions: AtomicUsize,
    failing_acks: AtomicBool,
}

/// Event log kept in process memory.
///
/// Cheap to clone; clones share the same streams.
#[derive(Clone)]
pub struct InMemoryEventLog {
    inner: Arc<Inner>,
}

impl Default for InMemoryEventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryEventLog {
    /// Create an empty log.
    #[must_use]
    pub fn new() -> Self {
        let (appends, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(LogState::default()),
                appends,
                next_subscription: AtomicU64::new(0),
                failing_subscriptions: AtomicUsize::new(0),
                failing_acks: AtomicBool::new(false),
            }),
        }
    }

    /// Append JSON `data` under `event_type` without a version check.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream was deleted.
    pub fn append_json(
        &self,
        stream_id: &str,
        event_type: &str,
        data: &serde_json::Value,
    ) -> Result<StreamRecord, EventLogError> {
        let record = NewRecord::new(event_type, serde_json::to_vec(data).unwrap());
        let mut appended = self
            .inner
            .append(stream_id, ExpectedVersion::Any, vec![record])?;
        Ok(appended.remove(0))
    }

    /// Append a link to `target_stream`/`target_sequence`, whether the
    /// target exists or not.
    ///
    /// # Errors
    ///
    /// Returns an error if `stream_id` was deleted.
    pub fn append_link(
        &self,
        stream_id: &str,
        target_stream: &str,
        target_sequence: u64,
    ) -> Result<StreamRecord, EventLogError> {
        let link = NewRecord::new(
            LINK_EVENT_TYPE,
            format!("{target_sequence}@{target_stream}").into_bytes(),
        );
        let mut appended = self.inner.append(stream_id, ExpectedVersion::Any, vec![link])?;
        Ok(appended.remove(0))
    }

    /// Hard delete a stream. Links pointing into it resolve to nothing.
    pub fn delete_stream(&self, stream_id: &str) {
        let mut state = self.inner.state.lock().unwrap();
        let stream = state.streams.entry(stream_id.to_string()).or_default();
        stream.records.clear();
        stream.deleted = true;
    }

    /// Records of a stream, links unresolved.
    #[must_use]
    pub fn records(&self, stream_id: &str) -> Vec<StreamRecord> {
        self.inner
            .state
            .lock()
            .unwrap()
            .streams
            .get(stream_id)
            .map(|stream| stream.records.clone())
            .unwrap_or_default()
    }

    /// Number of subscriptions currently delivering.
    #[must_use]
    pub fn live_subscriptions(&self) -> usize {
        self.inner.state.lock().unwrap().live.len()
    }

    /// Settings of a persistent group.
    #[must_use]
    pub fn persistent_settings(
        &self,
        stream_id: &str,
        group_name: &str,
    ) -> Option<PersistentSubscriptionSettings> {
        self.inner
            .state
            .lock()
            .unwrap()
            .groups
            .get(&(stream_id.to_string(), group_name.to_string()))
            .map(|group| group.settings.clone())
    }

    /// Make the next `count` subscribe calls fail with a connection error.
    pub fn fail_next_subscriptions(&self, count: usize) {
        self.inner.failing_subscriptions.store(count, Ordering::SeqCst);
    }

    /// Reject persistent acknowledgements while `fail` is set.
    pub fn fail_acknowledgements(&self, fail: bool) {
        self.inner.failing_acks.store(fail, Ordering::SeqCst);
    }

    /// Close every live subscription with `reason`, as a dropped connection
    /// would.
    pub fn disconnect_all(&self, reason: SubscriptionDropReason) {
        let live: Vec<StopSignal> = self
            .inner
            .state
            .lock()
            .unwrap()
            .live
            .values()
            .cloned()
            .collect();
        for stop in live {
            request_stop(&stop, reason);
        }
    }

    /// Resolve when at least `count` subscriptions are live.
    pub async fn wait_for_live_subscriptions(&self, count: usize) {
        while self.live_subscriptions() < count {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    }
}

fn request_stop(stop: &StopSignal, reason: SubscriptionDropReason) {
    stop.send_if_modified(|current| {
        if current.is_none() {
            *current = Some(reason);
            true
        } else {
            false
        }
    });
}

fn category_of(stream_id: &str) -> Option<&str> {
    if stream_id.starts_with('$') {
        return None;
    }
    stream_id.split_once('-').map(|(category, _)| category)
}

impl Inner {
    fn append(
        &self,
        stream_id: &str,
        expected: ExpectedVersion,
        records: Vec<NewRecord>,
    ) -> Result<Vec<StreamRecord>, EventLogError> {
        let appended = {
            let mut state = self.state.lock().unwrap();
            let appended = Self::append_locked(&mut state, stream_id, expected, records)?;

            if let Some(category) = category_of(stream_id) {
                for record in &appended {
                    let target = format!("{}@{}", record.sequence, record.stream_id).into_bytes();
                    for index in [format!("$ce-{category}"), format!("$et-{}", record.event_type)] {
                        let link = NewRecord::new(LINK_EVENT_TYPE, target.clone());
                        Self::append_locked(&mut state, &index, ExpectedVersion::Any, vec![link])?;
                    }
                }
            }
            appended
        };
        self.appends.send_modify(|count| *count += 1);
        Ok(appended)
    }

    fn append_locked(
        state: &mut LogState,
        stream_id: &str,
        expected: ExpectedVersion,
        records: Vec<NewRecord>,
    ) -> Result<Vec<StreamRecord>, EventLogError> {
        let stream = state.streams.entry(stream_id.to_string()).or_default();
        if stream.deleted {
            return Err(EventLogError::StreamDeleted(StreamId::new(stream_id)));
        }
        let current = stream.last_sequence();
        if !expected.matches(current) {
            return Err(EventLogError::VersionConflict {
                stream_id: StreamId::new(stream_id),
                expected,
                actual: current,
            });
        }

        let mut next = current.map_or(0, |last| last + 1);
        let mut appended = Vec::with_capacity(records.len());
        for record in records {
            let stored = StreamRecord {
                event_id: record.event_id,
                stream_id: StreamId::new(stream_id),
                sequence: next,
                event_type: record.event_type,
                data: record.data,
                metadata: record.metadata,
                created: Utc::now(),
            };
            next += 1;
            stream.records.push(stored.clone());
            appended.push(stored);
        }
        Ok(appended)
    }

    fn read_batch(
        &self,
        stream_id: &str,
        from: u64,
        limit: usize,
    ) -> Result<Vec<StreamRecord>, EventLogError> {
        let state = self.state.lock().unwrap();
        let stream = state
            .streams
            .get(stream_id)
            .ok_or_else(|| EventLogError::StreamNotFound(StreamId::new(stream_id)))?;
        if stream.deleted {
            return Err(EventLogError::StreamDeleted(StreamId::new(stream_id)));
        }
        let from = from.max(stream.metadata.first_readable_sequence());
        Ok(stream
            .records
            .iter()
            .filter(|record| record.sequence >= from)
            .take(limit)
            .cloned()
            .collect())
    }

    /// Records of `stream_id` from `from` on, links resolved, paired with
    /// the sequence in `stream_id`.
    fn deliverable(&self, stream_id: &str, from: u64) -> Vec<(u64, ResolvedRecord)> {
        let state = self.state.lock().unwrap();
        let Some(stream) = state.streams.get(stream_id) else {
            return Vec::new();
        };
        stream
            .records
            .iter()
            .filter(|record| record.sequence >= from)
            .take(DELIVERY_BATCH)
            .map(|record| (record.sequence, Self::resolve(&state, record)))
            .collect()
    }

    fn resolve(state: &LogState, record: &StreamRecord) -> ResolvedRecord {
        if record.event_type != LINK_EVENT_TYPE {
            return ResolvedRecord::plain(record.clone());
        }
        let target = std::str::from_utf8(&record.data)
            .ok()
            .and_then(|raw| raw.split_once('@'))
            .and_then(|(sequence, stream)| Some((sequence.parse::<u64>().ok()?, stream)))
            .and_then(|(sequence, stream)| {
                state
                    .streams
                    .get(stream)?
                    .records
                    .iter()
                    .find(|candidate| candidate.sequence == sequence)
                    .cloned()
            });
        ResolvedRecord {
            event: target,
            link: Some(record.clone()),
        }
    }

    fn take_subscription_failure(&self) -> bool {
        self.failing_subscriptions
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }

    fn register(&self) -> (u64, StopSignal) {
        let id = self.next_subscription.fetch_add(1, Ordering::SeqCst);
        let (stop, _) = watch::channel(None);
        let stop = Arc::new(stop);
        self.state
            .lock()
            .unwrap()
            .live
            .insert(id, Arc::clone(&stop));
        (id, stop)
    }

    fn unregister(&self, id: u64) {
        self.state.lock().unwrap().live.remove(&id);
    }

    fn group_position(&self, key: &GroupKey) -> Option<u64> {
        self.state.lock().unwrap().groups.get(key).map(|group| group.next)
    }

    fn advance_group(&self, key: &GroupKey, next: u64) {
        if let Some(group) = self.state.lock().unwrap().groups.get_mut(key) {
            group.next = group.next.max(next);
        }
    }
}

/// Wait for new appends or a stop request. Returns the stop reason.
async fn idle(
    appends: &mut watch::Receiver<u64>,
    stop: &mut watch::Receiver<Option<SubscriptionDropReason>>,
) -> Option<SubscriptionDropReason> {
    tokio::select! {
        changed = appends.changed() => {
            if changed.is_err() {
                return Some(SubscriptionDropReason::ConnectionClosed);
            }
        }
        _ = stop.changed() => {}
    }
    *stop.borrow()
}

async fn run_catch_up(
    inner: Arc<Inner>,
    id: u64,
    stream_id: String,
    mut next: u64,
    listener: Arc<dyn CatchUpListener>,
    mut stop: watch::Receiver<Option<SubscriptionDropReason>>,
) {
    let mut appends = inner.appends.subscribe();
    let mut live = false;

    let (reason, error): (SubscriptionDropReason, Option<BoxError>) = 'delivery: loop {
        let stopped = *stop.borrow();
        if let Some(reason) = stopped {
            break (reason, None);
        }
        appends.borrow_and_update();

        let batch = inner.deliverable(&stream_id, next);
        if batch.is_empty() {
            if !live {
                live = true;
                listener.on_live_processing_started();
            }
            if let Some(reason) = idle(&mut appends, &mut stop).await {
                break (reason, None);
            }
            continue;
        }

        for (sequence, record) in batch {
            let stopped = *stop.borrow();
            if let Some(reason) = stopped {
                break 'delivery (reason, None);
            }
            if let Err(err) = listener.on_event(record).await {
                break 'delivery (SubscriptionDropReason::EventHandlerException, Some(err));
            }
            next = sequence + 1;
        }
    };

    inner.unregister(id);
    listener.on_close(reason, error);
}

struct InMemoryAck {
    inner: Arc<Inner>,
    key: GroupKey,
    sequence: u64,
}

impl PersistentSubscriptionAck for InMemoryAck {
    fn acknowledge(&self, _event_id: Uuid) -> BoxFuture<'_, Result<(), EventLogError>> {
        Box::pin(async move {
            if self.inner.failing_acks.load(Ordering::SeqCst) {
                return Err(EventLogError::Connection("acknowledgement rejected".into()));
            }
            let (stream_name, group_name) = &self.key;
            let checkpoint = persistent_checkpoint_stream(stream_name, group_name);
            let data = serde_json::to_vec(&self.sequence)
                .map_err(|e| EventLogError::Serialization(e.to_string()))?;
            self.inner.append(
                checkpoint.as_str(),
                ExpectedVersion::Any,
                vec![NewRecord::new("$SubscriptionCheckpoint", data)],
            )?;
            Ok(())
        })
    }
}

async fn run_persistent(
    inner: Arc<Inner>,
    id: u64,
    key: GroupKey,
    listener: Arc<dyn PersistentListener>,
    mut stop: watch::Receiver<Option<SubscriptionDropReason>>,
) {
    let mut appends = inner.appends.subscribe();

    let (reason, error): (SubscriptionDropReason, Option<BoxError>) = 'delivery: loop {
        let stopped = *stop.borrow();
        if let Some(reason) = stopped {
            break (reason, None);
        }
        appends.borrow_and_update();

        let Some(position) = inner.group_position(&key) else {
            break (SubscriptionDropReason::PersistentSubscriptionDeleted, None);
        };
        let batch = inner.deliverable(&key.0, position);
        if batch.is_empty() {
            if let Some(reason) = idle(&mut appends, &mut stop).await {
                break (reason, None);
            }
            continue;
        }

        for (sequence, record) in batch {
            let stopped = *stop.borrow();
            if let Some(reason) = stopped {
                break 'delivery (reason, None);
            }
            let ack = InMemoryAck {
                inner: Arc::clone(&inner),
                key: key.clone(),
                sequence,
            };
            if let Err(err) = listener.on_event(&ack, record).await {
                break 'delivery (SubscriptionDropReason::EventHandlerException, Some(err));
            }
            inner.advance_group(&key, sequence + 1);
        }
    };

    inner.unregister(id);
    listener.on_close(reason, error);
}

struct InMemoryHandle {
    stop: StopSignal,
    task: JoinHandle<()>,
}

impl SubscriptionHandle for InMemoryHandle {
    fn stop(self: Box<Self>) -> BoxFuture<'static, ()> {
        let Self { stop, task } = *self;
        Box::pin(async move {
            request_stop(&stop, SubscriptionDropReason::UserInitiated);
            let _ = task.await;
        })
    }
}

impl EventLogClient for InMemoryEventLog {
    fn append(
        &self,
        stream_id: StreamId,
        expected_version: ExpectedVersion,
        records: Vec<NewRecord>,
    ) -> BoxFuture<'_, Result<AppendResult, EventLogError>> {
        Box::pin(async move {
            let appended = self
                .inner
                .append(stream_id.as_str(), expected_version, records)?;
            let next_expected_version = match appended.last() {
                Some(last) => last.sequence,
                None => self
                    .inner
                    .state
                    .lock()
                    .unwrap()
                    .streams
                    .get(stream_id.as_str())
                    .and_then(StreamData::last_sequence)
                    .unwrap_or_default(),
            };
            Ok(AppendResult {
                next_expected_version,
            })
        })
    }

    fn read_forward(
        &self,
        stream_id: StreamId,
        from: u64,
        batch_size: usize,
    ) -> BoxStream<'_, Result<StreamRecord, EventLogError>> {
        let batch_size = batch_size.max(1);
        Box::pin(async_stream::try_stream! {
            let mut next = from;
            loop {
                let batch = self.inner.read_batch(stream_id.as_str(), next, batch_size)?;
                let Some(last) = batch.last() else {
                    break;
                };
                next = last.sequence + 1;
                let full = batch.len() == batch_size;
                for record in batch {
                    yield record;
                }
                if !full {
                    break;
                }
            }
        })
    }

    fn read_last(
        &self,
        stream_id: StreamId,
    ) -> BoxFuture<'_, Result<Option<StreamRecord>, EventLogError>> {
        Box::pin(async move {
            let state = self.inner.state.lock().unwrap();
            let stream = state
                .streams
                .get(stream_id.as_str())
                .ok_or_else(|| EventLogError::StreamNotFound(stream_id.clone()))?;
            if stream.deleted {
                return Err(EventLogError::StreamDeleted(stream_id));
            }
            Ok(stream.records.last().cloned())
        })
    }

    fn stream_metadata(
        &self,
        stream_id: StreamId,
    ) -> BoxFuture<'_, Result<StreamMetadataResult, EventLogError>> {
        Box::pin(async move {
            let state = self.inner.state.lock().unwrap();
            Ok(state
                .streams
                .get(stream_id.as_str())
                .map(|stream| StreamMetadataResult {
                    metadata: stream.metadata.clone(),
                    meta_version: stream.meta_version,
                })
                .unwrap_or_default())
        })
    }

    fn set_stream_metadata(
        &self,
        stream_id: StreamId,
        expected_meta_version: ExpectedVersion,
        metadata: StreamMetadata,
    ) -> BoxFuture<'_, Result<(), EventLogError>> {
        Box::pin(async move {
            let mut state = self.inner.state.lock().unwrap();
            let stream = state.streams.entry(stream_id.as_str().to_string()).or_default();
            if !expected_meta_version.matches(stream.meta_version) {
                return Err(EventLogError::VersionConflict {
                    stream_id,
                    expected: expected_meta_version,
                    actual: stream.meta_version,
                });
            }
            stream.metadata = metadata;
            stream.meta_version = Some(stream.meta_version.map_or(0, |version| version + 1));
            Ok(())
        })
    }

    fn subscribe_catch_up(
        &self,
        stream_id: StreamId,
        after: Option<u64>,
        listener: Arc<dyn CatchUpListener>,
    ) -> BoxFuture<'_, Result<Box<dyn SubscriptionHandle>, EventLogError>> {
        Box::pin(async move {
            if self.inner.take_subscription_failure() {
                return Err(EventLogError::Connection("subscription refused".into()));
            }
            let (id, stop) = self.inner.register();
            let task = tokio::spawn(run_catch_up(
                Arc::clone(&self.inner),
                id,
                stream_id.into_inner(),
                after.map_or(0, |after| after + 1),
                listener,
                stop.subscribe(),
            ));
            Ok(Box::new(InMemoryHandle { stop, task }) as Box<dyn SubscriptionHandle>)
        })
    }

    fn subscribe_persistent(
        &self,
        stream_id: StreamId,
        group_name: String,
        listener: Arc<dyn PersistentListener>,
    ) -> BoxFuture<'_, Result<Box<dyn SubscriptionHandle>, EventLogError>> {
        Box::pin(async move {
            if self.inner.take_subscription_failure() {
                return Err(EventLogError::Connection("subscription refused".into()));
            }
            let key = (stream_id.as_str().to_string(), group_name);
            if self.inner.group_position(&key).is_none() {
                return Err(EventLogError::SubscriptionNotFound {
                    stream_id,
                    group_name: key.1,
                });
            }
            let (id, stop) = self.inner.register();
            let task = tokio::spawn(run_persistent(
                Arc::clone(&self.inner),
                id,
                key,
                listener,
                stop.subscribe(),
            ));
            Ok(Box::new(InMemoryHandle { stop, task }) as Box<dyn SubscriptionHandle>)
        })
    }

    fn create_persistent_subscription(
        &self,
        stream_id: StreamId,
        group_name: String,
        settings: PersistentSubscriptionSettings,
    ) -> BoxFuture<'_, Result<(), EventLogError>> {
        Box::pin(async move {
            let mut state = self.inner.state.lock().unwrap();
            let key = (stream_id.as_str().to_string(), group_name);
            if state.groups.contains_key(&key) {
                return Err(EventLogError::SubscriptionAlreadyExists {
                    stream_id,
                    group_name: key.1,
                });
            }
            let next = settings.start_from;
            state.groups.insert(key, Group { settings, next });
            Ok(())
        })
    }

    fn update_persistent_subscription(
        &self,
        stream_id: StreamId,
        group_name: String,
        settings: PersistentSubscriptionSettings,
    ) -> BoxFuture<'_, Result<(), EventLogError>> {
        Box::pin(async move {
            let mut state = self.inner.state.lock().unwrap();
            let key = (stream_id.as_str().to_string(), group_name);
            match state.groups.get_mut(&key) {
                Some(group) => {
                    group.settings = settings;
                    Ok(())
                }
                None => Err(EventLogError::SubscriptionNotFound {
                    stream_id,
                    group_name: key.1,
                }),
            }
        })
    }
}
