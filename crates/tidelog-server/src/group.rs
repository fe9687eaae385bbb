// Copyright 2026 The Tidelog Authors
// SPDX-License-Identifier: Apache-2.0

//! A TLog group: shared persistence plus its stack of generations.
//!
//! A group owns one KV store and one disk queue, shared by the current
//! generation and every prior one still being drained. Three rules order
//! work across generations:
//!
//! - commits append only to the single non-stopped generation,
//! - spills drain the oldest generation that still holds memory,
//! - the disk queue pops only behind the oldest generation in `pop_order`.
//!
//! The `commit_queue` task turns pushed-but-volatile queue entries into
//! durable ones and advances each generation's `queue_committed_version`,
//! which is what releases commit replies.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Semaphore};
use uuid::Uuid;

use tidelog_core::config::LogConfig;
use tidelog_core::{Error, LogId, Result, StorageTeamId, TLogGroupId, Version};
use tidelog_storage::keys;
use tidelog_storage::{FramedQueue, KeyValueStore};

use crate::generation::GenerationData;
use crate::notify::{Flag, NotifiedVersion};
use crate::protocol::{TLogCommitReply, TLogCommitRequest, TLogPopRequest};

/// Upper bound on one disk-queue fsync.
const MAX_QUEUE_COMMIT_TIME: Duration = Duration::from_secs(120);

/// How long pops stay suspended before the server re-enables them itself.
const IGNORE_POP_DEADLINE: Duration = Duration::from_secs(300);

/// Cadence of the spill / metadata-flush loop.
const STORAGE_UPDATE_INTERVAL: Duration = Duration::from_millis(500);

/// One framed record in the disk queue: a commit's durable image.
///
/// Recovery reads these back in push order; spilled-by-reference peeks read
/// them back by location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    /// Interface id of the generation that wrote the entry.
    pub id: LogId,
    /// Team the messages belong to.
    pub storage_team_id: StorageTeamId,
    /// Version of the commit.
    pub version: Version,
    /// The generation's known-committed version when the entry was built.
    pub known_committed_version: Version,
    /// Packed message payload.
    pub messages: Bytes,
}

struct GenerationMap {
    by_id: HashMap<LogId, Arc<GenerationData>>,
    pop_order: VecDeque<LogId>,
    spill_order: VecDeque<LogId>,
}

struct IgnorePop {
    active: bool,
    uid: Option<Uuid>,
    deadline: Option<Instant>,
    queued: Vec<(LogId, TLogPopRequest)>,
}

/// A TLog group: current plus prior generations over shared persistence.
pub struct GroupData {
    /// The group id.
    pub group_id: TLogGroupId,
    /// Durable metadata and spill storage.
    pub kv: Arc<KeyValueStore>,
    /// Durable commit queue.
    pub queue: tokio::sync::Mutex<FramedQueue>,
    /// Engine knobs.
    pub log_config: Arc<LogConfig>,
    /// Skip queue pushes entirely (benchmark escape hatch).
    pub queue_in_memory_only: bool,
    /// Bumped when a new generation finishes initializing; the commit loop
    /// rescans on changes.
    new_log_data: watch::Sender<u64>,
    /// Set once the group hits a terminal error.
    pub terminated: Flag,
    /// Serializes KV commits of spilled data.
    pub persistent_data_commit_lock: tokio::sync::Mutex<()>,
    /// Process-wide peek response memory limiter.
    pub peek_memory: Arc<Semaphore>,
    /// Concurrent spilled-data reads.
    pub spill_reads: Arc<Semaphore>,

    generations: Mutex<GenerationMap>,
    queue_commit_begin: AtomicU64,
    queue_commit_end: NotifiedVersion,
    disk_queue_commit_bytes: AtomicU64,
    large_commit_bytes: watch::Sender<bool>,
    bytes_input: AtomicU64,
    bytes_durable: AtomicU64,
    ignore_pop: Mutex<IgnorePop>,
}

impl GroupData {
    /// Opens the group's KV store and disk queue under `dir`.
    ///
    /// # Errors
    ///
    /// Fails on I/O or database errors opening either store.
    pub fn open(
        group_id: TLogGroupId,
        dir: &Path,
        log_config: Arc<LogConfig>,
        queue_in_memory_only: bool,
        peek_memory: Arc<Semaphore>,
    ) -> Result<Arc<Self>> {
        let kv = Arc::new(KeyValueStore::open(&dir.join("meta.redb"))?);
        let queue = FramedQueue::open(&dir.join("queue"))?;
        let spill_reads = Arc::new(Semaphore::new(log_config.concurrent_log_router_reads));
        Ok(Arc::new(Self {
            group_id,
            kv,
            queue: tokio::sync::Mutex::new(queue),
            log_config,
            queue_in_memory_only,
            new_log_data: watch::Sender::new(0),
            terminated: Flag::new(),
            persistent_data_commit_lock: tokio::sync::Mutex::new(()),
            peek_memory,
            spill_reads,
            generations: Mutex::new(GenerationMap {
                by_id: HashMap::new(),
                pop_order: VecDeque::new(),
                spill_order: VecDeque::new(),
            }),
            queue_commit_begin: AtomicU64::new(0),
            queue_commit_end: NotifiedVersion::new(0),
            disk_queue_commit_bytes: AtomicU64::new(0),
            large_commit_bytes: watch::Sender::new(false),
            bytes_input: AtomicU64::new(0),
            bytes_durable: AtomicU64::new(0),
            ignore_pop: Mutex::new(IgnorePop {
                active: false,
                uid: None,
                deadline: None,
                queued: Vec::new(),
            }),
        }))
    }

    /// Replays the disk queue from the saved recovery location, expecting a
    /// clean end of stream: recruitment starts from an empty queue.
    ///
    /// # Errors
    ///
    /// `corrupt_log` if an intact record is found.
    pub async fn check_empty_queue(&self) -> Result<()> {
        let recover_at = self
            .kv
            .read_value(keys::RECOVERY_LOCATION_KEY)?
            .and_then(|v| v.try_into().ok().map(u64::from_le_bytes))
            .unwrap_or(0);
        let mut queue = self.queue.lock().await;
        if queue.initialize_recovery(recover_at) {
            return Ok(());
        }
        match queue.read_next()? {
            None => Ok(()),
            Some(record) => {
                tracing::error!(
                    group_id = %self.group_id,
                    start = record.start,
                    "unexpected record in queue at recruitment"
                );
                Err(Error::CorruptLog("disk queue not empty at recruitment"))
            }
        }
    }

    /// Probes the KV store: a `Format` key, if present, must be one this
    /// build reads.
    ///
    /// # Errors
    ///
    /// `corrupt_log` on a foreign format marker.
    pub fn check_recovered(&self) -> Result<()> {
        match self.kv.read_value(keys::FORMAT_KEY)? {
            None => Ok(()),
            Some(value) if value == keys::FORMAT_VALUE => Ok(()),
            Some(_) => Err(Error::CorruptLog("unknown store format")),
        }
    }

    /// Registers a freshly recruited generation. Calling
    /// [`notify_new_log_data`](Self::notify_new_log_data) once persistent
    /// state lands is the caller's job.
    pub fn register_generation(&self, generation: Arc<GenerationData>) {
        let mut map = self.generations.lock().expect("generation map lock");
        map.pop_order.push_back(generation.log_id);
        map.spill_order.push_back(generation.log_id);
        map.by_id.insert(generation.log_id, generation);
    }

    /// Tells the commit loop to rescan for a newly initialized generation.
    pub fn notify_new_log_data(&self) {
        self.new_log_data.send_modify(|epoch| *epoch += 1);
    }

    /// The single non-stopped generation, if any.
    #[must_use]
    pub fn active_generation(&self) -> Option<Arc<GenerationData>> {
        let map = self.generations.lock().expect("generation map lock");
        map.by_id.values().find(|g| !g.is_stopped()).cloned()
    }

    /// Every generation currently registered.
    #[must_use]
    pub fn generations(&self) -> Vec<Arc<GenerationData>> {
        let map = self.generations.lock().expect("generation map lock");
        map.by_id.values().cloned().collect()
    }

    /// Stops every non-stopped generation (new recruitment or displacement).
    pub fn stop_all(&self) {
        for generation in self.generations() {
            generation.stop();
        }
    }

    /// Unlinks a generation and clears its persistent keys (buffered; the
    /// next KV commit makes it durable). Returns how many generations
    /// remain.
    pub fn remove_generation(&self, log_id: LogId) -> usize {
        let remaining = {
            let mut map = self.generations.lock().expect("generation map lock");
            map.by_id.remove(&log_id);
            map.pop_order.retain(|id| *id != log_id);
            map.spill_order.retain(|id| *id != log_id);
            map.by_id.len()
        };
        for (begin, end) in keys::all_log_ranges(log_id) {
            self.kv.clear_range(begin, end);
        }
        tracing::info!(group_id = %self.group_id, log_id = %log_id, remaining, "generation removed");
        remaining
    }

    /// Group-level resident bytes.
    #[must_use]
    pub fn volatile_bytes(&self) -> u64 {
        self.bytes_input
            .load(Ordering::Relaxed)
            .saturating_sub(self.bytes_durable.load(Ordering::Relaxed))
    }

    /// Byte counters for queuing metrics: `(input, durable)`.
    #[must_use]
    pub fn byte_counters(&self) -> (u64, u64) {
        (self.bytes_input.load(Ordering::Relaxed), self.bytes_durable.load(Ordering::Relaxed))
    }

    /// Marks the group dead after a terminal error and fails every pending
    /// recovery handshake.
    pub fn terminate(&self, error: &Error) {
        tracing::error!(group_id = %self.group_id, %error, "tlog group terminated");
        self.terminated.fail();
        for generation in self.generations() {
            generation.recovery_complete.fail();
            generation.committing_queue.fail();
        }
    }

    /// Serves one commit push against `generation`.
    ///
    /// Serializes on the `prev_version -> version` chain, applies
    /// backpressure against the hard memory limit, deduplicates replays,
    /// appends to the in-memory index and the framed queue, and replies
    /// once the queue commit covers the request (or the generation stops).
    ///
    /// # Errors
    ///
    /// `tlog_stopped` when stopped before or during the wait,
    /// `tlog_group_not_found` for unknown teams.
    pub async fn tlog_commit(
        self: &Arc<Self>,
        generation: &Arc<GenerationData>,
        req: TLogCommitRequest,
    ) -> Result<TLogCommitReply> {
        {
            let mut core = generation.core();
            core.min_known_committed_version =
                core.min_known_committed_version.max(req.min_known_committed_version);
        }
        generation.version.when_at_least(req.prev_version).await;

        let mut last_warn: Option<Instant> = None;
        while self.volatile_bytes() >= self.log_config.hard_limit_bytes
            && !generation.is_stopped()
        {
            if last_warn.map_or(true, |t| t.elapsed() >= Duration::from_secs(1)) {
                tracing::warn!(
                    log_id = %generation.log_id,
                    version = generation.version.get(),
                    "commit backpressure: memory at hard limit"
                );
                last_warn = Some(Instant::now());
            }
            let jitter = rand::thread_rng().gen_range(4_500..=5_500);
            tokio::time::sleep(Duration::from_micros(jitter)).await;
        }
        {
            // The check and the append must be atomic against other commits
            // of this generation, or a retried request could append twice.
            let _chain = generation.commit_chain.lock().await;
            if generation.is_stopped() {
                return Err(Error::TLogStopped);
            }

            // Duplicate iff the chain moved past us while we waited.
            let is_duplicate = generation.version.get() != req.prev_version;
            if !is_duplicate {
                if req.messages.is_empty() {
                    // Accepted, but no append, no queue entry, no version
                    // advance.
                    return Ok(TLogCommitReply {
                        version: generation.core().durable_known_committed_version,
                    });
                }
                let added =
                    generation.commit_messages(req.version, req.storage_team_id, &req.messages)?;
                self.bytes_input.fetch_add(added, Ordering::Relaxed);

                let known_committed = {
                    let mut core = generation.core();
                    core.known_committed_version =
                        core.known_committed_version.max(req.known_committed_version);
                    core.known_committed_version
                };

                if !self.queue_in_memory_only {
                    let entry = QueueEntry {
                        id: generation.log_id,
                        storage_team_id: req.storage_team_id,
                        version: req.version,
                        known_committed_version: known_committed,
                        messages: req.messages.clone(),
                    };
                    let encoded =
                        bincode::serialize(&entry).map_err(|e| Error::Database(e.to_string()))?;
                    let location = {
                        let mut queue = self.queue.lock().await;
                        queue.push(&encoded)
                    };
                    generation.record_location(req.version, location);

                    let commit_bytes = self
                        .disk_queue_commit_bytes
                        .fetch_add(encoded.len() as u64, Ordering::Relaxed)
                        + encoded.len() as u64;
                    if commit_bytes > self.log_config.max_queue_commit_bytes {
                        self.large_commit_bytes.send_replace(true);
                    }
                }

                // The release: queue-commit loop and peek waiters observe
                // this.
                generation.version.set(req.version);
            }
        }

        if generation.is_stopped() && generation.queue_committed_version.get() < req.version {
            return Err(Error::TLogStopped);
        }
        let mut warned = false;
        loop {
            tokio::select! {
                biased;
                () = generation.stop_commit.triggered() => return Err(Error::TLogStopped),
                () = generation.queue_committed_version.when_at_least(req.version) => break,
                () = tokio::time::sleep(self.log_config.warning_timeout()), if !warned => {
                    warned = true;
                    tracing::warn!(
                        log_id = %generation.log_id,
                        version = req.version,
                        "commit reply delayed on queue commit"
                    );
                }
            }
        }

        Ok(TLogCommitReply { version: generation.core().durable_known_committed_version })
    }

    /// The group's queue-commit loop. Adopts the active generation, waits
    /// for its version to move past what is already committed or
    /// committing, and issues disk commits; forces the final commit of
    /// generations that stopped with unflushed entries.
    pub async fn commit_queue(self: Arc<Self>) {
        let mut new_log_rx = self.new_log_data.subscribe();
        loop {
            if self.terminated.is_set() {
                return;
            }
            new_log_rx.borrow_and_update();
            let (active, mut missing_final) = self.scan_generations();
            let Some(generation) = active else {
                let _ = new_log_rx.changed().await;
                continue;
            };
            generation.committing_queue.set();
            tracing::info!(
                group_id = %self.group_id,
                log_id = %generation.log_id,
                version = generation.version.get(),
                committed = generation.queue_committed_version.get(),
                "commit queue adopted generation"
            );

            loop {
                let committed = generation.queue_committed_version.get();
                let committing = generation.core().queue_committing_version;
                let target = committed.max(committing);
                if generation.is_stopped() && generation.version.get() == target {
                    generation.queue_committed_version.when_at_least(target).await;
                    break;
                }

                tokio::select! {
                    () = generation.version.when_at_least(target + 1) => {
                        // One commit in flight at a time, unless bytes force
                        // an immediate one.
                        loop {
                            let begin = self.queue_commit_begin.load(Ordering::Acquire);
                            if begin == self.queue_commit_end.get()
                                || *self.large_commit_bytes.borrow()
                            {
                                break;
                            }
                            let mut large_rx = self.large_commit_bytes.subscribe();
                            tokio::select! {
                                () = self.queue_commit_end.when_at_least(begin) => {}
                                _ = large_rx.changed() => {}
                            }
                        }
                        if generation.version.get() > generation.queue_committed_version.get() {
                            let group = Arc::clone(&self);
                            let generation = Arc::clone(&generation);
                            let missing = std::mem::take(&mut missing_final);
                            tokio::spawn(async move {
                                if let Err(error) =
                                    group.do_queue_commit(&generation, missing).await
                                {
                                    group.terminate(&error);
                                }
                            });
                        }
                    }
                    _ = new_log_rx.changed() => {}
                }

                if self.terminated.is_set() {
                    return;
                }
            }
        }
    }

    /// Issues one durable queue commit covering everything pushed so far
    /// for `generation`, then advances its watermarks in commit order.
    async fn do_queue_commit(
        self: &Arc<Self>,
        generation: &Arc<GenerationData>,
        missing_final: Vec<Arc<GenerationData>>,
    ) -> Result<()> {
        let version = generation.version.get();
        let commit_number = self.queue_commit_begin.fetch_add(1, Ordering::AcqRel) + 1;
        let known_committed = {
            let mut core = generation.core();
            core.queue_committing_version = version;
            core.known_committed_version
        };

        if !self.queue_in_memory_only {
            let commit = async {
                let mut queue = self.queue.lock().await;
                queue.commit()
            };
            match tokio::time::timeout(MAX_QUEUE_COMMIT_TIME, commit).await {
                Ok(result) => result?,
                Err(_) => return Err(Error::IoTimeout),
            }
        }
        self.disk_queue_commit_bytes.store(0, Ordering::Relaxed);
        self.large_commit_bytes.send_replace(false);

        // Completions release strictly in begin order.
        self.queue_commit_end.when_at_least(commit_number - 1).await;

        if version > generation.queue_committed_version.get() {
            generation.core().durable_known_committed_version = known_committed;
            generation.queue_committed_version.set(version);
        }
        self.queue_commit_end.set(commit_number);

        for stopped in missing_final {
            let end = stopped.version.get();
            tracing::info!(
                group_id = %self.group_id,
                log_id = %stopped.log_id,
                version = end,
                "forcing final queue commit of stopped generation"
            );
            if end > stopped.queue_committed_version.get() {
                stopped.queue_committed_version.set(end);
            }
        }
        Ok(())
    }

    fn scan_generations(&self) -> (Option<Arc<GenerationData>>, Vec<Arc<GenerationData>>) {
        let map = self.generations.lock().expect("generation map lock");
        let mut active = None;
        let mut missing_final = Vec::new();
        for generation in map.by_id.values() {
            if !generation.is_stopped() {
                debug_assert!(active.is_none(), "two active generations in one group");
                active = Some(generation.clone());
            } else {
                let target = generation
                    .queue_committed_version
                    .get()
                    .max(generation.core().queue_committing_version);
                if generation.version.get() > target {
                    missing_final.push(generation.clone());
                }
            }
        }
        (active, missing_final)
    }

    /// Serves one pop. While pops are suspended the request is queued and
    /// replayed on resume.
    ///
    /// # Errors
    ///
    /// `tlog_group_not_found` for unknown teams.
    pub async fn handle_pop(
        self: &Arc<Self>,
        generation: &Arc<GenerationData>,
        req: TLogPopRequest,
    ) -> Result<()> {
        {
            let mut ignore = self.ignore_pop.lock().expect("ignore pop lock");
            if ignore.active {
                ignore.queued.push((generation.log_id, req));
                return Ok(());
            }
        }
        self.apply_pop(generation, req).await
    }

    async fn apply_pop(
        self: &Arc<Self>,
        generation: &Arc<GenerationData>,
        req: TLogPopRequest,
    ) -> Result<()> {
        let outcome = generation.pop(req.storage_team_id, req.tag, req.version)?;
        self.bytes_durable.fetch_add(outcome.freed_bytes, Ordering::Relaxed);

        // Durable after the next KV commit.
        self.kv.set(
            keys::tag_popped_key(generation.log_id, req.tag),
            keys::version_value(outcome.tag_popped),
        );
        if outcome.team_popped > 0 {
            let (begin, end) = keys::tag_messages_range(
                generation.log_id,
                req.tag,
                0,
                outcome.team_popped + 1,
            );
            self.kv.clear_range(begin, end);
            let (begin, end) = keys::tag_message_refs_range(
                generation.log_id,
                req.tag,
                0,
                outcome.team_popped + 1,
            );
            self.kv.clear_range(begin, end);
        }

        self.update_queue_pop().await
    }

    /// Recomputes how far the disk queue may reclaim: up to the first
    /// location still needed by the oldest generation in pop order. Fully
    /// drained generations fall off the front.
    pub async fn update_queue_pop(self: &Arc<Self>) -> Result<()> {
        enum Target {
            Location(u64),
            DurableEnd,
        }
        let target = {
            let mut map = self.generations.lock().expect("generation map lock");
            loop {
                let Some(front) = map.pop_order.front().copied() else {
                    break Target::DurableEnd;
                };
                let Some(generation) = map.by_id.get(&front).cloned() else {
                    map.pop_order.pop_front();
                    continue;
                };
                if let Some(location) = generation.first_needed_location() {
                    break Target::Location(location);
                }
                if generation.is_drained() {
                    map.pop_order.pop_front();
                    continue;
                }
                // The front generation retains nothing yet; everything
                // durable so far is reclaimable.
                break Target::DurableEnd;
            }
        };

        let location = {
            let mut queue = self.queue.lock().await;
            let location = match target {
                Target::Location(location) => location,
                Target::DurableEnd => queue.durable_end(),
            };
            queue.pop(location)?;
            location
        };
        self.kv.set(keys::RECOVERY_LOCATION_KEY, location.to_le_bytes().to_vec());
        Ok(())
    }

    /// Suspends pops on behalf of `uid` (snapshot backups).
    pub fn disable_pop(&self, uid: Uuid) {
        let mut ignore = self.ignore_pop.lock().expect("ignore pop lock");
        ignore.active = true;
        ignore.uid = Some(uid);
        ignore.deadline = Some(Instant::now() + IGNORE_POP_DEADLINE);
        tracing::info!(group_id = %self.group_id, snap_uid = %uid, "pops suspended");
    }

    /// Resumes pops if `uid` owns the suspension and replays queued pops.
    pub async fn enable_pop(self: &Arc<Self>, uid: Uuid) -> Result<()> {
        let queued = {
            let mut ignore = self.ignore_pop.lock().expect("ignore pop lock");
            if !ignore.active {
                return Ok(());
            }
            if ignore.uid != Some(uid) {
                tracing::warn!(
                    group_id = %self.group_id,
                    snap_uid = %uid,
                    owner = ?ignore.uid,
                    "enable-pop from non-owner ignored"
                );
                return Ok(());
            }
            ignore.active = false;
            ignore.uid = None;
            ignore.deadline = None;
            std::mem::take(&mut ignore.queued)
        };
        self.replay_pops(queued).await
    }

    async fn replay_pops(self: &Arc<Self>, queued: Vec<(LogId, TLogPopRequest)>) -> Result<()> {
        for (log_id, req) in queued {
            let generation = {
                let map = self.generations.lock().expect("generation map lock");
                map.by_id.get(&log_id).cloned()
            };
            if let Some(generation) = generation {
                self.apply_pop(&generation, req).await?;
            }
        }
        Ok(())
    }

    /// Background spiller and metadata flusher. Spills the oldest
    /// generation holding memory once the group crosses its spill
    /// threshold, and periodically commits buffered pop metadata.
    pub async fn update_storage_loop(self: Arc<Self>) {
        loop {
            tokio::time::sleep(STORAGE_UPDATE_INTERVAL).await;
            if self.terminated.is_set() {
                return;
            }
            if let Err(error) = self.update_storage_once().await {
                if error.is_terminal() {
                    self.terminate(&error);
                    return;
                }
                tracing::warn!(group_id = %self.group_id, %error, "storage update failed");
            }
        }
    }

    async fn update_storage_once(self: &Arc<Self>) -> Result<()> {
        // A suspension left to expire is released by the server itself.
        let expired = {
            let mut ignore = self.ignore_pop.lock().expect("ignore pop lock");
            if ignore.active && ignore.deadline.is_some_and(|d| Instant::now() >= d) {
                tracing::warn!(group_id = %self.group_id, owner = ?ignore.uid, "pop suspension expired");
                ignore.active = false;
                ignore.uid = None;
                ignore.deadline = None;
                Some(std::mem::take(&mut ignore.queued))
            } else {
                None
            }
        };
        if let Some(queued) = expired {
            self.replay_pops(queued).await?;
        }

        let volatile = self.volatile_bytes();
        if volatile > self.log_config.spill_threshold_bytes {
            let target = volatile - self.log_config.spill_threshold_bytes;
            if let Some(generation) = self.next_spill_generation() {
                let staged = generation.stage_spill(&self.kv, target);
                if staged > 0 {
                    let _commit_guard = self.persistent_data_commit_lock.lock().await;
                    self.kv.commit().await?;
                    generation.finish_spill(staged);
                    self.bytes_durable.fetch_add(staged, Ordering::Relaxed);
                    tracing::debug!(
                        group_id = %self.group_id,
                        log_id = %generation.log_id,
                        bytes = staged,
                        "spilled to kv store"
                    );
                }
            }
        } else {
            // Flush buffered pop offsets and clears.
            let _commit_guard = self.persistent_data_commit_lock.lock().await;
            self.kv.commit().await?;
        }
        Ok(())
    }

    /// Oldest generation still holding in-memory messages.
    fn next_spill_generation(&self) -> Option<Arc<GenerationData>> {
        let mut map = self.generations.lock().expect("generation map lock");
        loop {
            let front = *map.spill_order.front()?;
            match map.by_id.get(&front) {
                Some(generation) if generation.volatile_bytes() > 0 => {
                    return Some(generation.clone());
                }
                Some(generation) if !generation.is_stopped() => {
                    // Active generation with nothing resident; nothing to do.
                    return None;
                }
                _ => {
                    map.spill_order.pop_front();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use tidelog_core::{SpillType, Tag};

    use super::*;

    fn open_group(dir: &Path) -> Arc<GroupData> {
        GroupData::open(
            TLogGroupId::random(),
            dir,
            Arc::new(LogConfig::default()),
            false,
            Arc::new(Semaphore::new(LogConfig::default().peek_memory_bytes)),
        )
        .unwrap()
    }

    fn recruit(
        group: &Arc<GroupData>,
        teams: &[(StorageTeamId, Vec<Tag>)],
    ) -> Arc<GenerationData> {
        let generation = GenerationData::new(
            LogId::random(),
            group.group_id,
            Uuid::new_v4(),
            1,
            0,
            SpillType::Value,
            teams,
            group.log_config.clone(),
        );
        group.register_generation(generation.clone());
        group.notify_new_log_data();
        generation
    }

    fn team() -> StorageTeamId {
        StorageTeamId::from_u128(0x77)
    }

    fn commit_req(prev: Version, version: Version, payload: &'static [u8]) -> TLogCommitRequest {
        TLogCommitRequest {
            span_id: Uuid::new_v4(),
            storage_team_id: team(),
            messages: Bytes::from_static(payload),
            prev_version: prev,
            version,
            known_committed_version: prev,
            min_known_committed_version: 0,
            debug_id: None,
        }
    }

    #[tokio::test]
    async fn commit_chain_advances_and_replies_durable() {
        let dir = TempDir::new().unwrap();
        let group = open_group(dir.path());
        let generation = recruit(&group, &[(team(), vec![Tag::new(0, 1)])]);
        tokio::spawn(group.clone().commit_queue());

        let reply = group.tlog_commit(&generation, commit_req(0, 10, b"a")).await.unwrap();
        assert_eq!(reply.version, 0);
        let reply = group.tlog_commit(&generation, commit_req(10, 20, b"b")).await.unwrap();
        assert_eq!(reply.version, 10);

        assert_eq!(generation.version.get(), 20);
        assert_eq!(generation.queue_committed_version.get(), 20);
    }

    #[tokio::test]
    async fn duplicate_commit_changes_nothing() {
        let dir = TempDir::new().unwrap();
        let group = open_group(dir.path());
        let generation = recruit(&group, &[(team(), vec![Tag::new(0, 1)])]);
        tokio::spawn(group.clone().commit_queue());

        let first = group.tlog_commit(&generation, commit_req(0, 10, b"a")).await.unwrap();
        let second = group.tlog_commit(&generation, commit_req(0, 10, b"a")).await.unwrap();
        assert_eq!(first, second);

        let core = generation.core();
        assert_eq!(core.teams[&team()].messages.len(), 1);
    }

    #[tokio::test]
    async fn commit_against_stopped_generation_is_rejected() {
        let dir = TempDir::new().unwrap();
        let group = open_group(dir.path());
        let generation = recruit(&group, &[(team(), vec![])]);
        generation.stop();

        let err = group.tlog_commit(&generation, commit_req(0, 10, b"a")).await.unwrap_err();
        assert_eq!(err.code(), "tlog_stopped");
    }

    #[tokio::test]
    async fn stop_during_queue_wait_replies_stopped() {
        let dir = TempDir::new().unwrap();
        let group = open_group(dir.path());
        let generation = recruit(&group, &[(team(), vec![])]);
        // No commit_queue task: the queue commit never lands.

        let commit_group = group.clone();
        let commit_generation = generation.clone();
        let commit = tokio::spawn(async move {
            commit_group.tlog_commit(&commit_generation, commit_req(0, 10, b"a")).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!commit.is_finished());

        generation.stop();
        let err = commit.await.unwrap().unwrap_err();
        assert_eq!(err.code(), "tlog_stopped");
    }

    #[tokio::test]
    async fn empty_commit_is_accepted_without_side_effects() {
        let dir = TempDir::new().unwrap();
        let group = open_group(dir.path());
        let generation = recruit(&group, &[(team(), vec![])]);

        let reply = group.tlog_commit(&generation, commit_req(0, 10, b"")).await.unwrap();
        assert_eq!(reply.version, 0);
        assert_eq!(generation.version.get(), 0);
        assert!(generation.core().version_location.is_empty());
    }

    #[tokio::test]
    async fn missing_final_commit_drains_stopped_generation() {
        let dir = TempDir::new().unwrap();
        let group = open_group(dir.path());
        let old = recruit(&group, &[(team(), vec![])]);

        // The old generation advanced its version but its queue commit
        // never landed.
        old.commit_messages(10, team(), &Bytes::from_static(b"x")).unwrap();
        old.version.set(10);
        old.stop();

        let fresh = recruit(&group, &[(team(), vec![])]);
        tokio::spawn(group.clone().commit_queue());

        let reply = group.tlog_commit(&fresh, commit_req(0, 5, b"y")).await.unwrap();
        assert_eq!(reply.version, 0);
        // The stopped generation was forced to its final commit.
        old.queue_committed_version.when_at_least(10).await;
        assert!(old.is_drained());
    }

    #[tokio::test]
    async fn disabled_pops_queue_and_replay_on_enable() {
        let dir = TempDir::new().unwrap();
        let group = open_group(dir.path());
        let tag = Tag::new(0, 1);
        let generation = recruit(&group, &[(team(), vec![tag])]);
        tokio::spawn(group.clone().commit_queue());
        group.tlog_commit(&generation, commit_req(0, 10, b"abc")).await.unwrap();

        let snap = Uuid::new_v4();
        group.disable_pop(snap);
        let pop = TLogPopRequest {
            version: 10,
            durable_known_committed_version: 10,
            tag,
            storage_team_id: team(),
        };
        group.handle_pop(&generation, pop).await.unwrap();
        assert_eq!(generation.core().teams[&team()].messages.len(), 1);

        // Wrong owner cannot resume.
        group.enable_pop(Uuid::new_v4()).await.unwrap();
        assert_eq!(generation.core().teams[&team()].messages.len(), 1);

        group.enable_pop(snap).await.unwrap();
        assert!(generation.core().teams[&team()].messages.is_empty());
    }

    #[tokio::test]
    async fn queue_pop_stays_behind_oldest_generation() {
        let dir = TempDir::new().unwrap();
        let group = open_group(dir.path());
        let tag = Tag::new(0, 1);
        let old = recruit(&group, &[(team(), vec![tag])]);
        tokio::spawn(group.clone().commit_queue());

        group.tlog_commit(&old, commit_req(0, 10, b"ten")).await.unwrap();
        group.tlog_commit(&old, commit_req(10, 20, b"twenty")).await.unwrap();
        group.tlog_commit(&old, commit_req(20, 25, b"twentyfive")).await.unwrap();
        let location_25 = old.core().version_location[&25].0;
        group.stop_all();

        let fresh = recruit(&group, &[(team(), vec![tag])]);
        group.tlog_commit(&fresh, commit_req(0, 30, b"thirty")).await.unwrap();

        // Pop the old generation through 20 only; 25 is still needed.
        let pop = TLogPopRequest {
            version: 20,
            durable_known_committed_version: 20,
            tag,
            storage_team_id: team(),
        };
        group.handle_pop(&old, pop).await.unwrap();

        let queue = group.queue.lock().await;
        assert_eq!(queue.popped(), location_25);
    }
}
