// Copyright 2026 The Tidelog Authors
// SPDX-License-Identifier: Apache-2.0

//! One log generation of one TLog group.
//!
//! A generation owns the authoritative in-memory log slice for every storage
//! team recruited into its group: per-team deques of `(version, payload)`
//! entries whose payload bytes share large append-only message blocks. The
//! generation also tracks the version chain that serializes commits, the
//! durable watermarks, and which versions have been spilled to the KV store.
//!
//! Lifecycle: `Init -> Initialized -> Active -> Stopped -> Drained ->
//! Removed`. A stopped generation rejects commits but keeps serving peeks
//! until its consumers drain it; removal clears its persistent keys.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use tokio::sync::Semaphore;
use uuid::Uuid;

use tidelog_core::config::LogConfig;
use tidelog_core::{
    Epoch, Error, LogId, Result, SpillType, StorageTeamId, Tag, TLogGroupId, Version, TXS_TEAM,
};
use tidelog_storage::disk_queue::Location;
use tidelog_storage::keys::{self, SpilledMessageRef};
use tidelog_storage::{FramedQueue, KeyValueStore};

use crate::group::QueueEntry;
use crate::notify::{Flag, NotifiedVersion, Trigger};
use crate::protocol::{TLogPeekReply, TLogPeekRequest};

/// In-memory state for one storage team within a generation.
pub struct StorageTeamData {
    /// The team id.
    pub team: StorageTeamId,
    /// Storage server tags of the team's members.
    pub tags: Vec<Tag>,
    /// Version-ordered message entries; payloads reference shared blocks.
    pub messages: VecDeque<(Version, Bytes)>,
    /// Popped-through version per member tag.
    tag_popped: HashMap<Tag, Version>,
    /// Popped-through version for the whole team: the minimum across its
    /// member tags, so no member can lose unacknowledged data.
    popped: Version,
}

impl StorageTeamData {
    fn new(team: StorageTeamId, tags: Vec<Tag>) -> Self {
        Self { team, tags, messages: VecDeque::new(), tag_popped: HashMap::new(), popped: 0 }
    }

    /// Records a pop for one member tag and recomputes the team watermark.
    fn note_pop(&mut self, tag: Tag, version: Version) -> Version {
        let slot = self.tag_popped.entry(tag).or_insert(0);
        *slot = (*slot).max(version);
        self.popped = self
            .tags
            .iter()
            .map(|t| self.tag_popped.get(t).copied().unwrap_or(0))
            .min()
            .unwrap_or(version)
            .max(self.popped);
        self.popped
    }

    /// Popped-through version of the team.
    #[must_use]
    pub fn popped(&self) -> Version {
        self.popped
    }
}

/// Mutable core of a generation, behind one lock.
pub struct GenerationCore {
    /// Per-team message indexes.
    pub teams: HashMap<StorageTeamId, StorageTeamData>,
    /// Active message block; entries slice into it.
    block: BytesMut,
    /// `[start, end)` disk-queue locations of each pushed version.
    pub version_location: BTreeMap<Version, (Location, Location)>,
    /// Message bytes appended at each version, for spill sizing.
    version_sizes: BTreeMap<Version, u64>,
    /// Highest version a proxy certified committed everywhere.
    pub known_committed_version: Version,
    /// Lower bound across the proxy's view of all logs.
    pub min_known_committed_version: Version,
    /// Known-committed version proven durable by a queue commit.
    pub durable_known_committed_version: Version,
    /// Version of the queue commit currently in flight.
    pub queue_committing_version: Version,
    /// Bytes appended into this generation's memory.
    pub bytes_input: u64,
    /// Bytes released from memory (spilled or popped).
    pub bytes_durable: u64,
    /// Versions at or below this were moved to the KV store.
    pub spilled_through: Version,
    /// Next expected peek sequence per consumer.
    peek_trackers: HashMap<Uuid, u32>,
}

/// Outcome of an in-memory pop.
#[derive(Debug, Clone, Copy)]
pub struct PopOutcome {
    /// Bytes released from the in-memory index.
    pub freed_bytes: u64,
    /// The acknowledging tag's popped-through version after this pop.
    pub tag_popped: Version,
    /// The team's popped-through version after this pop.
    pub team_popped: Version,
}

/// One generation of one TLog group.
pub struct GenerationData {
    /// Interface id shared by all groups of this recruitment.
    pub log_id: LogId,
    /// Owning group.
    pub group_id: TLogGroupId,
    /// Recruitment this generation answers to.
    pub recruitment_id: Uuid,
    /// Epoch that recruited it.
    pub epoch: Epoch,
    /// Data-center locality.
    pub locality: i8,
    /// Spill mode.
    pub spill_type: SpillType,
    /// Next version to commit; advancing it releases peek and queue waiters.
    pub version: NotifiedVersion,
    /// The disk queue has committed up to here.
    pub queue_committed_version: NotifiedVersion,
    /// Pulsed when the generation stops, unblocking in-flight commit waits.
    pub stop_commit: Trigger,
    /// Serializes the duplicate-check-and-append section of commits, so a
    /// retried request cannot append twice.
    pub commit_chain: tokio::sync::Mutex<()>,
    /// Resolved when persistent state is initialized (or failed).
    pub recovery_complete: Flag,
    /// Resolved when the group's commit loop adopted this generation.
    pub committing_queue: Flag,
    stopped: AtomicBool,
    initialized: AtomicBool,
    core: Mutex<GenerationCore>,
    config: Arc<LogConfig>,
}

impl GenerationData {
    /// Creates a generation in the `Init` state.
    #[must_use]
    pub fn new(
        log_id: LogId,
        group_id: TLogGroupId,
        recruitment_id: Uuid,
        epoch: Epoch,
        locality: i8,
        spill_type: SpillType,
        storage_teams: &[(StorageTeamId, Vec<Tag>)],
        config: Arc<LogConfig>,
    ) -> Arc<Self> {
        let teams = storage_teams
            .iter()
            .map(|(team, tags)| (*team, StorageTeamData::new(*team, tags.clone())))
            .collect();
        Arc::new(Self {
            log_id,
            group_id,
            recruitment_id,
            epoch,
            locality,
            spill_type,
            version: NotifiedVersion::new(0),
            queue_committed_version: NotifiedVersion::new(0),
            stop_commit: Trigger::new(),
            commit_chain: tokio::sync::Mutex::new(()),
            recovery_complete: Flag::new(),
            committing_queue: Flag::new(),
            stopped: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
            core: Mutex::new(GenerationCore {
                teams,
                block: BytesMut::new(),
                version_location: BTreeMap::new(),
                version_sizes: BTreeMap::new(),
                known_committed_version: 0,
                min_known_committed_version: 0,
                durable_known_committed_version: 0,
                queue_committing_version: 0,
                bytes_input: 0,
                bytes_durable: 0,
                spilled_through: 0,
                peek_trackers: HashMap::new(),
            }),
            config,
        })
    }

    /// Locks the mutable core.
    pub fn core(&self) -> std::sync::MutexGuard<'_, GenerationCore> {
        self.core.lock().expect("generation core lock")
    }

    /// Whether this generation has been stopped.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Whether persistent state initialization completed.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Marks persistent state as initialized.
    pub fn mark_initialized(&self) {
        self.initialized.store(true, Ordering::Release);
    }

    /// Stopped with every pushed version committed to the queue.
    #[must_use]
    pub fn is_drained(&self) -> bool {
        self.is_stopped() && self.queue_committed_version.get() == self.version.get()
    }

    /// Stops the generation: commits are rejected from here on, in-flight
    /// commit waits unblock, and unresolved recovery promises fail.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!(log_id = %self.log_id, group_id = %self.group_id, epoch = self.epoch, "generation stopped");
        self.recovery_complete.fail();
        self.committing_queue.fail();
        self.stop_commit.trigger();
    }

    /// Whether `team`'s spilled data carries full values rather than
    /// disk-queue references. The transaction-state team always spills by
    /// value.
    #[must_use]
    pub fn should_spill_by_value(&self, team: StorageTeamId) -> bool {
        match self.spill_type {
            SpillType::Value => true,
            SpillType::Reference => team == TXS_TEAM,
        }
    }

    /// Appends `messages` to `team`'s in-memory index at `version`.
    ///
    /// Empty payloads are refused upstream; the version counter is advanced
    /// by the commit handler after queue framing, not here. Returns the
    /// bytes charged against the group's memory budget.
    ///
    /// # Errors
    ///
    /// `tlog_group_not_found` if the team is not recruited here.
    pub fn commit_messages(
        &self,
        version: Version,
        team: StorageTeamId,
        messages: &Bytes,
    ) -> Result<u64> {
        debug_assert!(!messages.is_empty());
        let mut core = self.core();
        if !core.teams.contains_key(&team) {
            return Err(Error::TLogGroupNotFound(team));
        }

        // Share the tail block; start a fresh one when it cannot hold the
        // payload. Sliced-off entries keep the old allocation alive until
        // the last one is spilled or popped.
        if core.block.capacity() < messages.len() {
            core.block =
                BytesMut::with_capacity(self.config.default_block_bytes.max(messages.len()));
        }
        core.block.extend_from_slice(messages);
        let slice = core.block.split().freeze();

        let added = slice.len() as u64;
        if slice.len() > self.config.max_message_size {
            tracing::warn!(
                log_id = %self.log_id,
                team = %team,
                version,
                size = slice.len(),
                "large message accepted"
            );
        }

        let team_data = core.teams.get_mut(&team).expect("checked above");
        debug_assert!(team_data.messages.back().map_or(true, |(v, _)| *v < version));
        team_data.messages.push_back((version, slice));

        *core.version_sizes.entry(version).or_insert(0) += added;
        core.bytes_input += added;
        Ok(added)
    }

    /// Records where a version's queue entry landed.
    pub fn record_location(&self, version: Version, location: (Location, Location)) {
        self.core().version_location.insert(version, location);
    }

    /// The smallest disk-queue location this generation still needs: the
    /// entry of the first version not yet popped by every team. `None` when
    /// nothing is retained.
    #[must_use]
    pub fn first_needed_location(&self) -> Option<Location> {
        let core = self.core();
        let min_popped = core.teams.values().map(StorageTeamData::popped).min().unwrap_or(0);
        core.version_location.range(min_popped + 1..).next().map(|(_, (start, _))| *start)
    }

    /// Applies a pop to the in-memory index: records the tag watermark,
    /// drops acknowledged entries and releases their bytes.
    ///
    /// # Errors
    ///
    /// `tlog_group_not_found` for unknown teams.
    pub fn pop(&self, team: StorageTeamId, tag: Tag, version: Version) -> Result<PopOutcome> {
        let mut core = self.core();
        let team_data =
            core.teams.get_mut(&team).ok_or(Error::TLogGroupNotFound(team))?;
        let team_popped = team_data.note_pop(tag, version);
        let tag_popped = team_data.tag_popped.get(&tag).copied().unwrap_or(version);

        let mut freed_bytes = 0u64;
        while team_data.messages.front().is_some_and(|(v, _)| *v <= team_popped) {
            let (_, payload) = team_data.messages.pop_front().expect("checked front");
            freed_bytes += payload.len() as u64;
        }

        // Forget locations for versions popped by every team.
        let min_popped = core.teams.values().map(StorageTeamData::popped).min().unwrap_or(0);
        core.version_location = core.version_location.split_off(&(min_popped + 1));
        core.version_sizes = core.version_sizes.split_off(&(min_popped + 1));
        core.bytes_durable += freed_bytes;
        Ok(PopOutcome { freed_bytes, tag_popped, team_popped })
    }

    /// Stops the generation for recovery and reports its end state.
    #[must_use]
    pub fn lock(&self) -> (Version, Version) {
        self.stop();
        let core = self.core();
        (self.version.get(), core.known_committed_version)
    }

    /// Bytes resident in memory (input minus released).
    #[must_use]
    pub fn volatile_bytes(&self) -> u64 {
        let core = self.core();
        core.bytes_input.saturating_sub(core.bytes_durable)
    }

    /// Spills in-memory entries up to the queue-committed version until at
    /// least `target_bytes` are released. Value-spill teams (and always the
    /// transaction-state team) write full payloads under `TagMsg/`;
    /// reference-spill teams write their queue locations under `TagMsgRef/`.
    ///
    /// The KV batch is buffered here; the caller commits it under the
    /// group's persistent-data lock and then calls
    /// [`finish_spill`](Self::finish_spill).
    ///
    /// Returns the bytes staged for release, zero when nothing is eligible.
    pub fn stage_spill(&self, kv: &KeyValueStore, target_bytes: u64) -> u64 {
        let mut core = self.core();
        let durable_limit = self.queue_committed_version.get();

        // Pick the cutoff version: oldest first until the target is met.
        let mut staged = 0u64;
        let mut spill_end = None;
        for (&version, &size) in core.version_sizes.range(..=durable_limit) {
            staged += size;
            spill_end = Some(version);
            if staged >= target_bytes {
                break;
            }
        }
        let Some(spill_end) = spill_end else {
            return 0;
        };

        let log_id = self.log_id;
        let spill_by_value: Vec<StorageTeamId> = core
            .teams
            .keys()
            .copied()
            .filter(|team| self.should_spill_by_value(*team))
            .collect();
        let version_location = core.version_location.clone();

        let mut released = 0u64;
        for team_data in core.teams.values_mut() {
            let by_value = spill_by_value.contains(&team_data.team);
            while team_data.messages.front().is_some_and(|(v, _)| *v <= spill_end) {
                let (version, payload) = team_data.messages.pop_front().expect("checked front");
                released += payload.len() as u64;
                for tag in &team_data.tags {
                    if by_value {
                        kv.set(keys::tag_messages_key(log_id, *tag, version), payload.to_vec());
                    } else if let Some((start, end)) = version_location.get(&version) {
                        let reference = SpilledMessageRef {
                            start: *start,
                            end: *end,
                            message_bytes: payload.len() as u32,
                        };
                        kv.set(
                            keys::tag_message_refs_key(log_id, *tag, version),
                            bincode::serialize(&reference).expect("serializable reference"),
                        );
                    }
                }
            }
        }

        core.spilled_through = core.spilled_through.max(spill_end);
        core.version_sizes = core.version_sizes.split_off(&(spill_end + 1));
        kv.set(keys::version_key(log_id), keys::version_value(self.version.get()));
        kv.set(
            keys::known_committed_key(log_id),
            keys::version_value(core.known_committed_version),
        );
        released
    }

    /// Accounts a completed spill's released bytes.
    pub fn finish_spill(&self, released: u64) {
        self.core().bytes_durable += released;
    }

    /// Serves a peek: drains spilled records first, then the in-memory
    /// index, bounded by the per-reply byte target.
    ///
    /// # Errors
    ///
    /// `tlog_group_not_found` for unknown teams, `operation_cancelled` for
    /// out-of-order sequences.
    pub async fn peek(
        &self,
        kv: &KeyValueStore,
        queue: &tokio::sync::Mutex<FramedQueue>,
        peek_memory: &Semaphore,
        spill_reads: &Semaphore,
        req: TLogPeekRequest,
    ) -> Result<TLogPeekReply> {
        self.check_peek_sequence(&req)?;
        let begin = req.begin_version;

        if self.version.get() < begin {
            if req.return_if_blocked {
                return Ok(self.empty_peek_reply(&req, begin));
            }
            // Wait for data to reach the requested version; a stop while
            // waiting yields an empty reply the consumer can retry against
            // the next generation.
            tokio::select! {
                () = self.version.when_at_least(begin) => {}
                () = self.stop_commit.triggered() => {}
            }
            if self.version.get() < begin {
                return Ok(self.empty_peek_reply(&req, begin));
            }
        }

        let reply_limit = self.config.peek_reply_bytes;
        let _memory_permit = peek_memory
            .acquire_many(reply_limit as u32)
            .await
            .map_err(|_| Error::OperationCancelled)?;

        let (popped, spilled_through, version_limit) = {
            let core = self.core();
            let team_data =
                core.teams.get(&req.storage_team_id).ok_or(Error::TLogGroupNotFound(req.storage_team_id))?;
            (team_data.popped(), core.spilled_through, self.version.get())
        };

        if popped > 0 && popped >= begin {
            // The requested prefix was reclaimed; the consumer must resume
            // past the popped version.
            let mut reply = self.empty_peek_reply(&req, popped);
            reply.popped = Some(popped);
            return Ok(reply);
        }

        let end_bound = req.end_version.unwrap_or(Version::MAX);
        let mut data = BytesMut::new();
        let mut first_included = None;
        let mut last_included = None;
        let mut spill_truncated = false;

        if begin <= spilled_through || req.only_spilled {
            spill_truncated = self
                .drain_spilled(
                    kv,
                    queue,
                    spill_reads,
                    &req,
                    begin,
                    end_bound.min(spilled_through.saturating_add(1)),
                    reply_limit,
                    &mut data,
                    &mut first_included,
                    &mut last_included,
                )
                .await?;
        }

        let mut memory_truncated = false;
        if !req.only_spilled && !spill_truncated {
            let core = self.core();
            let team_data =
                core.teams.get(&req.storage_team_id).ok_or(Error::TLogGroupNotFound(req.storage_team_id))?;
            for (version, payload) in &team_data.messages {
                if *version < begin {
                    continue;
                }
                if *version >= end_bound {
                    break;
                }
                if data.len() + payload.len() > reply_limit && !data.is_empty() {
                    memory_truncated = true;
                    break;
                }
                data.extend_from_slice(payload);
                first_included.get_or_insert(*version);
                last_included = Some(*version);
            }
        }

        let end = if spill_truncated || memory_truncated || req.only_spilled {
            last_included.unwrap_or(begin)
        } else {
            // Complete through the generation's version (or the exclusive
            // request bound).
            version_limit.min(end_bound.saturating_sub(1)).max(begin)
        };

        let core = self.core();
        Ok(TLogPeekReply {
            debug_id: req.debug_id,
            data: data.freeze(),
            end,
            popped: None,
            max_known_version: self.version.get(),
            min_known_committed_version: core.min_known_committed_version,
            begin: first_included,
            only_spilled: spill_truncated,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn drain_spilled(
        &self,
        kv: &KeyValueStore,
        queue: &tokio::sync::Mutex<FramedQueue>,
        spill_reads: &Semaphore,
        req: &TLogPeekRequest,
        begin: Version,
        end: Version,
        reply_limit: usize,
        data: &mut BytesMut,
        first_included: &mut Option<Version>,
        last_included: &mut Option<Version>,
    ) -> Result<bool> {
        if begin >= end {
            return Ok(false);
        }
        let by_value = self.should_spill_by_value(req.storage_team_id);
        if by_value {
            let (range_begin, range_end) =
                keys::tag_messages_range(self.log_id, req.tag, begin, end);
            for (key, value) in kv.read_range(&range_begin, &range_end, None)? {
                let version = keys::version_from_spill_key(&key)
                    .ok_or(Error::CorruptData("malformed spill key"))?;
                if data.len() + value.len() > reply_limit && !data.is_empty() {
                    return Ok(true);
                }
                data.extend_from_slice(&value);
                first_included.get_or_insert(version);
                *last_included = Some(version);
            }
        } else {
            let (range_begin, range_end) =
                keys::tag_message_refs_range(self.log_id, req.tag, begin, end);
            let _read_permit =
                spill_reads.acquire().await.map_err(|_| Error::OperationCancelled)?;
            for (key, value) in kv.read_range(&range_begin, &range_end, None)? {
                let version = keys::version_from_spill_key(&key)
                    .ok_or(Error::CorruptData("malformed spill key"))?;
                let reference: SpilledMessageRef = bincode::deserialize(&value)
                    .map_err(|_| Error::CorruptData("malformed spill reference"))?;
                if data.len() + reference.message_bytes as usize > reply_limit && !data.is_empty()
                {
                    return Ok(true);
                }
                let payload = {
                    let mut queue = queue.lock().await;
                    queue.read_record_at(reference.start, reference.end)?
                };
                let entry: QueueEntry = bincode::deserialize(&payload)
                    .map_err(|_| Error::CorruptData("malformed spilled queue entry"))?;
                data.extend_from_slice(&entry.messages);
                first_included.get_or_insert(version);
                *last_included = Some(version);
            }
        }
        Ok(false)
    }

    fn check_peek_sequence(&self, req: &TLogPeekRequest) -> Result<()> {
        if let Some((consumer, sequence)) = req.sequence {
            let mut core = self.core();
            let expected = core.peek_trackers.entry(consumer).or_insert(0);
            if sequence != *expected {
                tracing::debug!(
                    log_id = %self.log_id,
                    %consumer,
                    sequence,
                    expected = *expected,
                    "out-of-order peek dropped"
                );
                return Err(Error::OperationCancelled);
            }
            *expected += 1;
        }
        Ok(())
    }

    fn empty_peek_reply(&self, req: &TLogPeekRequest, end: Version) -> TLogPeekReply {
        let core = self.core();
        TLogPeekReply {
            debug_id: req.debug_id,
            data: Bytes::new(),
            end,
            popped: None,
            max_known_version: self.version.get(),
            min_known_committed_version: core.min_known_committed_version,
            begin: None,
            only_spilled: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_generation(teams: &[(StorageTeamId, Vec<Tag>)]) -> Arc<GenerationData> {
        GenerationData::new(
            LogId::random(),
            TLogGroupId::random(),
            Uuid::new_v4(),
            1,
            0,
            SpillType::Value,
            teams,
            Arc::new(LogConfig::default()),
        )
    }

    fn team() -> StorageTeamId {
        StorageTeamId::from_u128(0x10)
    }

    #[test]
    fn commit_messages_indexes_by_team_and_version() {
        let generation = test_generation(&[(team(), vec![Tag::new(0, 1)])]);
        generation.commit_messages(10, team(), &Bytes::from_static(b"aaa")).unwrap();
        generation.commit_messages(20, team(), &Bytes::from_static(b"bb")).unwrap();

        let core = generation.core();
        let entries = &core.teams[&team()].messages;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0], (10, Bytes::from_static(b"aaa")));
        assert_eq!(entries[1], (20, Bytes::from_static(b"bb")));
        assert_eq!(core.bytes_input, 5);
    }

    #[test]
    fn commit_messages_rejects_unknown_team() {
        let generation = test_generation(&[(team(), vec![])]);
        let err = generation
            .commit_messages(10, StorageTeamId::from_u128(0x99), &Bytes::from_static(b"x"))
            .unwrap_err();
        assert_eq!(err.code(), "tlog_group_not_found");
    }

    #[test]
    fn entries_share_the_block_allocation() {
        let generation = test_generation(&[(team(), vec![])]);
        generation.commit_messages(10, team(), &Bytes::from_static(b"aaa")).unwrap();
        generation.commit_messages(20, team(), &Bytes::from_static(b"bbb")).unwrap();

        let core = generation.core();
        let entries = &core.teams[&team()].messages;
        let first = entries[0].1.as_ptr() as usize;
        let second = entries[1].1.as_ptr() as usize;
        // Consecutive small appends land back to back in one block.
        assert_eq!(second, first + 3);
    }

    #[test]
    fn pop_uses_min_across_tags() {
        let tags = vec![Tag::new(0, 1), Tag::new(0, 2)];
        let generation = test_generation(&[(team(), tags.clone())]);
        for v in [10, 20, 30] {
            generation.commit_messages(v, team(), &Bytes::from_static(b"xy")).unwrap();
        }

        let outcome = generation.pop(team(), tags[0], 20).unwrap();
        // Second tag has not acknowledged anything yet.
        assert_eq!(outcome.team_popped, 0);
        assert_eq!(outcome.freed_bytes, 0);

        let outcome = generation.pop(team(), tags[1], 30).unwrap();
        assert_eq!(outcome.team_popped, 20);
        assert_eq!(outcome.freed_bytes, 4);
        assert_eq!(generation.core().teams[&team()].messages.len(), 1);
    }

    #[test]
    fn pop_never_removes_unacknowledged_versions() {
        let tag = Tag::new(0, 1);
        let generation = test_generation(&[(team(), vec![tag])]);
        for v in [10, 20] {
            generation.commit_messages(v, team(), &Bytes::from_static(b"x")).unwrap();
        }
        generation.pop(team(), tag, 10).unwrap();
        let core = generation.core();
        assert_eq!(core.teams[&team()].messages.front().unwrap().0, 20);
    }

    #[test]
    fn first_needed_location_tracks_pops() {
        let tag = Tag::new(0, 1);
        let generation = test_generation(&[(team(), vec![tag])]);
        for (v, loc) in [(10u64, (0u64, 50u64)), (20, (50, 90)), (25, (90, 120))] {
            generation.commit_messages(v, team(), &Bytes::from_static(b"m")).unwrap();
            generation.record_location(v, loc);
        }

        assert_eq!(generation.first_needed_location(), Some(0));
        generation.pop(team(), tag, 20).unwrap();
        assert_eq!(generation.first_needed_location(), Some(90));
        generation.pop(team(), tag, 25).unwrap();
        // Fully popped: the queue may advance past our last entry.
        assert_eq!(generation.first_needed_location(), None);
    }

    #[test]
    fn stop_is_idempotent_and_fails_promises() {
        let generation = test_generation(&[]);
        assert!(!generation.is_stopped());
        generation.stop();
        generation.stop();
        assert!(generation.is_stopped());
        assert!(generation.recovery_complete.is_set());
        assert!(generation.is_drained());
    }

    #[test]
    fn lock_stops_and_reports_end_state() {
        let generation = test_generation(&[(team(), vec![])]);
        generation.commit_messages(10, team(), &Bytes::from_static(b"x")).unwrap();
        generation.version.set(10);
        generation.core().known_committed_version = 7;

        let (end, kcv) = generation.lock();
        assert_eq!((end, kcv), (10, 7));
        assert!(generation.is_stopped());
    }

    #[test]
    fn txs_team_always_spills_by_value() {
        let generation = GenerationData::new(
            LogId::random(),
            TLogGroupId::random(),
            Uuid::new_v4(),
            1,
            0,
            SpillType::Reference,
            &[(team(), vec![]), (TXS_TEAM, vec![])],
            Arc::new(LogConfig::default()),
        );
        assert!(generation.should_spill_by_value(TXS_TEAM));
        assert!(!generation.should_spill_by_value(team()));
    }

    #[test]
    fn peek_sequence_enforces_order() {
        let generation = test_generation(&[(team(), vec![])]);
        let consumer = Uuid::new_v4();
        let req = |sequence| TLogPeekRequest {
            debug_id: None,
            begin_version: 0,
            end_version: None,
            storage_team_id: team(),
            tag: Tag::new(0, 1),
            return_if_blocked: true,
            only_spilled: false,
            sequence: Some((consumer, sequence)),
        };
        generation.check_peek_sequence(&req(0)).unwrap();
        generation.check_peek_sequence(&req(1)).unwrap();
        assert!(generation.check_peek_sequence(&req(1)).is_err());
        assert!(generation.check_peek_sequence(&req(5)).is_err());
        generation.check_peek_sequence(&req(2)).unwrap();
    }
}
