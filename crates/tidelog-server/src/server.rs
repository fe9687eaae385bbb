// Copyright 2026 The Tidelog Authors
// SPDX-License-Identifier: Apache-2.0

//! The shared TLog process shell.
//!
//! One `ServerData` hosts every TLog group assigned to this worker.
//! Recruitment (`InitializeTLogRequest`) creates per-group persistence on
//! first sight, stops the previous generation everywhere, initializes a new
//! generation per group, and returns a [`TLogInterface`] whose endpoints are
//! served until the generation is displaced. A displacement watcher
//! compares cluster info against our epoch and tears the recruitment down
//! with `worker_removed` when a newer recovery supersedes it.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::pin::pin;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, watch, Semaphore};
use uuid::Uuid;

use tidelog_core::config::Config;
use tidelog_core::{Epoch, Error, LogId, Result, StorageTeamId, Tag, TLogGroupId, Version};
use tidelog_storage::keys;

use crate::generation::GenerationData;
use crate::group::GroupData;
use crate::protocol::{
    InitializeTLogRequest, MessageTransferModel, Request, TLogEndpoints, TLogInterface,
    TLogLockResult, TLogQueuingMetricsReply,
};

/// Where the cluster currently stands in recovery, as observed by workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum RecoveryState {
    /// No cluster controller has published state yet.
    #[default]
    Uninitialized,
    /// A new master is recruiting its log system.
    Recruiting,
    /// The new log system accepts commits.
    AcceptingCommits,
    /// Old log data is fully recovered and old generations can retire.
    FullyRecovered,
}

/// The slice of cluster info the TLog watches for displacement.
#[derive(Debug, Clone, Default)]
pub struct ClusterInfo {
    /// Recovery count of the acting master.
    pub recovery_count: Epoch,
    /// Recovery progress.
    pub recovery_state: RecoveryState,
    /// Interfaces in the current log system config.
    pub log_system_logs: HashSet<LogId>,
    /// Interfaces of prior generations still being drained.
    pub prior_committed_log_servers: Vec<LogId>,
}

/// A recruitment request paired with its reply channel.
pub struct InitializeTLog {
    /// The request.
    pub body: InitializeTLogRequest,
    /// Resolves with the recruited interface.
    pub reply: oneshot::Sender<Result<TLogInterface>>,
}

type ActiveGeneration = HashMap<StorageTeamId, (Arc<GroupData>, Arc<GenerationData>)>;

/// A TLog process: its groups, recruitment cache and shared limits.
pub struct ServerData {
    /// Identifies this shared TLog across recruitments.
    pub shared_tlog_id: Uuid,
    /// The hosting worker.
    pub worker_id: Uuid,
    /// Changes whenever byte counters reset.
    pub instance_id: u64,
    config: Arc<Config>,
    data_dir: PathBuf,
    groups: DashMap<TLogGroupId, Arc<GroupData>>,
    recruitment_cache: Mutex<HashMap<Uuid, TLogInterface>>,
    peek_memory: Arc<Semaphore>,
    cluster: watch::Receiver<ClusterInfo>,
}

impl ServerData {
    /// Creates the process shell. `cluster` feeds the displacement watcher.
    #[must_use]
    pub fn new(config: Config, cluster: watch::Receiver<ClusterInfo>) -> Arc<Self> {
        let data_dir = config.storage.data_dir.clone();
        let peek_memory = Arc::new(Semaphore::new(config.log.peek_memory_bytes));
        Arc::new(Self {
            shared_tlog_id: Uuid::new_v4(),
            worker_id: Uuid::new_v4(),
            instance_id: rand::random(),
            config: Arc::new(config),
            data_dir,
            groups: DashMap::new(),
            recruitment_cache: Mutex::new(HashMap::new()),
            peek_memory,
            cluster,
        })
    }

    /// Serves recruitment requests until the channel closes or a terminal
    /// error tears the worker down.
    ///
    /// # Errors
    ///
    /// Terminal storage errors; pending recruitments are rejected with
    /// `recruitment_failed` first.
    pub async fn run(
        self: Arc<Self>,
        mut requests: mpsc::UnboundedReceiver<InitializeTLog>,
    ) -> Result<()> {
        while let Some(init) = requests.recv().await {
            let recruitment_id = init.body.recruitment_id;
            let cached = {
                let cache = self.recruitment_cache.lock().expect("recruitment cache lock");
                cache.get(&recruitment_id).cloned()
            };
            if let Some(interface) = cached {
                tracing::info!(%recruitment_id, "recruitment deduplicated");
                let _ = init.reply.send(Ok(interface));
                continue;
            }

            match self.clone().tlog_start(init.body).await {
                Ok(interface) => {
                    self.recruitment_cache
                        .lock()
                        .expect("recruitment cache lock")
                        .insert(recruitment_id, interface.clone());
                    let _ = init.reply.send(Ok(interface));
                }
                Err(error) => {
                    tracing::error!(%recruitment_id, %error, "recruitment failed");
                    let _ = init.reply.send(Err(Error::RecruitmentFailed));
                    if error.is_terminal() {
                        // Reject whatever is still queued before going down.
                        while let Ok(pending) = requests.try_recv() {
                            let _ = pending.reply.send(Err(Error::RecruitmentFailed));
                        }
                        return Err(error);
                    }
                }
            }
        }
        Ok(())
    }

    /// Recruits a new generation: ensures groups exist and are recovered,
    /// stops the prior generation, initializes persistent state, and starts
    /// serving the new interface.
    async fn tlog_start(self: Arc<Self>, req: InitializeTLogRequest) -> Result<TLogInterface> {
        let log_id = LogId::random();
        let (interface, endpoints) = TLogInterface::new_pair(
            log_id,
            self.shared_tlog_id,
            MessageTransferModel::PassivelyPull,
        );
        let create_timeout = self.config.log.max_create_duration();

        for group_req in &req.tlog_groups {
            if self.groups.contains_key(&group_req.group_id) {
                continue;
            }
            let group_id = group_req.group_id;
            let dir = self.data_dir.join(format!("group-{}", group_id.to_hex()));
            let log_config = Arc::new(self.config.log.clone());
            let in_memory_only = self.config.storage.queue_in_memory_only;
            let peek_memory = self.peek_memory.clone();

            let opened = tokio::time::timeout(
                create_timeout,
                tokio::task::spawn_blocking(move || {
                    GroupData::open(group_id, &dir, log_config, in_memory_only, peek_memory)
                }),
            )
            .await
            .map_err(|_| Error::IoTimeout)?
            .map_err(|e| Error::Database(e.to_string()))??;

            tokio::time::timeout(create_timeout, opened.check_empty_queue())
                .await
                .map_err(|_| Error::IoTimeout)??;
            opened.check_recovered()?;

            tokio::spawn(opened.clone().commit_queue());
            tokio::spawn(opened.clone().update_storage_loop());
            tracing::info!(group_id = %group_id, "tlog group opened");
            self.groups.insert(group_id, opened);
        }

        // A new recruitment displaces whatever was active.
        self.stop_all_tlogs(log_id);

        let mut active: ActiveGeneration = HashMap::new();
        let mut started = Vec::new();
        for group_req in &req.tlog_groups {
            let group = self
                .groups
                .get(&group_req.group_id)
                .map(|entry| entry.value().clone())
                .expect("group created above");

            // Every team needs at least one tag for spill keys.
            let teams: Vec<(StorageTeamId, Vec<Tag>)> = group_req
                .storage_teams
                .iter()
                .map(|(team, tags)| {
                    let tags =
                        if tags.is_empty() { vec![Tag::new(0, 0)] } else { tags.clone() };
                    (*team, tags)
                })
                .collect();

            let generation = GenerationData::new(
                log_id,
                group.group_id,
                req.recruitment_id,
                req.epoch,
                req.locality,
                req.spill_type,
                &teams,
                Arc::new(self.config.log.clone()),
            );
            group.register_generation(generation.clone());
            for (team, _) in &teams {
                active.insert(*team, (group.clone(), generation.clone()));
            }
            started.push((group, generation));
        }

        for (group, generation) in &started {
            self.tlog_group_start(group, generation).await?;
        }

        tracing::info!(
            log_id = %log_id,
            epoch = req.epoch,
            groups = req.tlog_groups.len(),
            teams = active.len(),
            "tlog generation recruited"
        );

        let server = self.clone();
        let epoch = req.epoch;
        let is_primary = req.is_primary;
        tokio::spawn(async move {
            server.tlog_core(log_id, epoch, is_primary, endpoints, active).await;
        });
        Ok(interface)
    }

    /// Brings one group's new generation to life: persists its identity
    /// keys and waits for the commit loop to adopt it.
    async fn tlog_group_start(
        &self,
        group: &Arc<GroupData>,
        generation: &Arc<GenerationData>,
    ) -> Result<()> {
        let init = async {
            let kv = &group.kv;
            kv.set(keys::FORMAT_KEY, keys::FORMAT_VALUE);
            kv.set(keys::version_key(generation.log_id), keys::version_value(generation.version.get()));
            kv.set(
                keys::known_committed_key(generation.log_id),
                keys::version_value(generation.core().known_committed_version),
            );
            kv.set(keys::locality_key(generation.log_id), vec![generation.locality as u8]);
            kv.set(
                keys::recovery_count_key(generation.log_id),
                keys::version_value(generation.epoch),
            );
            kv.set(
                keys::protocol_version_key(generation.log_id),
                keys::version_value(keys::LOG_PROTOCOL_VERSION),
            );
            kv.set(
                keys::spill_type_key(generation.log_id),
                vec![match generation.spill_type {
                    tidelog_core::SpillType::Value => 0u8,
                    tidelog_core::SpillType::Reference => 1u8,
                }],
            );
            let _commit_guard = group.persistent_data_commit_lock.lock().await;
            kv.commit().await
        };
        tokio::time::timeout(self.config.log.max_create_duration(), init)
            .await
            .map_err(|_| Error::IoTimeout)?
            .map_err(|error| {
                self.remove_log(group, generation);
                error
            })?;

        generation.mark_initialized();
        group.notify_new_log_data();
        generation.recovery_complete.set();

        if !generation.committing_queue.wait().await {
            self.remove_log(group, generation);
            return Err(Error::WorkerRemoved);
        }
        tracing::info!(
            log_id = %generation.log_id,
            group_id = %group.group_id,
            locality = generation.locality,
            "tlog group ready"
        );
        Ok(())
    }

    /// Stops every generation on this worker; a new recruitment or a
    /// displacement is taking over.
    pub fn stop_all_tlogs(&self, recruited: LogId) {
        for entry in &self.groups {
            for generation in entry.value().generations() {
                if !generation.is_stopped() {
                    tracing::info!(
                        stopped = %generation.log_id,
                        recruited = %recruited,
                        "generation stopped by new recruitment"
                    );
                }
                generation.stop();
            }
        }
    }

    fn remove_log(&self, group: &Arc<GroupData>, generation: &Arc<GenerationData>) {
        generation.stop();
        group.remove_generation(generation.log_id);
    }

    /// Serves one recruitment's endpoints until displacement or until every
    /// interface handle is dropped.
    async fn tlog_core(
        self: Arc<Self>,
        log_id: LogId,
        epoch: Epoch,
        is_primary: bool,
        mut endpoints: TLogEndpoints,
        active: ActiveGeneration,
    ) {
        let mut failure_waiters: Vec<oneshot::Sender<Result<()>>> = Vec::new();
        let mut removed = pin!(self.rejoin_masters(log_id, epoch, is_primary));

        loop {
            tokio::select! {
                () = &mut removed => {
                    tracing::warn!(log_id = %log_id, "worker removed, dropping generation");
                    for (group, generation) in unique_groups(&active) {
                        self.remove_log(&group, &generation);
                    }
                    self.recruitment_cache
                        .lock()
                        .expect("recruitment cache lock")
                        .retain(|_, interface| interface.id != log_id);
                    break;
                }
                Some(request) = endpoints.commit.recv() => {
                    let Request { body, reply } = request;
                    match active.get(&body.storage_team_id) {
                        None => {
                            let _ = reply.send(Err(Error::TLogGroupNotFound(body.storage_team_id)));
                        }
                        Some((_, generation)) if generation.is_stopped() => {
                            let _ = reply.send(Err(Error::TLogStopped));
                        }
                        Some((group, generation)) => {
                            let group = group.clone();
                            let generation = generation.clone();
                            tokio::spawn(async move {
                                let _ = reply.send(group.tlog_commit(&generation, body).await);
                            });
                        }
                    }
                }
                Some(request) = endpoints.peek_messages.recv() => {
                    let Request { body, reply } = request;
                    match active.get(&body.storage_team_id) {
                        None => {
                            let _ = reply.send(Err(Error::TLogGroupNotFound(body.storage_team_id)));
                        }
                        Some((group, generation)) => {
                            let group = group.clone();
                            let generation = generation.clone();
                            tokio::spawn(async move {
                                let result = generation
                                    .peek(
                                        &group.kv,
                                        &group.queue,
                                        &group.peek_memory,
                                        &group.spill_reads,
                                        body,
                                    )
                                    .await;
                                let _ = reply.send(result);
                            });
                        }
                    }
                }
                Some(request) = endpoints.pop_messages.recv() => {
                    let Request { body, reply } = request;
                    match active.get(&body.storage_team_id) {
                        None => {
                            let _ = reply.send(Err(Error::TLogGroupNotFound(body.storage_team_id)));
                        }
                        Some((group, generation)) => {
                            let group = group.clone();
                            let generation = generation.clone();
                            tokio::spawn(async move {
                                let _ = reply.send(group.handle_pop(&generation, body).await);
                            });
                        }
                    }
                }
                Some(request) = endpoints.lock.recv() => {
                    let mut end = Version::MAX;
                    let mut known_committed = 0;
                    for (_, generation) in unique_groups(&active) {
                        let (gen_end, gen_kcv) = generation.lock();
                        end = end.min(gen_end);
                        known_committed = known_committed.max(gen_kcv);
                    }
                    if end == Version::MAX {
                        end = 0;
                    }
                    let _ = request
                        .reply
                        .send(Ok(TLogLockResult { end, known_committed_version: known_committed }));
                }
                Some(request) = endpoints.get_queuing_metrics.recv() => {
                    let server = self.clone();
                    let pairs = unique_groups(&active);
                    tokio::spawn(async move {
                        let _ = request.reply.send(server.queuing_metrics(&pairs).await);
                    });
                }
                Some(request) = endpoints.confirm_running.recv() => {
                    let _ = request.reply.send(Ok(()));
                }
                Some(request) = endpoints.wait_failure.recv() => {
                    // Held until this serve loop dies; the drop is the signal.
                    failure_waiters.push(request.reply);
                }
                Some(request) = endpoints.recovery_finished.recv() => {
                    let pairs = unique_groups(&active);
                    tokio::spawn(async move {
                        for (_, generation) in pairs {
                            generation.recovery_complete.wait().await;
                        }
                        let _ = request.reply.send(Ok(()));
                    });
                }
                Some(request) = endpoints.snap_request.recv() => {
                    tracing::info!(
                        snap_uid = %request.body.snap_uid,
                        role = %request.body.role,
                        payload_bytes = request.body.snap_payload.len(),
                        "snapshot requested"
                    );
                    let _ = request.reply.send(Ok(()));
                }
                Some(request) = endpoints.disable_pop.recv() => {
                    for (group, _) in unique_groups(&active) {
                        group.disable_pop(request.body.snap_uid);
                    }
                    let _ = request.reply.send(Ok(()));
                }
                Some(request) = endpoints.enable_pop.recv() => {
                    let pairs = unique_groups(&active);
                    let uid = request.body.snap_uid;
                    tokio::spawn(async move {
                        for (group, _) in pairs {
                            if let Err(error) = group.enable_pop(uid).await {
                                let _ = request.reply.send(Err(error));
                                return;
                            }
                        }
                        let _ = request.reply.send(Ok(()));
                    });
                }
                else => break,
            }
        }
        drop(failure_waiters);
        tracing::info!(log_id = %log_id, "tlog serve loop ended");
    }

    async fn queuing_metrics(
        &self,
        pairs: &[(Arc<GroupData>, Arc<GenerationData>)],
    ) -> Result<TLogQueuingMetricsReply> {
        let mut bytes_input = 0;
        let mut bytes_durable = 0;
        let mut storage_bytes = 0;
        let mut v = Version::MAX;
        for (group, generation) in pairs {
            let (input, durable) = group.byte_counters();
            bytes_input += input;
            bytes_durable += durable;
            storage_bytes += group.queue.lock().await.on_disk_bytes();
            v = v.min(generation.queue_committed_version.get());
        }
        if v == Version::MAX {
            v = 0;
        }
        let local_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();
        Ok(TLogQueuingMetricsReply {
            local_time,
            instance_id: self.instance_id,
            bytes_durable,
            bytes_input,
            storage_bytes,
            v,
        })
    }

    /// Resolves when cluster info displaces this generation.
    async fn rejoin_masters(&self, log_id: LogId, epoch: Epoch, is_primary: bool) {
        let mut cluster = self.cluster.clone();
        loop {
            let displaced = {
                let info = cluster.borrow_and_update();
                let in_priors = info.prior_committed_log_servers.contains(&log_id);
                let in_logs = info.log_system_logs.contains(&log_id);
                let superseded = if is_primary {
                    info.recovery_count >= epoch
                        && info.recovery_state != RecoveryState::Uninitialized
                } else {
                    (info.recovery_count > epoch
                        && info.recovery_state != RecoveryState::Uninitialized)
                        || (info.recovery_count == epoch
                            && info.recovery_state == RecoveryState::FullyRecovered)
                };
                !in_priors && !in_logs && superseded
            };
            if displaced {
                tracing::warn!(log_id = %log_id, epoch, "generation displaced by cluster info");
                return;
            }
            if cluster.changed().await.is_err() {
                // Cluster feed gone; displacement can never be observed.
                std::future::pending::<()>().await;
            }
        }
    }
}

fn unique_groups(active: &ActiveGeneration) -> Vec<(Arc<GroupData>, Arc<GenerationData>)> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for (group, generation) in active.values() {
        if seen.insert(group.group_id) {
            out.push((group.clone(), generation.clone()));
        }
    }
    out
}

/// Handle used by callers (the binary, tests, a recruiter) to drive a
/// running server.
#[derive(Clone)]
pub struct ServerHandle {
    requests: mpsc::UnboundedSender<InitializeTLog>,
}

impl ServerHandle {
    /// Starts the server task and returns a handle to it.
    #[must_use]
    pub fn spawn(server: Arc<ServerData>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            if let Err(error) = server.run(rx).await {
                tracing::error!(%error, "tlog server terminated");
            }
        });
        Self { requests: tx }
    }

    /// Recruits a generation and returns its interface.
    ///
    /// # Errors
    ///
    /// `recruitment_failed` if the server rejected or died during
    /// recruitment.
    pub async fn initialize(&self, body: InitializeTLogRequest) -> Result<TLogInterface> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.requests
            .send(InitializeTLog { body, reply: reply_tx })
            .map_err(|_| Error::RecruitmentFailed)?;
        reply_rx.await.map_err(|_| Error::RecruitmentFailed)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recovery_state_is_ordered() {
        assert!(RecoveryState::Uninitialized < RecoveryState::Recruiting);
        assert!(RecoveryState::AcceptingCommits < RecoveryState::FullyRecovered);
    }

    #[test]
    fn cluster_info_default_is_uninitialized() {
        let info = ClusterInfo::default();
        assert_eq!(info.recovery_state, RecoveryState::Uninitialized);
        assert_eq!(info.recovery_count, 0);
        assert!(info.log_system_logs.is_empty());
    }
}
