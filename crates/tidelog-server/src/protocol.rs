//! Wire messages and the TLog interface.
//!
//! Every message carries a stable numeric file identifier for schema
//! routing; the TCP layer frames `[len][file_identifier][bincode body]` and
//! dispatches on the identifier. The interface itself is a bundle of
//! request channels, one per endpoint, wired data-driven from
//! [`endpoint_descriptors`] rather than through dynamic dispatch: the pull
//! and push transfer models share the base endpoints and differ only in the
//! trailing pop-control pair.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use tidelog_core::{Epoch, Error, LogId, Result, SpillType, StorageTeamId, Tag, TLogGroupId, Version};

/// How messages move between this log and its storage servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageTransferModel {
    /// The TLog actively pushes batches to storage servers.
    ActivelyPush,
    /// Storage servers pull via peek/pop (the deployed model).
    PassivelyPull,
}

/// A push of one storage team's messages at one version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TLogCommitRequest {
    /// Tracing span of the proxy batch.
    pub span_id: Uuid,
    /// Team the messages belong to.
    pub storage_team_id: StorageTeamId,
    /// Packed subsequenced mutations.
    pub messages: Bytes,
    /// The previously committed version; serializes the commit chain.
    pub prev_version: Version,
    /// Version being committed.
    pub version: Version,
    /// Highest version the proxy certified committed on all required logs.
    pub known_committed_version: Version,
    /// Lower bound across the proxy's view of all logs.
    pub min_known_committed_version: Version,
    /// Debug correlation id.
    pub debug_id: Option<Uuid>,
}

impl TLogCommitRequest {
    /// Stable schema identifier.
    pub const FILE_IDENTIFIER: u32 = 316371;
}

/// Reply to a commit: the durable known-committed version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TLogCommitReply {
    /// Known-committed version proven durable by the queue commit.
    pub version: Version,
}

impl TLogCommitReply {
    /// Stable schema identifier.
    pub const FILE_IDENTIFIER: u32 = 178491;
}

/// A storage server pulling a team's messages from `begin_version` on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TLogPeekRequest {
    /// Debug correlation id.
    pub debug_id: Option<Uuid>,
    /// First version of interest.
    pub begin_version: Version,
    /// Exclusive upper bound, if any.
    pub end_version: Option<Version>,
    /// Team to read.
    pub storage_team_id: StorageTeamId,
    /// Tag of the requesting storage server.
    pub tag: Tag,
    /// Reply immediately instead of blocking when no data is in range.
    pub return_if_blocked: bool,
    /// Only drain spilled data; do not touch the in-memory index.
    pub only_spilled: bool,
    /// `(consumer, sequence)` for enforcing monotonic request order.
    pub sequence: Option<(Uuid, u32)>,
}

impl TLogPeekRequest {
    /// Stable schema identifier.
    pub const FILE_IDENTIFIER: u32 = 356070;
}

/// Reply to a peek.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TLogPeekReply {
    /// Debug correlation id from the request.
    pub debug_id: Option<Uuid>,
    /// Concatenated message payloads in version order.
    pub data: Bytes,
    /// Highest version through which `data` is complete.
    pub end: Version,
    /// Set when the requested range was already popped.
    pub popped: Option<Version>,
    /// The generation's current version.
    pub max_known_version: Version,
    /// Lower bound on committed versions across the log system.
    pub min_known_committed_version: Version,
    /// First version included in `data`.
    pub begin: Option<Version>,
    /// `data` came entirely from spill storage and more spill remains.
    pub only_spilled: bool,
}

impl TLogPeekReply {
    /// Stable schema identifier.
    pub const FILE_IDENTIFIER: u32 = 292724;
}

/// Consumer acknowledgement that a team's versions `<= version` are durable
/// on storage; authorizes reclamation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TLogPopRequest {
    /// Versions at or below this are acknowledged.
    pub version: Version,
    /// The acknowledging server's durable known-committed version.
    pub durable_known_committed_version: Version,
    /// Tag of the acknowledging storage server.
    pub tag: Tag,
    /// Team being acknowledged.
    pub storage_team_id: StorageTeamId,
}

impl TLogPopRequest {
    /// Stable schema identifier.
    pub const FILE_IDENTIFIER: u32 = 288041;
}

/// Result of locking the log: first stage of recovery by a new master.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TLogLockResult {
    /// Version the log stopped at.
    pub end: Version,
    /// Its known-committed version.
    pub known_committed_version: Version,
}

impl TLogLockResult {
    /// Stable schema identifier.
    pub const FILE_IDENTIFIER: u32 = 5232634;
}

/// Request for queue depth and byte counters.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TLogQueuingMetricsRequest {}

impl TLogQueuingMetricsRequest {
    /// Stable schema identifier.
    pub const FILE_IDENTIFIER: u32 = 8756454;
}

/// Queue depth and byte counters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TLogQueuingMetricsReply {
    /// Server wall-clock seconds when sampled.
    pub local_time: f64,
    /// Changes whenever the byte counters reset.
    pub instance_id: u64,
    /// Bytes made durable (spilled, popped or committed away).
    pub bytes_durable: u64,
    /// Bytes accepted into memory.
    pub bytes_input: u64,
    /// Bytes held by the disk queue.
    pub storage_bytes: u64,
    /// Queue-committed version.
    pub v: Version,
}

impl TLogQueuingMetricsReply {
    /// Stable schema identifier.
    pub const FILE_IDENTIFIER: u32 = 3123450;
}

/// Liveness probe used by read-version requests.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TLogConfirmRunningRequest {
    /// Debug correlation id.
    pub debug_id: Option<Uuid>,
}

impl TLogConfirmRunningRequest {
    /// Stable schema identifier.
    pub const FILE_IDENTIFIER: u32 = 8013123;
}

/// Resolves once the active generation finished recovery.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TLogRecoveryFinishedRequest {}

impl TLogRecoveryFinishedRequest {
    /// Stable schema identifier.
    pub const FILE_IDENTIFIER: u32 = 6634364;
}

/// Snapshot coordination request; pops are expected to be disabled around it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TLogSnapRequest {
    /// Opaque payload for the snapshot tooling.
    pub snap_payload: Bytes,
    /// Snapshot id; must match the disable-pop owner.
    pub snap_uid: Uuid,
    /// Role string recorded with the snapshot.
    pub role: String,
}

impl TLogSnapRequest {
    /// Stable schema identifier.
    pub const FILE_IDENTIFIER: u32 = 6454632;
}

/// Suspends pop processing during a snapshot-based backup.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TLogDisablePopRequest {
    /// Owner of the suspension.
    pub snap_uid: Uuid,
    /// Debug correlation id.
    pub debug_id: Option<Uuid>,
}

impl TLogDisablePopRequest {
    /// Stable schema identifier.
    pub const FILE_IDENTIFIER: u32 = 4252331;
}

/// Resumes pop processing and replays pops queued meanwhile.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TLogEnablePopRequest {
    /// Must match the uid that disabled pops.
    pub snap_uid: Uuid,
    /// Debug correlation id.
    pub debug_id: Option<Uuid>,
}

impl TLogEnablePopRequest {
    /// Stable schema identifier.
    pub const FILE_IDENTIFIER: u32 = 9025233;
}

/// One group's recruitment parameters inside [`InitializeTLogRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TLogGroupRecruitment {
    /// The group being recruited.
    pub group_id: TLogGroupId,
    /// Teams assigned to this group, each with its storage server tags.
    pub storage_teams: Vec<(StorageTeamId, Vec<Tag>)>,
}

/// Recruits a new generation on this worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitializeTLogRequest {
    /// The recovery count of the recruiting master.
    pub epoch: Epoch,
    /// Groups this worker hosts in the new generation.
    pub tlog_groups: Vec<TLogGroupRecruitment>,
    /// Spill mode for the new generation.
    pub spill_type: SpillType,
    /// Data-center locality.
    pub locality: i8,
    /// Whether this worker is in the primary region.
    pub is_primary: bool,
    /// Dedup key: repeated requests get the already-built interface.
    pub recruitment_id: Uuid,
}

impl InitializeTLogRequest {
    /// Stable schema identifier.
    pub const FILE_IDENTIFIER: u32 = 748551;
}

/// A request paired with its reply channel.
#[derive(Debug)]
pub struct Request<Q, R> {
    /// Request body.
    pub body: Q,
    /// Where the handler sends the outcome.
    pub reply: oneshot::Sender<Result<R>>,
}

type Tx<Q, R> = mpsc::UnboundedSender<Request<Q, R>>;
/// Receiver half of one endpoint.
pub type Rx<Q, R> = mpsc::UnboundedReceiver<Request<Q, R>>;

fn call<Q, R>(tx: &Tx<Q, R>, body: Q) -> impl std::future::Future<Output = Result<R>> + '_ {
    let (reply_tx, reply_rx) = oneshot::channel();
    let sent = tx.send(Request { body, reply: reply_tx }).is_ok();
    async move {
        if !sent {
            return Err(Error::OperationCancelled);
        }
        reply_rx.await.map_err(|_| Error::OperationCancelled)?
    }
}

/// Client handle to one recruited TLog: a channel per endpoint.
///
/// Cloneable and cheap; dropping every clone cancels in-flight waits with
/// `operation_cancelled`.
#[derive(Debug, Clone)]
pub struct TLogInterface {
    /// Interface id; all groups of one recruitment share it.
    pub id: LogId,
    /// The hosting worker's shared TLog id.
    pub shared_tlog_id: Uuid,
    /// Transfer model this interface was built for.
    pub transfer_model: MessageTransferModel,

    commit: Tx<TLogCommitRequest, TLogCommitReply>,
    peek_messages: Tx<TLogPeekRequest, TLogPeekReply>,
    pop_messages: Tx<TLogPopRequest, ()>,
    lock: Tx<(), TLogLockResult>,
    get_queuing_metrics: Tx<TLogQueuingMetricsRequest, TLogQueuingMetricsReply>,
    confirm_running: Tx<TLogConfirmRunningRequest, ()>,
    wait_failure: Tx<(), ()>,
    recovery_finished: Tx<TLogRecoveryFinishedRequest, ()>,
    snap_request: Tx<TLogSnapRequest, ()>,
    disable_pop: Tx<TLogDisablePopRequest, ()>,
    enable_pop: Tx<TLogEnablePopRequest, ()>,
}

/// Server half of a [`TLogInterface`]: the endpoint receivers.
pub struct TLogEndpoints {
    /// Commit pushes.
    pub commit: Rx<TLogCommitRequest, TLogCommitReply>,
    /// Peek pulls.
    pub peek_messages: Rx<TLogPeekRequest, TLogPeekReply>,
    /// Pop acknowledgements.
    pub pop_messages: Rx<TLogPopRequest, ()>,
    /// Recovery locking.
    pub lock: Rx<(), TLogLockResult>,
    /// Metrics scrapes.
    pub get_queuing_metrics: Rx<TLogQueuingMetricsRequest, TLogQueuingMetricsReply>,
    /// Liveness probes.
    pub confirm_running: Rx<TLogConfirmRunningRequest, ()>,
    /// Failure monitoring; replies are held until shutdown.
    pub wait_failure: Rx<(), ()>,
    /// Recovery-finished barrier.
    pub recovery_finished: Rx<TLogRecoveryFinishedRequest, ()>,
    /// Snapshot coordination.
    pub snap_request: Rx<TLogSnapRequest, ()>,
    /// Pop suspension.
    pub disable_pop: Rx<TLogDisablePopRequest, ()>,
    /// Pop resumption.
    pub enable_pop: Rx<TLogEnablePopRequest, ()>,
}

impl TLogInterface {
    /// Builds a connected interface/endpoints pair.
    #[must_use]
    pub fn new_pair(
        id: LogId,
        shared_tlog_id: Uuid,
        transfer_model: MessageTransferModel,
    ) -> (Self, TLogEndpoints) {
        macro_rules! endpoint {
            () => {
                mpsc::unbounded_channel()
            };
        }
        let (commit_tx, commit_rx) = endpoint!();
        let (peek_tx, peek_rx) = endpoint!();
        let (pop_tx, pop_rx) = endpoint!();
        let (lock_tx, lock_rx) = endpoint!();
        let (metrics_tx, metrics_rx) = endpoint!();
        let (confirm_tx, confirm_rx) = endpoint!();
        let (fail_tx, fail_rx) = endpoint!();
        let (recovered_tx, recovered_rx) = endpoint!();
        let (snap_tx, snap_rx) = endpoint!();
        let (disable_tx, disable_rx) = endpoint!();
        let (enable_tx, enable_rx) = endpoint!();

        let interface = Self {
            id,
            shared_tlog_id,
            transfer_model,
            commit: commit_tx,
            peek_messages: peek_tx,
            pop_messages: pop_tx,
            lock: lock_tx,
            get_queuing_metrics: metrics_tx,
            confirm_running: confirm_tx,
            wait_failure: fail_tx,
            recovery_finished: recovered_tx,
            snap_request: snap_tx,
            disable_pop: disable_tx,
            enable_pop: enable_tx,
        };
        let endpoints = TLogEndpoints {
            commit: commit_rx,
            peek_messages: peek_rx,
            pop_messages: pop_rx,
            lock: lock_rx,
            get_queuing_metrics: metrics_rx,
            confirm_running: confirm_rx,
            wait_failure: fail_rx,
            recovery_finished: recovered_rx,
            snap_request: snap_rx,
            disable_pop: disable_rx,
            enable_pop: enable_rx,
        };
        (interface, endpoints)
    }

    /// Pushes a commit and waits for its durable reply.
    pub async fn commit(&self, body: TLogCommitRequest) -> Result<TLogCommitReply> {
        call(&self.commit, body).await
    }

    /// Pulls a team's messages.
    pub async fn peek_messages(&self, body: TLogPeekRequest) -> Result<TLogPeekReply> {
        call(&self.peek_messages, body).await
    }

    /// Acknowledges a team's durable prefix.
    pub async fn pop_messages(&self, body: TLogPopRequest) -> Result<()> {
        call(&self.pop_messages, body).await
    }

    /// Stops the log and returns its end state.
    pub async fn lock(&self) -> Result<TLogLockResult> {
        call(&self.lock, ()).await
    }

    /// Samples queue metrics.
    pub async fn get_queuing_metrics(&self) -> Result<TLogQueuingMetricsReply> {
        call(&self.get_queuing_metrics, TLogQueuingMetricsRequest::default()).await
    }

    /// Confirms the server is processing requests.
    pub async fn confirm_running(&self, debug_id: Option<Uuid>) -> Result<()> {
        call(&self.confirm_running, TLogConfirmRunningRequest { debug_id }).await
    }

    /// Registers for failure notification; resolves when the server dies.
    pub async fn wait_failure(&self) -> Result<()> {
        call(&self.wait_failure, ()).await
    }

    /// Waits for the active generation's recovery to complete.
    pub async fn recovery_finished(&self) -> Result<()> {
        call(&self.recovery_finished, TLogRecoveryFinishedRequest::default()).await
    }

    /// Coordinates a disk snapshot.
    pub async fn snap_request(&self, body: TLogSnapRequest) -> Result<()> {
        call(&self.snap_request, body).await
    }

    /// Suspends pops (pull model only).
    pub async fn disable_pop(&self, body: TLogDisablePopRequest) -> Result<()> {
        call(&self.disable_pop, body).await
    }

    /// Resumes pops (pull model only).
    pub async fn enable_pop(&self, body: TLogEnablePopRequest) -> Result<()> {
        call(&self.enable_pop, body).await
    }
}

/// A named endpoint with its request schema identifier, in wire order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointDescriptor {
    /// Endpoint name, stable across releases.
    pub name: &'static str,
    /// File identifier of the request schema served here.
    pub file_identifier: u32,
}

const BASE_ENDPOINTS: &[EndpointDescriptor] = &[
    EndpointDescriptor { name: "commit", file_identifier: TLogCommitRequest::FILE_IDENTIFIER },
    EndpointDescriptor {
        name: "peekMessages",
        file_identifier: TLogPeekRequest::FILE_IDENTIFIER,
    },
    EndpointDescriptor { name: "popMessages", file_identifier: TLogPopRequest::FILE_IDENTIFIER },
    EndpointDescriptor { name: "lock", file_identifier: TLogLockResult::FILE_IDENTIFIER },
    EndpointDescriptor {
        name: "getQueuingMetrics",
        file_identifier: TLogQueuingMetricsRequest::FILE_IDENTIFIER,
    },
    EndpointDescriptor {
        name: "confirmRunning",
        file_identifier: TLogConfirmRunningRequest::FILE_IDENTIFIER,
    },
    EndpointDescriptor { name: "waitFailure", file_identifier: 4121433 },
    EndpointDescriptor {
        name: "recoveryFinished",
        file_identifier: TLogRecoveryFinishedRequest::FILE_IDENTIFIER,
    },
    EndpointDescriptor { name: "snapRequest", file_identifier: TLogSnapRequest::FILE_IDENTIFIER },
];

const PULL_ENDPOINTS: &[EndpointDescriptor] = &[
    EndpointDescriptor {
        name: "disablePopRequest",
        file_identifier: TLogDisablePopRequest::FILE_IDENTIFIER,
    },
    EndpointDescriptor {
        name: "enablePopRequest",
        file_identifier: TLogEnablePopRequest::FILE_IDENTIFIER,
    },
];

/// Ordered endpoint list for a transfer model. Wire positions are the
/// indices in this slice.
#[must_use]
pub fn endpoint_descriptors(model: MessageTransferModel) -> Vec<EndpointDescriptor> {
    match model {
        MessageTransferModel::ActivelyPush => BASE_ENDPOINTS.to_vec(),
        MessageTransferModel::PassivelyPull => {
            BASE_ENDPOINTS.iter().chain(PULL_ENDPOINTS).copied().collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_identifiers_are_unique() {
        let descriptors = endpoint_descriptors(MessageTransferModel::PassivelyPull);
        let mut ids: Vec<u32> = descriptors.iter().map(|d| d.file_identifier).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), descriptors.len());
    }

    #[test]
    fn pull_model_extends_base_endpoints() {
        let push = endpoint_descriptors(MessageTransferModel::ActivelyPush);
        let pull = endpoint_descriptors(MessageTransferModel::PassivelyPull);
        assert_eq!(&pull[..push.len()], &push[..]);
        assert_eq!(pull.len(), push.len() + 2);
        assert_eq!(pull.last().unwrap().name, "enablePopRequest");
    }

    #[tokio::test]
    async fn dropped_endpoints_cancel_calls() {
        let (interface, endpoints) =
            TLogInterface::new_pair(LogId::random(), Uuid::new_v4(), MessageTransferModel::PassivelyPull);
        drop(endpoints);
        let err = interface.confirm_running(None).await.unwrap_err();
        assert_eq!(err.code(), "operation_cancelled");
    }

    #[tokio::test]
    async fn request_reply_roundtrip() {
        let (interface, mut endpoints) =
            TLogInterface::new_pair(LogId::random(), Uuid::new_v4(), MessageTransferModel::PassivelyPull);
        tokio::spawn(async move {
            let request = endpoints.confirm_running.recv().await.unwrap();
            let _ = request.reply.send(Ok(()));
        });
        interface.confirm_running(None).await.unwrap();
    }

    #[test]
    fn wire_types_roundtrip_through_bincode() {
        let request = TLogCommitRequest {
            span_id: Uuid::new_v4(),
            storage_team_id: StorageTeamId::random(),
            messages: Bytes::from_static(b"payload"),
            prev_version: 10,
            version: 20,
            known_committed_version: 5,
            min_known_committed_version: 3,
            debug_id: None,
        };
        let encoded = bincode::serialize(&request).unwrap();
        let decoded: TLogCommitRequest = bincode::deserialize(&encoded).unwrap();
        assert_eq!(decoded.version, 20);
        assert_eq!(decoded.messages, request.messages);
    }
}
