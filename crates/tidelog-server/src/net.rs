//! TCP hosting of the TLog endpoints.
//!
//! Framing is `[magic:u32][len:u32][file_identifier:u32][bincode body]`,
//! little-endian, where `len` counts the identifier plus body. Requests are
//! dispatched on the identifier to the process's current interface;
//! replies reuse the identifier of the request and carry a status byte
//! (`0` ok, `1` error) followed by the bincode reply or the stable error
//! code string.

use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};

use tidelog_core::{Error, Result};

use crate::protocol::{
    InitializeTLogRequest, TLogCommitRequest, TLogConfirmRunningRequest, TLogDisablePopRequest,
    TLogEnablePopRequest, TLogInterface, TLogPeekRequest, TLogPopRequest,
    TLogQueuingMetricsRequest, TLogRecoveryFinishedRequest, TLogSnapRequest,
};
use crate::server::ServerHandle;

const FRAME_MAGIC: u32 = 0x544C_4731; // "TLG1"
const MAX_FRAME_BYTES: usize = 100 << 20;

/// Lock endpoint wire identifier (the request is bare).
const LOCK_FILE_IDENTIFIER: u32 = 5232634;
/// Wait-failure endpoint wire identifier.
const WAIT_FAILURE_FILE_IDENTIFIER: u32 = 4121433;

/// Identity of a recruited interface, serialized back to the recruiter.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct InterfaceInfo {
    /// Interface id.
    pub id: tidelog_core::LogId,
    /// Shared TLog id of the hosting worker.
    pub shared_tlog_id: uuid::Uuid,
}

/// Encodes one frame.
#[must_use]
pub fn encode_frame(file_identifier: u32, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(12 + body.len());
    out.extend_from_slice(&FRAME_MAGIC.to_le_bytes());
    out.extend_from_slice(&((body.len() + 4) as u32).to_le_bytes());
    out.extend_from_slice(&file_identifier.to_le_bytes());
    out.extend_from_slice(body);
    out
}

/// Reads one frame; `None` on clean end of stream.
pub async fn read_frame<R: AsyncReadExt + Unpin>(
    reader: &mut R,
) -> Result<Option<(u32, Vec<u8>)>> {
    let mut magic = [0u8; 4];
    match reader.read_exact(&mut magic).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    if u32::from_le_bytes(magic) != FRAME_MAGIC {
        return Err(Error::CorruptLog("bad frame magic"));
    }
    let len = reader.read_u32_le().await? as usize;
    if !(4..=MAX_FRAME_BYTES).contains(&len) {
        return Err(Error::CorruptLog("frame length out of range"));
    }
    let file_identifier = reader.read_u32_le().await?;
    let mut body = vec![0u8; len - 4];
    reader.read_exact(&mut body).await?;
    Ok(Some((file_identifier, body)))
}

fn encode_reply<R: Serialize>(file_identifier: u32, result: &Result<R>) -> Vec<u8> {
    let mut body = Vec::new();
    match result {
        Ok(reply) => {
            body.push(0);
            body.extend_from_slice(&bincode::serialize(reply).expect("serializable reply"));
        }
        Err(error) => {
            body.push(1);
            body.extend_from_slice(error.code().as_bytes());
        }
    }
    encode_frame(file_identifier, &body)
}

fn decode_reply<R: DeserializeOwned>(body: &[u8]) -> Result<R> {
    match body.split_first() {
        Some((0, payload)) => {
            bincode::deserialize(payload).map_err(|e| Error::Database(e.to_string()))
        }
        Some((1, code)) => Err(Error::from_code(&String::from_utf8_lossy(code))),
        _ => Err(Error::CorruptLog("empty reply frame")),
    }
}

/// What the listener serves: recruitment plus the currently recruited
/// interface.
pub struct NetServer {
    handle: ServerHandle,
    current: Mutex<Option<TLogInterface>>,
}

impl NetServer {
    /// Creates the dispatch state around a server handle.
    #[must_use]
    pub fn new(handle: ServerHandle) -> Arc<Self> {
        Arc::new(Self { handle, current: Mutex::new(None) })
    }

    /// Accept loop; one task per connection.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (socket, peer) = listener.accept().await?;
            tracing::debug!(%peer, "tlog connection accepted");
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(error) = server.handle_connection(socket).await {
                    if !error.is_shutdown() {
                        tracing::warn!(%peer, %error, "tlog connection failed");
                    }
                }
            });
        }
    }

    async fn handle_connection(self: &Arc<Self>, socket: TcpStream) -> Result<()> {
        let (mut reader, writer) = socket.into_split();
        let writer = Arc::new(tokio::sync::Mutex::new(writer));
        while let Some((file_identifier, body)) = read_frame(&mut reader).await? {
            self.dispatch(file_identifier, body, &writer).await?;
        }
        Ok(())
    }

    fn interface(&self) -> Result<TLogInterface> {
        self.current
            .lock()
            .expect("interface slot lock")
            .clone()
            .ok_or(Error::RecruitmentFailed)
    }

    async fn dispatch(
        self: &Arc<Self>,
        file_identifier: u32,
        body: Vec<u8>,
        writer: &Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
    ) -> Result<()> {
        macro_rules! route {
            ($ty:ty, $call:expr) => {{
                let request: $ty =
                    bincode::deserialize(&body).map_err(|_| Error::CorruptLog("bad request body"))?;
                let server = self.clone();
                let writer = writer.clone();
                tokio::spawn(async move {
                    let result = match server.interface() {
                        Ok(interface) => ($call)(interface, request).await,
                        Err(error) => Err(error),
                    };
                    let frame = encode_reply(file_identifier, &result);
                    let mut writer = writer.lock().await;
                    let _ = writer.write_all(&frame).await;
                });
                Ok(())
            }};
        }

        match file_identifier {
            InitializeTLogRequest::FILE_IDENTIFIER => {
                let request: InitializeTLogRequest = bincode::deserialize(&body)
                    .map_err(|_| Error::CorruptLog("bad request body"))?;
                let result = self.handle.initialize(request).await;
                let info = match &result {
                    Ok(interface) => {
                        *self.current.lock().expect("interface slot lock") =
                            Some(interface.clone());
                        Ok(InterfaceInfo {
                            id: interface.id,
                            shared_tlog_id: interface.shared_tlog_id,
                        })
                    }
                    Err(_) => Err(Error::RecruitmentFailed),
                };
                let frame = encode_reply(file_identifier, &info);
                writer.lock().await.write_all(&frame).await?;
                Ok(())
            }
            TLogCommitRequest::FILE_IDENTIFIER => {
                route!(TLogCommitRequest, |i: TLogInterface, r| async move { i.commit(r).await })
            }
            TLogPeekRequest::FILE_IDENTIFIER => {
                route!(TLogPeekRequest, |i: TLogInterface, r| async move {
                    i.peek_messages(r).await
                })
            }
            TLogPopRequest::FILE_IDENTIFIER => {
                route!(TLogPopRequest, |i: TLogInterface, r| async move {
                    i.pop_messages(r).await
                })
            }
            LOCK_FILE_IDENTIFIER => {
                route!((), |i: TLogInterface, ()| async move { i.lock().await })
            }
            TLogQueuingMetricsRequest::FILE_IDENTIFIER => {
                route!(TLogQueuingMetricsRequest, |i: TLogInterface, _r| async move {
                    i.get_queuing_metrics().await
                })
            }
            TLogConfirmRunningRequest::FILE_IDENTIFIER => {
                route!(TLogConfirmRunningRequest, |i: TLogInterface, r: TLogConfirmRunningRequest| async move {
                    i.confirm_running(r.debug_id).await
                })
            }
            WAIT_FAILURE_FILE_IDENTIFIER => {
                route!((), |i: TLogInterface, ()| async move { i.wait_failure().await })
            }
            TLogRecoveryFinishedRequest::FILE_IDENTIFIER => {
                route!(TLogRecoveryFinishedRequest, |i: TLogInterface, _r| async move {
                    i.recovery_finished().await
                })
            }
            TLogSnapRequest::FILE_IDENTIFIER => {
                route!(TLogSnapRequest, |i: TLogInterface, r| async move {
                    i.snap_request(r).await
                })
            }
            TLogDisablePopRequest::FILE_IDENTIFIER => {
                route!(TLogDisablePopRequest, |i: TLogInterface, r| async move {
                    i.disable_pop(r).await
                })
            }
            TLogEnablePopRequest::FILE_IDENTIFIER => {
                route!(TLogEnablePopRequest, |i: TLogInterface, r| async move {
                    i.enable_pop(r).await
                })
            }
            other => {
                tracing::warn!(file_identifier = other, "unknown request identifier");
                Err(Error::CorruptLog("unknown request identifier"))
            }
        }
    }
}

/// Minimal wire client for recruiters and storage servers.
///
/// Replies on one connection return in request order, so calls are
/// serialized over the stream.
pub struct RemoteTLog {
    stream: tokio::sync::Mutex<TcpStream>,
}

impl RemoteTLog {
    /// Connects to a TLog at `addr`.
    ///
    /// # Errors
    ///
    /// I/O errors from the connect.
    pub async fn connect(addr: std::net::SocketAddr) -> Result<Self> {
        Ok(Self { stream: tokio::sync::Mutex::new(TcpStream::connect(addr).await?) })
    }

    async fn call<Q: Serialize, R: DeserializeOwned>(
        &self,
        file_identifier: u32,
        request: &Q,
    ) -> Result<R> {
        let body = bincode::serialize(request).map_err(|e| Error::Database(e.to_string()))?;
        let frame = encode_frame(file_identifier, &body);
        let mut stream = self.stream.lock().await;
        stream.write_all(&frame).await?;
        let (reply_identifier, reply) =
            read_frame(&mut *stream).await?.ok_or(Error::OperationCancelled)?;
        if reply_identifier != file_identifier {
            return Err(Error::CorruptLog("mismatched reply identifier"));
        }
        decode_reply(&reply)
    }

    /// Recruits a generation.
    pub async fn initialize(&self, request: &InitializeTLogRequest) -> Result<InterfaceInfo> {
        self.call(InitializeTLogRequest::FILE_IDENTIFIER, request).await
    }

    /// Pushes a commit.
    pub async fn commit(
        &self,
        request: &TLogCommitRequest,
    ) -> Result<crate::protocol::TLogCommitReply> {
        self.call(TLogCommitRequest::FILE_IDENTIFIER, request).await
    }

    /// Pulls messages.
    pub async fn peek_messages(
        &self,
        request: &TLogPeekRequest,
    ) -> Result<crate::protocol::TLogPeekReply> {
        self.call(TLogPeekRequest::FILE_IDENTIFIER, request).await
    }

    /// Acknowledges a durable prefix.
    pub async fn pop_messages(&self, request: &TLogPopRequest) -> Result<()> {
        self.call(TLogPopRequest::FILE_IDENTIFIER, request).await
    }

    /// Liveness probe.
    pub async fn confirm_running(&self) -> Result<()> {
        self.call(
            TLogConfirmRunningRequest::FILE_IDENTIFIER,
            &TLogConfirmRunningRequest::default(),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_roundtrip() {
        let frame = encode_frame(42, b"hello");
        let mut cursor = std::io::Cursor::new(frame);
        let decoded = futures_block_on(read_frame(&mut cursor)).unwrap().unwrap();
        assert_eq!(decoded, (42, b"hello".to_vec()));
    }

    #[test]
    fn bad_magic_is_corrupt() {
        let mut frame = encode_frame(42, b"hello");
        frame[0] ^= 0xFF;
        let mut cursor = std::io::Cursor::new(frame);
        let err = futures_block_on(read_frame(&mut cursor)).unwrap_err();
        assert_eq!(err.code(), "corrupt_log");
    }

    #[test]
    fn clean_eof_is_none() {
        let mut cursor = std::io::Cursor::new(Vec::new());
        assert!(futures_block_on(read_frame(&mut cursor)).unwrap().is_none());
    }

    #[test]
    fn error_replies_carry_codes() {
        let frame = encode_reply::<()>(7, &Err(Error::TLogStopped));
        // Skip magic + len + fi.
        let body = &frame[12..];
        let err = decode_reply::<()>(body).unwrap_err();
        assert_eq!(err.code(), "tlog_stopped");
    }

    fn futures_block_on<F: std::future::Future>(future: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(future)
    }
}
