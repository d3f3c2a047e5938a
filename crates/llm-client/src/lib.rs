//! Client-side mirror of the `llm-service` object model.
//!
//! [ClientService] finds the daemon's bus socket and performs `OpenSession`;
//! the pipe descriptors that come back become a private endpoint owned by a
//! [ClientSession]. Completions are driven through [CursorProxy], which
//! translates `exec_stream` into the `Exec` method plus `Chunk` signal
//! subscription.
#![deny(missing_docs)]

use std::collections::{BTreeMap, HashMap};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::net::unix::pipe;
use tokio::sync::{mpsc, oneshot};

use llm_ipc::{
    read_frame, recv_with_fds, write_frame, RpcError, ServerMessage, SessionReply,
    SessionRequest, OPEN_SESSION_BYTE,
};

/// Errors surfaced by the client library.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Transport failure: the bus socket or the private endpoint.
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
    /// The server answered a method call with an error.
    #[error("service error: {0}")]
    Rpc(#[from] RpcError),
    /// The private endpoint closed while a call was outstanding.
    #[error("the session endpoint closed")]
    Closed,
}

/// A handle to the well-known service on the shared bus.
pub struct ClientService {
    bus_path: PathBuf,
}

impl ClientService {
    /// Points at the daemon's default bus socket
    /// ([llm_ipc::default_bus_path]).
    pub fn new() -> Self {
        Self::with_bus_path(llm_ipc::default_bus_path())
    }

    /// Points at a specific bus socket.
    pub fn with_bus_path(bus_path: PathBuf) -> Self {
        ClientService { bus_path }
    }

    /// Calls `OpenSession`: connects to the bus, receives the private pipe
    /// pair over `SCM_RIGHTS`, and starts the session's reader task.
    pub async fn open_session(&self) -> Result<ClientSession, ClientError> {
        let bus_path = self.bus_path.clone();
        let (read_fd, write_fd) = tokio::task::spawn_blocking(
            move || -> std::io::Result<(std::os::fd::OwnedFd, std::os::fd::OwnedFd)> {
                use std::io::Write;
                let mut stream = UnixStream::connect(&bus_path)?;
                stream.write_all(&[OPEN_SESSION_BYTE])?;

                let mut ack = [0u8; 1];
                let (n, mut fds) = recv_with_fds(&stream, &mut ack)?;
                if n != 1 || ack[0] != OPEN_SESSION_BYTE || fds.len() != 2 {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("malformed OpenSession reply ({n} bytes, {} fds)", fds.len()),
                    ));
                }
                let write_fd = fds.pop().expect("checked length");
                let read_fd = fds.pop().expect("checked length");
                Ok((read_fd, write_fd))
            },
        )
        .await
        .expect("OpenSession task does not panic")?;

        let reader = pipe::Receiver::from_file(std::fs::File::from(read_fd))?;
        let writer = pipe::Sender::from_file(std::fs::File::from(write_fd))?;
        Ok(ClientSession::start(reader, writer))
    }
}

impl Default for ClientService {
    fn default() -> Self {
        Self::new()
    }
}

struct SessionInner {
    writer: tokio::sync::Mutex<pipe::Sender>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Result<SessionReply, RpcError>>>>,
    chunks: Mutex<HashMap<String, mpsc::UnboundedSender<String>>>,
    next_id: AtomicU64,
}

impl SessionInner {
    async fn call(self: &Arc<Self>, mut request: SessionRequest) -> Result<SessionReply, ClientError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        match &mut request {
            SessionRequest::CreateCompletion { id: slot, .. }
            | SessionRequest::Exec { id: slot, .. }
            | SessionRequest::Terminate { id: slot, .. } => *slot = id,
        }

        let (tx, rx) = oneshot::channel();
        self.pending.lock().expect("pending lock").insert(id, tx);

        {
            let mut writer = self.writer.lock().await;
            write_frame(&mut *writer, &request).await?;
        }

        match rx.await {
            Ok(result) => Ok(result?),
            Err(_) => Err(ClientError::Closed),
        }
    }

    fn subscribe_chunks(&self, path: &str) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.chunks
            .lock()
            .expect("chunks lock")
            .insert(path.to_owned(), tx);
        rx
    }

    fn unsubscribe_chunks(&self, path: &str) {
        self.chunks.lock().expect("chunks lock").remove(path);
    }
}

/// One session with the daemon, over a private endpoint no other client
/// shares.
pub struct ClientSession {
    inner: Arc<SessionInner>,
}

impl ClientSession {
    fn start(mut reader: pipe::Receiver, writer: pipe::Sender) -> Self {
        let inner = Arc::new(SessionInner {
            writer: tokio::sync::Mutex::new(writer),
            pending: Mutex::new(HashMap::new()),
            chunks: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        });

        // The reader task: routes replies to their callers and chunk signals
        // to their cursor's subscriber.
        let routed = inner.clone();
        tokio::spawn(async move {
            loop {
                match read_frame::<_, ServerMessage>(&mut reader).await {
                    Ok(Some(ServerMessage::Reply { id, reply })) => {
                        if let Some(tx) = routed.pending.lock().expect("pending lock").remove(&id) {
                            let _ = tx.send(Ok(reply));
                        }
                    }
                    Ok(Some(ServerMessage::Error { id, error })) => {
                        if let Some(tx) = routed.pending.lock().expect("pending lock").remove(&id) {
                            let _ = tx.send(Err(error));
                        }
                    }
                    Ok(Some(ServerMessage::Chunk { path, text })) => {
                        let chunks = routed.chunks.lock().expect("chunks lock");
                        if let Some(tx) = chunks.get(&path) {
                            let _ = tx.send(text);
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!("session endpoint read failed: {e}");
                        break;
                    }
                }
            }
            // Fail anything still outstanding so callers do not hang.
            routed.pending.lock().expect("pending lock").clear();
        });

        ClientSession { inner }
    }

    /// `Session.CreateCompletion`: returns a proxy for the new cursor.
    pub async fn start_completion(
        &self,
        model: &str,
        properties: BTreeMap<String, serde_json::Value>,
        prompt: &str,
        max_tokens: i32,
    ) -> Result<CursorProxy, ClientError> {
        let reply = self
            .inner
            .call(SessionRequest::CreateCompletion {
                id: 0,
                model: model.to_owned(),
                properties,
                prompt: prompt.to_owned(),
                max_tokens,
            })
            .await?;
        match reply {
            SessionReply::CompletionCreated { path } => Ok(CursorProxy {
                inner: self.inner.clone(),
                path,
                terminated: std::sync::atomic::AtomicBool::new(false),
            }),
            other => Err(unexpected_reply(other)),
        }
    }
}

fn unexpected_reply(reply: SessionReply) -> ClientError {
    ClientError::Io(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        format!("unexpected reply {reply:?}"),
    ))
}

/// A proxy for one server-side completion cursor.
///
/// Dropping the proxy sends a best-effort `Terminate` so the server releases
/// its cursor (and the model reference behind it).
pub struct CursorProxy {
    inner: Arc<SessionInner>,
    path: String,
    terminated: std::sync::atomic::AtomicBool,
}

impl std::fmt::Debug for CursorProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CursorProxy").field("path", &self.path).finish()
    }
}

impl CursorProxy {
    /// The cursor's object path on the private endpoint.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Runs the completion: issues `Exec` and forwards every `Chunk` signal
    /// to `on_chunk` as it arrives (the first chunk is the prompt played
    /// back). Returns the full generated completion, prompt excluded.
    ///
    /// `_chunk_size` is advisory; the server currently picks its own
    /// streaming granularity.
    pub async fn exec_stream(
        &self,
        num_tokens: i32,
        _chunk_size: usize,
        mut on_chunk: impl FnMut(&str),
    ) -> Result<String, ClientError> {
        let mut chunk_rx = self.inner.subscribe_chunks(&self.path);

        let reply = {
            let call = self.inner.call(SessionRequest::Exec {
                id: 0,
                path: self.path.clone(),
                num_tokens,
            });
            tokio::pin!(call);
            loop {
                tokio::select! {
                    reply = &mut call => break reply,
                    chunk = chunk_rx.recv() => {
                        if let Some(text) = chunk {
                            on_chunk(&text);
                        }
                    }
                }
            }
        };

        // Chunks are written before the reply, so anything still queued
        // belongs to this exec.
        while let Ok(text) = chunk_rx.try_recv() {
            on_chunk(&text);
        }
        self.inner.unsubscribe_chunks(&self.path);

        match reply? {
            SessionReply::ExecDone { completion, .. } => Ok(completion),
            other => Err(unexpected_reply(other)),
        }
    }

    /// Releases the server-side cursor explicitly.
    pub async fn terminate(self) -> Result<(), ClientError> {
        self.terminate_ref().await
    }

    /// Like [CursorProxy::terminate], but leaves the proxy alive, so it can
    /// interrupt an `exec_stream` that borrows the same proxy.
    pub async fn terminate_ref(&self) -> Result<(), ClientError> {
        self.terminated
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let reply = self
            .inner
            .call(SessionRequest::Terminate {
                id: 0,
                path: self.path.clone(),
            })
            .await?;
        match reply {
            SessionReply::Terminated => Ok(()),
            other => Err(unexpected_reply(other)),
        }
    }
}

impl Drop for CursorProxy {
    fn drop(&mut self) {
        if self.terminated.load(std::sync::atomic::Ordering::SeqCst) {
            return;
        }
        // Fire-and-forget: nobody is left to observe the reply, and failing
        // here just means the server cleans up on disconnect instead.
        let inner = self.inner.clone();
        let path = self.path.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = inner
                    .call(SessionRequest::Terminate { id: 0, path })
                    .await;
            });
        }
    }
}
