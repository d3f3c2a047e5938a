//! One client's session: the frame loop over the private endpoint, the
//! cursors it owns, and the worker threads that run them.

use std::collections::HashMap;
use std::sync::Arc;

use llm::ggml::CancelToken;
use llm::{ArgmaxSampler, CompletionCursor, InferenceError};
use llm_ipc::{
    read_frame, write_frame, ErrorKind, RpcError, ServerMessage, SessionReply, SessionRequest,
    COMPLETION_PATH_PREFIX,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::registry::{ModelRegistry, ModelSpec};

/// Tokens per streamed chunk. Small enough for prompt-speed first output,
/// large enough to keep signal overhead negligible.
const STREAM_CHUNK_SIZE: usize = 2;

/// What a cursor worker reports back to the session loop.
enum WorkerEvent {
    Chunk {
        path: String,
        text: String,
    },
    Done {
        id: u64,
        path: String,
        result: Result<String, RpcError>,
    },
}

struct CursorSlot {
    cancel: CancelToken,
    model_key: String,
    /// Present while the cursor is idle; taken by `Exec` and never returned
    /// (a cursor streams once).
    cursor: Option<CompletionCursor>,
}

enum Slot {
    Live(CursorSlot),
    /// The path stays known after `Terminate`, so method calls on it fail
    /// with `Spent` rather than `NotFound`.
    Terminated,
}

struct Session {
    registry: Arc<ModelRegistry>,
    cursors: HashMap<String, Slot>,
    next_serial: u64,
    n_threads: usize,
    events: mpsc::UnboundedSender<WorkerEvent>,
}

/// Serves one private endpoint until the peer disconnects. All cursor state
/// dies with the connection; models the session used get their use counts
/// released.
pub async fn run(
    mut reader: impl AsyncRead + Unpin,
    mut writer: impl AsyncWrite + Unpin,
    registry: Arc<ModelRegistry>,
    n_threads: usize,
) {
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let mut session = Session {
        registry,
        cursors: HashMap::new(),
        next_serial: 0,
        n_threads,
        events: events_tx,
    };

    loop {
        tokio::select! {
            frame = read_frame::<_, SessionRequest>(&mut reader) => {
                let request = match frame {
                    Ok(Some(request)) => request,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!("session endpoint read failed: {e}");
                        break;
                    }
                };
                let id = request.id();
                let message = match session.handle_request(request).await {
                    Ok(Some(reply)) => Some(ServerMessage::Reply { id, reply }),
                    // The reply is deferred; a worker delivers it later.
                    Ok(None) => None,
                    Err(error) => Some(ServerMessage::Error { id, error }),
                };
                if let Some(message) = message {
                    if write_frame(&mut writer, &message).await.is_err() {
                        break;
                    }
                }
            }
            event = events_rx.recv() => {
                // The sender lives in `session`, so the channel cannot close
                // while we are looping.
                let Some(event) = event else { break };
                let message = match event {
                    WorkerEvent::Chunk { path, text } => ServerMessage::Chunk { path, text },
                    WorkerEvent::Done { id, path, result } => match result {
                        Ok(completion) => ServerMessage::Reply {
                            id,
                            reply: SessionReply::ExecDone { path, completion },
                        },
                        Err(error) => ServerMessage::Error { id, error },
                    },
                };
                if write_frame(&mut writer, &message).await.is_err() {
                    break;
                }
            }
        }
    }

    session.teardown();
}

impl Session {
    /// Handles one request. `Ok(None)` means the reply is deferred to a
    /// worker event (`Exec` replies only after its chunks).
    async fn handle_request(
        &mut self,
        request: SessionRequest,
    ) -> Result<Option<SessionReply>, RpcError> {
        match request {
            SessionRequest::CreateCompletion {
                model,
                properties,
                prompt,
                max_tokens,
                ..
            } => {
                let spec = ModelSpec::from_request(&model, &properties)?;
                let max_tokens = usize::try_from(max_tokens).map_err(|_| {
                    RpcError::new(ErrorKind::InvalidArgument, "max_tokens must be non-negative")
                })?;

                let (model_key, language_model) = self.registry.acquire(spec).await?;
                let cursor = language_model.create_completion(
                    &prompt,
                    max_tokens,
                    Box::new(ArgmaxSampler),
                    self.n_threads,
                );

                let path = format!("{COMPLETION_PATH_PREFIX}/{}", self.next_serial);
                self.next_serial += 1;
                self.cursors.insert(
                    path.clone(),
                    Slot::Live(CursorSlot {
                        cancel: cursor.cancel_token(),
                        model_key,
                        cursor: Some(cursor),
                    }),
                );
                tracing::info!(%path, "created cursor");
                Ok(Some(SessionReply::CompletionCreated { path }))
            }

            SessionRequest::Exec {
                id, path, num_tokens,
            } => {
                let num_tokens = usize::try_from(num_tokens).map_err(|_| {
                    RpcError::new(ErrorKind::InvalidArgument, "num_tokens must be non-negative")
                })?;
                let slot = match self.cursors.get_mut(&path) {
                    None => {
                        return Err(RpcError::new(
                            ErrorKind::NotFound,
                            format!("no cursor at `{path}`"),
                        ))
                    }
                    Some(Slot::Terminated) => {
                        return Err(RpcError::new(ErrorKind::Spent, "the cursor was terminated"))
                    }
                    Some(Slot::Live(slot)) => slot,
                };
                let mut cursor = slot.cursor.take().ok_or_else(|| {
                    RpcError::new(ErrorKind::Spent, "the cursor has already executed")
                })?;

                // The reply happens later, from the worker's Done event; the
                // session loop goes back to serving other requests.
                let events = self.events.clone();
                let worker_path = path.clone();
                std::thread::spawn(move || {
                    let mut completion = String::new();
                    let mut is_prompt_chunk = true;
                    let result = cursor
                        .exec_stream(num_tokens, STREAM_CHUNK_SIZE, |chunk| {
                            if !is_prompt_chunk {
                                completion.push_str(&chunk.text);
                            }
                            is_prompt_chunk = false;
                            let _ = events.send(WorkerEvent::Chunk {
                                path: worker_path.clone(),
                                text: chunk.text,
                            });
                        })
                        .map(|stats| {
                            tracing::info!(path = %worker_path, %stats, "exec finished");
                            completion
                        })
                        .map_err(rpc_error_from_inference);
                    let _ = events.send(WorkerEvent::Done {
                        id,
                        path: worker_path,
                        result,
                    });
                });

                Ok(None)
            }

            SessionRequest::Terminate { path, .. } => {
                let slot = match self.cursors.insert(path.clone(), Slot::Terminated) {
                    None => {
                        self.cursors.remove(&path);
                        return Err(RpcError::new(
                            ErrorKind::NotFound,
                            format!("no cursor at `{path}`"),
                        ));
                    }
                    Some(Slot::Terminated) => {
                        return Err(RpcError::new(ErrorKind::Spent, "the cursor was terminated"))
                    }
                    Some(Slot::Live(slot)) => slot,
                };
                slot.cancel.cancel();
                self.registry.release(&slot.model_key);
                tracing::info!(%path, "terminated cursor");
                Ok(Some(SessionReply::Terminated))
            }
        }
    }

    fn teardown(&mut self) {
        for (path, slot) in self.cursors.drain() {
            if let Slot::Live(slot) = slot {
                tracing::info!(%path, "releasing cursor on disconnect");
                slot.cancel.cancel();
                self.registry.release(&slot.model_key);
            }
        }
    }
}

fn rpc_error_from_inference(error: InferenceError) -> RpcError {
    let kind = match &error {
        InferenceError::Cancelled => ErrorKind::Cancelled,
        InferenceError::Spent => ErrorKind::Spent,
        InferenceError::Tokenization(_)
        | InferenceError::EmptyPrompt
        | InferenceError::ContextFull => ErrorKind::InvalidArgument,
        InferenceError::Compute(_) => ErrorKind::InternalBug,
    };
    RpcError::new(kind, error.to_string())
}
