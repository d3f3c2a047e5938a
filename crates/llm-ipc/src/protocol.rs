use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// The well-known name the daemon's bus socket is created under.
pub const SERVICE_WELL_KNOWN_NAME: &str = "org.ggml.Service";

/// The object path of the service root (informational; the bus carries only
/// `OpenSession`).
pub const SERVICE_OBJECT_PATH: &str = "/org/ggml/Service";

/// The object path the session object is exposed at on the private endpoint.
pub const SESSION_OBJECT_PATH: &str = "/org/ggml/Session";

/// The path prefix completion cursors are exposed under; a serial number is
/// appended per cursor.
pub const COMPLETION_PATH_PREFIX: &str = "/org/ggml/LanguageModelCompletion";

/// The single-byte `OpenSession` request sent over the shared bus. The reply
/// carries the same byte, with the client's pipe descriptors attached as
/// ancillary data.
pub const OPEN_SESSION_BYTE: u8 = b'S';

/// The error kinds surfaced at the IPC boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// The model file is malformed (bad magic, truncation, shape mismatch,
    /// unsupported dtype conversion).
    FormatError,
    /// No such model or quantization selector.
    NotFound,
    /// Bad prompt, unsupported properties, or malformed request.
    InvalidArgument,
    /// The operation was cancelled (terminated) mid-flight.
    Cancelled,
    /// The cursor has already streamed or was terminated.
    Spent,
    /// Stream or socket failure.
    IO,
    /// An internal invariant was violated. A bug, not a user error.
    InternalBug,
}

/// A failure reply: the error kind plus a human-readable message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct RpcError {
    /// The machine-readable error kind.
    pub kind: ErrorKind,
    /// A human-readable description.
    pub message: String,
}

impl RpcError {
    /// Creates an error reply.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        RpcError {
            kind,
            message: message.into(),
        }
    }
}

/// Methods a client invokes on its private endpoint. Every request carries a
/// client-chosen id echoed by the matching reply, so method calls on
/// different cursors can be in flight at once.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SessionRequest {
    /// `Session.CreateCompletion`: resolve (and if needed load) the model,
    /// create a cursor, expose it at a completion path.
    CreateCompletion {
        /// The request id, echoed in the reply.
        id: u64,
        /// The model family name; currently `"gpt2"`.
        model: String,
        /// Late-bound model properties. Recognized keys: `n_params`
        /// (`"117M" | "345M" | "774M" | "1558M"`) and `quantization`
        /// (`"f16" | "q8_0" | "q5_0" | "q5_1" | "q4_0" | "q4_1"`). Unknown
        /// keys are rejected.
        properties: BTreeMap<String, serde_json::Value>,
        /// The prompt the cursor will complete.
        prompt: String,
        /// The cursor's token budget.
        max_tokens: i32,
    },
    /// `LanguageModelCompletion.Exec`: run the cursor, streaming [chunks]
    /// (ServerMessage::Chunk) and finally replying with the concatenated
    /// completion (prompt excluded).
    Exec {
        /// The request id, echoed in the reply.
        id: u64,
        /// The cursor's object path.
        path: String,
        /// How many tokens to generate.
        num_tokens: i32,
    },
    /// `LanguageModelCompletion.Terminate`: release the server-side cursor,
    /// cancelling any in-flight `Exec`.
    Terminate {
        /// The request id, echoed in the reply.
        id: u64,
        /// The cursor's object path.
        path: String,
    },
}

impl SessionRequest {
    /// The request id carried by this request.
    pub fn id(&self) -> u64 {
        match self {
            SessionRequest::CreateCompletion { id, .. }
            | SessionRequest::Exec { id, .. }
            | SessionRequest::Terminate { id, .. } => *id,
        }
    }
}

/// Successful replies, paired to requests by id in [ServerMessage::Reply].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SessionReply {
    /// The cursor was created and exposed.
    CompletionCreated {
        /// The cursor's object path on this endpoint.
        path: String,
    },
    /// The `Exec` finished. Delivered strictly after every chunk it
    /// produced.
    ExecDone {
        /// The cursor's object path.
        path: String,
        /// The generated text, prompt excluded.
        completion: String,
    },
    /// The cursor was terminated.
    Terminated,
}

/// Everything the server sends on the private endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// A method reply.
    Reply {
        /// The id of the request this answers.
        id: u64,
        /// The result.
        reply: SessionReply,
    },
    /// A method failure.
    Error {
        /// The id of the request this answers.
        id: u64,
        /// What went wrong.
        error: RpcError,
    },
    /// The `Chunk` signal: one streamed payload from an executing cursor,
    /// including the initial prompt pass-through.
    Chunk {
        /// The emitting cursor's object path.
        path: String,
        /// The chunk text.
        text: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_roundtrip_through_json() {
        let requests = vec![
            SessionRequest::CreateCompletion {
                id: 1,
                model: "gpt2".into(),
                properties: [
                    ("n_params".to_owned(), serde_json::json!("117M")),
                    ("quantization".to_owned(), serde_json::json!("q4_0")),
                ]
                .into_iter()
                .collect(),
                prompt: "The meaning of life is:".into(),
                max_tokens: 32,
            },
            SessionRequest::Exec {
                id: 2,
                path: format!("{COMPLETION_PATH_PREFIX}/0"),
                num_tokens: 7,
            },
            SessionRequest::Terminate {
                id: 3,
                path: format!("{COMPLETION_PATH_PREFIX}/0"),
            },
        ];
        for request in requests {
            let bytes = serde_json::to_vec(&request).unwrap();
            let decoded: SessionRequest = serde_json::from_slice(&bytes).unwrap();
            let re_bytes = serde_json::to_vec(&decoded).unwrap();
            assert_eq!(bytes, re_bytes);
            assert_eq!(request.id(), decoded.id());
        }
    }

    #[test]
    fn server_messages_roundtrip_through_json() {
        let messages = vec![
            ServerMessage::Reply {
                id: 1,
                reply: SessionReply::CompletionCreated {
                    path: format!("{COMPLETION_PATH_PREFIX}/3"),
                },
            },
            ServerMessage::Error {
                id: 2,
                error: RpcError::new(ErrorKind::NotFound, "no such model"),
            },
            ServerMessage::Chunk {
                path: format!("{COMPLETION_PATH_PREFIX}/3"),
                text: " to live".into(),
            },
        ];
        for message in messages {
            let bytes = serde_json::to_vec(&message).unwrap();
            let decoded: ServerMessage = serde_json::from_slice(&bytes).unwrap();
            assert_eq!(bytes, serde_json::to_vec(&decoded).unwrap());
        }
    }

    #[test]
    fn unknown_message_types_fail_to_parse() {
        assert!(serde_json::from_slice::<SessionRequest>(b"{\"type\":\"Reboot\"}").is_err());
    }
}
