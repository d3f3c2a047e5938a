//! The wire protocol between the `llm-service` daemon and its clients.
//!
//! Two transports are involved:
//!
//! - the *shared bus*: a Unix socket at a well-known path, carrying exactly
//!   one method (`OpenSession`), whose reply passes two pipe descriptors via
//!   `SCM_RIGHTS`;
//! - the *private endpoint*: the pipe pair itself, carrying length-prefixed
//!   JSON frames of [SessionRequest]/[ServerMessage] between one client and
//!   its session.
#![deny(missing_docs)]

mod codec;
mod fdpass;
mod protocol;

pub use codec::{read_frame, write_frame, MAX_FRAME_LEN};
pub use fdpass::{recv_with_fds, send_with_fds};
pub use protocol::{
    ErrorKind, RpcError, ServerMessage, SessionReply, SessionRequest, COMPLETION_PATH_PREFIX,
    OPEN_SESSION_BYTE, SERVICE_OBJECT_PATH, SERVICE_WELL_KNOWN_NAME, SESSION_OBJECT_PATH,
};

use std::path::PathBuf;

/// The bus socket path: `$GGML_SERVICE_BUS` if set, otherwise
/// `$XDG_RUNTIME_DIR/org.ggml.Service`, falling back to `/tmp`.
pub fn default_bus_path() -> PathBuf {
    if let Some(path) = std::env::var_os("GGML_SERVICE_BUS") {
        return PathBuf::from(path);
    }
    let dir = std::env::var_os("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp"));
    dir.join(SERVICE_WELL_KNOWN_NAME)
}
