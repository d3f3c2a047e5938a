//! The bus-facing front of the daemon: the well-known socket, `OpenSession`
//! handling, and private endpoint setup.

use std::os::fd::{FromRawFd, OwnedFd};
use std::path::PathBuf;
use std::sync::Arc;

use llm_ipc::{send_with_fds, OPEN_SESSION_BYTE};
use tokio::io::AsyncReadExt;
use tokio::net::unix::pipe;
use tokio::net::{UnixListener, UnixStream};

use crate::registry::ModelRegistry;
use crate::session;

/// Where and how the daemon serves.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// The bus socket path.
    pub bus_path: PathBuf,
    /// The directory holding cached model files
    /// (`ggml-model-gpt-2-117M.bin`, ...). Fetching files into the cache is
    /// someone else's job; a missing file is an IO error at
    /// `CreateCompletion` time.
    pub cache_dir: PathBuf,
    /// Worker threads per graph computation.
    pub n_threads: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        let cache_dir = std::env::var_os("GGML_MODEL_CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let base = std::env::var_os("XDG_CACHE_HOME")
                    .map(PathBuf::from)
                    .or_else(|| {
                        std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".cache"))
                    })
                    .unwrap_or_else(|| PathBuf::from("/tmp"));
                base.join("ggml-llm").join("models")
            });
        ServiceConfig {
            bus_path: llm_ipc::default_bus_path(),
            cache_dir,
            n_threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
        }
    }
}

/// The daemon: a bound bus socket plus the process-wide model registry.
pub struct Service {
    listener: UnixListener,
    registry: Arc<ModelRegistry>,
    n_threads: usize,
}

impl Service {
    /// Binds the bus socket (replacing a stale one left by a dead process)
    /// and sets up the registry.
    pub fn bind(config: ServiceConfig) -> std::io::Result<Self> {
        if config.bus_path.exists() {
            std::fs::remove_file(&config.bus_path)?;
        }
        if let Some(parent) = config.bus_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let listener = UnixListener::bind(&config.bus_path)?;
        tracing::info!(bus = %config.bus_path.display(), cache = %config.cache_dir.display(), "service bound");
        Ok(Service {
            listener,
            registry: Arc::new(ModelRegistry::new(config.cache_dir)),
            n_threads: config.n_threads,
        })
    }

    /// The registry, shared with every session.
    pub fn registry(&self) -> Arc<ModelRegistry> {
        self.registry.clone()
    }

    /// Accepts bus connections forever. Each `OpenSession` gets its own
    /// session task on a private endpoint.
    pub async fn serve(self) -> std::io::Result<()> {
        loop {
            let (stream, _addr) = self.listener.accept().await?;
            let registry = self.registry.clone();
            let n_threads = self.n_threads;
            tokio::spawn(async move {
                if let Err(e) = open_session(stream, registry, n_threads).await {
                    tracing::warn!("OpenSession failed: {e}");
                }
            });
        }
    }
}

/// Handles one bus connection: reads the `OpenSession` byte, creates the two
/// pipes, hands the client its ends over `SCM_RIGHTS`, and runs the session
/// over the server ends.
async fn open_session(
    mut stream: UnixStream,
    registry: Arc<ModelRegistry>,
    n_threads: usize,
) -> std::io::Result<()> {
    let mut request = [0u8; 1];
    stream.read_exact(&mut request).await?;
    if request[0] != OPEN_SESSION_BYTE {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("unknown bus request {:#04x}", request[0]),
        ));
    }

    // The descriptor dance is blocking; do it off the loop.
    let std_stream = stream.into_std()?;
    let (server_read, server_write) =
        tokio::task::spawn_blocking(move || -> std::io::Result<(OwnedFd, OwnedFd)> {
            use std::os::fd::AsRawFd;
            std_stream.set_nonblocking(false)?;

            let (client_to_server_read, client_to_server_write) = new_pipe()?;
            let (server_to_client_read, server_to_client_write) = new_pipe()?;

            // The client receives its read end and its write end; our
            // duplicates of those two close when the OwnedFds drop here.
            send_with_fds(
                &std_stream,
                &[OPEN_SESSION_BYTE],
                &[
                    server_to_client_read.as_raw_fd(),
                    client_to_server_write.as_raw_fd(),
                ],
            )?;

            Ok((client_to_server_read, server_to_client_write))
        })
        .await
        .expect("OpenSession task does not panic")?;

    let reader = pipe::Receiver::from_file(std::fs::File::from(server_read))?;
    let writer = pipe::Sender::from_file(std::fs::File::from(server_write))?;

    tracing::info!("opened session on a private endpoint");
    session::run(reader, writer, registry, n_threads).await;
    tracing::info!("session closed");
    Ok(())
}

fn new_pipe() -> std::io::Result<(OwnedFd, OwnedFd)> {
    let (read_fd, write_fd) =
        nix::unistd::pipe().map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
    // SAFETY: pipe(2) just created these descriptors; we are their only
    // owner.
    unsafe {
        Ok((
            OwnedFd::from_raw_fd(read_fd),
            OwnedFd::from_raw_fd(write_fd),
        ))
    }
}
