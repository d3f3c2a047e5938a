//! End-to-end tests: a real daemon on a temporary bus socket, a real client,
//! and a synthetic GPT-2 checkpoint in a temporary model cache.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use llm::ggml::{self, util};
use llm::Hyperparameters;
use llm_client::{ClientError, ClientService, ClientSession};
use llm_ipc::ErrorKind;
use llm_service::{Service, ServiceConfig};

const N_VOCAB: usize = 16;
const N_CTX: usize = 4096;
const N_EMBD: usize = 32;

fn weights(n: usize, seed: u64) -> Vec<f32> {
    let mut state = seed.wrapping_mul(0x9e37_79b9_7f4a_7c15).wrapping_add(1);
    (0..n)
        .map(|_| {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            ((state >> 33) as i64 % 1000) as f32 / 5000.0
        })
        .collect()
}

fn write_record(out: &mut Vec<u8>, name: &str, dims: &[usize], seed: u64) {
    util::write_i32(out, dims.len() as i32).unwrap();
    util::write_i32(out, name.len() as i32).unwrap();
    util::write_i32(out, u32::from(ggml::Type::F32) as i32).unwrap();
    for &dim in dims {
        util::write_i32(out, dim as i32).unwrap();
    }
    out.extend_from_slice(name.as_bytes());
    for value in weights(dims.iter().product(), seed) {
        out.extend_from_slice(&value.to_le_bytes());
    }
}

/// Writes a tiny GPT-2 checkpoint under the name the 117M preset resolves
/// to, so the daemon loads it like the real thing.
fn install_model(cache_dir: &Path) {
    let hp = Hyperparameters {
        n_vocab: N_VOCAB,
        n_ctx: N_CTX,
        n_embd: N_EMBD,
        n_head: 2,
        n_layer: 2,
        file_type: llm::FileType::F32,
    };
    let mut out = Vec::new();
    util::write_u32(&mut out, ggml::FILE_MAGIC_GGML).unwrap();
    hp.write(&mut out).unwrap();
    util::write_i32(&mut out, N_VOCAB as i32).unwrap();
    for i in 0..N_VOCAB {
        util::write_u32(&mut out, 1).unwrap();
        out.push(b'a' + i as u8);
    }
    let e = N_EMBD;
    write_record(&mut out, "model/ln_f/g", &[e], 1);
    write_record(&mut out, "model/ln_f/b", &[e], 2);
    write_record(&mut out, "model/wte", &[e, N_VOCAB], 3);
    write_record(&mut out, "model/wpe", &[e, N_CTX], 4);
    for layer in 0..hp.n_layer {
        let seed = 100 * (layer as u64 + 1);
        write_record(&mut out, &format!("model/h{layer}/ln_1/g"), &[e], seed + 1);
        write_record(&mut out, &format!("model/h{layer}/ln_1/b"), &[e], seed + 2);
        write_record(&mut out, &format!("model/h{layer}/ln_2/g"), &[e], seed + 3);
        write_record(&mut out, &format!("model/h{layer}/ln_2/b"), &[e], seed + 4);
        write_record(&mut out, &format!("model/h{layer}/attn/c_attn/w"), &[e, 3 * e], seed + 5);
        write_record(&mut out, &format!("model/h{layer}/attn/c_attn/b"), &[3 * e], seed + 6);
        write_record(&mut out, &format!("model/h{layer}/attn/c_proj/w"), &[e, e], seed + 7);
        write_record(&mut out, &format!("model/h{layer}/attn/c_proj/b"), &[e], seed + 8);
        write_record(&mut out, &format!("model/h{layer}/mlp/c_fc/w"), &[e, 4 * e], seed + 9);
        write_record(&mut out, &format!("model/h{layer}/mlp/c_fc/b"), &[4 * e], seed + 10);
        write_record(&mut out, &format!("model/h{layer}/mlp/c_proj/w"), &[4 * e, e], seed + 11);
        write_record(&mut out, &format!("model/h{layer}/mlp/c_proj/b"), &[e], seed + 12);
    }
    std::fs::write(cache_dir.join("ggml-model-gpt-2-117M.bin"), out).unwrap();
}

struct Harness {
    _dir: tempfile::TempDir,
    registry: Arc<llm_service::ModelRegistry>,
    client: ClientService,
    server: tokio::task::JoinHandle<std::io::Result<()>>,
}

impl Harness {
    fn start(with_model: bool) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let bus_path = dir.path().join("org.ggml.Service");
        let cache_dir = dir.path().join("models");
        std::fs::create_dir_all(&cache_dir).unwrap();
        if with_model {
            install_model(&cache_dir);
        }

        let service = Service::bind(ServiceConfig {
            bus_path: bus_path.clone(),
            cache_dir,
            n_threads: 1,
        })
        .unwrap();
        let registry = service.registry();
        let server = tokio::spawn(service.serve());

        Harness {
            _dir: dir,
            registry,
            client: ClientService::with_bus_path(bus_path),
            server,
        }
    }

    async fn session(&self) -> ClientSession {
        self.client.open_session().await.unwrap()
    }

    fn total_use_count(&self) -> usize {
        self.registry.use_counts().iter().map(|(_, n)| n).sum()
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.server.abort();
    }
}

fn default_properties() -> BTreeMap<String, serde_json::Value> {
    [
        ("n_params".to_owned(), serde_json::json!("117M")),
        ("quantization".to_owned(), serde_json::json!("f16")),
    ]
    .into_iter()
    .collect()
}

fn rpc_kind(error: &ClientError) -> Option<ErrorKind> {
    match error {
        ClientError::Rpc(e) => Some(e.kind),
        _ => None,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn streamed_chunks_concatenate_to_the_completion() {
    let harness = Harness::start(true);
    let session = harness.session().await;

    let cursor = session
        .start_completion("gpt2", default_properties(), "abc", 32)
        .await
        .unwrap();
    assert!(cursor.path().starts_with("/org/ggml/LanguageModelCompletion/"));

    let mut chunks = Vec::new();
    let completion = cursor
        .exec_stream(7, 2, |chunk| chunks.push(chunk.to_owned()))
        .await
        .unwrap();

    assert_eq!(chunks[0], "abc", "the first chunk plays the prompt back");
    assert!(chunks.len() >= 4, "expected streamed chunks, got {chunks:?}");
    let streamed: String = chunks[1..].concat();
    assert_eq!(streamed, completion);
    assert_eq!(completion.len(), 7, "one byte per synthetic token");
    assert_eq!(harness.total_use_count(), 1);

    cursor.terminate().await.unwrap();
    assert_eq!(harness.total_use_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_requests_load_the_model_once() {
    let harness = Harness::start(true);
    let (session_a, session_b) = tokio::join!(harness.session(), harness.session());

    let (a, b) = tokio::join!(
        session_a.start_completion("gpt2", default_properties(), "ab", 8),
        session_b.start_completion("gpt2", default_properties(), "cd", 8),
    );
    let (cursor_a, cursor_b) = (a.unwrap(), b.unwrap());

    let counts = harness.registry.use_counts();
    assert_eq!(counts.len(), 1, "one registry entry, not one per client");
    assert_eq!(counts[0].1, 2);

    // Both cursors actually work against the shared weights.
    let (ra, rb) = tokio::join!(
        cursor_a.exec_stream(3, 2, |_| {}),
        cursor_b.exec_stream(3, 2, |_| {}),
    );
    ra.unwrap();
    rb.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn terminate_cancels_an_inflight_exec() {
    let harness = Harness::start(true);
    let session = harness.session().await;
    let cursor = session
        .start_completion("gpt2", default_properties(), "abc", 4000)
        .await
        .unwrap();
    assert_eq!(harness.total_use_count(), 1);

    let exec = cursor.exec_stream(3500, 2, |_| {});
    let terminate = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        cursor.terminate_ref().await
    };
    let (exec_result, terminate_result) = tokio::join!(exec, terminate);

    terminate_result.unwrap();
    let error = exec_result.expect_err("exec should be cancelled");
    assert_eq!(rpc_kind(&error), Some(ErrorKind::Cancelled), "{error}");
    assert_eq!(harness.total_use_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn a_cursor_execs_exactly_once() {
    let harness = Harness::start(true);
    let session = harness.session().await;
    let cursor = session
        .start_completion("gpt2", default_properties(), "abc", 8)
        .await
        .unwrap();

    cursor.exec_stream(2, 2, |_| {}).await.unwrap();
    let error = cursor.exec_stream(2, 2, |_| {}).await.unwrap_err();
    assert_eq!(rpc_kind(&error), Some(ErrorKind::Spent), "{error}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn exec_zero_returns_the_prompt_chunk_only() {
    let harness = Harness::start(true);
    let session = harness.session().await;
    let cursor = session
        .start_completion("gpt2", default_properties(), "abc", 8)
        .await
        .unwrap();

    let mut chunks = Vec::new();
    let completion = cursor
        .exec_stream(0, 4, |chunk| chunks.push(chunk.to_owned()))
        .await
        .unwrap();
    assert_eq!(completion, "");
    assert_eq!(chunks, vec!["abc".to_owned()]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_models_are_not_found() {
    let harness = Harness::start(true);
    let session = harness.session().await;
    let error = session
        .start_completion("gpt3", default_properties(), "abc", 8)
        .await
        .unwrap_err();
    assert_eq!(rpc_kind(&error), Some(ErrorKind::NotFound), "{error}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unsupported_quantization_is_invalid_argument() {
    let harness = Harness::start(true);
    let session = harness.session().await;
    let mut properties = default_properties();
    properties.insert("quantization".to_owned(), serde_json::json!("q2_k"));
    let error = session
        .start_completion("gpt2", properties, "abc", 8)
        .await
        .unwrap_err();
    assert_eq!(rpc_kind(&error), Some(ErrorKind::InvalidArgument), "{error}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_cache_file_is_an_io_error() {
    let harness = Harness::start(false);
    let session = harness.session().await;
    let error = session
        .start_completion("gpt2", default_properties(), "abc", 8)
        .await
        .unwrap_err();
    assert_eq!(rpc_kind(&error), Some(ErrorKind::IO), "{error}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn disconnect_releases_model_references() {
    let harness = Harness::start(true);
    let session = harness.session().await;
    let cursor = session
        .start_completion("gpt2", default_properties(), "abc", 8)
        .await
        .unwrap();
    assert_eq!(harness.total_use_count(), 1);

    drop(cursor);
    drop(session);

    // Cleanup is asynchronous: either the best-effort Terminate or the
    // endpoint teardown releases the reference.
    for _ in 0..100 {
        if harness.total_use_count() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("model reference was not released after disconnect");
}
