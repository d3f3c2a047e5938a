//! The process-wide model registry: fingerprint-keyed deduplication of
//! loaded models, use counting, and coalescing of concurrent loads.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use llm::ggml::CancelToken;
use llm::models::gpt2::{self, Gpt2Preset};
use llm::{LanguageModel, LoadError, ModelConfig, QuantizationConfig};
use llm_ipc::{ErrorKind, RpcError};
use tokio::sync::oneshot;

/// A validated `CreateCompletion` model request: the preset to load and the
/// in-memory weight type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelSpec {
    preset: Gpt2Preset,
    weight_type: llm::ggml::Type,
}

impl ModelSpec {
    /// Validates a model name and property map. Unknown models are
    /// [ErrorKind::NotFound]; unknown property keys, non-string values and
    /// unsupported quantization options are [ErrorKind::InvalidArgument].
    pub fn from_request(
        model: &str,
        properties: &BTreeMap<String, serde_json::Value>,
    ) -> Result<Self, RpcError> {
        let mut n_params: Option<&str> = None;
        let mut quantization: Option<&str> = None;
        for (key, value) in properties {
            let value = value.as_str().ok_or_else(|| {
                RpcError::new(
                    ErrorKind::InvalidArgument,
                    format!("property `{key}` must be a string"),
                )
            })?;
            match key.as_str() {
                "n_params" => n_params = Some(value),
                "quantization" => quantization = Some(value),
                other => {
                    return Err(RpcError::new(
                        ErrorKind::InvalidArgument,
                        format!("unknown property `{other}`"),
                    ))
                }
            }
        }

        if model != "gpt2" {
            return Err(RpcError::new(
                ErrorKind::NotFound,
                format!("no such model `{model}`"),
            ));
        }
        let preset = match n_params {
            None => Gpt2Preset::P117M,
            Some(n_params) => Gpt2Preset::from_n_params(n_params).ok_or_else(|| {
                RpcError::new(
                    ErrorKind::NotFound,
                    format!("no gpt2 model with n_params `{n_params}`"),
                )
            })?,
        };
        let weight_type = match quantization.unwrap_or("f16") {
            "f16" => llm::ggml::Type::F16,
            "q8_0" => llm::ggml::Type::Q8_0,
            "q5_0" => llm::ggml::Type::Q5_0,
            "q5_1" => llm::ggml::Type::Q5_1,
            "q4_0" => llm::ggml::Type::Q4_0,
            "q4_1" => llm::ggml::Type::Q4_1,
            other => {
                return Err(RpcError::new(
                    ErrorKind::InvalidArgument,
                    format!(
                        "no such quantization type `{other}` (valid options: f16, q8_0, q5_0, \
                         q5_1, q4_0, q4_1)"
                    ),
                ))
            }
        };

        Ok(ModelSpec {
            preset,
            weight_type,
        })
    }

    /// The registry key: one entry per distinct (model, properties) pair,
    /// canonicalized so equivalent property maps collide.
    pub fn fingerprint(&self) -> String {
        format!(
            "gpt2-{}-{}",
            self.preset.cache_file_name(),
            self.weight_type
        )
    }

    fn model_config(&self) -> ModelConfig {
        ModelConfig {
            quantization: Some(QuantizationConfig {
                target: self.weight_type,
                include: gpt2::quantization_regexes(),
                exclude: vec![],
            }),
        }
    }
}

struct ReadyEntry {
    model: Arc<LanguageModel>,
    use_count: usize,
}

enum Entry {
    /// A load is in flight; these waiters get the outcome.
    #[allow(clippy::type_complexity)]
    Loading(Vec<oneshot::Sender<Result<Arc<LanguageModel>, RpcError>>>),
    Ready(ReadyEntry),
}

/// The registry. `use_count` rises when a cursor attaches to a model and
/// falls when the cursor is terminated; entries linger at zero as a warm
/// cache.
pub struct ModelRegistry {
    cache_dir: PathBuf,
    models: Mutex<HashMap<String, Entry>>,
}

impl ModelRegistry {
    /// Creates a registry over the given model cache directory.
    pub fn new(cache_dir: PathBuf) -> Self {
        ModelRegistry {
            cache_dir,
            models: Mutex::new(HashMap::new()),
        }
    }

    /// Resolves `spec` to a loaded model, loading it on first use, and
    /// counts one new cursor against it. Concurrent requests for the same
    /// fingerprint coalesce onto a single load.
    pub async fn acquire(
        self: &Arc<Self>,
        spec: ModelSpec,
    ) -> Result<(String, Arc<LanguageModel>), RpcError> {
        let key = spec.fingerprint();
        let (tx, rx) = oneshot::channel();

        let should_load = {
            let mut models = self.models.lock().expect("registry lock");
            match models.get_mut(&key) {
                Some(Entry::Ready(entry)) => {
                    entry.use_count += 1;
                    return Ok((key, entry.model.clone()));
                }
                Some(Entry::Loading(waiters)) => {
                    waiters.push(tx);
                    false
                }
                None => {
                    models.insert(key.clone(), Entry::Loading(vec![tx]));
                    true
                }
            }
        };

        if should_load {
            let registry = self.clone();
            let load_key = key.clone();
            tokio::task::spawn_blocking(move || registry.load_and_publish(spec, load_key));
        }

        let model = rx
            .await
            .map_err(|_| RpcError::new(ErrorKind::InternalBug, "model load worker vanished"))??;
        Ok((key, model))
    }

    /// Runs on a blocking worker: loads the model file and hands the result
    /// to every waiter. Each waiter that gets a model counts as one use.
    fn load_and_publish(self: Arc<Self>, spec: ModelSpec, key: String) {
        let path = self.cache_dir.join(spec.preset.cache_file_name());
        tracing::info!(%key, path = %path.display(), "loading model");

        let result = std::fs::File::open(&path)
            .map_err(|e| {
                RpcError::new(
                    ErrorKind::IO,
                    format!("model file {} is not available: {e}", path.display()),
                )
            })
            .and_then(|file| {
                let mut reader = std::io::BufReader::new(file);
                load_model(&mut reader, &spec).map_err(rpc_error_from_load)
            });

        let mut models = self.models.lock().expect("registry lock");
        let waiters = match models.remove(&key) {
            Some(Entry::Loading(waiters)) => waiters,
            other => {
                // Nothing should be able to replace a Loading entry.
                tracing::error!(%key, "registry entry changed under a load");
                if let Some(entry) = other {
                    models.insert(key, entry);
                }
                return;
            }
        };

        match result {
            Ok(model) => {
                let model = Arc::new(model);
                let mut handed_out = 0;
                for waiter in waiters {
                    if waiter.send(Ok(model.clone())).is_ok() {
                        handed_out += 1;
                    }
                }
                tracing::info!(%key, use_count = handed_out, "model ready");
                models.insert(
                    key,
                    Entry::Ready(ReadyEntry {
                        model,
                        use_count: handed_out,
                    }),
                );
            }
            Err(error) => {
                tracing::warn!(%key, %error, "model load failed");
                for waiter in waiters {
                    let _ = waiter.send(Err(error.clone()));
                }
            }
        }
    }

    /// Releases one cursor's use of `key`. The entry stays resident at zero.
    pub fn release(&self, key: &str) {
        let mut models = self.models.lock().expect("registry lock");
        if let Some(Entry::Ready(entry)) = models.get_mut(key) {
            entry.use_count = entry.use_count.saturating_sub(1);
        }
    }

    /// The current `(fingerprint, use_count)` pairs of ready models.
    pub fn use_counts(&self) -> Vec<(String, usize)> {
        let models = self.models.lock().expect("registry lock");
        models
            .iter()
            .filter_map(|(key, entry)| match entry {
                Entry::Ready(e) => Some((key.clone(), e.use_count)),
                Entry::Loading(_) => None,
            })
            .collect()
    }
}

fn load_model(
    reader: &mut impl BufRead,
    spec: &ModelSpec,
) -> Result<LanguageModel, LoadError> {
    LanguageModel::load_from_stream(
        reader,
        &gpt2::GPT2,
        &spec.model_config(),
        llm::load_progress_logger,
        &CancelToken::new(),
    )
}

fn rpc_error_from_load(error: LoadError) -> RpcError {
    let kind = match &error {
        LoadError::Io(_) => ErrorKind::IO,
        LoadError::Cancelled => ErrorKind::Cancelled,
        _ => ErrorKind::FormatError,
    };
    RpcError::new(kind, error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(pairs: &[(&str, &str)]) -> BTreeMap<String, serde_json::Value> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), serde_json::json!(v)))
            .collect()
    }

    #[test]
    fn equivalent_property_maps_share_a_fingerprint() {
        let a = ModelSpec::from_request("gpt2", &props(&[("n_params", "117M")])).unwrap();
        let b = ModelSpec::from_request(
            "gpt2",
            &props(&[("quantization", "f16"), ("n_params", "117M")]),
        )
        .unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn unknown_model_is_not_found() {
        let err = ModelSpec::from_request("gpt3", &props(&[])).unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[test]
    fn unknown_quantization_is_invalid_argument() {
        let err =
            ModelSpec::from_request("gpt2", &props(&[("quantization", "q9_9")])).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
    }

    #[test]
    fn unknown_property_keys_are_rejected() {
        let err = ModelSpec::from_request("gpt2", &props(&[("n_parms", "117M")])).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
    }

    #[test]
    fn non_string_property_values_are_rejected() {
        let mut properties = BTreeMap::new();
        properties.insert("n_params".to_owned(), serde_json::json!(117));
        let err = ModelSpec::from_request("gpt2", &properties).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
    }
}
