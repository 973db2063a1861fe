use crate::{config::ModelKind, model_service::ModelLoadError};
use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
    thread::sleep,
    time::Duration,
};

const MAX_FETCH_RETRIES: u32 = 5;

/// Attempt count and backoff bounds for artifact downloads.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FetchPolicy {
    pub attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            attempts: MAX_FETCH_RETRIES,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }
}

/// Locates the artifact `file_name` under `base`.
///
/// A local `base` must already contain the file. An `http(s)://` base is
/// served from `cache_dir` when the file was fetched before, and downloaded
/// into it otherwise.
pub fn resolve(
    kind: ModelKind,
    base: &str,
    file_name: &str,
    cache_dir: Option<&Path>,
) -> Result<PathBuf, ModelLoadError> {
    resolve_with_policy(kind, base, file_name, cache_dir, FetchPolicy::default())
}

pub(crate) fn resolve_with_policy(
    kind: ModelKind,
    base: &str,
    file_name: &str,
    cache_dir: Option<&Path>,
    policy: FetchPolicy,
) -> Result<PathBuf, ModelLoadError> {
    if !is_url(base) {
        let path = Path::new(base).join(file_name);
        if path.is_file() {
            return Ok(path);
        }
        return Err(ModelLoadError::NotFound { kind, path });
    }

    let cache_dir = match cache_dir {
        Some(dir) => dir.to_path_buf(),
        None => model_cache_dir()?,
    };
    let cached_path = cache_dir.join(file_name);
    if cached_path.is_file() {
        tracing::debug!("Using cached {} at {:?}", kind, cached_path);
        return Ok(cached_path);
    }

    fs::create_dir_all(&cache_dir).map_err(|source| ModelLoadError::Cache {
        kind,
        path: cache_dir.clone(),
        source,
    })?;

    let url = artifact_url(base, file_name);
    let bytes = fetch_with_retry(kind, &url, policy)?;
    write_atomically(kind, &cached_path, &bytes)?;
    tracing::info!("Downloaded {} ({} bytes) to {:?}", kind, bytes.len(), cached_path);

    Ok(cached_path)
}

pub fn model_cache_dir() -> Result<PathBuf, ModelLoadError> {
    dirs::cache_dir()
        .map(|dir| dir.join("face_annotator").join("models"))
        .ok_or(ModelLoadError::NoCacheDir)
}

pub(crate) fn is_url(base: &str) -> bool {
    base.starts_with("http://") || base.starts_with("https://")
}

fn artifact_url(base: &str, file_name: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), file_name)
}

fn fetch_with_retry(
    kind: ModelKind,
    url: &str,
    policy: FetchPolicy,
) -> Result<Vec<u8>, ModelLoadError> {
    let mut retry_delay = policy.initial_delay;
    let mut last_error = String::new();

    for attempt in 1..=policy.attempts {
        match fetch(url) {
            Ok(bytes) => return Ok(bytes),
            Err(e) => {
                tracing::warn!(
                    "Fetching {} failed (attempt {}/{}): {}",
                    kind,
                    attempt,
                    policy.attempts,
                    e
                );
                last_error = e.to_string();
            }
        }

        if attempt < policy.attempts {
            let jitter = rand::random::<f32>() * 0.2 + 0.9;
            sleep(retry_delay.mul_f32(jitter));
            retry_delay = (retry_delay * 2).min(policy.max_delay);
        }
    }

    Err(ModelLoadError::Fetch {
        kind,
        url: url.to_string(),
        reason: last_error,
    })
}

fn fetch(url: &str) -> Result<Vec<u8>, reqwest::Error> {
    let response = reqwest::blocking::get(url)?.error_for_status()?;
    Ok(response.bytes()?.to_vec())
}

fn write_atomically(kind: ModelKind, dest: &Path, bytes: &[u8]) -> Result<(), ModelLoadError> {
    let temp_path = dest.with_extension("part");
    let mut file =
        fs::File::create(&temp_path).map_err(|e| cache_error(kind, &temp_path, e))?;
    file.write_all(bytes)
        .map_err(|e| cache_error(kind, &temp_path, e))?;
    file.flush().map_err(|e| cache_error(kind, &temp_path, e))?;
    drop(file);

    fs::rename(&temp_path, dest).map_err(|e| cache_error(kind, dest, e))
}

fn cache_error(kind: ModelKind, path: &Path, source: std::io::Error) -> ModelLoadError {
    ModelLoadError::Cache {
        kind,
        path: path.to_path_buf(),
        source,
    }
}
