//! Model hub snapshots: repository ids, the local cache and downloads.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use reqwest::Client;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::config::{NetworkConfig, RunOptions};
use crate::error::{ConvertError, Result};
use crate::model::weights::{read_index, INDEX_FILE, SINGLE_FILE};

pub const CONFIG_FILE: &str = "config.json";
pub const TOKENIZER_FILE: &str = "tokenizer.json";
/// WordPiece vocabulary, used when no `tokenizer.json` is published.
pub const VOCAB_FILE: &str = "vocab.txt";
pub const TOKENIZER_CONFIG_FILE: &str = "tokenizer_config.json";
/// Legacy pickle checkpoints, recognized only to report them.
pub const PICKLE_FILE: &str = "pytorch_model.bin";

static REPO_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*/[A-Za-z0-9][A-Za-z0-9._-]*$").unwrap()
});

/// `org/name[@revision]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoRef {
    pub repo_id: String,
    pub revision: String,
}

impl RepoRef {
    pub fn parse(source: &str) -> Option<Self> {
        let (repo_id, revision) = match source.split_once('@') {
            Some((repo, rev)) if !rev.is_empty() => (repo, rev),
            Some(_) => return None,
            None => (source, NetworkConfig::DEFAULT_REVISION),
        };
        if !REPO_ID.is_match(repo_id) || revision.contains(|c: char| c == '/' || c == '\\') {
            return None;
        }
        Some(Self {
            repo_id: repo_id.to_string(),
            revision: revision.to_string(),
        })
    }

    /// `<cache>/<org>--<name>/<revision>`
    pub fn snapshot_dir(&self, cache_dir: &Path) -> PathBuf {
        cache_dir
            .join(self.repo_id.replace('/', "--"))
            .join(&self.revision)
    }

    fn url(&self, base: &str, file: &str) -> String {
        format!(
            "{}/{}/resolve/{}/{}",
            base.trim_end_matches('/'),
            self.repo_id,
            self.revision,
            file
        )
    }
}

/// True when a directory holds everything needed to materialize a model.
pub fn snapshot_complete(dir: &Path) -> bool {
    let has_tokenizer = dir.join(TOKENIZER_FILE).is_file() || dir.join(VOCAB_FILE).is_file();
    if !dir.join(CONFIG_FILE).is_file() || !has_tokenizer {
        return false;
    }
    if dir.join(SINGLE_FILE).is_file() {
        return true;
    }
    let index_path = dir.join(INDEX_FILE);
    if !index_path.is_file() {
        return false;
    }
    match read_index(&index_path, "") {
        Ok(index) => index
            .shard_files()
            .iter()
            .all(|shard| dir.join(shard).is_file()),
        Err(_) => false,
    }
}

/// Downloads hub snapshots into the cache.
pub struct HubClient {
    client: Client,
    base_url: String,
    auth_header: Option<String>,
    cache_dir: PathBuf,
    offline: bool,
}

impl HubClient {
    pub fn new(options: &RunOptions) -> Result<Self> {
        // Connect timeout only; a total timeout would cut off large weight files.
        let client = Client::builder()
            .connect_timeout(NetworkConfig::CONNECT_TIMEOUT)
            .user_agent(concat!("modelpack/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ConvertError::Config {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            base_url: options.hub_base_url.clone(),
            auth_header: options.hub_token.as_ref().map(|t| format!("Bearer {}", t)),
            cache_dir: options.cache_dir.clone(),
            offline: options.offline,
        })
    }

    /// Return a complete snapshot directory, downloading missing files.
    pub async fn snapshot(&self, repo: &RepoRef) -> Result<PathBuf> {
        let dir = repo.snapshot_dir(&self.cache_dir);
        if snapshot_complete(&dir) {
            debug!("Using cached snapshot {}", dir.display());
            return Ok(dir);
        }
        if self.offline {
            return Err(self.unresolved(repo, "not in the local cache and offline mode is on"));
        }

        info!("Downloading {}@{}", repo.repo_id, repo.revision);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| self.unresolved(repo, &format!("cannot create {}: {e}", dir.display())))?;

        if !self.fetch(repo, CONFIG_FILE, &dir).await? {
            return Err(self.unresolved(repo, &format!("{CONFIG_FILE} not found")));
        }
        if !self.fetch(repo, TOKENIZER_FILE, &dir).await? {
            if !self.fetch(repo, VOCAB_FILE, &dir).await? {
                return Err(self.unresolved(
                    repo,
                    &format!("neither {TOKENIZER_FILE} nor {VOCAB_FILE} found"),
                ));
            }
            // Optional; carries `do_lower_case`.
            self.fetch(repo, TOKENIZER_CONFIG_FILE, &dir).await?;
        }

        if !self.fetch(repo, SINGLE_FILE, &dir).await? {
            if !self.fetch(repo, INDEX_FILE, &dir).await? {
                return Err(self.unresolved(
                    repo,
                    "no safetensors weights published (pickle-only checkpoints are not supported)",
                ));
            }
            let index = read_index(&dir.join(INDEX_FILE), &repo.repo_id)?;
            for shard in index.shard_files() {
                if !self.fetch(repo, &shard, &dir).await? {
                    return Err(self.unresolved(repo, &format!("shard {shard} not found")));
                }
            }
        }

        Ok(dir)
    }

    /// Download one file unless already present. Returns `false` on 404.
    async fn fetch(&self, repo: &RepoRef, file: &str, dir: &Path) -> Result<bool> {
        use futures::StreamExt;

        let dest = dir.join(file);
        if dest.is_file() {
            return Ok(true);
        }

        let url = repo.url(&self.base_url, file);
        let mut request = self.client.get(&url);
        if let Some(auth) = &self.auth_header {
            request = request.header("Authorization", auth);
        }
        let response = request
            .send()
            .await
            .map_err(|e| self.unresolved(repo, &format!("request for {file} failed: {e}")))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            debug!("{} not published for {}", file, repo.repo_id);
            return Ok(false);
        }
        if !status.is_success() {
            return Err(self.unresolved(repo, &format!("HTTP {status} for {file}")));
        }

        let part = dir.join(format!("{file}{}", NetworkConfig::DOWNLOAD_TEMP_SUFFIX));
        let write_err =
            |e: std::io::Error| self.unresolved(repo, &format!("cannot write {}: {e}", part.display()));
        let mut out = tokio::fs::File::create(&part).await.map_err(write_err)?;

        let mut downloaded: u64 = 0;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    drop(out);
                    let _ = tokio::fs::remove_file(&part).await;
                    return Err(self.unresolved(repo, &format!("download of {file} failed: {e}")));
                }
            };
            out.write_all(&chunk).await.map_err(write_err)?;
            downloaded += chunk.len() as u64;
        }
        out.flush().await.map_err(write_err)?;
        drop(out);

        tokio::fs::rename(&part, &dest).await.map_err(write_err)?;
        debug!("Downloaded {} ({} bytes)", file, downloaded);
        Ok(true)
    }

    fn unresolved(&self, repo: &RepoRef, message: &str) -> ConvertError {
        ConvertError::SourceResolution {
            source_id: repo.repo_id.clone(),
            message: message.to_string(),
        }
    }
}
