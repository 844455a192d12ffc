//! Chunked asset handling: splitting, acknowledgement tracking and the local
//! chunk store.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::crypto::hash_hex;
use crate::errors::{ChainError, ChainResult};
use crate::protocol::Connector;

const MANIFEST_FILE: &str = "manifest.json";

pub fn asset_hash(content: &[u8]) -> String {
    hash_hex(content)
}

pub fn chunk_id(asset_hash: &str, index: usize) -> String {
    format!("{asset_hash}-{index}")
}

/// Asset hash a chunk id belongs to.
pub fn chunk_asset_hash(chunk_id: &str) -> Option<&str> {
    chunk_id.rsplit_once('-').map(|(hash, _)| hash)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub id: String,
    pub data: Vec<u8>,
}

/// Splits `content` into `chunk_size` slices. Empty content is rejected.
pub fn split_asset(content: &[u8], chunk_size: usize) -> ChainResult<(String, Vec<Chunk>)> {
    if content.is_empty() {
        return Err(ChainError::Asset("asset is empty".into()));
    }
    if chunk_size == 0 {
        return Err(ChainError::Config("chunk_size must be positive".into()));
    }
    let hash = asset_hash(content);
    let chunks = content
        .chunks(chunk_size)
        .enumerate()
        .map(|(index, data)| Chunk {
            id: chunk_id(&hash, index),
            data: data.to_vec(),
        })
        .collect();
    Ok((hash, chunks))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckProgress {
    pub acknowledged: usize,
    pub total: usize,
}

impl AckProgress {
    pub fn is_complete(&self) -> bool {
        self.acknowledged == self.total
    }
}

struct PendingChunk {
    /// Storage peer the chunk was pushed to; only its reply counts.
    holder: Connector,
    /// `true` while the chunk still awaits its acknowledgement.
    awaiting: bool,
}

struct PendingAsset {
    chunks: BTreeMap<String, PendingChunk>,
    progress: watch::Sender<AckProgress>,
}

impl PendingAsset {
    fn snapshot(&self) -> AckProgress {
        AckProgress {
            acknowledged: self.chunks.values().filter(|chunk| !chunk.awaiting).count(),
            total: self.chunks.len(),
        }
    }
}

/// Acknowledgement status of every asset currently being uploaded.
///
/// Each asset publishes its [`AckProgress`] on a watch channel so the uploader
/// can wait for completion instead of polling the map. An asset has at most
/// one upload in flight; its entry lives exactly as long as the
/// [`PendingUpload`] returned by [`PendingChunks::register`].
#[derive(Default)]
pub struct PendingChunks {
    assets: Mutex<HashMap<String, PendingAsset>>,
}

impl PendingChunks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts tracking `chunks`, given as `(chunk_id, holder)` pairs, for
    /// `asset_hash`. Fails while another upload of the same asset is pending.
    pub fn register<I>(
        self: &Arc<Self>,
        asset_hash: &str,
        chunks: I,
    ) -> ChainResult<PendingUpload>
    where
        I: IntoIterator<Item = (String, Connector)>,
    {
        let chunks: BTreeMap<String, PendingChunk> = chunks
            .into_iter()
            .map(|(id, holder)| {
                (
                    id,
                    PendingChunk {
                        holder,
                        awaiting: true,
                    },
                )
            })
            .collect();
        let progress = AckProgress {
            acknowledged: 0,
            total: chunks.len(),
        };
        let (sender, receiver) = watch::channel(progress);
        let mut assets = self.assets.lock();
        if assets.contains_key(asset_hash) {
            return Err(ChainError::Asset(format!(
                "asset {asset_hash} is already being uploaded"
            )));
        }
        assets.insert(
            asset_hash.to_string(),
            PendingAsset {
                chunks,
                progress: sender,
            },
        );
        Ok(PendingUpload {
            pending: self.clone(),
            asset_hash: asset_hash.to_string(),
            progress: receiver,
        })
    }

    /// Marks `chunk_id` as acknowledged by `from` and returns the new
    /// progress of its asset. Replies for untracked chunks, or from a peer
    /// the chunk was not pushed to, change nothing.
    pub fn acknowledge(&self, chunk_id: &str, from: &Connector) -> ChainResult<AckProgress> {
        let untracked = || ChainError::Asset(format!("chunk {chunk_id} is not pending"));
        let asset_hash = chunk_asset_hash(chunk_id).ok_or_else(untracked)?;
        let mut assets = self.assets.lock();
        let asset = assets.get_mut(asset_hash).ok_or_else(untracked)?;
        let chunk = asset.chunks.get_mut(chunk_id).ok_or_else(untracked)?;
        if chunk.holder != *from {
            return Err(ChainError::Asset(format!(
                "chunk {chunk_id} was pushed to {}, not {from}",
                chunk.holder
            )));
        }
        chunk.awaiting = false;
        let progress = asset.snapshot();
        asset.progress.send_replace(progress);
        Ok(progress)
    }

    /// Per chunk, `true` while it still awaits its acknowledgement.
    pub fn status(&self, asset_hash: &str) -> Option<BTreeMap<String, bool>> {
        self.assets.lock().get(asset_hash).map(|asset| {
            asset
                .chunks
                .iter()
                .map(|(id, chunk)| (id.clone(), chunk.awaiting))
                .collect()
        })
    }

    pub fn progress(&self, asset_hash: &str) -> Option<AckProgress> {
        self.assets.lock().get(asset_hash).map(PendingAsset::snapshot)
    }

    pub fn contains(&self, asset_hash: &str) -> bool {
        self.assets.lock().contains_key(asset_hash)
    }

    pub fn len(&self) -> usize {
        self.assets.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.lock().is_empty()
    }
}

/// One registered upload. Dropping it stops tracking the asset, so every
/// exit from the upload path (success, timeout or cancellation) cleans up.
pub struct PendingUpload {
    pending: Arc<PendingChunks>,
    asset_hash: String,
    progress: watch::Receiver<AckProgress>,
}

impl PendingUpload {
    pub fn asset_hash(&self) -> &str {
        &self.asset_hash
    }

    pub fn progress(&self) -> AckProgress {
        *self.progress.borrow()
    }

    /// Resolves once every chunk is acknowledged.
    pub async fn wait_complete(&mut self) -> ChainResult<AckProgress> {
        let progress = self
            .progress
            .wait_for(|progress| progress.is_complete())
            .await
            .map_err(|_| {
                ChainError::Asset(format!("tracking of asset {} was dropped", self.asset_hash))
            })?;
        Ok(*progress)
    }
}

impl Drop for PendingUpload {
    fn drop(&mut self) {
        self.pending.assets.lock().remove(&self.asset_hash);
    }
}

/// Where the chunks of an uploaded asset were placed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetManifest {
    pub file_name: String,
    pub asset_hash: String,
    pub size: usize,
    pub chunks: Vec<String>,
    pub locations: BTreeMap<String, Connector>,
}

/// Chunks and manifests on local disk, one directory per file name.
#[derive(Debug, Clone)]
pub struct AssetStore {
    root: PathBuf,
}

impl AssetStore {
    pub fn open(root: &Path) -> ChainResult<Self> {
        fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    fn file_dir(&self, file_name: &str) -> ChainResult<PathBuf> {
        ensure_plain_name(file_name)?;
        Ok(self.root.join(file_name))
    }

    pub fn write_chunk(&self, file_name: &str, chunk_id: &str, data: &[u8]) -> ChainResult<()> {
        ensure_plain_name(chunk_id)?;
        let dir = self.file_dir(file_name)?;
        fs::create_dir_all(&dir)?;
        fs::write(dir.join(chunk_id), data)?;
        Ok(())
    }

    pub fn read_chunk(&self, file_name: &str, chunk_id: &str) -> ChainResult<Option<Vec<u8>>> {
        ensure_plain_name(chunk_id)?;
        let path = self.file_dir(file_name)?.join(chunk_id);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(fs::read(path)?))
    }

    pub fn write_manifest(&self, manifest: &AssetManifest) -> ChainResult<()> {
        let dir = self.file_dir(&manifest.file_name)?;
        fs::create_dir_all(&dir)?;
        fs::write(dir.join(MANIFEST_FILE), serde_json::to_vec_pretty(manifest)?)?;
        Ok(())
    }

    pub fn read_manifest(&self, file_name: &str) -> ChainResult<Option<AssetManifest>> {
        let path = self.file_dir(file_name)?.join(MANIFEST_FILE);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_slice(&fs::read(path)?)?))
    }
}

fn ensure_plain_name(name: &str) -> ChainResult<()> {
    let plain = !name.is_empty()
        && name != "."
        && name != ".."
        && name != MANIFEST_FILE
        && !name.contains(['/', '\\']);
    if plain {
        Ok(())
    } else {
        Err(ChainError::Asset(format!("invalid asset name {name:?}")))
    }
}
