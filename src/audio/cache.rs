use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use serde::Serialize;
use tokio::{sync::Semaphore, task::JoinSet};

use super::{buffer::DecodedAudio, decoder::decode_file};
use crate::error::DecodeError;

/// Outcome of a [`AudioCache::preload`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PreloadReport {
    pub loaded: usize,
    pub failed: usize,
    /// Distinct paths not decoded: already cached, or past the limit.
    pub skipped: usize,
}

/// Path-keyed store of decoded clips, shared with every voice playing them.
///
/// Entries are never evicted automatically. Decoding happens outside the
/// lock, so two concurrent misses on one path may both decode; the later
/// insert wins and both callers get a valid buffer.
#[derive(Debug, Default)]
pub struct AudioCache {
    entries: RwLock<HashMap<PathBuf, Arc<DecodedAudio>>>,
}

impl AudioCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<PathBuf, Arc<DecodedAudio>>> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<PathBuf, Arc<DecodedAudio>>> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Cached buffer for `path`, decoding and inserting it on a miss.
    pub fn get_or_load(&self, path: &Path) -> Result<Arc<DecodedAudio>, DecodeError> {
        if let Some(hit) = self.get(path) {
            return Ok(hit);
        }

        let audio = Arc::new(decode_file(path)?);
        log::debug!(
            "cached {} ({:.2}s, {} KiB)",
            path.display(),
            audio.duration().as_secs_f64(),
            audio.memory_bytes() / 1024
        );
        self.write().insert(path.to_path_buf(), Arc::clone(&audio));
        Ok(audio)
    }

    pub fn get(&self, path: &Path) -> Option<Arc<DecodedAudio>> {
        self.read().get(path).cloned()
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.read().contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sum of the sample-data footprint of every cached clip.
    pub fn memory_bytes(&self) -> usize {
        self.read().values().map(|a| a.memory_bytes()).sum()
    }

    /// Drop the entry for `path` so the next load re-reads the file.
    pub fn invalidate(&self, path: &Path) -> bool {
        self.write().remove(path).is_some()
    }

    pub fn clear(&self) {
        self.write().clear();
    }

    /// Decode up to `limit` distinct, non-empty paths on the blocking pool.
    /// Individual failures are logged and counted, never returned.
    pub async fn preload<I, P>(&self, paths: I, limit: usize) -> PreloadReport
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let mut report = PreloadReport::default();
        let mut seen = HashSet::new();
        let mut queue = Vec::new();

        for path in paths {
            let path = path.as_ref();
            if path.as_os_str().is_empty() || !seen.insert(path.to_path_buf()) {
                continue;
            }
            if seen.len() > limit || self.contains(path) {
                report.skipped += 1;
                continue;
            }
            queue.push(path.to_path_buf());
        }

        if queue.is_empty() {
            return report;
        }

        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        let permits = Arc::new(Semaphore::new(parallelism));
        let mut tasks = JoinSet::new();

        for path in queue {
            let permits = Arc::clone(&permits);
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await;
                let target = path.clone();
                let decoded = tokio::task::spawn_blocking(move || decode_file(&target)).await;
                (path, decoded)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((path, Ok(Ok(audio)))) => {
                    self.write().insert(path, Arc::new(audio));
                    report.loaded += 1;
                }
                Ok((path, Ok(Err(e)))) => {
                    log::warn!("Preload {} failed: {e}", path.display());
                    report.failed += 1;
                }
                Ok((path, Err(e))) => {
                    log::warn!("Preload {} panicked: {e}", path.display());
                    report.failed += 1;
                }
                Err(e) => {
                    log::warn!("Preload task failed: {e}");
                    report.failed += 1;
                }
            }
        }

        log::info!(
            "Preload: {} loaded, {} failed, {} skipped ({} clips cached)",
            report.loaded,
            report.failed,
            report.skipped,
            self.len()
        );
        report
    }
}
