use std::{
    collections::HashMap,
    fmt::{self, Display, Formatter},
    fs::{self, File},
    io::{self, Read},
    path::{Path, PathBuf},
    time::SystemTime,
};

use log::trace;
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

use crate::{queue::WorkerId, task::FileSpec};

/// Content hash of a file. Used as the key under which workers cache inputs.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint([u8; 16]);

impl Fingerprint {
    pub fn of_bytes(data: &[u8]) -> Self {
        Self::from_digest(&Md5::digest(data))
    }

    fn from_digest(digest: &[u8]) -> Self {
        let mut bytes = [0; 16];
        bytes.copy_from_slice(digest);
        Self(bytes)
    }
}

impl Display for Fingerprint {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Outcome of a cache lookup
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Residency {
    Cached,
    NeedsTransfer,
}

/// Per-worker knowledge of which inputs are already resident, keyed by fingerprint.
/// The value is the remote name under which the file was originally pushed.
#[derive(Debug, Default)]
pub struct FileCacheTracker {
    resident: HashMap<WorkerId, HashMap<Fingerprint, String>>,
}

impl FileCacheTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Non-cacheable files, and files whose fingerprint has not been computed yet, always need to
    /// be transferred
    pub fn resolve(&self, worker: WorkerId, spec: &FileSpec) -> Residency {
        match spec.fingerprint {
            Some(fingerprint) if spec.is_cacheable() && self.contains(worker, fingerprint) => {
                Residency::Cached
            }
            _ => Residency::NeedsTransfer,
        }
    }

    /// Remembers that `worker` holds a file with the given fingerprint
    pub fn record<T>(&mut self, worker: WorkerId, fingerprint: Fingerprint, path: T)
    where
        T: Into<String>,
    {
        let path = path.into();
        trace!(
            "Worker {} now caches {} as \"{}\"",
            worker,
            fingerprint,
            path
        );
        self.resident
            .entry(worker)
            .or_default()
            .insert(fingerprint, path);
    }

    pub fn contains(&self, worker: WorkerId, fingerprint: Fingerprint) -> bool {
        self.resident
            .get(&worker)
            .is_some_and(|files| files.contains_key(&fingerprint))
    }

    /// How many of the given fingerprints are resident on `worker`
    pub fn resident_count<I>(&self, worker: WorkerId, fingerprints: I) -> usize
    where
        I: IntoIterator<Item = Fingerprint>,
    {
        match self.resident.get(&worker) {
            Some(files) => fingerprints
                .into_iter()
                .filter(|fingerprint| files.contains_key(fingerprint))
                .count(),
            None => 0,
        }
    }

    pub fn files_on(&self, worker: WorkerId) -> usize {
        self.resident.get(&worker).map_or(0, HashMap::len)
    }

    /// Discards everything known about a worker's cache
    pub fn forget_worker(&mut self, worker: WorkerId) {
        self.resident.remove(&worker);
    }
}

#[derive(Debug)]
struct MemoEntry {
    len: u64,
    modified: SystemTime,
    fingerprint: Fingerprint,
}

/// Avoids re-hashing local files whose length and modification time have not changed since they
/// were last fingerprinted
#[derive(Debug, Default)]
pub struct FingerprintMemo {
    entries: HashMap<PathBuf, MemoEntry>,
}

impl FingerprintMemo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the fingerprint of the file at `path`. If the file had to be read to compute it,
    /// its contents are returned as well so the caller does not need to read it a second time.
    pub fn fingerprint(&mut self, path: &Path) -> io::Result<(Fingerprint, Option<Vec<u8>>)> {
        let metadata = fs::metadata(path)?;
        let modified = metadata.modified()?;

        if let Some(entry) = self.entries.get(path) {
            if entry.len == metadata.len() && entry.modified == modified {
                return Ok((entry.fingerprint, None));
            }
        }

        let mut data = Vec::with_capacity(metadata.len().try_into().unwrap_or(0));
        File::open(path)?.read_to_end(&mut data)?;
        let fingerprint = Fingerprint::of_bytes(&data);
        self.entries.insert(
            path.to_path_buf(),
            MemoEntry {
                len: metadata.len(),
                modified,
                fingerprint,
            },
        );
        Ok((fingerprint, Some(data)))
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
