use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct CachedFile {
    pub content: String,
    pub tokens: u64,
    stored_at: Instant,
}

/// Time-boxed cache of extracted file content, keyed by (chat, path).
///
/// Entries expire after a fixed TTL; there is no invalidation on filesystem
/// change. Staleness inside the window is an accepted tradeoff.
#[derive(Debug)]
pub struct FileCache {
    entries: DashMap<(Uuid, PathBuf), CachedFile>,
    ttl: Duration,
}

impl FileCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn get(&self, chat_id: Uuid, path: &Path) -> Option<(String, u64)> {
        let key = (chat_id, path.to_path_buf());
        if let Some(entry) = self.entries.get(&key) {
            if entry.stored_at.elapsed() < self.ttl {
                return Some((entry.content.clone(), entry.tokens));
            }
        }
        // Expired entries are dropped lazily on the next lookup.
        self.entries.remove(&key);
        None
    }

    pub fn put(&self, chat_id: Uuid, path: &Path, content: String, tokens: u64) {
        self.entries.insert(
            (chat_id, path.to_path_buf()),
            CachedFile {
                content,
                tokens,
                stored_at: Instant::now(),
            },
        );
    }
}
