//! Mount-point sources and the mount registry.
//!
//! A source owns the ingest state and the block queue for one mount.
//! Mutation happens under the source's own lock from its scheduler
//! client; listeners only hold block references they fetched from the
//! queue. The registry enforces one source per mount and the global
//! source limit.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use crate::buffer::BlockQueue;
use crate::config::MountConfig;
use crate::format::FormatError;
use crate::format::ingest::{MountIngest, StreamReader};
use crate::stats::Stats;

/// Lifecycle flags for one source.
#[derive(Debug, Default, Clone, Copy)]
pub struct SourceFlags {
    /// Stream is live and reading.
    pub running: bool,
    /// Relay only opens its upstream when demand exists.
    pub on_demand: bool,
    /// Shutdown in progress, listeners draining.
    pub terminating: bool,
    /// Listeners held back until the source settles.
    pub pause_listeners: bool,
    /// Listeners are being rechecked before release.
    pub listeners_sync: bool,
    /// The upstream stopped delivering within its window.
    pub timeout: bool,
}

/// One mount-point instance.
#[derive(Debug)]
pub struct Source {
    mount: String,
    /// Lifecycle flags, owned by the source client.
    pub flags: SourceFlags,
    /// Ingest state feeding the queue.
    pub ingest: MountIngest,
    /// Recent blocks for listener fan-out.
    pub queue: BlockQueue,
    /// Listeners currently attached.
    pub listeners: usize,
    /// Listeners still to acknowledge a termination.
    pub termination_count: usize,
    stats: Arc<Stats>,
}

impl Source {
    /// Creates a source for `mount` with a queue bounded to
    /// `queue_bytes` of payload.
    pub fn new(mount: &str, content_type: &str, icy_metaint: usize, queue_bytes: usize) -> Self {
        let stats = Arc::new(Stats::new());
        Self {
            mount: mount.to_string(),
            flags: SourceFlags::default(),
            ingest: MountIngest::new(mount, content_type, icy_metaint, Arc::clone(&stats)),
            queue: BlockQueue::new(queue_bytes),
            listeners: 0,
            termination_count: 0,
            stats,
        }
    }

    /// Mount path this source publishes.
    pub fn mount(&self) -> &str {
        &self.mount
    }

    /// Shared stats store for this source.
    pub fn stats(&self) -> Arc<Stats> {
        Arc::clone(&self.stats)
    }

    /// Reads the next block from the upstream onto the queue.
    ///
    /// Clears `running` on any ingest failure so the owning client can
    /// move into termination on its next tick.
    ///
    /// # Errors
    /// Propagates the ingest error after flagging the source down.
    pub fn read(&mut self, reader: &mut dyn StreamReader) -> Result<(), FormatError> {
        match self.ingest.next_block(reader) {
            Ok(Some(block)) => {
                self.queue.push(block);
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => {
                tracing::warn!("source {} stopping: {e}", self.mount);
                self.flags.running = false;
                Err(e)
            }
        }
    }

    /// Installs a fresh upstream's stream facts and marks the source
    /// running. Called when a relay connection completes.
    pub fn attach_upstream(&mut self, content_type: &str, icy_metaint: usize, cfg: &MountConfig) {
        self.ingest = MountIngest::new(
            &self.mount,
            content_type,
            icy_metaint,
            Arc::clone(&self.stats),
        );
        self.ingest.apply_settings(cfg);
        self.flags.running = true;
        self.flags.pause_listeners = false;
        self.flags.timeout = false;
    }

    /// Begins shutdown: listeners are counted for the drain and either
    /// moved to a fallback or paused for a retry.
    pub fn shutdown(&mut self, fallback: bool) {
        tracing::info!("source {} shutting down, fallback {}", self.mount, fallback);
        self.flags.terminating = true;
        self.flags.listeners_sync = true;
        self.termination_count = self.listeners;
        if fallback {
            self.flags.pause_listeners = false;
        }
    }

    /// Resets per-run state so the source can be reused by a retry.
    pub fn clear(&mut self) {
        self.queue.clear();
        self.flags.terminating = false;
        self.flags.listeners_sync = false;
        self.flags.timeout = false;
        self.termination_count = 0;
    }
}

/// Registry of live sources, one per mount.
#[derive(Debug)]
pub struct MountRegistry {
    sources: RwLock<HashMap<String, Arc<Mutex<Source>>>>,
    source_limit: usize,
}

impl MountRegistry {
    /// Creates a registry capped at `source_limit` concurrent sources.
    pub fn new(source_limit: usize) -> Self {
        Self {
            sources: RwLock::new(HashMap::new()),
            source_limit,
        }
    }

    /// Reserves `mount`, failing when it is taken or the limit is hit.
    pub fn reserve(
        &self,
        mount: &str,
        content_type: &str,
        icy_metaint: usize,
        queue_bytes: usize,
    ) -> Option<Arc<Mutex<Source>>> {
        let mut sources = self.sources.write().expect("mount registry poisoned");
        if sources.contains_key(mount) {
            return None;
        }
        if sources.len() >= self.source_limit {
            tracing::warn!("mount {mount} refused, source limit {} reached", self.source_limit);
            return None;
        }
        let source = Arc::new(Mutex::new(Source::new(
            mount,
            content_type,
            icy_metaint,
            queue_bytes,
        )));
        sources.insert(mount.to_string(), Arc::clone(&source));
        Some(source)
    }

    /// Looks up a live source.
    pub fn find(&self, mount: &str) -> Option<Arc<Mutex<Source>>> {
        self.sources
            .read()
            .expect("mount registry poisoned")
            .get(mount)
            .cloned()
    }

    /// Releases `mount` back to the pool.
    pub fn release(&self, mount: &str) {
        self.sources
            .write()
            .expect("mount registry poisoned")
            .remove(mount);
    }

    /// Number of live sources.
    pub fn len(&self) -> usize {
        self.sources.read().expect("mount registry poisoned").len()
    }

    /// Whether no sources are live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_is_exclusive_per_mount() {
        let registry = MountRegistry::new(4);
        assert!(registry.reserve("/a", "audio/mpeg", 0, 1 << 20).is_some());
        assert!(registry.reserve("/a", "audio/mpeg", 0, 1 << 20).is_none());
        registry.release("/a");
        assert!(registry.reserve("/a", "audio/mpeg", 0, 1 << 20).is_some());
    }

    #[test]
    fn source_limit_is_enforced() {
        let registry = MountRegistry::new(1);
        assert!(registry.reserve("/a", "audio/mpeg", 0, 1 << 20).is_some());
        assert!(registry.reserve("/b", "audio/mpeg", 0, 1 << 20).is_none());
    }

    #[test]
    fn failed_read_clears_running() {
        struct FailingReader;
        impl StreamReader for FailingReader {
            fn read_bytes(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
                Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone"))
            }
        }
        let mut source = Source::new("/a", "application/ogg", 0, 1 << 20);
        source.flags.running = true;
        assert!(source.read(&mut FailingReader).is_err());
        assert!(!source.flags.running);
    }
}
