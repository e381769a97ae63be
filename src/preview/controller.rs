//! Preview orchestration: render worker pool, page cache, sync queries
//!
//! The controller owns the cache and the sync index and satisfies the UI's
//! "show me page P at scale S" and "highlight line L" requests. Rendering
//! happens on worker threads; responses come back through a channel the UI
//! polls, tagged with the document generation so work that straddles a
//! recompile is discarded instead of repopulating the cache with stale
//! pixels.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use flume::{Receiver, Sender};
use log::{debug, warn};

use crate::compile::CompileResult;

use super::cache::{PageCache, PageKey, PageSurface};
use super::sync::{SharedSyncIndex, SyncIndex, SyncNode};
use super::synctex::SyncNodeSource;

pub const DEFAULT_RENDER_WORKERS: usize = 2;
pub const DEFAULT_CACHE_BUDGET: usize = 256 * 1024 * 1024;

/// Identifies one render request for response matching
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(u64);

impl RequestId {
    #[must_use]
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

/// Faults produced by the rendering backend, carried as channel values
#[derive(Debug, Clone, thiserror::Error)]
pub enum RenderFault {
    #[error("no compiled document to render")]
    NoDocument,

    #[error("page {page} out of range (document has {count})")]
    PageOutOfRange { page: usize, count: usize },

    #[error("render backend error: {0}")]
    Backend(String),
}

/// Renders pages of one opened document. Implementations must tolerate
/// concurrent `render` calls from the worker pool.
pub trait PageRenderer: Send + Sync {
    fn page_count(&self) -> usize;
    fn render(&self, key: &PageKey) -> Result<PageSurface, RenderFault>;
}

/// Opens a compiled document into a [`PageRenderer`]
pub trait RenderBackend: Send + Sync {
    fn open(&self, path: &Path) -> Result<Arc<dyn PageRenderer>, RenderFault>;
}

enum RenderRequest {
    Page {
        id: RequestId,
        key: PageKey,
        generation: u64,
        renderer: Arc<dyn PageRenderer>,
    },
    Shutdown,
}

/// Outcome of one render request, delivered through the response channel
pub enum RenderResponse {
    Page {
        id: RequestId,
        key: PageKey,
        surface: Arc<PageSurface>,
    },
    Error { id: RequestId, fault: RenderFault },
    /// The document changed while the request was queued or rendering
    Stale(RequestId),
}

/// Immediate answer to a page request
pub enum PageStatus {
    Ready(Arc<PageSurface>),
    /// Queued for a worker; the surface arrives via [`PreviewController::poll_responses`]
    Pending(RequestId),
    Failed(RenderFault),
}

/// Orchestrates the page cache, the render workers and the sync index
pub struct PreviewController {
    backend: Box<dyn RenderBackend>,
    sync_source: Box<dyn SyncNodeSource>,
    renderer: Option<Arc<dyn PageRenderer>>,
    cache: Arc<Mutex<PageCache>>,
    sync_index: Arc<SharedSyncIndex>,
    request_tx: Sender<RenderRequest>,
    response_rx: Receiver<RenderResponse>,
    doc_generation: Arc<AtomicU64>,
    next_request_id: u64,
    pending: HashMap<PageKey, RequestId>,
    last_highlight: Option<(usize, f32)>,
    num_workers: usize,
}

impl PreviewController {
    #[must_use]
    pub fn new(backend: Box<dyn RenderBackend>, sync_source: Box<dyn SyncNodeSource>) -> Self {
        Self::with_config(
            backend,
            sync_source,
            DEFAULT_RENDER_WORKERS,
            DEFAULT_CACHE_BUDGET,
        )
    }

    #[must_use]
    pub fn with_config(
        backend: Box<dyn RenderBackend>,
        sync_source: Box<dyn SyncNodeSource>,
        num_workers: usize,
        cache_budget: usize,
    ) -> Self {
        let cache = Arc::new(Mutex::new(PageCache::new(cache_budget)));
        let doc_generation = Arc::new(AtomicU64::new(0));

        // flume because the request queue fans out to multiple workers;
        // std::sync::mpsc receivers cannot be cloned
        let (request_tx, request_rx) = flume::unbounded();
        let (response_tx, response_rx) = flume::unbounded();

        for _ in 0..num_workers.max(1) {
            let rx = request_rx.clone();
            let tx = response_tx.clone();
            let cache_clone = Arc::clone(&cache);
            let generation = Arc::clone(&doc_generation);
            std::thread::spawn(move || {
                render_worker(&rx, &tx, &cache_clone, &generation);
            });
        }

        Self {
            backend,
            sync_source,
            renderer: None,
            cache,
            sync_index: Arc::new(SharedSyncIndex::empty()),
            request_tx,
            response_rx,
            doc_generation,
            next_request_id: 1,
            pending: HashMap::new(),
            last_highlight: None,
            num_workers: num_workers.max(1),
        }
    }

    /// Apply a successful compile: retire every cached surface and queued
    /// render, open the new document and rebuild the sync index.
    ///
    /// Failed compiles must not reach here; the last good preview stays up.
    pub fn document_compiled(&mut self, result: &CompileResult) {
        self.doc_generation.fetch_add(1, Ordering::SeqCst);
        lock(&self.cache).invalidate_all();
        self.pending.clear();

        self.renderer = match &result.pdf_path {
            Some(path) => match self.backend.open(path) {
                Ok(renderer) => Some(renderer),
                Err(fault) => {
                    warn!("cannot open {}: {fault}", path.display());
                    None
                }
            },
            None => None,
        };

        self.rebuild_sync_index(result);
    }

    fn rebuild_sync_index(&mut self, result: &CompileResult) {
        let nodes = match &result.synctex_path {
            Some(sync_path) => {
                match self.sync_source.load(sync_path, &result.source_path) {
                    Ok(nodes) => nodes,
                    Err(err) => {
                        // navigation degrades to nothing; the preview itself
                        // is unaffected
                        warn!("sync index unavailable: {err}");
                        Vec::new()
                    }
                }
            }
            None => Vec::new(),
        };
        debug!("sync index rebuilt with {} nodes", nodes.len());
        self.sync_index.replace(SyncIndex::build(nodes));
        self.last_highlight = None;
    }

    /// Cache hit answers synchronously; a miss queues a render unless one
    /// for the same key is already in flight.
    pub fn request_page(&mut self, page_index: usize, scale: f32, dpr: f32) -> PageStatus {
        let Some(renderer) = self.renderer.clone() else {
            return PageStatus::Failed(RenderFault::NoDocument);
        };
        let count = renderer.page_count();
        if page_index >= count {
            return PageStatus::Failed(RenderFault::PageOutOfRange {
                page: page_index,
                count,
            });
        }

        let key = PageKey::new(page_index, scale, dpr);
        if let Some(surface) = lock(&self.cache).get(&key) {
            return PageStatus::Ready(surface);
        }
        if let Some(id) = self.pending.get(&key) {
            return PageStatus::Pending(*id);
        }

        let id = self.next_id();
        let _ = self.request_tx.send(RenderRequest::Page {
            id,
            key,
            generation: self.doc_generation.load(Ordering::SeqCst),
            renderer,
        });
        self.pending.insert(key, id);
        PageStatus::Pending(id)
    }

    /// Drain completed renders; stale responses are dropped here so callers
    /// only ever see surfaces for the current document.
    pub fn poll_responses(&mut self) -> Vec<RenderResponse> {
        let mut responses = vec![];
        while let Ok(response) = self.response_rx.try_recv() {
            match &response {
                RenderResponse::Page { id, key, .. } => {
                    if self.pending.get(key) != Some(id) {
                        continue;
                    }
                    self.pending.remove(key);
                }
                RenderResponse::Error { id, .. } => {
                    self.pending.retain(|_, pending_id| pending_id != id);
                }
                RenderResponse::Stale(id) => {
                    self.pending.retain(|_, pending_id| pending_id != id);
                    continue;
                }
            }
            responses.push(response);
        }
        responses
    }

    /// Source line → output region for "jump to output from cursor".
    /// Remembers the returned region to keep consecutive jumps stable.
    pub fn sync_forward(&mut self, line: u32) -> Option<SyncNode> {
        let index = self.sync_index.load();
        let node = index.forward(line, self.last_highlight).copied()?;
        self.last_highlight = Some((node.page_index, node.y));
        Some(node)
    }

    /// Output click → source line
    #[must_use]
    pub fn sync_inverse(&self, page_index: usize, x: f32, y: f32) -> Option<u32> {
        self.sync_index.load().inverse(page_index, x, y)
    }

    /// Shared handle for read paths outside the controller (UI threads)
    #[must_use]
    pub fn sync_index(&self) -> Arc<SharedSyncIndex> {
        Arc::clone(&self.sync_index)
    }

    #[must_use]
    pub fn page_count(&self) -> Option<usize> {
        self.renderer.as_ref().map(|r| r.page_count())
    }

    pub fn set_cache_budget(&self, budget_bytes: usize) {
        lock(&self.cache).set_budget(budget_bytes);
    }

    #[must_use]
    pub fn cache_bytes(&self) -> usize {
        lock(&self.cache).total_bytes()
    }

    /// Shutdown all workers
    pub fn shutdown(&self) {
        for _ in 0..self.num_workers {
            let _ = self.request_tx.send(RenderRequest::Shutdown);
        }
    }

    fn next_id(&mut self) -> RequestId {
        let id = RequestId::new(self.next_request_id);
        self.next_request_id += 1;
        id
    }
}

impl Drop for PreviewController {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn lock(cache: &Arc<Mutex<PageCache>>) -> std::sync::MutexGuard<'_, PageCache> {
    cache.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Worker loop: check the cache, render on a miss, insert only when the
/// document generation is still current.
fn render_worker(
    requests: &Receiver<RenderRequest>,
    responses: &Sender<RenderResponse>,
    cache: &Arc<Mutex<PageCache>>,
    doc_generation: &Arc<AtomicU64>,
) {
    for request in requests.iter() {
        match request {
            RenderRequest::Page {
                id,
                key,
                generation,
                renderer,
            } => {
                if generation != doc_generation.load(Ordering::SeqCst) {
                    let _ = responses.send(RenderResponse::Stale(id));
                    continue;
                }

                // another worker may have filled this key meanwhile
                if let Some(surface) = lock(cache).get(&key) {
                    let _ = responses.send(RenderResponse::Page { id, key, surface });
                    continue;
                }

                match renderer.render(&key) {
                    Ok(surface) => {
                        // re-check and insert under one lock; a recompile
                        // slipping between the two would cache a stale surface
                        let mut entries = lock(cache);
                        if generation != doc_generation.load(Ordering::SeqCst) {
                            drop(entries);
                            let _ = responses.send(RenderResponse::Stale(id));
                            continue;
                        }
                        let surface = entries.insert(key, surface);
                        drop(entries);
                        let _ = responses.send(RenderResponse::Page { id, key, surface });
                    }
                    Err(fault) => {
                        let _ = responses.send(RenderResponse::Error { id, fault });
                    }
                }
            }
            RenderRequest::Shutdown => break,
        }
    }
}
