//! Preview side: page cache, render orchestration, source↔output sync

mod cache;
mod controller;
#[cfg(feature = "pdf")]
mod mupdf;
mod sync;
mod synctex;

pub use cache::{PageCache, PageKey, PageSurface};
pub use controller::{
    DEFAULT_CACHE_BUDGET, DEFAULT_RENDER_WORKERS, PageRenderer, PageStatus, PreviewController,
    RenderBackend, RenderFault, RenderResponse, RequestId,
};
#[cfg(feature = "pdf")]
pub use mupdf::MupdfBackend;
pub use sync::{SharedSyncIndex, SyncIndex, SyncNode};
pub use synctex::{SyncNodeSource, SyncParseError, SyncTexParser};
