//! MuPDF-backed rendering, behind the `pdf` cargo feature

use std::path::Path;
use std::sync::Mutex;

use mupdf::{Colorspace, Document, Matrix, Pixmap};

use super::cache::{PageKey, PageSurface};
use super::controller::{PageRenderer, RenderBackend, RenderFault};

/// Opens compiled documents through MuPDF
#[derive(Clone, Copy, Debug, Default)]
pub struct MupdfBackend;

impl RenderBackend for MupdfBackend {
    fn open(&self, path: &Path) -> Result<std::sync::Arc<dyn PageRenderer>, RenderFault> {
        let doc = Document::open(path.to_string_lossy().as_ref())
            .map_err(|e| RenderFault::Backend(e.to_string()))?;
        let page_count = doc
            .page_count()
            .map_err(|e| RenderFault::Backend(e.to_string()))? as usize;
        Ok(std::sync::Arc::new(MupdfRenderer {
            // the mupdf context is not safe for concurrent page loads
            doc: Mutex::new(doc),
            page_count,
        }))
    }
}

struct MupdfRenderer {
    doc: Mutex<Document>,
    page_count: usize,
}

impl PageRenderer for MupdfRenderer {
    fn page_count(&self) -> usize {
        self.page_count
    }

    fn render(&self, key: &PageKey) -> Result<PageSurface, RenderFault> {
        if key.page_index >= self.page_count {
            return Err(RenderFault::PageOutOfRange {
                page: key.page_index,
                count: self.page_count,
            });
        }

        let doc = self
            .doc
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let page = doc
            .load_page(key.page_index as i32)
            .map_err(|e| RenderFault::Backend(e.to_string()))?;

        let mag = key.magnification();
        let transform = Matrix::new_scale(mag, mag);
        let rgb = Colorspace::device_rgb();
        let pixmap = page
            .to_pixmap(&transform, &rgb, false, false)
            .map_err(|e| RenderFault::Backend(e.to_string()))?;

        Ok(PageSurface {
            width_px: pixmap.width(),
            height_px: pixmap.height(),
            pixels: pixmap_to_rgb(&pixmap)?,
        })
    }
}

/// Repack pixmap samples as tight RGB8, dropping stride padding and any
/// alpha channel.
fn pixmap_to_rgb(pixmap: &Pixmap) -> Result<Vec<u8>, RenderFault> {
    let n = pixmap.n() as usize;
    if n < 3 {
        return Err(RenderFault::Backend(format!(
            "unsupported pixmap format: {n} channels"
        )));
    }

    let width = pixmap.width() as usize;
    let height = pixmap.height() as usize;
    let stride = pixmap.stride() as usize;
    let samples = pixmap.samples();
    let row_bytes = width * n;
    if samples.len() < stride.saturating_mul(height) || row_bytes > stride {
        return Err(RenderFault::Backend("pixmap buffer size mismatch".into()));
    }

    let mut out = Vec::with_capacity(width * height * 3);
    for y in 0..height {
        let row = &samples[y * stride..y * stride + row_bytes];
        if n == 3 {
            out.extend_from_slice(row);
        } else {
            for px in row.chunks_exact(n) {
                out.extend_from_slice(&px[..3]);
            }
        }
    }
    Ok(out)
}
