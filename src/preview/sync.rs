//! Bidirectional source↔output position index
//!
//! Built in full after every successful compile from the position-mapping
//! side file, never patched incrementally. Readers hold an immutable snapshot
//! through [`SharedSyncIndex`], so queries run lock-free while a rebuild
//! swaps the next index in.

use std::sync::Arc;

use arc_swap::ArcSwap;

/// One mapping record: a rectangle in PDF points on one page, tied to a
/// 1-based source line. Box records carry higher confidence than bare
/// point records.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SyncNode {
    pub source_line: u32,
    /// 0-based page index
    pub page_index: usize,
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

impl SyncNode {
    fn contains(&self, x: f32, y: f32) -> bool {
        x >= self.x && x <= self.x + self.width && y >= self.y && y <= self.y + self.height
    }

    fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    fn distance_to(&self, x: f32, y: f32) -> f32 {
        let dx = (self.x - x).max(x - (self.x + self.width)).max(0.0);
        let dy = (self.y - y).max(y - (self.y + self.height)).max(0.0);
        (dx * dx + dy * dy).sqrt()
    }
}

/// Immutable double index over one set of nodes: one ordering by source
/// line for forward queries, one by (page, y) for inverse queries.
#[derive(Debug, Default)]
pub struct SyncIndex {
    by_line: Vec<SyncNode>,
    by_page: Vec<SyncNode>,
}

impl SyncIndex {
    /// Build both orderings from a freshly parsed node set
    #[must_use]
    pub fn build(mut nodes: Vec<SyncNode>) -> Self {
        nodes.sort_by(|a, b| a.source_line.cmp(&b.source_line));
        let by_line = nodes.clone();
        nodes.sort_by(|a, b| {
            a.page_index
                .cmp(&b.page_index)
                .then(a.y.total_cmp(&b.y))
        });
        Self {
            by_line,
            by_page: nodes,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_line.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_line.len()
    }

    /// Source line → best output region.
    ///
    /// Among the nodes for `line` (or the nearest line that has any, searched
    /// outward) the highest-confidence node wins; ties go to the node
    /// vertically closest to `previous` (the last highlighted region) to keep
    /// the highlight from jumping between near-identical candidates.
    #[must_use]
    pub fn forward(&self, line: u32, previous: Option<(usize, f32)>) -> Option<&SyncNode> {
        let candidates = self.nodes_for_nearest_line(line)?;
        candidates.iter().min_by(|a, b| {
            b.confidence
                .total_cmp(&a.confidence)
                .then_with(|| match previous {
                    Some((page, y)) => {
                        vertical_distance(a, page, y).total_cmp(&vertical_distance(b, page, y))
                    }
                    None => std::cmp::Ordering::Equal,
                })
        })
    }

    /// Output point → best source line.
    ///
    /// Restricted to `page_index`; a rectangle containing the point beats any
    /// non-containing one, then smaller rectangles beat larger (precise
    /// matches over broad page-wide boxes), then plain distance decides.
    #[must_use]
    pub fn inverse(&self, page_index: usize, x: f32, y: f32) -> Option<u32> {
        let start = self.by_page.partition_point(|n| n.page_index < page_index);
        let end = self.by_page.partition_point(|n| n.page_index <= page_index);
        let on_page = &self.by_page[start..end];
        if on_page.is_empty() {
            return None;
        }

        on_page
            .iter()
            .min_by(|a, b| {
                let a_in = a.contains(x, y);
                let b_in = b.contains(x, y);
                b_in.cmp(&a_in)
                    .then_with(|| {
                        if a_in && b_in {
                            a.area().total_cmp(&b.area())
                        } else {
                            a.distance_to(x, y).total_cmp(&b.distance_to(x, y))
                        }
                    })
                    .then_with(|| a.area().total_cmp(&b.area()))
            })
            .map(|n| n.source_line)
    }

    /// Exact-line slice, or the slice of the nearest line with nodes
    fn nodes_for_nearest_line(&self, line: u32) -> Option<&[SyncNode]> {
        if self.by_line.is_empty() {
            return None;
        }
        let start = self.by_line.partition_point(|n| n.source_line < line);
        let end = self.by_line.partition_point(|n| n.source_line <= line);
        if start < end {
            return Some(&self.by_line[start..end]);
        }

        // no exact match; the neighbors around the insertion point are the
        // nearest mapped lines below and above
        let below = start.checked_sub(1).map(|i| self.by_line[i].source_line);
        let above = self.by_line.get(start).map(|n| n.source_line);
        let nearest = match (below, above) {
            (Some(b), Some(a)) => {
                if line - b <= a - line {
                    b
                } else {
                    a
                }
            }
            (Some(b), None) => b,
            (None, Some(a)) => a,
            (None, None) => return None,
        };
        let start = self.by_line.partition_point(|n| n.source_line < nearest);
        let end = self.by_line.partition_point(|n| n.source_line <= nearest);
        Some(&self.by_line[start..end])
    }
}

fn vertical_distance(node: &SyncNode, page: usize, y: f32) -> f32 {
    if node.page_index == page {
        (node.y - y).abs()
    } else {
        // off-page candidates sort after anything on the reference page
        f32::INFINITY
    }
}

/// Atomically replaceable index handle.
///
/// `load` is wait-free and may run concurrently with `replace`; a reader
/// always observes either the complete old index or the complete new one.
#[derive(Debug)]
pub struct SharedSyncIndex {
    inner: ArcSwap<SyncIndex>,
}

impl Default for SharedSyncIndex {
    fn default() -> Self {
        Self::empty()
    }
}

impl SharedSyncIndex {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            inner: ArcSwap::from_pointee(SyncIndex::default()),
        }
    }

    pub fn replace(&self, index: SyncIndex) {
        self.inner.store(Arc::new(index));
    }

    #[must_use]
    pub fn load(&self) -> Arc<SyncIndex> {
        self.inner.load_full()
    }
}
