//! LRU page cache for rasterized preview pages
//!
//! Entries are keyed by (page, zoom, device scale) and accounted in bytes
//! against a configurable budget. Eviction is strict LRU; the whole cache is
//! dropped on recompilation because every surface is stale by construction.

use std::sync::Arc;

use lru::LruCache;

/// Cache key: one logical page at one perceptible resolution.
///
/// Scale factors are quantized to millesimal units for stable Eq/Hash; two
/// requests for the same page at perceptibly different resolution are
/// distinct entries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PageKey {
    /// 0-based page index
    pub page_index: usize,
    scale_millis: u32,
    dpr_millis: u32,
}

impl PageKey {
    #[must_use]
    pub fn new(page_index: usize, scale: f32, device_pixel_ratio: f32) -> Self {
        Self {
            page_index,
            scale_millis: quantize(scale),
            dpr_millis: quantize(device_pixel_ratio),
        }
    }

    #[must_use]
    pub fn scale(&self) -> f32 {
        self.scale_millis as f32 / 1000.0
    }

    #[must_use]
    pub fn device_pixel_ratio(&self) -> f32 {
        self.dpr_millis as f32 / 1000.0
    }

    /// Effective rasterization magnification
    #[must_use]
    pub fn magnification(&self) -> f32 {
        self.scale() * self.device_pixel_ratio()
    }
}

fn quantize(factor: f32) -> u32 {
    if factor.is_finite() && factor > 0.0 {
        (factor * 1000.0).round() as u32
    } else {
        1000
    }
}

/// One rasterized page: tightly packed RGB8 pixels
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PageSurface {
    pub width_px: u32,
    pub height_px: u32,
    pub pixels: Vec<u8>,
}

impl PageSurface {
    /// Cache cost of this surface
    #[must_use]
    pub fn byte_size(&self) -> usize {
        self.pixels.len() + std::mem::size_of::<Self>()
    }
}

struct CachedPage {
    surface: Arc<PageSurface>,
    byte_size: usize,
    last_access_generation: u64,
}

/// Byte-budgeted LRU cache of rendered pages.
///
/// Total cost never rests above the budget: inserting the entry that pushes
/// it over immediately evicts least-recently-used entries back under.
pub struct PageCache {
    entries: LruCache<PageKey, CachedPage>,
    total_bytes: usize,
    budget_bytes: usize,
    generation: u64,
}

impl PageCache {
    #[must_use]
    pub fn new(budget_bytes: usize) -> Self {
        Self {
            entries: LruCache::unbounded(),
            total_bytes: 0,
            budget_bytes,
            generation: 0,
        }
    }

    /// Get a cached surface, promoting it in the recency order
    #[must_use]
    pub fn get(&mut self, key: &PageKey) -> Option<Arc<PageSurface>> {
        self.generation += 1;
        let generation = self.generation;
        self.entries.get_mut(key).map(|entry| {
            entry.last_access_generation = generation;
            Arc::clone(&entry.surface)
        })
    }

    /// Check presence without touching recency
    #[must_use]
    pub fn contains(&self, key: &PageKey) -> bool {
        self.entries.contains(key)
    }

    /// Insert a surface, account its cost and evict back under budget
    pub fn insert(&mut self, key: PageKey, surface: PageSurface) -> Arc<PageSurface> {
        let byte_size = surface.byte_size();
        let arc = Arc::new(surface);
        self.generation += 1;
        if let Some(old) = self.entries.put(
            key,
            CachedPage {
                surface: Arc::clone(&arc),
                byte_size,
                last_access_generation: self.generation,
            },
        ) {
            self.total_bytes -= old.byte_size;
        }
        self.total_bytes += byte_size;
        self.evict_to_budget();
        arc
    }

    /// Cached surface, or render-and-insert on a miss. The render error is
    /// the caller's to report; a failed render caches nothing.
    pub fn get_or_render<E>(
        &mut self,
        key: PageKey,
        render_fn: impl FnOnce(&PageKey) -> Result<PageSurface, E>,
    ) -> Result<Arc<PageSurface>, E> {
        if let Some(surface) = self.get(&key) {
            return Ok(surface);
        }
        let surface = render_fn(&key)?;
        Ok(self.insert(key, surface))
    }

    /// Drop every entry; called once per successful recompilation
    pub fn invalidate_all(&mut self) {
        self.entries.clear();
        self.total_bytes = 0;
    }

    /// Reconfigure the budget; shrinking evicts down to the new limit
    pub fn set_budget(&mut self, budget_bytes: usize) {
        self.budget_bytes = budget_bytes;
        self.evict_to_budget();
    }

    #[must_use]
    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    #[must_use]
    pub fn budget_bytes(&self) -> usize {
        self.budget_bytes
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Recency stamp of an entry, exposed for eviction-order assertions
    #[must_use]
    pub fn last_access_generation(&self, key: &PageKey) -> Option<u64> {
        self.entries.peek(key).map(|e| e.last_access_generation)
    }

    fn evict_to_budget(&mut self) {
        while self.total_bytes > self.budget_bytes {
            match self.entries.pop_lru() {
                Some((_, evicted)) => self.total_bytes -= evicted.byte_size,
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn surface(pixel_bytes: usize) -> PageSurface {
        PageSurface {
            width_px: pixel_bytes as u32 / 3,
            height_px: 1,
            pixels: vec![0; pixel_bytes],
        }
    }

    fn overhead() -> usize {
        std::mem::size_of::<PageSurface>()
    }

    #[test]
    fn hit_returns_cached_surface_without_rerender() {
        let mut cache = PageCache::new(1 << 20);
        let key = PageKey::new(0, 1.0, 2.0);
        let mut renders = 0;
        for _ in 0..3 {
            let result: Result<_, ()> = cache.get_or_render(key, |_| {
                renders += 1;
                Ok(surface(300))
            });
            assert!(result.is_ok());
        }
        assert_eq!(renders, 1);
    }

    #[test]
    fn distinct_scales_are_distinct_entries() {
        assert_ne!(PageKey::new(0, 1.0, 1.0), PageKey::new(0, 1.5, 1.0));
        assert_ne!(PageKey::new(0, 1.0, 1.0), PageKey::new(0, 1.0, 2.0));
        // quantization collapses imperceptible differences
        assert_eq!(PageKey::new(0, 1.0, 1.0), PageKey::new(0, 1.0001, 1.0));
    }

    #[test]
    fn total_bytes_never_exceeds_budget() {
        let entry_cost = 1000 + overhead();
        let mut cache = PageCache::new(entry_cost * 3);
        for page in 0..50 {
            cache.insert(PageKey::new(page, 1.0, 1.0), surface(1000));
            assert!(cache.total_bytes() <= cache.budget_bytes());
        }
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn eviction_is_least_recently_used_first() {
        let entry_cost = 1000 + overhead();
        let mut cache = PageCache::new(entry_cost * 2);
        let a = PageKey::new(0, 1.0, 1.0);
        let b = PageKey::new(1, 1.0, 1.0);
        cache.insert(a, surface(1000));
        cache.insert(b, surface(1000));

        // touch `a` so `b` becomes the LRU victim
        assert!(cache.get(&a).is_some());
        assert!(cache.last_access_generation(&a) > cache.last_access_generation(&b));

        cache.insert(PageKey::new(2, 1.0, 1.0), surface(1000));
        assert!(cache.contains(&a));
        assert!(!cache.contains(&b));
    }

    #[test]
    fn invalidate_all_forces_rerender() {
        let mut cache = PageCache::new(1 << 20);
        let key = PageKey::new(0, 1.0, 1.0);
        let renders = std::cell::Cell::new(0);
        let render = |cache: &mut PageCache| {
            let _: Result<_, ()> = cache.get_or_render(key, |_| {
                renders.set(renders.get() + 1);
                Ok(surface(300))
            });
        };
        render(&mut cache);
        render(&mut cache);
        assert_eq!(renders.get(), 1);

        cache.invalidate_all();
        assert_eq!(cache.total_bytes(), 0);

        render(&mut cache);
        assert_eq!(renders.get(), 2);
    }

    #[test]
    fn shrinking_budget_evicts_immediately() {
        let entry_cost = 1000 + overhead();
        let mut cache = PageCache::new(entry_cost * 4);
        for page in 0..4 {
            cache.insert(PageKey::new(page, 1.0, 1.0), surface(1000));
        }
        assert_eq!(cache.len(), 4);

        cache.set_budget(entry_cost);
        assert_eq!(cache.len(), 1);
        assert!(cache.total_bytes() <= cache.budget_bytes());
        // the most recently inserted page survives
        assert!(cache.contains(&PageKey::new(3, 1.0, 1.0)));
    }

    #[test]
    fn oversized_entry_does_not_rest_in_cache() {
        let mut cache = PageCache::new(100);
        let arc = cache.insert(PageKey::new(0, 1.0, 1.0), surface(5000));
        assert!(cache.is_empty());
        assert_eq!(cache.total_bytes(), 0);
        // the caller keeps the surface it asked for
        assert_eq!(arc.pixels.len(), 5000);
    }

    #[test]
    fn reinserting_a_key_replaces_cost_accounting() {
        let mut cache = PageCache::new(1 << 20);
        let key = PageKey::new(0, 1.0, 1.0);
        cache.insert(key, surface(1000));
        let total_small = cache.total_bytes();
        cache.insert(key, surface(2000));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.total_bytes(), total_small + 1000);
    }
}
