use chaingraph_core::{ChunkId, ContentId};
use smallvec::SmallVec;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::content::{ContentRegistry, ContentState};
use crate::graph::surface::{batch, Extent, Surface};
use crate::net::Transport;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChunkConfig {
    pub chunk_width: f64,
    // Margin kept loaded on each side, as a multiple of the view width.
    pub unload_ratio: f64,
    pub update_delay: Duration,
    pub max_chunks_in_view: u32,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            chunk_width: 6000.0,
            unload_ratio: 1.3,
            update_delay: Duration::from_millis(100),
            max_chunks_in_view: 10,
        }
    }
}

#[derive(Debug)]
pub struct Chunk {
    pub last_request: Instant,
    pub contents: BTreeMap<ContentId, ContentState>,
}

// Bounds are inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkWindow {
    pub min_chunk: i64,
    pub max_chunk: i64,
    pub unload_chunks: i64,
    pub min_bound: i64,
    pub max_bound: i64,
}

impl ChunkWindow {
    pub fn compute(extent: &Extent, cfg: &ChunkConfig) -> Option<Self> {
        let lo = (extent.x1 / cfg.chunk_width).floor();
        let hi = (extent.x2 / cfg.chunk_width).ceil();
        if !lo.is_finite() || !hi.is_finite() {
            return None;
        }
        let min_chunk = lo as i64;
        let max_chunk = hi as i64;
        let chunks = max_chunk - min_chunk;
        if chunks < 0 || chunks > i64::from(cfg.max_chunks_in_view) {
            return None;
        }
        let unload_chunks = (chunks as f64 * cfg.unload_ratio).round() as i64;
        Some(Self {
            min_chunk,
            max_chunk,
            unload_chunks,
            min_bound: (min_chunk - unload_chunks).max(0),
            max_bound: max_chunk + unload_chunks,
        })
    }

    pub fn contains(&self, chunk: ChunkId) -> bool {
        let c = i64::from(chunk.0);
        c >= self.min_bound && c <= self.max_bound
    }

    // Center pair first, then alternately one step left and one step right.
    pub fn load_order(&self) -> SmallVec<[ChunkId; 32]> {
        let mut out = SmallVec::new();
        if self.max_bound < self.min_bound {
            return out;
        }
        let mut left = (self.min_bound + self.max_bound).div_euclid(2);
        let mut right = left + 1;
        loop {
            if left >= self.min_bound {
                push_chunk(&mut out, left);
                left -= 1;
            }
            if right <= self.max_bound {
                push_chunk(&mut out, right);
                right += 1;
            }
            if left < self.min_bound && right > self.max_bound {
                break;
            }
        }
        out
    }
}

fn push_chunk(out: &mut SmallVec<[ChunkId; 32]>, idx: i64) {
    if let Ok(id) = u32::try_from(idx) {
        out.push(ChunkId(id));
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ViewChange {
    pub window: Option<ChunkWindow>,
    pub loaded: Vec<ChunkId>,
    pub refreshed: Vec<ChunkId>,
    pub unloaded: Vec<ChunkId>,
}

impl ViewChange {
    pub fn aborted(&self) -> bool {
        self.window.is_none()
    }
}

pub struct ChunkManager {
    cfg: ChunkConfig,
    chunks: BTreeMap<ChunkId, Chunk>,
}

impl ChunkManager {
    pub fn new(cfg: ChunkConfig) -> Self {
        Self {
            cfg,
            chunks: BTreeMap::new(),
        }
    }

    pub fn config(&self) -> &ChunkConfig {
        &self.cfg
    }

    pub fn load_view(
        &mut self,
        extent: &Extent,
        now: Instant,
        registry: &ContentRegistry,
        surface: &mut dyn Surface,
        tx: &mut dyn Transport,
    ) -> ViewChange {
        let mut change = ViewChange::default();
        let Some(window) = ChunkWindow::compute(extent, &self.cfg) else {
            tracing::warn!(
                x1 = extent.x1,
                x2 = extent.x2,
                max = self.cfg.max_chunks_in_view,
                "too many chunks in view, ignoring viewport"
            );
            return change;
        };
        change.window = Some(window);

        batch(surface, |surface| {
            let below: Vec<ChunkId> = self
                .chunks
                .keys()
                .rev()
                .filter(|id| i64::from(id.0) < window.min_bound)
                .copied()
                .collect();
            for id in below {
                self.unload_chunk(id, registry, surface, tx);
                change.unloaded.push(id);
            }

            for id in window.load_order() {
                self.load_chunk(id, now, registry, surface, tx, &mut change);
            }

            let above: Vec<ChunkId> = self
                .chunks
                .keys()
                .filter(|id| i64::from(id.0) > window.max_bound)
                .copied()
                .collect();
            for id in above {
                self.unload_chunk(id, registry, surface, tx);
                change.unloaded.push(id);
            }
        });

        tracing::debug!(
            min = window.min_bound,
            max = window.max_bound,
            loaded = change.loaded.len(),
            refreshed = change.refreshed.len(),
            unloaded = change.unloaded.len(),
            "viewport update"
        );
        change
    }

    fn load_chunk(
        &mut self,
        id: ChunkId,
        now: Instant,
        registry: &ContentRegistry,
        surface: &mut dyn Surface,
        tx: &mut dyn Transport,
        change: &mut ViewChange,
    ) {
        if let Some(chunk) = self.chunks.get_mut(&id) {
            if now.saturating_duration_since(chunk.last_request) > self.cfg.update_delay {
                tracing::debug!(chunk = %id, "refreshing older existing chunk");
                chunk.last_request = now;
                for handler in registry.iter() {
                    if let Some(state) = chunk.contents.get_mut(&handler.id()) {
                        handler.refresh(state, tx);
                    }
                }
                change.refreshed.push(id);
            }
            return;
        }

        let mut contents = BTreeMap::new();
        for handler in registry.iter() {
            let mut state = handler.init_state(id);
            handler.load(&mut state, tx, surface);
            contents.insert(handler.id(), state);
        }
        self.chunks.insert(
            id,
            Chunk {
                last_request: now,
                contents,
            },
        );
        change.loaded.push(id);
    }

    pub fn unload_chunk(
        &mut self,
        id: ChunkId,
        registry: &ContentRegistry,
        surface: &mut dyn Surface,
        tx: &mut dyn Transport,
    ) -> bool {
        let Some(mut chunk) = self.chunks.remove(&id) else {
            return false;
        };
        tracing::debug!(chunk = %id, "unloading chunk");
        batch(surface, |surface| {
            for handler in registry.iter() {
                if let Some(state) = chunk.contents.get_mut(&handler.id()) {
                    handler.unload(state, tx, surface);
                }
            }
        });
        true
    }

    pub fn refresh_all(&mut self, now: Instant, registry: &ContentRegistry, tx: &mut dyn Transport) {
        for chunk in self.chunks.values_mut() {
            chunk.last_request = now;
            for handler in registry.iter() {
                if let Some(state) = chunk.contents.get_mut(&handler.id()) {
                    handler.refresh(state, tx);
                }
            }
        }
    }

    pub fn state_mut(&mut self, chunk: ChunkId, content: ContentId) -> Option<&mut ContentState> {
        self.chunks.get_mut(&chunk)?.contents.get_mut(&content)
    }

    pub fn get(&self, chunk: ChunkId) -> Option<&Chunk> {
        self.chunks.get(&chunk)
    }

    pub fn ids(&self) -> impl Iterator<Item = ChunkId> + '_ {
        self.chunks.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::{BlockHeaders, ChunkMarkers};
    use crate::graph::axis::TimeAxis;
    use crate::graph::surface::MemorySurface;
    use crate::net::RecordingTransport;
    use chaingraph_core::{decode_request, ProtocolVariant, Request};
    use proptest::prelude::*;

    fn cfg(width: f64) -> ChunkConfig {
        ChunkConfig {
            chunk_width: width,
            ..ChunkConfig::default()
        }
    }

    fn registry(width: f64) -> ContentRegistry {
        let axis = TimeAxis {
            chunk_width: width,
            ..TimeAxis::default()
        };
        ContentRegistry::new()
            .with(BlockHeaders::new(axis))
            .with(ChunkMarkers::new(axis))
    }

    fn view(x1: f64, x2: f64) -> Extent {
        Extent::new(x1, 0.0, x2, 500.0)
    }

    fn requested_chunks(sent: &[Vec<u8>]) -> Vec<u32> {
        sent.iter()
            .filter_map(|f| match decode_request(f, ProtocolVariant::Chunks) {
                Ok(Request::Load { chunk, .. }) => Some(chunk.0),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn window_for_1500_wide_view() {
        let w = ChunkWindow::compute(&view(0.0, 1500.0), &cfg(600.0)).expect("window");
        assert_eq!(w.min_chunk, 0);
        assert_eq!(w.max_chunk, 3);
        assert_eq!(w.unload_chunks, 4);
        assert_eq!((w.min_bound, w.max_bound), (0, 7));
    }

    #[test]
    fn load_order_starts_at_center_and_alternates() {
        let w = ChunkWindow::compute(&view(0.0, 1500.0), &cfg(600.0)).expect("window");
        let order: Vec<u32> = w.load_order().iter().map(|c| c.0).collect();
        assert_eq!(order, vec![3, 4, 2, 5, 1, 6, 0, 7]);
    }

    #[test]
    fn oversized_view_aborts_without_side_effects() {
        let mut mgr = ChunkManager::new(cfg(600.0));
        let reg = registry(600.0);
        let mut surface = MemorySurface::default();
        let mut tx = RecordingTransport::default();
        let now = Instant::now();

        mgr.load_view(&view(0.0, 1500.0), now, &reg, &mut surface, &mut tx);
        let before: Vec<ChunkId> = mgr.ids().collect();
        let nodes_before = surface.node_count();
        tx.take();

        let change = mgr.load_view(&view(0.0, 600.0 * 11.0), now, &reg, &mut surface, &mut tx);
        assert!(change.aborted());
        assert_eq!(mgr.ids().collect::<Vec<_>>(), before);
        assert_eq!(surface.node_count(), nodes_before);
        assert!(tx.sent.is_empty());
    }

    #[test]
    fn new_chunks_are_requested_center_first() {
        let mut mgr = ChunkManager::new(cfg(600.0));
        let reg = registry(600.0);
        let mut surface = MemorySurface::default();
        let mut tx = RecordingTransport::default();

        let change = mgr.load_view(&view(0.0, 1500.0), Instant::now(), &reg, &mut surface, &mut tx);
        assert_eq!(
            change.loaded.iter().map(|c| c.0).collect::<Vec<_>>(),
            vec![3, 4, 2, 5, 1, 6, 0, 7]
        );
        assert_eq!(requested_chunks(&tx.take()), vec![3, 4, 2, 5, 1, 6, 0, 7]);
        // one boundary marker per chunk
        assert_eq!(surface.node_count(), 8);
    }

    #[test]
    fn repeat_within_delay_is_idempotent_and_silent() {
        let mut mgr = ChunkManager::new(cfg(600.0));
        let reg = registry(600.0);
        let mut surface = MemorySurface::default();
        let mut tx = RecordingTransport::default();
        let now = Instant::now();

        mgr.load_view(&view(0.0, 1500.0), now, &reg, &mut surface, &mut tx);
        let ids: Vec<ChunkId> = mgr.ids().collect();
        tx.take();

        let change = mgr.load_view(
            &view(0.0, 1500.0),
            now + Duration::from_millis(50),
            &reg,
            &mut surface,
            &mut tx,
        );
        assert!(change.loaded.is_empty());
        assert!(change.refreshed.is_empty());
        assert!(tx.sent.is_empty());
        assert_eq!(mgr.ids().collect::<Vec<_>>(), ids);
    }

    #[test]
    fn stale_chunks_are_refreshed_after_delay() {
        let mut mgr = ChunkManager::new(cfg(600.0));
        let reg = registry(600.0);
        let mut surface = MemorySurface::default();
        let mut tx = RecordingTransport::default();
        let now = Instant::now();

        mgr.load_view(&view(0.0, 1500.0), now, &reg, &mut surface, &mut tx);
        tx.take();
        let change = mgr.load_view(
            &view(0.0, 1500.0),
            now + Duration::from_millis(150),
            &reg,
            &mut surface,
            &mut tx,
        );
        assert_eq!(change.refreshed.len(), 8);
        assert_eq!(requested_chunks(&tx.take()).len(), 8);
    }

    #[test]
    fn panning_unloads_chunks_and_their_nodes() {
        let mut mgr = ChunkManager::new(cfg(600.0));
        let reg = registry(600.0);
        let mut surface = MemorySurface::default();
        let mut tx = RecordingTransport::default();
        let now = Instant::now();

        mgr.load_view(&view(0.0, 1500.0), now, &reg, &mut surface, &mut tx);
        // window becomes [10-4, 13+4]
        let change = mgr.load_view(&view(6000.0, 7500.0), now, &reg, &mut surface, &mut tx);
        assert_eq!(
            change.unloaded.iter().map(|c| c.0).collect::<Vec<_>>(),
            vec![5, 4, 3, 2, 1, 0]
        );
        assert_eq!(mgr.ids().map(|c| c.0).collect::<Vec<_>>(), (6..=17).collect::<Vec<_>>());
        assert_eq!(surface.node_count(), 12);
    }

    #[test]
    fn isolated_chunks_beyond_a_hole_do_not_leak() {
        let mut mgr = ChunkManager::new(cfg(600.0));
        let reg = registry(600.0);
        let mut surface = MemorySurface::default();
        let mut tx = RecordingTransport::default();
        let now = Instant::now();

        mgr.load_view(&view(60_000.0, 61_000.0), now, &reg, &mut surface, &mut tx);
        mgr.load_view(&view(0.0, 1500.0), now, &reg, &mut surface, &mut tx);
        assert!(mgr.ids().all(|c| c.0 <= 7));
        assert_eq!(surface.node_count(), mgr.len());
    }

    #[test]
    fn unload_of_unknown_chunk_is_a_no_op() {
        let mut mgr = ChunkManager::new(cfg(600.0));
        let reg = registry(600.0);
        let mut surface = MemorySurface::default();
        let mut tx = RecordingTransport::default();
        assert!(!mgr.unload_chunk(ChunkId(4), &reg, &mut surface, &mut tx));
    }

    proptest! {
        #[test]
        fn materialized_set_is_exactly_the_window(
            start in 0.0f64..50_000.0,
            width in 1.0f64..5_000.0,
            prev_start in 0.0f64..50_000.0,
        ) {
            let mut mgr = ChunkManager::new(cfg(600.0));
            let reg = registry(600.0);
            let mut surface = MemorySurface::default();
            let mut tx = RecordingTransport::default();
            let now = Instant::now();

            mgr.load_view(&view(prev_start, prev_start + 1000.0), now, &reg, &mut surface, &mut tx);
            let extent = view(start, start + width);
            let change = mgr.load_view(&extent, now, &reg, &mut surface, &mut tx);
            let w = change.window.expect("window within bound");

            let expected: Vec<u32> = (w.min_bound..=w.max_bound).map(|c| c as u32).collect();
            let got: Vec<u32> = mgr.ids().map(|c| c.0).collect();
            prop_assert_eq!(&got, &expected);

            mgr.load_view(&extent, now, &reg, &mut surface, &mut tx);
            let again: Vec<u32> = mgr.ids().map(|c| c.0).collect();
            prop_assert_eq!(again, expected);
        }
    }
}
