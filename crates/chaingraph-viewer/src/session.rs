use chaingraph_core::{ChunkId, ContentId, EventIndex, LayoutOptions, ProtocolVariant};
use crossbeam_channel::{never, tick, Receiver};
use std::time::{Duration, Instant};

use crate::content::{
    Applied, BlockHeaders, ChunkMarkers, ContentError, ContentRegistry, LayoutTrigger,
};
use crate::graph::{
    batch, ChunkConfig, ChunkManager, Extent, LayoutEngine, SessionStats, Surface, TimeAxis,
    ViewChange,
};
use crate::net::{
    Disposition, EventStream, Incoming, IncomingKind, RecordOutcome, RecordSink, Transport,
};

#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub variant: ProtocolVariant,
    pub axis: TimeAxis,
    pub unload_ratio: f64,
    pub update_delay: Duration,
    pub max_chunks_in_view: u32,
    pub heartbeat: Duration,
    pub layout: LayoutOptions,
    pub auto_layout: bool,
    pub chunk_markers: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        let chunks = ChunkConfig::default();
        Self {
            variant: ProtocolVariant::Chunks,
            axis: TimeAxis::default(),
            unload_ratio: chunks.unload_ratio,
            update_delay: chunks.update_delay,
            max_chunks_in_view: chunks.max_chunks_in_view,
            heartbeat: Duration::from_millis(1000),
            layout: LayoutOptions::default(),
            auto_layout: true,
            chunk_markers: true,
        }
    }
}

impl SessionConfig {
    pub fn chunk_config(&self) -> ChunkConfig {
        ChunkConfig {
            chunk_width: self.axis.chunk_width,
            unload_ratio: self.unload_ratio,
            update_delay: self.update_delay,
            max_chunks_in_view: self.max_chunks_in_view,
        }
    }

    pub fn registry(&self) -> ContentRegistry {
        let registry =
            ContentRegistry::new().with(BlockHeaders::new(self.axis).with_variant(self.variant));
        if self.chunk_markers {
            registry.with(ChunkMarkers::new(self.axis))
        } else {
            registry
        }
    }
}

#[derive(Debug)]
pub struct Heartbeat {
    interval: Duration,
    rx: Receiver<Instant>,
    running: bool,
}

impl Heartbeat {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            rx: never(),
            running: false,
        }
    }

    pub fn start(&mut self) {
        self.rx = tick(self.interval);
        self.running = true;
    }

    pub fn stop(&mut self) {
        self.rx = never();
        self.running = false;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    // Fresh handle for a `select!`; replaced by every start and stop.
    pub fn receiver(&self) -> Receiver<Instant> {
        self.rx.clone()
    }
}

pub struct GraphSession<S, T> {
    surface: S,
    tx: T,
    variant: ProtocolVariant,
    registry: ContentRegistry,
    chunks: ChunkManager,
    stream: EventStream,
    engine: LayoutEngine,
    options: LayoutOptions,
    auto_layout: bool,
    trigger: LayoutTrigger,
    heartbeat: Heartbeat,
    connected: bool,
    stats: SessionStats,
}

struct SessionSink<'a> {
    registry: &'a ContentRegistry,
    chunks: &'a mut ChunkManager,
    surface: &'a mut dyn Surface,
    trigger: &'a mut LayoutTrigger,
}

impl SessionSink<'_> {
    fn finish(result: Result<Applied, ContentError>, what: &str) -> RecordOutcome {
        match result {
            Ok(_) => RecordOutcome::Applied,
            Err(e) => {
                tracing::warn!(error = %e, "{what} rejected");
                RecordOutcome::Rejected
            }
        }
    }
}

impl RecordSink for SessionSink<'_> {
    fn apply_record(&mut self, kind: ContentId, index: EventIndex, payload: &[u8]) -> RecordOutcome {
        let Some(handler) = self.registry.get(kind) else {
            tracing::warn!(kind = %kind, index = index.0, "no handler for event type");
            return RecordOutcome::Ignored;
        };
        let chunk = match handler.route_event(payload) {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::warn!(kind = %kind, index = index.0, error = %e, "cannot route event");
                return RecordOutcome::Rejected;
            }
        };
        let Some(state) = self.chunks.state_mut(chunk, kind) else {
            tracing::trace!(chunk = %chunk, index = index.0, "event for unloaded chunk");
            return RecordOutcome::Ignored;
        };
        Self::finish(
            handler.handle_event(state, payload, index, &mut *self.surface, &mut *self.trigger),
            "event",
        )
    }

    fn apply_content(&mut self, content: ContentId, chunk: ChunkId, payload: &[u8]) -> RecordOutcome {
        let Some(handler) = self.registry.get(content) else {
            tracing::warn!(content = %content, "no handler for content");
            return RecordOutcome::Ignored;
        };
        let Some(state) = self.chunks.state_mut(chunk, content) else {
            tracing::debug!(chunk = %chunk, content = %content, "response for unloaded chunk");
            return RecordOutcome::Ignored;
        };
        Self::finish(
            handler.handle_msg(state, payload, &mut *self.surface, &mut *self.trigger),
            "content",
        )
    }
}

fn apply_layout(
    engine: &LayoutEngine,
    surface: &mut dyn Surface,
    registry: &ContentRegistry,
    options: &LayoutOptions,
    stats: &mut SessionStats,
) {
    match engine.run(surface, registry, options) {
        Ok(_) => stats.layouts += 1,
        Err(e) => tracing::warn!(error = %e, "layout failed"),
    }
}

impl<S: Surface, T: Transport> GraphSession<S, T> {
    pub fn new(cfg: &SessionConfig, surface: S, tx: T) -> Self {
        Self {
            surface,
            tx,
            variant: cfg.variant,
            registry: cfg.registry(),
            chunks: ChunkManager::new(cfg.chunk_config()),
            stream: EventStream::new(cfg.variant),
            engine: LayoutEngine::new(),
            options: cfg.layout,
            auto_layout: cfg.auto_layout,
            trigger: LayoutTrigger::default(),
            heartbeat: Heartbeat::new(cfg.heartbeat),
            connected: false,
            stats: SessionStats::default(),
        }
    }

    pub fn handle(&mut self, ev: Incoming, now: Instant) {
        match ev.kind {
            IncomingKind::Opened => {
                tracing::info!(peer = %ev.peer, "connected");
                self.on_open(now);
            }
            IncomingKind::Closed => {
                tracing::info!(peer = %ev.peer, "disconnected");
                self.on_close();
            }
            IncomingKind::Frame(bytes) => self.on_message(&bytes, now),
            IncomingKind::Error(msg) => tracing::warn!(peer = %ev.peer, "{msg}"),
        }
    }

    // ----- Connection -----

    pub fn on_open(&mut self, now: Instant) {
        if self.connected {
            return;
        }
        self.connected = true;
        self.stats.reconnects += 1;
        match self.variant {
            ProtocolVariant::Chunks if self.chunks.is_empty() => {
                self.on_viewport(now);
            }
            ProtocolVariant::Chunks => {
                self.chunks.refresh_all(now, &self.registry, &mut self.tx);
                self.stats.chunk_refreshes += self.chunks.len() as u64;
            }
            ProtocolVariant::Events => {
                if self.chunks.is_empty() {
                    self.on_viewport(now);
                }
                self.stream.announce(&mut self.tx);
                self.heartbeat.start();
            }
        }
    }

    pub fn on_close(&mut self) {
        self.connected = false;
        self.heartbeat.stop();
    }

    pub fn on_message(&mut self, bytes: &[u8], now: Instant) {
        self.stats.on_frame(now);
        let Self {
            surface,
            tx,
            registry,
            chunks,
            stream,
            trigger,
            engine,
            options,
            auto_layout,
            stats,
            ..
        } = self;
        let disposition = batch(surface, |surface| {
            let disposition = {
                let mut sink = SessionSink {
                    registry: &*registry,
                    chunks: &mut *chunks,
                    surface: &mut *surface,
                    trigger: &mut *trigger,
                };
                stream.on_message(bytes, &mut sink, &mut *tx)
            };
            // layout lands in the same commit as the records that asked for it
            if trigger.take() && *auto_layout {
                apply_layout(engine, surface, registry, options, stats);
            }
            disposition
        });

        match disposition {
            Disposition::Applied { tally, .. } => {
                self.stats.records_applied += u64::from(tally.applied);
                self.stats.records_ignored += u64::from(tally.ignored + tally.rejected);
            }
            Disposition::Content(RecordOutcome::Applied) => self.stats.records_applied += 1,
            Disposition::Content(_) => self.stats.records_ignored += 1,
            Disposition::Resync { .. } => self.stats.resyncs += 1,
            Disposition::Dropped(_) => self.stats.dropped_frames += 1,
            Disposition::Status => {}
        }
    }

    // ----- Viewport -----

    pub fn on_viewport(&mut self, now: Instant) -> ViewChange {
        let extent = self.surface.extent();
        let change = self
            .chunks
            .load_view(&extent, now, &self.registry, &mut self.surface, &mut self.tx);
        self.stats.on_view(&change);
        change
    }

    pub fn set_viewport(&mut self, extent: Extent, now: Instant) -> ViewChange {
        self.surface.set_extent(extent);
        self.on_viewport(now)
    }

    pub fn pan(&mut self, dx: f64, now: Instant) -> ViewChange {
        let extent = self.surface.extent().translated(dx, 0.0);
        self.set_viewport(extent, now)
    }

    pub fn fit(&mut self, now: Instant) -> Option<ViewChange> {
        let mut bounds: Option<Extent> = None;
        for n in self.surface.nodes() {
            let (hw, hh) = (n.width / 2.0, n.height / 2.0);
            let b = bounds.get_or_insert(Extent::new(
                n.position.x - hw,
                n.position.y - hh,
                n.position.x + hw,
                n.position.y + hh,
            ));
            b.x1 = b.x1.min(n.position.x - hw);
            b.y1 = b.y1.min(n.position.y - hh);
            b.x2 = b.x2.max(n.position.x + hw);
            b.y2 = b.y2.max(n.position.y + hh);
        }
        let bounds = bounds?;
        Some(self.set_viewport(bounds, now))
    }

    // ----- Cursor and layout -----

    pub fn on_heartbeat(&mut self) {
        if self.connected {
            self.stream.announce(&mut self.tx);
        }
    }

    pub fn set_layout_options(&mut self, opts: LayoutOptions) {
        self.options = opts;
        self.layout();
    }

    pub fn layout(&mut self) {
        apply_layout(
            &self.engine,
            &mut self.surface,
            &self.registry,
            &self.options,
            &mut self.stats,
        );
    }

    // ----- Accessors -----

    pub fn options(&self) -> &LayoutOptions {
        &self.options
    }

    pub fn cursor(&self) -> EventIndex {
        self.stream.cursor()
    }

    pub fn chunks(&self) -> &ChunkManager {
        &self.chunks
    }

    pub fn heartbeat(&self) -> &Heartbeat {
        &self.heartbeat
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.tx
    }

    pub fn stats(&mut self, now: Instant) -> &SessionStats {
        self.stats.nodes = self.surface.node_count();
        self.stats.edges = self.surface.edge_count();
        self.stats.chunks = self.chunks.len();
        self.stats.tick(now);
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::headers::tests::{header, key_of};
    use crate::content::markers::marker_key;
    use crate::graph::{MemorySurface, Point};
    use crate::net::RecordingTransport;
    use chaingraph_core::{
        decode_request, encode_content_update, encode_event_batch, HeaderData, Request,
    };
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    type TestSession = GraphSession<MemorySurface, RecordingTransport>;

    fn cfg(variant: ProtocolVariant) -> SessionConfig {
        SessionConfig {
            variant,
            chunk_markers: false,
            ..SessionConfig::default()
        }
    }

    // Viewport over chunks 0..=1 of the default axis (6000 px per chunk).
    fn session(variant: ProtocolVariant) -> TestSession {
        let surface = MemorySurface::new(Extent::new(0.0, 0.0, 6000.0, 500.0));
        GraphSession::new(&cfg(variant), surface, RecordingTransport::default())
    }

    fn content(chunk: u32, headers: &[HeaderData]) -> Vec<u8> {
        let mut payload = Vec::new();
        for h in headers {
            h.encode_into(&mut payload);
        }
        encode_content_update(ContentId::BLOCK_HEADERS, ChunkId(chunk), &payload)
    }

    fn loads(sent: &[Vec<u8>]) -> Vec<u32> {
        sent.iter()
            .filter_map(|f| match decode_request(f, ProtocolVariant::Chunks) {
                Ok(Request::Load { chunk, .. }) => Some(chunk.0),
                _ => None,
            })
            .collect()
    }

    fn cursors(sent: &[Vec<u8>]) -> Vec<u32> {
        sent.iter()
            .filter_map(|f| match decode_request(f, ProtocolVariant::Events) {
                Ok(Request::Cursor(c)) => Some(c.0),
                _ => None,
            })
            .collect()
    }

    fn keys(s: &TestSession) -> BTreeSet<(String, bool)> {
        s.surface()
            .nodes()
            .map(|n| (n.key.to_string(), n.placeholder))
            .collect()
    }

    #[test]
    fn first_open_loads_the_viewport() {
        let mut s = session(ProtocolVariant::Chunks);
        let now = Instant::now();
        s.on_open(now);
        // [0, 1] plus round(1 * 1.3) on each side, clamped at 0
        assert_eq!(s.chunks().ids().map(|c| c.0).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(loads(&s.transport_mut().take()), vec![1, 2, 0]);
    }

    #[test]
    fn reopen_refreshes_every_chunk() {
        let mut s = session(ProtocolVariant::Chunks);
        let now = Instant::now();
        s.on_open(now);
        s.on_close();
        s.transport_mut().take();

        s.on_open(now);
        let mut got = loads(&s.transport_mut().take());
        got.sort_unstable();
        assert_eq!(got, vec![0, 1, 2]);
    }

    #[test]
    fn content_for_loaded_chunk_is_applied_and_laid_out() {
        let mut s = session(ProtocolVariant::Chunks);
        let now = Instant::now();
        s.on_open(now);

        s.on_message(&content(0, &[header(10, 1, 0), header(11, 2, 1)]), now);
        assert_eq!(s.surface().node_count(), 2);
        assert_eq!(s.surface().edge_count(), 1);
        let n = s.surface().node(&key_of(2)).expect("node");
        assert_eq!(n.position.x, 11.0 * 60.0);

        let stats = s.stats(now);
        assert_eq!(stats.records_applied, 1);
        assert_eq!(stats.layouts, 1);
    }

    #[test]
    fn content_for_unloaded_chunk_is_dropped() {
        let mut s = session(ProtocolVariant::Chunks);
        let now = Instant::now();
        s.on_open(now);
        s.on_message(&content(40, &[header(4000, 1, 0)]), now);
        assert_eq!(s.surface().node_count(), 0);
        assert_eq!(s.stats(now).records_ignored, 1);
    }

    #[test]
    fn panning_away_unloads_nodes() {
        let mut s = session(ProtocolVariant::Chunks);
        let now = Instant::now();
        s.on_open(now);
        s.on_message(&content(0, &[header(10, 1, 0), header(11, 2, 1)]), now);

        s.pan(60_000.0, now);
        assert_eq!(s.surface().node_count(), 0);
        assert!(s.chunks().ids().all(|c| c.0 >= 8));
    }

    #[test]
    fn events_open_announces_cursor_and_starts_heartbeat() {
        let mut s = session(ProtocolVariant::Events);
        let now = Instant::now();
        s.on_open(now);
        assert!(s.heartbeat().is_running());
        let sent = s.transport_mut().take();
        assert!(loads(&sent).is_empty());
        assert_eq!(cursors(&sent), vec![0]);

        s.on_heartbeat();
        assert_eq!(cursors(&s.transport_mut().take()), vec![0]);

        s.on_close();
        assert!(!s.heartbeat().is_running());
        s.on_heartbeat();
        assert!(s.transport_mut().sent.is_empty());
    }

    #[test]
    fn events_for_unloaded_chunks_still_advance_the_cursor() {
        let mut s = session(ProtocolVariant::Events);
        let now = Instant::now();
        s.on_open(now);
        s.transport_mut().take();

        let near = header(10, 1, 0).encode();
        let far = header(9000, 7, 0).encode();
        let frame = encode_event_batch(
            EventIndex(0),
            &[
                (ContentId::BLOCK_HEADERS, near.as_slice()),
                (ContentId::BLOCK_HEADERS, far.as_slice()),
            ],
        );
        s.on_message(&frame, now);
        assert_eq!(s.cursor(), EventIndex(2));
        assert_eq!(s.surface().node_count(), 1);
        assert_eq!(
            s.surface().node(&key_of(1)).and_then(|n| n.event_index),
            Some(EventIndex(0))
        );
        assert_eq!(cursors(&s.transport_mut().take()), vec![2]);
    }

    #[test]
    fn gap_in_events_resyncs_without_mutation() {
        let mut s = session(ProtocolVariant::Events);
        let now = Instant::now();
        s.on_open(now);
        s.transport_mut().take();

        let h = header(10, 1, 0).encode();
        let frame = encode_event_batch(EventIndex(5), &[(ContentId::BLOCK_HEADERS, h.as_slice())]);
        s.on_message(&frame, now);
        assert_eq!(s.surface().node_count(), 0);
        assert_eq!(s.cursor(), EventIndex(0));
        assert_eq!(cursors(&s.transport_mut().take()), vec![0]);
        assert_eq!(s.stats(now).resyncs, 1);
    }

    #[test]
    fn fit_moves_viewport_to_graph_bounds() {
        let mut s = session(ProtocolVariant::Chunks);
        let now = Instant::now();
        assert!(s.fit(now).is_none());

        s.on_open(now);
        s.on_message(&content(0, &[header(10, 1, 0), header(20, 2, 1)]), now);
        s.fit(now).expect("non-empty graph");
        let e = s.surface().extent();
        assert_eq!(e.x1, 600.0 - 15.0);
        assert_eq!(e.x2, 1200.0 + 15.0);
    }

    #[test]
    fn layout_options_rerun_layout() {
        let mut s = session(ProtocolVariant::Chunks);
        let now = Instant::now();
        s.on_open(now);
        s.on_message(&content(0, &[header(10, 1, 0), header(20, 2, 1)]), now);

        s.set_layout_options(LayoutOptions {
            compact: true,
            ..LayoutOptions::default()
        });
        let n = s.surface().node(&key_of(2)).expect("node");
        assert_eq!(n.position.x, 35.0);
        assert!(s.options().compact);
    }

    #[test]
    fn markers_follow_chunks() {
        let mut c = cfg(ProtocolVariant::Chunks);
        c.chunk_markers = true;
        let surface = MemorySurface::new(Extent::new(0.0, 0.0, 6000.0, 500.0));
        let mut s = GraphSession::new(&c, surface, RecordingTransport::default());
        s.on_open(Instant::now());
        assert_eq!(s.surface().node_count(), 3);
    }

    fn marked_session() -> TestSession {
        let surface = MemorySurface::new(Extent::new(0.0, 0.0, 6000.0, 500.0));
        GraphSession::new(
            &SessionConfig::default(),
            surface,
            RecordingTransport::default(),
        )
    }

    #[test]
    fn each_frame_and_view_change_commits_one_revision() {
        let mut s = marked_session();
        let now = Instant::now();
        s.on_open(now);

        let before = s.surface().revision();
        s.on_message(
            &content(0, &[header(10, 1, 0), header(11, 2, 1), header(12, 3, 2)]),
            now,
        );
        assert_eq!(s.surface().revision(), before + 1);
        assert_eq!(s.stats(now).layouts, 1);

        s.on_message(&content(40, &[header(4000, 9, 0)]), now);
        assert_eq!(s.surface().revision(), before + 1);

        s.pan(12_000.0, now);
        assert_eq!(s.surface().revision(), before + 2);
    }

    #[test]
    fn markers_do_not_bend_the_chain() {
        let mut s = marked_session();
        let now = Instant::now();
        s.on_open(now);
        s.on_message(
            &content(0, &[header(10, 1, 0), header(11, 2, 1), header(12, 3, 2)]),
            now,
        );

        let y = |k| s.surface().node(&key_of(k)).expect("header").position.y;
        assert_eq!(y(1), y(2));
        assert_eq!(y(2), y(3));
        assert_eq!(
            s.surface().node(&key_of(1)).expect("header").position.x,
            600.0
        );
        for chunk in 0..3u32 {
            let marker = s.surface().node(&marker_key(ChunkId(chunk))).expect("marker");
            assert_eq!(marker.position, Point::new(f64::from(chunk) * 6000.0, 0.0));
        }
    }

    #[test]
    fn parent_edge_survives_its_chunk_reloading() {
        let mut s = session(ProtocolVariant::Chunks);
        let now = Instant::now();
        s.on_open(now);
        // parent at the end of chunk 0, child early in chunk 1
        s.on_message(&content(0, &[header(90, 1, 0)]), now);
        s.on_message(&content(1, &[header(110, 2, 1)]), now);
        assert_eq!(s.surface().edge_count(), 1);

        // window moves to chunks 1..=4
        let change = s.pan(12_000.0, now);
        assert_eq!(change.unloaded, vec![ChunkId(0)]);
        assert_eq!(
            keys(&s),
            BTreeSet::from([(key_of(1).to_string(), true), (key_of(2).to_string(), false)])
        );
        assert_eq!(s.surface().edge_count(), 1);

        s.pan(-12_000.0, now);
        assert!(loads(&s.transport_mut().take()).contains(&0));
        s.on_message(&content(0, &[header(90, 1, 0)]), now);
        assert_eq!(
            keys(&s),
            BTreeSet::from([(key_of(1).to_string(), false), (key_of(2).to_string(), false)])
        );
        assert_eq!(s.surface().edge_count(), 1);
        let parent = s.surface().node(&key_of(1)).expect("parent");
        assert_eq!(parent.chunk, Some(ChunkId(0)));
        assert_eq!(parent.slot, Some(90));
    }

    proptest! {
        #[test]
        fn redelivery_matches_single_delivery(order in proptest::collection::vec(0usize..6, 1..24)) {
            // 1 <- 2 <- 3 <- 4 with forks 2 <- 5 and 5 <- 6
            let chain = [
                header(10, 1, 0),
                header(11, 2, 1),
                header(12, 3, 2),
                header(13, 4, 3),
                header(12, 5, 2),
                header(14, 6, 5),
            ];
            let now = Instant::now();

            let mut replayed = session(ProtocolVariant::Chunks);
            replayed.on_open(now);
            for &i in &order {
                replayed.on_message(&content(0, &[chain[i].clone()]), now);
            }

            let unique: BTreeSet<usize> = order.iter().copied().collect();
            let mut once = session(ProtocolVariant::Chunks);
            once.on_open(now);
            for &i in &unique {
                once.on_message(&content(0, &[chain[i].clone()]), now);
            }

            prop_assert_eq!(keys(&replayed), keys(&once));
            let edges = |s: &TestSession| s.surface().edges().map(|e| e.key.clone()).collect::<Vec<_>>();
            prop_assert_eq!(edges(&replayed), edges(&once));
        }
    }
}
