use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::graph::chunks::ViewChange;

const RATE_WINDOW: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionStats {
    pub frames: u64,
    pub records_applied: u64,
    pub records_ignored: u64,
    pub resyncs: u64,
    pub dropped_frames: u64,
    pub chunk_loads: u64,
    pub chunk_refreshes: u64,
    pub chunk_unloads: u64,
    pub aborted_views: u64,
    pub layouts: u64,
    pub reconnects: u64,
    pub nodes: usize,
    pub edges: usize,
    pub chunks: usize,
    pub frame_rate: f32,
    #[serde(skip)]
    frame_window: VecDeque<Instant>,
}

impl SessionStats {
    pub(crate) fn on_frame(&mut self, now: Instant) {
        self.frames += 1;
        self.frame_window.push_back(now);
        self.trim(now);
    }

    fn trim(&mut self, now: Instant) {
        while let Some(front) = self.frame_window.front() {
            if now.saturating_duration_since(*front) > RATE_WINDOW {
                self.frame_window.pop_front();
            } else {
                break;
            }
        }
    }

    pub(crate) fn on_view(&mut self, change: &ViewChange) {
        if change.aborted() {
            self.aborted_views += 1;
        }
        self.chunk_loads += change.loaded.len() as u64;
        self.chunk_refreshes += change.refreshed.len() as u64;
        self.chunk_unloads += change.unloaded.len() as u64;
    }

    pub fn tick(&mut self, now: Instant) {
        self.trim(now);
        self.frame_rate = self.frame_window.len() as f32 / RATE_WINDOW.as_secs_f32();
    }

    pub fn report(&self) {
        tracing::info!(
            frames = self.frames,
            frame_rate = self.frame_rate,
            applied = self.records_applied,
            ignored = self.records_ignored,
            resyncs = self.resyncs,
            dropped = self.dropped_frames,
            chunks = self.chunks,
            loads = self.chunk_loads,
            refreshes = self.chunk_refreshes,
            unloads = self.chunk_unloads,
            nodes = self.nodes,
            edges = self.edges,
            "session stats"
        );
    }
}
