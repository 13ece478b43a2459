use anyhow::Context;
use serde::Serialize;
use std::fs;
use std::path::Path;

use crate::graph::{Edge, Extent, Node, Surface};
use crate::net::Transport;
use crate::session::GraphSession;

#[derive(Debug, Serialize)]
pub struct Snapshot<'a> {
    pub cursor: u32,
    pub viewport: Extent,
    pub chunks: Vec<u32>,
    pub nodes: Vec<&'a Node>,
    pub edges: Vec<&'a Edge>,
}

pub fn snapshot<S: Surface, T: Transport>(session: &GraphSession<S, T>) -> Snapshot<'_> {
    let surface = session.surface();
    Snapshot {
        cursor: session.cursor().0,
        viewport: surface.extent(),
        chunks: session.chunks().ids().map(|c| c.0).collect(),
        nodes: surface.nodes().collect(),
        edges: surface.edges().collect(),
    }
}

pub fn write_snapshot(path: &Path, snapshot: &Snapshot<'_>) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create snapshot directory {}", parent.display()))?;
    }
    let data = serde_json::to_vec_pretty(snapshot).context("failed to serialize snapshot")?;
    fs::write(path, data).with_context(|| format!("failed to write snapshot {}", path.display()))?;
    tracing::debug!(
        path = %path.display(),
        nodes = snapshot.nodes.len(),
        edges = snapshot.edges.len(),
        "snapshot written"
    );
    Ok(())
}
