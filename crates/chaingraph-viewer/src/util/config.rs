use anyhow::Context;
use chaingraph_core::{LayoutOptions, ProtocolVariant};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::graph::{Extent, TimeAxis};
use crate::session::SessionConfig;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InitialView {
    pub x: f64,
    pub width: f64,
    pub height: f64,
}

impl Default for InitialView {
    fn default() -> Self {
        Self {
            x: 0.0,
            width: 6000.0,
            height: 800.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    pub server_addr: String,
    pub protocol: ProtocolVariant,
    pub pixels_per_second: f64,
    pub seconds_per_slot: f64,
    pub chunk_width: f64,
    pub unload_ratio: f64,
    pub chunk_update_delay_ms: u64,
    pub max_chunks_in_view: u32,
    pub heartbeat_ms: u64,
    pub reconnect_ms: u64,
    // Viewport drift to the right; 0 keeps it still.
    pub follow_px_per_sec: f64,
    pub auto_layout: bool,
    pub chunk_markers: bool,
    pub stats_interval_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_path: Option<PathBuf>,
    pub view: InitialView,
    pub layout: LayoutOptions,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        let pixels_per_second = 10.0;
        Self {
            server_addr: "127.0.0.1:4000".to_string(),
            protocol: ProtocolVariant::Chunks,
            pixels_per_second,
            seconds_per_slot: 6.0,
            chunk_width: 600.0 * pixels_per_second,
            unload_ratio: 1.3,
            chunk_update_delay_ms: 100,
            max_chunks_in_view: 10,
            heartbeat_ms: 1000,
            reconnect_ms: 1000,
            follow_px_per_sec: 0.0,
            auto_layout: true,
            chunk_markers: true,
            stats_interval_secs: 10,
            snapshot_path: None,
            view: InitialView::default(),
            layout: LayoutOptions::default(),
        }
    }
}

impl ViewerConfig {
    pub fn to_session_config(&self) -> SessionConfig {
        SessionConfig {
            variant: self.protocol,
            axis: TimeAxis {
                pixels_per_second: self.pixels_per_second,
                seconds_per_slot: self.seconds_per_slot,
                chunk_width: self.chunk_width,
            },
            unload_ratio: self.unload_ratio,
            update_delay: Duration::from_millis(self.chunk_update_delay_ms),
            max_chunks_in_view: self.max_chunks_in_view,
            heartbeat: Duration::from_millis(self.heartbeat_ms),
            layout: self.layout,
            auto_layout: self.auto_layout,
            chunk_markers: self.chunk_markers,
        }
    }

    pub fn initial_extent(&self) -> Extent {
        let half = self.view.height / 2.0;
        Extent::new(self.view.x, -half, self.view.x + self.view.width, half)
    }

    pub fn apply_args(&mut self, args: &ViewerArgs) {
        if let Some(addr) = &args.addr {
            self.server_addr = addr.clone();
        }
        if let Some(protocol) = args.protocol {
            self.protocol = protocol;
        }
        if let Some(path) = &args.export {
            self.snapshot_path = Some(path.clone());
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ViewerArgs {
    pub addr: Option<String>,
    pub protocol: Option<ProtocolVariant>,
    pub export: Option<PathBuf>,
    pub write_config: bool,
}

pub fn parse_args() -> anyhow::Result<ViewerArgs> {
    parse_args_from(std::env::args_os().skip(1))
}

fn parse_args_from<I>(args: I) -> anyhow::Result<ViewerArgs>
where
    I: IntoIterator<Item = OsString>,
{
    let mut out = ViewerArgs::default();
    let mut args = args.into_iter();

    while let Some(arg) = args.next() {
        if arg == "--addr" {
            let Some(addr) = args.next() else {
                anyhow::bail!("--addr expects host:port");
            };
            out.addr = Some(addr.to_string_lossy().into_owned());
        } else if arg == "--mode" {
            let Some(value) = args.next() else {
                anyhow::bail!("--mode expects chunks|events");
            };
            let value = value.to_string_lossy();
            let Some(mode) = ProtocolVariant::parse(&value) else {
                anyhow::bail!("invalid mode: {value} (expected chunks|events)");
            };
            out.protocol = Some(mode);
        } else if arg == "--export" {
            let Some(path) = args.next() else {
                anyhow::bail!("--export expects a path");
            };
            out.export = Some(PathBuf::from(path));
        } else if arg == "--write-config" {
            out.write_config = true;
        } else {
            anyhow::bail!("unknown argument: {:?}", arg);
        }
    }
    Ok(out)
}

fn config_file_path() -> Option<PathBuf> {
    let proj = ProjectDirs::from("", "", "chaingraph")?;
    Some(proj.config_dir().join("viewer.toml"))
}

pub fn load_or_default() -> ViewerConfig {
    let Some(path) = config_file_path() else {
        return ViewerConfig::default();
    };
    load_or_default_from_path(&path)
}

fn load_or_default_from_path(path: &Path) -> ViewerConfig {
    let Ok(contents) = fs::read_to_string(path) else {
        return ViewerConfig::default();
    };
    toml::from_str(&contents).unwrap_or_else(|e| {
        tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable viewer config");
        ViewerConfig::default()
    })
}

pub fn save(cfg: &ViewerConfig) -> anyhow::Result<()> {
    let Some(path) = config_file_path() else {
        return Err(anyhow::anyhow!("no config directory available"));
    };
    save_to_path(cfg, &path)
}

fn save_to_path(cfg: &ViewerConfig, path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory {}", parent.display()))?;
    }
    let data = toml::to_string_pretty(cfg).context("failed to serialize viewer config")?;
    fs::write(path, data)
        .with_context(|| format!("failed to write viewer config {}", path.display()))?;
    Ok(())
}
