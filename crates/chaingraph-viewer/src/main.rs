use anyhow::Result;
use chaingraph_viewer::export;
use chaingraph_viewer::graph::MemorySurface;
use chaingraph_viewer::net::spawn_connection;
use chaingraph_viewer::util::config::{self, ViewerConfig};
use chaingraph_viewer::GraphSession;
use crossbeam_channel::{never, select, tick};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

const PAN_STEP: Duration = Duration::from_millis(100);

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn main() -> Result<()> {
    init_tracing();
    let args = config::parse_args()?;
    let mut cfg: ViewerConfig = config::load_or_default();
    cfg.apply_args(&args);
    if args.write_config {
        config::save(&cfg)?;
        tracing::info!("viewer config written");
        return Ok(());
    }
    tracing::info!(
        addr = %cfg.server_addr,
        protocol = ?cfg.protocol,
        chunk_width = cfg.chunk_width,
        "starting viewer"
    );

    let (tx, rx) = crossbeam_channel::unbounded();
    let conn = spawn_connection(
        cfg.server_addr.clone(),
        Duration::from_millis(cfg.reconnect_ms),
        tx,
    )?;

    let surface = MemorySurface::new(cfg.initial_extent());
    let mut session = GraphSession::new(&cfg.to_session_config(), surface, conn.transport());

    let pan = if cfg.follow_px_per_sec > 0.0 {
        tick(PAN_STEP)
    } else {
        never()
    };
    let pan_dx = cfg.follow_px_per_sec * PAN_STEP.as_secs_f64();
    let report = tick(Duration::from_secs(cfg.stats_interval_secs.max(1)));

    loop {
        let heartbeat = session.heartbeat().receiver();
        select! {
            recv(rx) -> msg => match msg {
                Ok(ev) => session.handle(ev, Instant::now()),
                Err(_) => break,
            },
            recv(heartbeat) -> _ => session.on_heartbeat(),
            recv(pan) -> _ => {
                session.pan(pan_dx, Instant::now());
            }
            recv(report) -> _ => {
                session.stats(Instant::now()).report();
                if let Some(path) = &cfg.snapshot_path {
                    if let Err(e) = export::write_snapshot(path, &export::snapshot(&session)) {
                        tracing::warn!(error = %format!("{e:#}"), "snapshot export failed");
                    }
                }
            }
        }
    }

    tracing::info!("network thread exited");
    Ok(())
}
