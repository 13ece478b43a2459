use anyhow::{Context, Result};
use chaingraph_core::ProtocolVariant;
use std::ffi::OsString;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedConfig {
    pub listen: String,
    pub mode: ProtocolVariant,
    /// Wall time per slot.
    pub slot: Duration,
    /// Add a competing block every N slots; 0 disables forks.
    pub fork_every: u64,
    /// Slots generated before the first client connects.
    pub history: u64,
    /// Must match the viewer's chunk width divided by its pixels per slot.
    pub slots_per_chunk: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:4000".to_string(),
            mode: ProtocolVariant::Chunks,
            slot: Duration::from_millis(1000),
            fork_every: 9,
            history: 500,
            slots_per_chunk: 100,
        }
    }
}

pub fn parse_args() -> Result<FeedConfig> {
    parse_args_from(std::env::args_os().skip(1))
}

fn next_u64(args: &mut impl Iterator<Item = OsString>, flag: &str) -> Result<u64> {
    let Some(value) = args.next() else {
        anyhow::bail!("{flag} expects a number");
    };
    let value = value.to_string_lossy();
    value
        .parse()
        .with_context(|| format!("{flag}: invalid number {value:?}"))
}

fn parse_args_from<I>(args: I) -> Result<FeedConfig>
where
    I: IntoIterator<Item = OsString>,
{
    let mut cfg = FeedConfig::default();
    let mut args = args.into_iter();

    while let Some(arg) = args.next() {
        if arg == "--listen" {
            let Some(addr) = args.next() else {
                anyhow::bail!("--listen expects host:port");
            };
            cfg.listen = addr.to_string_lossy().into_owned();
        } else if arg == "--mode" {
            let Some(value) = args.next() else {
                anyhow::bail!("--mode expects chunks|events");
            };
            let value = value.to_string_lossy();
            let Some(mode) = ProtocolVariant::parse(&value) else {
                anyhow::bail!("invalid mode: {value} (expected chunks|events)");
            };
            cfg.mode = mode;
        } else if arg == "--slot-ms" {
            cfg.slot = Duration::from_millis(next_u64(&mut args, "--slot-ms")?.max(1));
        } else if arg == "--fork-every" {
            cfg.fork_every = next_u64(&mut args, "--fork-every")?;
        } else if arg == "--history" {
            cfg.history = next_u64(&mut args, "--history")?;
        } else if arg == "--slots-per-chunk" {
            cfg.slots_per_chunk = next_u64(&mut args, "--slots-per-chunk")?.max(1);
        } else {
            anyhow::bail!("unknown argument: {:?}", arg);
        }
    }

    Ok(cfg)
}
