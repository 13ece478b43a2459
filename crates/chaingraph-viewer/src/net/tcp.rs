use crate::net::{Incoming, Transport};
use anyhow::{Context, Result};
use crossbeam_channel::Sender;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

pub struct ConnectionHandle {
    peer: String,
    out: mpsc::UnboundedSender<Vec<u8>>,
    open: Arc<AtomicBool>,
}

impl ConnectionHandle {
    pub fn transport(&self) -> NetTransport {
        NetTransport {
            peer: self.peer.clone(),
            out: self.out.clone(),
            open: Arc::clone(&self.open),
        }
    }
}

pub struct NetTransport {
    peer: String,
    out: mpsc::UnboundedSender<Vec<u8>>,
    open: Arc<AtomicBool>,
}

impl Transport for NetTransport {
    fn send(&mut self, frame: Vec<u8>) {
        if !self.open.load(Ordering::SeqCst) {
            tracing::debug!(peer = %self.peer, len = frame.len(), "not connected, dropping frame");
            return;
        }
        if self.out.send(frame).is_err() {
            tracing::warn!(peer = %self.peer, "network thread gone, dropping frame");
        }
    }
}

// Connects to `addr` on a dedicated thread and keeps reconnecting every
// `retry` until the receiving side of `tx` is dropped.
pub fn spawn_connection(
    addr: String,
    retry: Duration,
    tx: Sender<Incoming>,
) -> Result<ConnectionHandle> {
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let open = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&open);
    let peer = addr.clone();

    std::thread::Builder::new()
        .name("chaingraph-net".into())
        .spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    let _ = tx.send(Incoming::error(addr, format!("tokio runtime: {e}")));
                    return;
                }
            };
            rt.block_on(run(addr, retry, tx, out_rx, flag));
        })
        .context("spawn network thread")?;

    Ok(ConnectionHandle {
        peer,
        out: out_tx,
        open,
    })
}

async fn run(
    addr: String,
    retry: Duration,
    tx: Sender<Incoming>,
    mut out_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    open: Arc<AtomicBool>,
) {
    loop {
        if let Err(e) = connect_once(&addr, &tx, &mut out_rx, &open).await {
            if tx.send(Incoming::error(addr.clone(), format!("{e:#}"))).is_err() {
                return;
            }
        }
        if open.swap(false, Ordering::SeqCst) && tx.send(Incoming::closed(addr.clone())).is_err() {
            return;
        }

        // Frames queued for the old connection refer to stale state.
        loop {
            match out_rx.try_recv() {
                Ok(_) => continue,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return,
            }
        }

        tokio::time::sleep(retry).await;
    }
}

async fn connect_once(
    addr: &str,
    tx: &Sender<Incoming>,
    out_rx: &mut mpsc::UnboundedReceiver<Vec<u8>>,
    open: &AtomicBool,
) -> Result<()> {
    let stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("connect {addr}"))?;
    stream.set_nodelay(true).context("set TCP_NODELAY")?;

    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());

    open.store(true, Ordering::SeqCst);
    if tx.send(Incoming::opened(addr.to_string())).is_err() {
        return Ok(());
    }

    loop {
        tokio::select! {
            frame = framed.next() => match frame {
                Some(bytes) => {
                    let bytes = bytes.context("read frame")?;
                    if tx.send(Incoming::frame(addr.to_string(), bytes.to_vec())).is_err() {
                        return Ok(());
                    }
                }
                None => return Ok(()),
            },
            out = out_rx.recv() => match out {
                Some(frame) => framed.send(tokio_util::bytes::Bytes::from(frame)).await.context("write frame")?,
                None => return Ok(()),
            },
        }
    }
}
