use anyhow::{Context, Result};
use chaingraph_core::wire::MSG_STATUS;
use chaingraph_core::{
    decode_request, encode_content_update, encode_event_batch, ChunkId, ContentId, EventIndex,
    HeaderData, KnownIndices, ProtocolVariant, Request,
};
use futures_util::{SinkExt, StreamExt};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, RwLock};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::chain::Chain;

/// Records per outbound event batch.
const MAX_BATCH: usize = 128;

pub struct Feed {
    chain: RwLock<Chain>,
    mode: ProtocolVariant,
    slots_per_chunk: u64,
}

impl Feed {
    pub fn new(chain: Chain, mode: ProtocolVariant, slots_per_chunk: u64) -> Self {
        Self {
            chain: RwLock::new(chain),
            mode,
            slots_per_chunk: slots_per_chunk.max(1),
        }
    }

    fn chunk_of(&self, slot: u64) -> ChunkId {
        ChunkId(u32::try_from(slot / self.slots_per_chunk).unwrap_or(u32::MAX))
    }
}

fn status_frame() -> Vec<u8> {
    let mut out = vec![MSG_STATUS];
    out.extend_from_slice(b"chaingraph-feed");
    out
}

fn headers_payload<'a>(headers: impl IntoIterator<Item = &'a HeaderData>) -> Vec<u8> {
    let mut out = Vec::new();
    for h in headers {
        h.encode_into(&mut out);
    }
    out
}

/// Headers of `chunk` the client does not list as known. `None` when there
/// is nothing to send.
fn load_response(
    chain: &Chain,
    chunk: ChunkId,
    known: &KnownIndices,
    slots_per_chunk: u64,
) -> Option<Vec<u8>> {
    let first = u64::from(chunk.0) * slots_per_chunk;
    let last = first + slots_per_chunk - 1;
    let payload = headers_payload(
        chain
            .in_slots(first, last)
            .filter(|h| !known.contains(h.header.slot)),
    );
    if payload.is_empty() {
        return None;
    }
    Some(encode_content_update(ContentId::BLOCK_HEADERS, chunk, &payload))
}

fn event_batches(chain: &Chain, from: usize) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    for (n, part) in chain.since(from).chunks(MAX_BATCH).enumerate() {
        let start = u32::try_from(from + n * MAX_BATCH).unwrap_or(u32::MAX);
        let encoded: Vec<Vec<u8>> = part.iter().map(HeaderData::encode).collect();
        let records: Vec<(ContentId, &[u8])> = encoded
            .iter()
            .map(|p| (ContentId::BLOCK_HEADERS, p.as_slice()))
            .collect();
        out.push(encode_event_batch(EventIndex(start), &records));
    }
    out
}

/// What one client has asked for so far.
#[derive(Debug, Default)]
struct Subscriber {
    chunks: BTreeSet<ChunkId>,
    /// Chain length already pushed.
    seen: usize,
}

impl Subscriber {
    async fn on_request(&mut self, feed: &Feed, bytes: &[u8]) -> Vec<Vec<u8>> {
        let request = match decode_request(bytes, feed.mode) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed request");
                return Vec::new();
            }
        };
        let chain = feed.chain.read().await;
        match request {
            Request::Load {
                content,
                chunk,
                known,
            } => {
                if content != ContentId::BLOCK_HEADERS {
                    tracing::warn!(content = %content, "unsupported content requested");
                    return Vec::new();
                }
                self.chunks.insert(chunk);
                self.seen = chain.len();
                tracing::debug!(chunk = %chunk, known = known.known.len(), "load request");
                load_response(&chain, chunk, &known, feed.slots_per_chunk)
                    .into_iter()
                    .collect()
            }
            Request::Cursor(cursor) => {
                let from = cursor.0 as usize;
                self.seen = chain.len().max(from);
                tracing::debug!(cursor = cursor.0, head = chain.len(), "cursor push");
                event_batches(&chain, from)
            }
        }
    }

    async fn on_growth(&mut self, feed: &Feed) -> Vec<Vec<u8>> {
        let chain = feed.chain.read().await;
        let fresh = chain.since(self.seen);
        let out = match feed.mode {
            ProtocolVariant::Events => event_batches(&chain, self.seen),
            ProtocolVariant::Chunks => {
                let mut by_chunk: BTreeMap<ChunkId, Vec<&HeaderData>> = BTreeMap::new();
                for h in fresh {
                    let chunk = feed.chunk_of(h.header.slot);
                    if self.chunks.contains(&chunk) {
                        by_chunk.entry(chunk).or_default().push(h);
                    }
                }
                by_chunk
                    .into_iter()
                    .map(|(chunk, hs)| {
                        encode_content_update(ContentId::BLOCK_HEADERS, chunk, &headers_payload(hs))
                    })
                    .collect()
            }
        };
        self.seen = self.seen.max(chain.len());
        out
    }
}

async fn serve_conn(
    feed: Arc<Feed>,
    stream: TcpStream,
    mut growth: broadcast::Receiver<usize>,
) -> Result<()> {
    stream.set_nodelay(true).context("set TCP_NODELAY")?;
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
    framed.send(tokio_util::bytes::Bytes::from(status_frame())).await.context("send status")?;

    let mut sub = Subscriber {
        seen: feed.chain.read().await.len(),
        ..Subscriber::default()
    };

    loop {
        let out = tokio::select! {
            frame = framed.next() => match frame {
                Some(bytes) => {
                    let bytes = bytes.context("read request")?;
                    sub.on_request(&feed, &bytes).await
                }
                None => return Ok(()),
            },
            update = growth.recv() => match update {
                Ok(_) | Err(RecvError::Lagged(_)) => sub.on_growth(&feed).await,
                Err(RecvError::Closed) => return Ok(()),
            },
        };
        for frame in out {
            framed.send(tokio_util::bytes::Bytes::from(frame)).await.context("send frame")?;
        }
    }
}

/// Advances the chain one slot per `slot` and announces the new length.
async fn produce(feed: Arc<Feed>, slot: Duration, growth: broadcast::Sender<usize>) {
    let mut ticker = tokio::time::interval(slot);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let (added, len, head) = {
            let mut chain = feed.chain.write().await;
            let added = chain.advance();
            (added, chain.len(), chain.head_slot())
        };
        if added > 0 {
            tracing::trace!(slot = head, headers = len, "new slot");
            let _ = growth.send(len);
        }
    }
}

pub async fn serve(listener: TcpListener, feed: Arc<Feed>, slot: Duration) -> Result<()> {
    let (growth, _) = broadcast::channel(64);
    tokio::spawn(produce(Arc::clone(&feed), slot, growth.clone()));

    loop {
        let (stream, peer) = listener.accept().await.context("accept")?;
        tracing::info!(%peer, "viewer connected");
        let feed = Arc::clone(&feed);
        let rx = growth.subscribe();
        tokio::spawn(async move {
            match serve_conn(feed, stream, rx).await {
                Ok(()) => tracing::info!(%peer, "viewer disconnected"),
                Err(e) => tracing::warn!(%peer, error = %format!("{e:#}"), "connection failed"),
            }
        });
    }
}
