//! # Transport Layer
//!
//! Framed TCP streams and the per-peer outbound connection pool.
//!
//! ## Framing
//!
//! ```text
//! +----------------------+---------------------------+
//! | length: u32 (BE)     | JSON envelope (length B)  |
//! +----------------------+---------------------------+
//! ```
//!
//! Frames larger than the configured limit are refused before the body is
//! read; the stream is then out of sync and must be dropped.
//!
//! ## Connection Pool
//!
//! - At most one pooled connection per peer, bounded by an LRU cache
//! - Each [`PeerConnection`] owns an async mutex held for a whole
//!   request/response exchange, so exchanges on one socket never interleave
//! - A transport failure poisons the handle and removes it from the pool,
//!   but only if the pooled entry is still that same handle. A caller holding
//!   a stale handle can never evict a newer, healthy connection
//! - The next [`ConnectionPool::get_or_dial`] after a removal dials fresh
//!
//! Addresses come from the registry's published endpoints at dial time.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use lru::LruCache;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, trace, warn};

use crate::error::{GatewayError, Result};
use crate::identity::NodeId;
use crate::messages::Envelope;
use crate::registry::{NetworkRole, NodeKind, NodeRegistry};

impl From<NodeKind> for NetworkRole {
    fn from(kind: NodeKind) -> Self {
        match kind {
            NodeKind::Gateway => NetworkRole::Gateway,
            NodeKind::Provider => NetworkRole::Provider,
        }
    }
}

// ============================================================================
// Framed Stream
// ============================================================================

pub struct PeerStream {
    stream: TcpStream,
    max_frame_size: usize,
}

impl PeerStream {
    pub fn new(stream: TcpStream, max_frame_size: usize) -> Self {
        Self {
            stream,
            max_frame_size,
        }
    }

    pub async fn send(&mut self, envelope: &Envelope, timeout: Duration) -> Result<()> {
        let bytes = envelope.to_bytes()?;
        self.send_frame(&bytes, timeout).await
    }

    /// Read one frame and parse it. A body that is not a valid envelope is
    /// `Malformed`; the stream itself stays usable.
    pub async fn receive(&mut self, timeout: Duration) -> Result<Envelope> {
        match self.receive_frame(timeout).await? {
            Some(bytes) => Envelope::from_bytes(&bytes),
            None => Err(GatewayError::Transport("connection closed by peer".to_string())),
        }
    }

    pub async fn send_frame(&mut self, bytes: &[u8], timeout: Duration) -> Result<()> {
        if bytes.len() > self.max_frame_size {
            return Err(GatewayError::Malformed(format!(
                "outbound frame too large: {} bytes (max {})",
                bytes.len(),
                self.max_frame_size
            )));
        }
        let len = bytes.len() as u32;
        tokio::time::timeout(timeout, async {
            self.stream.write_all(&len.to_be_bytes()).await?;
            self.stream.write_all(bytes).await?;
            self.stream.flush().await
        })
        .await??;
        Ok(())
    }

    /// Read one raw frame. `Ok(None)` means the peer closed the stream
    /// between frames.
    pub async fn receive_frame(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        let mut len_buf = [0u8; 4];
        match tokio::time::timeout(timeout, self.stream.read_exact(&mut len_buf)).await? {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_be_bytes(len_buf) as usize;

        if len > self.max_frame_size {
            warn!(
                size = len,
                max = self.max_frame_size,
                "peer sent oversized frame"
            );
            return Err(GatewayError::Transport(format!(
                "frame too large: {} bytes (max {})",
                len, self.max_frame_size
            )));
        }

        let mut body = vec![0u8; len];
        tokio::time::timeout(timeout, self.stream.read_exact(&mut body)).await??;
        trace!(size = len, "frame received");
        Ok(Some(body))
    }
}

// ============================================================================
// Pooled Connection
// ============================================================================

pub struct PeerConnection {
    peer: NodeId,
    stream: Mutex<PeerStream>,
    poisoned: AtomicBool,
}

impl PeerConnection {
    fn new(peer: NodeId, stream: PeerStream) -> Self {
        Self {
            peer,
            stream: Mutex::new(stream),
            poisoned: AtomicBool::new(false),
        }
    }

    pub fn peer(&self) -> &NodeId {
        &self.peer
    }

    /// Take exclusive use of the socket for one exchange.
    pub async fn lock(&self) -> MutexGuard<'_, PeerStream> {
        self.stream.lock().await
    }

    pub fn poison(&self) {
        self.poisoned.store(true, Ordering::Release);
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("peer", &self.peer)
            .field("poisoned", &self.is_poisoned())
            .finish()
    }
}

// ============================================================================
// Pool
// ============================================================================

pub struct ConnectionPool {
    connections: Mutex<LruCache<NodeId, Arc<PeerConnection>>>,
    registry: Arc<NodeRegistry>,
    dial_timeout: Duration,
    max_frame_size: usize,
}

impl ConnectionPool {
    pub fn new(
        registry: Arc<NodeRegistry>,
        capacity: usize,
        dial_timeout: Duration,
        max_frame_size: usize,
    ) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            connections: Mutex::new(LruCache::new(capacity)),
            registry,
            dial_timeout,
            max_frame_size,
        }
    }

    /// Return the pooled connection to `peer`, dialing its registered
    /// endpoint for `kind` when there is none.
    pub async fn get_or_dial(&self, peer: &NodeId, kind: NodeKind) -> Result<Arc<PeerConnection>> {
        {
            let mut pool = self.connections.lock().await;
            if let Some(conn) = pool.get(peer) {
                if !conn.is_poisoned() {
                    return Ok(conn.clone());
                }
                pool.pop(peer);
            }
        }

        let record = self.registry.lookup(kind, peer).await?;
        let addr = record.endpoint(kind.into())?.to_string();
        debug!(peer = %peer, addr = %addr, "dialing peer");

        let stream = tokio::time::timeout(self.dial_timeout, TcpStream::connect(addr.as_str()))
            .await
            .map_err(|_| GatewayError::Transport(format!("dial to {} timed out", addr)))??;
        stream.set_nodelay(true)?;
        let fresh = Arc::new(PeerConnection::new(
            *peer,
            PeerStream::new(stream, self.max_frame_size),
        ));

        let mut pool = self.connections.lock().await;
        if let Some(existing) = pool.get(peer)
            && !existing.is_poisoned()
        {
            // Lost a dial race; the fresh socket is dropped.
            return Ok(existing.clone());
        }
        pool.put(*peer, fresh.clone());
        Ok(fresh)
    }

    /// Poison `handle` and drop it from the pool if it is still the pooled
    /// connection for `peer`.
    pub async fn deregister(&self, peer: &NodeId, handle: &Arc<PeerConnection>) {
        handle.poison();
        let mut pool = self.connections.lock().await;
        if let Some(current) = pool.peek(peer)
            && Arc::ptr_eq(current, handle)
        {
            pool.pop(peer);
            debug!(peer = %peer, "deregistered connection");
        }
    }

    pub async fn is_pooled(&self, peer: &NodeId) -> bool {
        self.connections.lock().await.contains(peer)
    }

    pub async fn len(&self) -> usize {
        self.connections.lock().await.len()
    }
}
