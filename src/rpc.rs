//! # RPC Layer
//!
//! Request/response exchanges over pooled TCP connections, and the accept
//! loop serving inbound envelopes.
//!
//! ## Client Side
//!
//! [`PeerClient`] implements [`GatewayRpc`] and [`ProviderRpc`]. One exchange:
//!
//! 1. Sign the request with the installed key (`NotInitialised` without one)
//! 2. Resolve the peer's registered signing key (`NotFound` / `Authentication`)
//! 3. Take the peer's pooled connection and hold its lock until done
//! 4. Send, receive, verify the response against the peer's key
//! 5. On a verified "switch protocol" reply naming a version we speak,
//!    re-stamp and re-sign the request and retry once on the same socket
//! 6. On any transport failure, deregister the connection
//!
//! Authentication failures discard the response but keep the connection.
//!
//! ## Server Side
//!
//! [`serve`] accepts connections and spawns [`handle_connection`] per socket.
//! Frames are handed to the [`Router`]; a `None` from the router means the
//! request is dropped without a reply.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tracing::{debug, info, trace, warn};

use crate::cid::ContentId;
use crate::error::{GatewayError, Result};
use crate::gateway::GatewayContext;
use crate::handlers::Router;
use crate::identity::{NodeId, PublicKey};
use crate::messages::{
    Envelope, GatewayDhtDiscoverRequest, ListOffersRequest, Message, PingRequest, PingResponse,
};
use crate::offer::CidGroupOffer;
use crate::protocols::{GatewayRpc, ProviderRpc};
use crate::registry::NodeKind;
use crate::transport::{PeerConnection, PeerStream};

/// Outbound client for gateway and provider peers.
#[derive(Clone)]
pub struct PeerClient {
    ctx: Arc<GatewayContext>,
}

impl PeerClient {
    pub fn new(ctx: Arc<GatewayContext>) -> Self {
        Self { ctx }
    }

    /// Signed request, verified response.
    async fn exchange(
        &self,
        peer: &NodeId,
        kind: NodeKind,
        request: &Message,
        read_timeout: Duration,
    ) -> Result<Envelope> {
        let (keypair, key_version) = self.ctx.keys.current().await?;
        let versions = &self.ctx.config.protocol;
        let mut envelope = request.to_signed_envelope(versions, &keypair, key_version)?;
        let peer_key = self.ctx.registry.signing_key(kind, peer).await?;

        let conn = self.ctx.pool.get_or_dial(peer, kind).await?;
        let result = {
            let mut stream = conn.lock().await;
            let write_timeout = self.ctx.config.tcp_inactivity_timeout;
            let mut response =
                round_trip(&mut stream, &envelope, &peer_key, write_timeout, read_timeout).await;

            if let Ok(reply) = &response
                && let Ok(Message::ProtocolChange(change)) = reply.decode()
                && change.desired_version != envelope.protocol_version
                && versions.speaks(change.desired_version)
            {
                debug!(
                    peer = %peer,
                    from = envelope.protocol_version,
                    to = change.desired_version,
                    "peer requested protocol switch, retrying once"
                );
                envelope.protocol_version = change.desired_version;
                envelope.sign(&keypair, key_version)?;
                response =
                    round_trip(&mut stream, &envelope, &peer_key, write_timeout, read_timeout)
                        .await;
            }
            response
        };

        self.settle(peer, &conn, result).await
    }

    /// One-way signed message; no reply is read.
    async fn notify(&self, peer: &NodeId, kind: NodeKind, envelope: &Envelope) -> Result<()> {
        let conn = self.ctx.pool.get_or_dial(peer, kind).await?;
        let result = {
            let mut stream = conn.lock().await;
            stream
                .send(envelope, self.ctx.config.tcp_inactivity_timeout)
                .await
        };
        self.settle(peer, &conn, result).await
    }

    async fn settle<T>(&self, peer: &NodeId, conn: &Arc<PeerConnection>, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            match e {
                GatewayError::Transport(_) => {
                    debug!(peer = %peer, error = %e, "transport failure, deregistering connection");
                    self.ctx.pool.deregister(peer, conn).await;
                }
                GatewayError::Authentication(_) => {
                    warn!(peer = %peer, error = %e, "discarding unauthenticated response");
                }
                _ => trace!(peer = %peer, error = %e, "exchange failed"),
            }
        }
        result
    }
}

async fn round_trip(
    stream: &mut PeerStream,
    request: &Envelope,
    peer_key: &PublicKey,
    write_timeout: Duration,
    read_timeout: Duration,
) -> Result<Envelope> {
    stream.send(request, write_timeout).await?;
    let response = stream.receive(read_timeout).await?;
    response.verify(peer_key)?;
    Ok(response)
}

/// Decode a verified response, turning the peer's error replies into errors.
fn into_reply(envelope: &Envelope) -> Result<Message> {
    match envelope.decode()? {
        Message::InvalidMessage(invalid) => Err(GatewayError::Malformed(format!(
            "peer rejected request: {}",
            invalid.reason
        ))),
        Message::ProtocolMismatch(_) | Message::ProtocolChange(_) => {
            Err(GatewayError::ProtocolMismatch {
                peer_version: envelope.protocol_version,
                peer_supported: envelope.protocol_supported.clone(),
            })
        }
        other => Ok(other),
    }
}

fn unexpected(message: &Message) -> GatewayError {
    GatewayError::Malformed(format!("unexpected reply {:?}", message.message_type()))
}

#[async_trait]
impl GatewayRpc for PeerClient {
    async fn ping(&self, gateway: &NodeId, ttl: i64) -> Result<PingResponse> {
        let nonce: i64 = rand::random();
        let request = Message::GatewayPingRequest(PingRequest {
            gateway_id: self.ctx.gateway_id(),
            nonce,
            ttl,
        });
        let timeout = self.ctx.config.tcp_inactivity_timeout;
        let envelope = self.exchange(gateway, NodeKind::Gateway, &request, timeout).await?;
        match into_reply(&envelope)? {
            Message::GatewayPingResponse(pong) if pong.nonce == nonce => Ok(pong),
            Message::GatewayPingResponse(_) => {
                Err(GatewayError::Malformed("ping nonce mismatch".to_string()))
            }
            other => Err(unexpected(&other)),
        }
    }

    async fn dht_discover(
        &self,
        gateway: &NodeId,
        cid: &ContentId,
        nonce: i64,
        ttl: i64,
    ) -> Result<Envelope> {
        let request = Message::GatewayDhtDiscoverRequest(GatewayDhtDiscoverRequest {
            gateway_id: self.ctx.gateway_id(),
            cid: cid.clone(),
            nonce,
            ttl,
        });
        let timeout = self.ctx.config.tcp_inactivity_timeout;
        let envelope = self.exchange(gateway, NodeKind::Gateway, &request, timeout).await?;
        match into_reply(&envelope)? {
            Message::GatewayDhtDiscoverResponse(resp) if resp.nonce == nonce => Ok(envelope),
            Message::GatewayDhtDiscoverResponse(_) => {
                Err(GatewayError::Malformed("discover nonce mismatch".to_string()))
            }
            other => Err(unexpected(&other)),
        }
    }
}

#[async_trait]
impl ProviderRpc for PeerClient {
    async fn list_offers(
        &self,
        provider: &NodeId,
        cid_min: &ContentId,
        cid_max: &ContentId,
    ) -> Result<Vec<CidGroupOffer>> {
        let request = Message::GatewayListOffersRequest(ListOffersRequest {
            gateway_id: self.ctx.gateway_id(),
            cid_min: cid_min.clone(),
            cid_max: cid_max.clone(),
        });
        let timeout = self.ctx.config.long_tcp_inactivity_timeout;
        let envelope = self.exchange(provider, NodeKind::Provider, &request, timeout).await?;
        match into_reply(&envelope)? {
            Message::GatewayListOffersResponse(resp) => Ok(resp.offers),
            other => Err(unexpected(&other)),
        }
    }

    async fn acknowledge_offers(&self, provider: &NodeId, ack: Envelope) -> Result<()> {
        self.notify(provider, NodeKind::Provider, &ack).await
    }
}

// ============================================================================
// Server
// ============================================================================

/// Accept loop. Runs until the listener fails.
pub async fn serve<G: GatewayRpc>(listener: TcpListener, router: Arc<Router<G>>) -> Result<()> {
    let local = listener.local_addr()?;
    info!(addr = %local, "gateway listening");
    loop {
        let (stream, remote) = listener.accept().await?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(remote = %remote, error = %e, "failed to set TCP_NODELAY");
        }
        let router = router.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, remote, router).await {
                debug!(remote = %remote, error = %e, "connection closed with error");
            }
        });
    }
}

/// Serve one inbound socket until the peer closes it or goes idle.
pub async fn handle_connection<G: GatewayRpc>(
    stream: tokio::net::TcpStream,
    remote: SocketAddr,
    router: Arc<Router<G>>,
) -> Result<()> {
    let config = &router.context().config;
    let mut stream = PeerStream::new(stream, config.max_frame_size);
    debug!(remote = %remote, "inbound connection");

    loop {
        let Some(frame) = stream.receive_frame(config.idle_connection_timeout).await? else {
            debug!(remote = %remote, "peer closed connection");
            return Ok(());
        };
        match router.handle_bytes(&frame).await {
            Some(reply) => {
                stream
                    .send_frame(&reply, config.tcp_inactivity_timeout)
                    .await?
            }
            None => trace!(remote = %remote, "request dropped without reply"),
        }
    }
}
