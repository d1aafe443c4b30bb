//! # Inbound Message Router
//!
//! Every inbound envelope, whether from a TCP frame or an HTTP collaborator,
//! goes through [`Router::handle_envelope`]:
//!
//! 1. Protocol negotiation against the local version set
//! 2. Body decode into the closed [`Message`] type
//! 3. Per-type handling (one arm per variant)
//! 4. Reply stamped with our versions, signed when a key is installed
//!
//! ## Authentication
//!
//! | Sender | Requests | Check |
//! |--------|----------|-------|
//! | Client | standard and DHT discovery | none |
//! | Gateway | ping, DHT discovery | signature against the registry key of `gateway_id` |
//! | Admin | key install, enrollment, reputation | admin listener only |
//!
//! ## Surfaces
//!
//! A router serves one [`Surface`]. The peer surface (clients and gateways)
//! refuses every admin message; the admin surface is bound to its own
//! listener and refuses everything else. Reputation reads and writes need
//! installed key material, key installation does not.
//!
//! Any handling error becomes an invalid-message reply. A `None` reply means
//! the request is dropped silently (discovery past its TTL).

use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::discovery::{discover_local, dht_discover};
use crate::error::{GatewayError, Result};
use crate::gateway::GatewayContext;
use crate::identity::{KeyVersion, Keypair, NodeId, now_secs};
use crate::messages::{
    EnrollAck, Envelope, InitialiseKeyResponse, Message, Negotiation, PingResponse,
    ProtocolChange, ProtocolMismatch, ReputationResponse,
};
use crate::protocols::GatewayRpc;
use crate::registry::{NodeKind, RegisteredNode};

/// Which listener a router answers on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Surface {
    /// Client discovery and gateway-to-gateway traffic.
    Peer,
    /// Operator channel for key installation, enrollment and reputation.
    Admin,
}

fn is_admin(message: &Message) -> bool {
    matches!(
        message,
        Message::AdminInitialiseKeyRequest(_)
            | Message::AdminInitialiseKeyResponse(_)
            | Message::AdminEnrollGatewayRequest(_)
            | Message::AdminEnrollGatewayResponse(_)
            | Message::AdminEnrollProviderRequest(_)
            | Message::AdminEnrollProviderResponse(_)
            | Message::AdminGetReputationRequest(_)
            | Message::AdminGetReputationResponse(_)
            | Message::AdminSetReputationRequest(_)
            | Message::AdminSetReputationResponse(_)
    )
}

pub struct Router<G: GatewayRpc> {
    ctx: Arc<GatewayContext>,
    gateways: Arc<G>,
    surface: Surface,
}

impl<G: GatewayRpc> Router<G> {
    pub fn new(ctx: Arc<GatewayContext>, gateways: Arc<G>, surface: Surface) -> Self {
        Self {
            ctx,
            gateways,
            surface,
        }
    }

    pub fn surface(&self) -> Surface {
        self.surface
    }

    pub fn context(&self) -> &Arc<GatewayContext> {
        &self.ctx
    }

    /// Handle one serialized envelope and return the serialized reply.
    pub async fn handle_bytes(&self, bytes: &[u8]) -> Option<Vec<u8>> {
        let reply = match Envelope::from_bytes(bytes) {
            Ok(envelope) => self.handle_envelope(envelope).await?,
            Err(e) => {
                debug!(error = %e, "undecodable envelope");
                self.reply(Message::invalid(e.to_string())).await?
            }
        };
        match reply.to_bytes() {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!(error = %e, "failed to serialize reply");
                None
            }
        }
    }

    pub async fn handle_envelope(&self, envelope: Envelope) -> Option<Envelope> {
        let versions = &self.ctx.config.protocol;
        match versions.negotiate(&envelope) {
            Negotiation::Accept => {}
            Negotiation::SwitchTo(desired_version) => {
                debug!(
                    peer_version = envelope.protocol_version,
                    desired_version, "asking sender to switch protocol"
                );
                return self
                    .reply(Message::ProtocolChange(ProtocolChange { desired_version }))
                    .await;
            }
            Negotiation::Unreconciled(common) => {
                let reason = format!(
                    "common version {} is not the current version {}",
                    common, versions.current
                );
                return self
                    .reply(Message::ProtocolMismatch(ProtocolMismatch { reason }))
                    .await;
            }
            Negotiation::Mismatch => {
                let reason = format!(
                    "no common protocol version with {:?}",
                    envelope.protocol_supported
                );
                return self
                    .reply(Message::ProtocolMismatch(ProtocolMismatch { reason }))
                    .await;
            }
        }

        let message = match envelope.decode() {
            Ok(message) => message,
            Err(e) => {
                debug!(message_type = envelope.message_type, error = %e, "rejecting request");
                return self.reply(Message::invalid(e.to_string())).await;
            }
        };
        let message_type = message.message_type();

        if is_admin(&message) != (self.surface == Surface::Admin) {
            warn!(
                message_type = ?message_type,
                surface = ?self.surface,
                "message refused on this listener"
            );
            return self
                .reply(Message::invalid(format!(
                    "{:?} is not served on the {:?} listener",
                    message_type, self.surface
                )))
                .await;
        }

        match self.dispatch(&envelope, message).await {
            Ok(Some(reply)) => self.reply(reply).await,
            Ok(None) => None,
            Err(e) => {
                debug!(message_type = ?message_type, error = %e, "request failed");
                self.reply(Message::invalid(e.to_string())).await
            }
        }
    }

    async fn dispatch(&self, envelope: &Envelope, message: Message) -> Result<Option<Message>> {
        match message {
            Message::ClientStandardDiscoverRequest(req) => {
                trace!(cid = %req.cid, "handling standard discovery");
                self.require_key().await?;
                if let Some(client) = &req.client_id {
                    self.ctx.reputation.observe(client).await;
                }
                let response = discover_local(&self.ctx, &req.cid, req.nonce, req.ttl).await?;
                Ok(response.map(Message::ClientStandardDiscoverResponse))
            }
            Message::ClientDhtDiscoverRequest(req) => {
                trace!(cid = %req.cid, num_dht = req.num_dht, "handling dht discovery");
                self.require_key().await?;
                if let Some(client) = &req.client_id {
                    self.ctx.reputation.observe(client).await;
                }
                let response = dht_discover(&self.ctx, &self.gateways, &req).await;
                Ok(response.map(Message::ClientDhtDiscoverResponse))
            }
            Message::GatewayPingRequest(req) => {
                self.authenticate_gateway(envelope, &req.gateway_id).await?;
                if now_secs() > req.ttl {
                    return Err(GatewayError::Malformed(format!(
                        "ping from {} expired at {}",
                        req.gateway_id, req.ttl
                    )));
                }
                trace!(from = %req.gateway_id, "answering ping");
                Ok(Some(Message::GatewayPingResponse(PingResponse {
                    nonce: req.nonce,
                    is_alive: true,
                })))
            }
            Message::GatewayDhtDiscoverRequest(req) => {
                self.authenticate_gateway(envelope, &req.gateway_id).await?;
                let response = discover_local(&self.ctx, &req.cid, req.nonce, req.ttl).await?;
                debug!(from = %req.gateway_id, cid = %req.cid, answered = response.is_some(), "gateway dht discovery");
                Ok(response.map(Message::GatewayDhtDiscoverResponse))
            }

            Message::AdminInitialiseKeyRequest(req) => {
                let keypair = Keypair::from_secret_hex(&req.private_key)?;
                self.ctx
                    .install_key(keypair, KeyVersion(req.key_version))
                    .await;
                Ok(Some(Message::AdminInitialiseKeyResponse(
                    InitialiseKeyResponse { success: true },
                )))
            }
            Message::AdminEnrollGatewayRequest(record) => {
                let ack = self.enroll(NodeKind::Gateway, record).await?;
                Ok(Some(Message::AdminEnrollGatewayResponse(ack)))
            }
            Message::AdminEnrollProviderRequest(record) => {
                let ack = self.enroll(NodeKind::Provider, record).await?;
                Ok(Some(Message::AdminEnrollProviderResponse(ack)))
            }
            Message::AdminGetReputationRequest(req) => {
                self.require_key().await?;
                let (reputation, exists) = self.ctx.reputation.get(&req.client_id).await;
                Ok(Some(Message::AdminGetReputationResponse(ReputationResponse {
                    client_id: req.client_id,
                    reputation,
                    exists,
                })))
            }
            Message::AdminSetReputationRequest(req) => {
                self.require_key().await?;
                let exists = self.ctx.reputation.set(&req.client_id, req.reputation).await;
                let (reputation, _) = self.ctx.reputation.get(&req.client_id).await;
                Ok(Some(Message::AdminSetReputationResponse(ReputationResponse {
                    client_id: req.client_id,
                    reputation,
                    exists,
                })))
            }

            // Provider-facing messages: this node is never the provider side.
            Message::GatewayListOffersRequest(_)
            | Message::GatewayListOffersAck(_)
            | Message::ProviderOfferAck(_) => Err(GatewayError::Unsupported(format!(
                "{:?} is served by providers",
                envelope.message_type
            ))),

            // Replies arriving as requests.
            Message::ClientStandardDiscoverResponse(_)
            | Message::ClientDhtDiscoverResponse(_)
            | Message::GatewayPingResponse(_)
            | Message::GatewayListOffersResponse(_)
            | Message::GatewayDhtDiscoverResponse(_)
            | Message::AdminInitialiseKeyResponse(_)
            | Message::AdminEnrollGatewayResponse(_)
            | Message::AdminEnrollProviderResponse(_)
            | Message::AdminGetReputationResponse(_)
            | Message::AdminSetReputationResponse(_)
            | Message::ProtocolChange(_)
            | Message::ProtocolMismatch(_)
            | Message::InvalidMessage(_) => Err(GatewayError::Unsupported(format!(
                "message type {} is not a request",
                envelope.message_type
            ))),
        }
    }

    async fn require_key(&self) -> Result<()> {
        if self.ctx.keys.is_installed().await {
            Ok(())
        } else {
            Err(GatewayError::NotInitialised)
        }
    }

    async fn authenticate_gateway(&self, envelope: &Envelope, gateway: &NodeId) -> Result<()> {
        self.require_key().await?;
        let key = self.ctx.registry.signing_key(NodeKind::Gateway, gateway).await?;
        envelope.verify(&key).inspect_err(|e| {
            warn!(gateway = %gateway, error = %e, "gateway request failed authentication");
        })
    }

    async fn enroll(&self, kind: NodeKind, record: RegisteredNode) -> Result<EnrollAck> {
        let id = record.id()?;
        let outcome = self.ctx.registry.enroll(kind, record).await?;
        let stored = self.ctx.registry.lookup(kind, &id).await?;
        debug!(kind = %kind, node = %id, outcome = ?outcome, "admin enrollment");
        Ok(EnrollAck {
            node: (*stored).clone(),
            outcome,
        })
    }

    /// Stamp a reply with our versions and sign it if we can.
    async fn reply(&self, message: Message) -> Option<Envelope> {
        let versions = &self.ctx.config.protocol;
        let signed = match self.ctx.keys.current().await {
            Ok((keypair, key_version)) => {
                message.to_signed_envelope(versions, &keypair, key_version)
            }
            Err(_) => message.to_envelope(versions),
        };
        match signed {
            Ok(envelope) => Some(envelope),
            Err(e) => {
                warn!(message_type = ?message.message_type(), error = %e, "failed to encode reply");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::cid::ContentId;
    use crate::config::GatewayConfig;
    use crate::messages::{
        DiscoverResponse, GetReputationRequest, InitialiseKeyRequest, PingRequest,
        ProtocolVersions, SetReputationRequest, StandardDiscoverRequest,
    };
    use crate::offer::CidGroupOffer;

    struct NoGateways;

    #[async_trait]
    impl GatewayRpc for NoGateways {
        async fn ping(&self, _gateway: &NodeId, _ttl: i64) -> Result<PingResponse> {
            Err(GatewayError::Transport("offline".into()))
        }

        async fn dht_discover(
            &self,
            _gateway: &NodeId,
            _cid: &ContentId,
            _nonce: i64,
            _ttl: i64,
        ) -> Result<Envelope> {
            Err(GatewayError::Transport("offline".into()))
        }
    }

    fn router() -> Router<NoGateways> {
        let config = GatewayConfig::default().with_gateway_id(NodeId::derive(b"me"));
        Router::new(
            Arc::new(GatewayContext::new(config)),
            Arc::new(NoGateways),
            Surface::Peer,
        )
    }

    fn admin_router() -> Router<NoGateways> {
        let config = GatewayConfig::default().with_gateway_id(NodeId::derive(b"me"));
        Router::new(
            Arc::new(GatewayContext::new(config)),
            Arc::new(NoGateways),
            Surface::Admin,
        )
    }

    fn peer_over(admin: &Router<NoGateways>) -> Router<NoGateways> {
        Router::new(admin.context().clone(), Arc::new(NoGateways), Surface::Peer)
    }

    async fn install(router: &Router<NoGateways>) -> Keypair {
        let keypair = Keypair::generate();
        router
            .context()
            .install_key(keypair.clone(), KeyVersion::initial())
            .await;
        keypair
    }

    async fn send(router: &Router<NoGateways>, message: Message) -> Option<Message> {
        let envelope = message.to_envelope(&ProtocolVersions::default()).unwrap();
        router
            .handle_envelope(envelope)
            .await
            .map(|reply| reply.decode().unwrap())
    }

    fn expect_invalid(reply: Option<Message>) -> String {
        match reply {
            Some(Message::InvalidMessage(invalid)) => invalid.reason,
            other => panic!("expected invalid-message reply, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn garbage_bytes_get_invalid_reply() {
        let router = router();
        let reply = router.handle_bytes(b"not json").await.unwrap();
        let envelope = Envelope::from_bytes(&reply).unwrap();
        assert!(matches!(envelope.decode().unwrap(), Message::InvalidMessage(_)));
    }

    #[tokio::test]
    async fn discovery_requires_installed_key() {
        let router = router();
        let reply = send(
            &router,
            Message::ClientStandardDiscoverRequest(StandardDiscoverRequest {
                cid: ContentId::from_bytes(b"cid".to_vec()).unwrap(),
                nonce: 1,
                ttl: now_secs() + 60,
                client_id: None,
            }),
        )
        .await;
        expect_invalid(reply);
    }

    #[tokio::test]
    async fn standard_discovery_serves_cache_and_drops_after_ttl() {
        let router = router();
        let keypair = install(&router).await;
        let provider = NodeId::derive(b"provider");
        let cid = ContentId::from_bytes(b"bafy-a".to_vec()).unwrap();
        let mut offer = CidGroupOffer::new(
            provider,
            vec![cid.clone(), ContentId::from_bytes(b"bafy-b".to_vec()).unwrap()],
            3,
            now_secs() + 600,
            1,
        )
        .unwrap();
        offer.sign(&keypair, KeyVersion::initial()).unwrap();
        router.context().offers.insert(offer).await;

        let request = |ttl| {
            Message::ClientStandardDiscoverRequest(StandardDiscoverRequest {
                cid: cid.clone(),
                nonce: 42,
                ttl,
                client_id: Some(NodeId::derive(b"client")),
            })
        };

        match send(&router, request(now_secs() + 60)).await {
            Some(Message::ClientStandardDiscoverResponse(DiscoverResponse {
                nonce,
                found,
                offers,
                ..
            })) => {
                assert_eq!(nonce, 42);
                assert!(found);
                assert_eq!(offers.len(), 1);
                assert!(offers[0].merkle_proof.verify(&cid, &offers[0].merkle_root));
            }
            other => panic!("unexpected reply {:?}", other),
        }
        assert_eq!(
            router.context().reputation.get(&NodeId::derive(b"client")).await,
            (0, true)
        );

        assert!(send(&router, request(now_secs() - 1)).await.is_none());
    }

    #[tokio::test]
    async fn unregistered_gateway_ping_is_rejected() {
        let router = router();
        install(&router).await;
        let reply = send(
            &router,
            Message::GatewayPingRequest(PingRequest {
                gateway_id: NodeId::derive(b"stranger"),
                nonce: 1,
                ttl: now_secs() + 10,
            }),
        )
        .await;
        expect_invalid(reply);
    }

    #[tokio::test]
    async fn ping_from_registered_gateway_is_answered_until_expiry() {
        let router = router();
        install(&router).await;
        let peer_key = Keypair::generate();
        let peer = NodeId::derive(b"peer");
        router
            .context()
            .registry
            .seed(
                NodeKind::Gateway,
                vec![RegisteredNode {
                    node_id: peer.to_hex(),
                    signing_key: peer_key.public_key().to_hex(),
                    ..Default::default()
                }],
            )
            .await;

        let ping = |ttl| {
            Message::GatewayPingRequest(PingRequest {
                gateway_id: peer,
                nonce: 7,
                ttl,
            })
            .to_signed_envelope(&ProtocolVersions::default(), &peer_key, KeyVersion::initial())
            .unwrap()
        };

        let reply = router.handle_envelope(ping(now_secs() + 10)).await.unwrap();
        assert_eq!(
            reply.decode().unwrap(),
            Message::GatewayPingResponse(PingResponse {
                nonce: 7,
                is_alive: true
            })
        );

        let reply = router.handle_envelope(ping(now_secs() - 5)).await.unwrap();
        assert!(matches!(reply.decode().unwrap(), Message::InvalidMessage(_)));

        let mut forged = ping(now_secs() + 10);
        forged
            .sign(&Keypair::generate(), KeyVersion::initial())
            .unwrap();
        let reply = router.handle_envelope(forged).await.unwrap();
        assert!(matches!(reply.decode().unwrap(), Message::InvalidMessage(_)));
    }

    #[tokio::test]
    async fn admin_flow_installs_key_then_enrolls() {
        let router = admin_router();
        let record = RegisteredNode {
            node_id: NodeId::derive(b"gw2").to_hex().to_uppercase(),
            signing_key: Keypair::generate().public_key().to_hex(),
            ..Default::default()
        };

        let reply = send(&router, Message::AdminEnrollGatewayRequest(record.clone())).await;
        assert!(expect_invalid(reply).contains("not initialised"));

        let keypair = Keypair::generate();
        let reply = send(
            &router,
            Message::AdminInitialiseKeyRequest(InitialiseKeyRequest {
                private_key: keypair.secret_key_hex(),
                key_version: 3,
            }),
        )
        .await;
        assert_eq!(
            reply,
            Some(Message::AdminInitialiseKeyResponse(InitialiseKeyResponse {
                success: true
            }))
        );

        let envelope = Message::AdminEnrollGatewayRequest(record.clone())
            .to_envelope(&ProtocolVersions::default())
            .unwrap();
        let reply = router.handle_envelope(envelope).await.unwrap();
        reply.verify(&keypair.public_key()).unwrap();
        match reply.decode().unwrap() {
            Message::AdminEnrollGatewayResponse(ack) => {
                assert_eq!(ack.outcome, crate::registry::EnrollOutcome::Inserted);
                assert_eq!(ack.node.node_id, record.node_id.to_lowercase());
            }
            other => panic!("unexpected reply {:?}", other),
        }

        match send(&router, Message::AdminEnrollGatewayRequest(record)).await {
            Some(Message::AdminEnrollGatewayResponse(ack)) => {
                assert_eq!(ack.outcome, crate::registry::EnrollOutcome::Unchanged)
            }
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[tokio::test]
    async fn set_reputation_only_touches_known_clients() {
        let router = admin_router();
        install(&router).await;
        let client = NodeId::derive(b"client");

        let set = Message::AdminSetReputationRequest(SetReputationRequest {
            client_id: client,
            reputation: 9,
        });
        match send(&router, set.clone()).await {
            Some(Message::AdminSetReputationResponse(resp)) => {
                assert!(!resp.exists);
                assert_eq!(resp.reputation, 0);
            }
            other => panic!("unexpected reply {:?}", other),
        }

        router.context().reputation.observe(&client).await;
        send(&router, set).await;
        match send(
            &router,
            Message::AdminGetReputationRequest(GetReputationRequest { client_id: client }),
        )
        .await
        {
            Some(Message::AdminGetReputationResponse(resp)) => {
                assert!(resp.exists);
                assert_eq!(resp.reputation, 9);
            }
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[tokio::test]
    async fn reputation_admin_requires_installed_key() {
        let router = admin_router();
        let client = NodeId::derive(b"client");
        router.context().reputation.observe(&client).await;

        let reason = expect_invalid(
            send(
                &router,
                Message::AdminSetReputationRequest(SetReputationRequest {
                    client_id: client,
                    reputation: 5,
                }),
            )
            .await,
        );
        assert!(reason.contains("not initialised"));
        expect_invalid(
            send(
                &router,
                Message::AdminGetReputationRequest(GetReputationRequest { client_id: client }),
            )
            .await,
        );
        assert_eq!(router.context().reputation.get(&client).await, (0, true));
    }

    #[tokio::test]
    async fn admin_messages_are_refused_on_the_peer_surface() {
        let admin = admin_router();
        let peer = peer_over(&admin);
        let original = install(&admin).await;

        let replacement = Keypair::generate();
        let reply = send(
            &peer,
            Message::AdminInitialiseKeyRequest(InitialiseKeyRequest {
                private_key: replacement.secret_key_hex(),
                key_version: 9,
            }),
        )
        .await;
        expect_invalid(reply);
        let (installed, version) = admin.context().keys.current().await.unwrap();
        assert!(installed.public_key() == original.public_key());
        assert_eq!(version, KeyVersion::initial());

        let record = RegisteredNode {
            node_id: NodeId::derive(b"intruder").to_hex(),
            signing_key: Keypair::generate().public_key().to_hex(),
            ..Default::default()
        };
        expect_invalid(send(&peer, Message::AdminEnrollGatewayRequest(record.clone())).await);
        expect_invalid(send(&peer, Message::AdminEnrollProviderRequest(record.clone())).await);
        let client = NodeId::derive(b"client");
        admin.context().reputation.observe(&client).await;
        expect_invalid(
            send(
                &peer,
                Message::AdminSetReputationRequest(SetReputationRequest {
                    client_id: client,
                    reputation: 100,
                }),
            )
            .await,
        );
        assert_eq!(admin.context().registry.len(NodeKind::Gateway).await, 0);
        assert_eq!(admin.context().registry.len(NodeKind::Provider).await, 0);
        assert_eq!(admin.context().reputation.get(&client).await, (0, true));

        match send(&admin, Message::AdminEnrollGatewayRequest(record)).await {
            Some(Message::AdminEnrollGatewayResponse(_)) => {}
            other => panic!("unexpected reply {:?}", other),
        }
        assert_eq!(admin.context().registry.len(NodeKind::Gateway).await, 1);
    }

    #[tokio::test]
    async fn admin_surface_refuses_discovery() {
        let router = admin_router();
        install(&router).await;
        let reply = send(
            &router,
            Message::ClientStandardDiscoverRequest(StandardDiscoverRequest {
                cid: ContentId::from_bytes(b"cid".to_vec()).unwrap(),
                nonce: 1,
                ttl: now_secs() + 60,
                client_id: None,
            }),
        )
        .await;
        assert!(expect_invalid(reply).contains("listener"));
    }

    #[tokio::test]
    async fn replies_sent_as_requests_are_rejected() {
        let router = router();
        let reply = send(
            &router,
            Message::GatewayPingResponse(PingResponse {
                nonce: 1,
                is_alive: true,
            }),
        )
        .await;
        expect_invalid(reply);
    }

    #[tokio::test]
    async fn negotiation_outcomes() {
        let router = router();
        let body = Message::GatewayPingResponse(PingResponse {
            nonce: 1,
            is_alive: true,
        });

        let newer = body.to_envelope(&ProtocolVersions::new(2, vec![2, 1])).unwrap();
        match router.handle_envelope(newer).await.unwrap().decode().unwrap() {
            Message::ProtocolChange(change) => assert_eq!(change.desired_version, 1),
            other => panic!("unexpected reply {:?}", other),
        }

        let only_newer = body.to_envelope(&ProtocolVersions::new(2, vec![2])).unwrap();
        assert!(matches!(
            router.handle_envelope(only_newer).await.unwrap().decode().unwrap(),
            Message::ProtocolMismatch(_)
        ));
    }
}
