//! # Retrieval Gateway
//!
//! A gateway node for a decentralized content-retrieval network. Clients ask
//! a gateway which providers can serve a content identifier (CID); the
//! gateway answers from a cache of provider offers that it has fetched and
//! verified, or routes the question to the peer gateways nearest the CID.
//!
//! - **Envelopes**: every message is a versioned, typed, Ed25519-signed envelope
//! - **Offers**: providers commit to CID sets with a Merkle root; clients get
//!   per-CID sub-offers carrying an inclusion proof
//! - **Registry**: gateways and providers with their signing keys and endpoints
//! - **Proximity**: XOR distance on a 256-bit keyspace orders gateways around
//!   this node and around each CID
//! - **Transport**: pooled TCP connections with length-prefixed frames
//!
//! ## Security Model
//!
//! - Outbound requests are signed with the installed key
//! - Responses and gateway requests are verified against the registry key of
//!   the peer they claim to come from
//! - Offers are accepted only with a valid Merkle commitment and provider
//!   signature, and only until they expire
//! - Frame and body sizes are bounded before allocation
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `gateway` | Shared context and the node facade |
//! | `identity` | Node ids, keypairs, installed key store |
//! | `crypto` | Domain-separated signatures |
//! | `cid` | Content identifiers |
//! | `merkle` | Commitment trees and inclusion proofs |
//! | `offer` | Group offers, sub-offers, acknowledgements |
//! | `messages` | Envelope, message set, negotiation |
//! | `registry` | Registered gateways and providers |
//! | `dht` | XOR ordering and the closest-gateway refresh |
//! | `discovery` | Offer cache, offer refresh, lookups |
//! | `handlers` | Inbound message router, peer and admin surfaces |
//! | `protocols` | Outbound RPC traits |
//! | `rpc` | TCP implementation of the RPC traits and accept loop |
//! | `transport` | Framing and the connection pool |
//! | `reputation` | Client reputation scores |
//! | `registrar` | File-backed registrar |
//! | `config` | Gateway configuration |

pub mod cid;
pub mod config;
pub mod crypto;
pub mod dht;
pub mod discovery;
pub mod error;
pub mod gateway;
pub mod handlers;
pub mod identity;
pub mod merkle;
pub mod messages;
pub mod offer;
pub mod protocols;
pub mod registrar;
pub mod registry;
pub mod reputation;
pub mod rpc;
pub mod transport;

pub use cid::ContentId;
pub use config::GatewayConfig;
pub use error::{GatewayError, Result};
pub use gateway::{Gateway, GatewayContext};
pub use identity::{KeyVersion, Keypair, NodeId, PublicKey};
pub use messages::{Envelope, Message};
pub use offer::{CidGroupOffer, SubCidOffer};
pub use registrar::StaticRegistrar;
pub use registry::{NodeKind, RegisteredNode};
