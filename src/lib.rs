//! ## icelink
//!
//! An interactive-connectivity and transport library for peer-to-peer
//! media and data sessions across NATs and firewalls.
//!
//! The pieces stack the way the wire does:
//!
//! - [`codec`] parses and serializes STUN/TURN messages and channel
//!   data framing.
//! - [`requester`] turns one STUN request into a transaction with
//!   retransmission, response matching, and credential retry, paced by
//!   a [`backoff`] timer.
//! - [`discovery`] walks STUN servers to learn the server-reflexive
//!   address; [`turn`] keeps a relayed allocation alive with
//!   permissions and channel bindings.
//! - [`ice`] gathers host, reflexive, and relayed candidates on a
//!   socket and runs the connectivity-check state machine per
//!   session.
//! - [`rudp`] layers reliable ordered byte streams over a session,
//!   and [`mls`] encrypts and authenticates a [`stream`] pair with
//!   rotating keys.
//!
//! Hosts inject the ambient capabilities: an SRV resolver ([`dns`]),
//! a cache store ([`cache`]), settings ([`config`]), and observers
//! everywhere state changes or bytes move.

pub mod backgrounding;
pub mod backoff;
pub mod cache;
pub mod config;
pub mod discovery;
pub mod dns;
pub mod error;
pub mod ice;
pub mod mls;
pub mod requester;
pub mod rudp;
pub mod stream;
pub mod subscriptions;
pub mod turn;
pub mod uri;

pub use codec;
