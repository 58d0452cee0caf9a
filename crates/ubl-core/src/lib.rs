//! # ubl-core
//!
//! Core library for the UBL messaging and ledger service.
//!
//! Every state-changing operation in the system becomes a cryptographically
//! linked receipt in a per-tenant append-only hash chain. This crate provides
//! the building blocks behind that guarantee:
//!
//! - **Canonical JSON** ([`canon`]): the deterministic byte form used as hash
//!   input (sorted keys, NFC strings, no whitespace).
//! - **Hashing** ([`hash`]): SHA-256 content ids (`c:`), body hashes (`b:`),
//!   and chained head hashes (`h:`) seeded at `h:genesis`.
//! - **Atoms** ([`atom`]): the `action.v1` / `effect.v1` ledger entries and
//!   the receipts returned on append.
//! - **Coordinators** ([`ledger`], [`room`], [`tenant`], [`workspace`]):
//!   single-writer actors, one per entity key, serialized by the runtime.
//! - **Runtime** ([`runtime`]): the per-key registry guaranteeing one active
//!   coordinator instance per key, plus cross-coordinator orchestration.
//! - **Stores** ([`store`]): the keyed coordinator state store (source of
//!   truth) and the SQLite index store (reader-side mirror).
//!
//! The HTTP + SSE surface and the JSON-RPC tool server live in the
//! `ubl-gateway` crate; this crate is transport-agnostic.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod agreement;
pub mod atom;
pub mod bounded;
pub mod canon;
pub mod config;
pub mod error;
pub mod hash;
pub mod id;
pub mod identity;
pub mod ledger;
pub mod room;
pub mod runtime;
pub mod store;
pub mod tenant;
pub mod workspace;

pub use atom::{ActionAtom, Atom, EffectAtom, Message, Receipt};
pub use config::ServiceConfig;
pub use error::ApiError;
pub use identity::Identity;
pub use runtime::UblRuntime;
