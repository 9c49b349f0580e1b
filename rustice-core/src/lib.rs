//! # rust-ice-core - STUN Message Engine
//!
//! `rust-ice-core` provides the message-level machinery for interactive
//! connectivity establishment: transaction identifiers, the binary
//! message codec with its integrity attributes, and a worker pool that
//! turns raw datagrams into decoded message events. This crate is the
//! underlying engine that powers the higher-level `rustice` library.
//!
//! ## Features
//!
//! - **Transaction IDs**: Modern 12-byte and legacy 16-byte
//!   identifiers with cheap table lookups
//! - **Message Codec**: Header and attribute encoding with strict
//!   decode validation
//! - **Integrity Attributes**: FINGERPRINT (masked CRC-32) and
//!   MESSAGE-INTEGRITY (HMAC-SHA1) computed over the exact wire prefix
//! - **Address Attributes**: Plain and XOR-obfuscated transport
//!   addresses, IPv4 and IPv6
//! - **Dispatch Pool**: Fixed worker pool with advisory cancellation,
//!   panic containment, and exactly-once completion callbacks
//! - **Buffer Arena**: Fixed-size receive buffers recycled on drop
//!
//! ## Architecture
//!
//! The library is organized into several key modules:
//!
//! - [`transaction`] - Transaction identifiers and the pending table
//! - [`attribute`] - Attribute constants, address codecs, integrity values
//! - [`message`] - Message decoding and the wire builder
//! - [`dispatch`] - Decode-and-dispatch worker pool and buffer arena
//! - [`error`] - Error type shared across the crate
//!
//! ## Quick Start
//!
//! ### Building and Decoding a Message
//!
//! ```rust
//! use rust_ice_core::message::{Message, MessageBuilder};
//! use rust_ice_core::transaction::TransactionId;
//!
//! # fn main() -> rust_ice_core::error::Result<()> {
//! let id = TransactionId::new();
//! let wire = MessageBuilder::binding_request(&id).fingerprint().finish();
//!
//! let message = Message::decode(&wire)?;
//! assert_eq!(message.transaction_id(), &id);
//! assert!(message.fingerprint()?.is_some());
//! # Ok(())
//! # }
//! ```
//!
//! ### Dispatching Raw Datagrams
//!
//! ```rust,no_run
//! use rust_ice_core::dispatch::{
//!     DispatchConfig, DispatchPool, MessageEventHandler, RawMessage, StunMessageEvent,
//! };
//! use std::sync::Arc;
//!
//! struct Printer;
//!
//! impl MessageEventHandler for Printer {
//!     fn handle_message_event(&self, event: StunMessageEvent) {
//!         println!("{} -> {}: {:?}", event.remote(), event.local(), event.message().class());
//!     }
//! }
//!
//! # #[tokio::main]
//! # async fn main() -> rust_ice_core::error::Result<()> {
//! let pool = DispatchPool::new(
//!     DispatchConfig::default().set_event_handler(Arc::new(Printer)),
//! )?;
//!
//! let mut buf = pool.arena().checkout();
//! // ... fill buf from a socket ...
//! let remote = "203.0.113.7:3478".parse().unwrap();
//! let local = "0.0.0.0:54321".parse().unwrap();
//! let handle = pool.dispatch(RawMessage::new(buf, remote, local), || {})?;
//!
//! // A handle can withdraw the job before a worker reaches it.
//! handle.cancel();
//! # Ok(())
//! # }
//! ```
//!
//! ## Completion Guarantees
//!
//! Every job accepted by [`dispatch::DispatchPool::dispatch`] runs its
//! completion callback exactly once: after delivery, after a decode
//! failure, after a cancellation, after a worker panic, and when a
//! stopping pool discards the job unprocessed. Callers can hang
//! retransmission bookkeeping off the callback without auditing which
//! exit the job took.
//!
//! ## Thread Safety
//!
//! All public types are thread-safe and can be shared across async
//! tasks. The library uses Tokio for async runtime.
//!
//! ## See Also
//!
//! - [`rustice`](../rustice/index.html) - Candidate harvesting and
//!   nomination built on top of this crate

pub mod attribute;
pub mod dispatch;
pub mod error;
pub mod message;
pub mod transaction;
