//! # weft-server
//!
//! The weft control-plane server: accepts bidirectional event streams,
//! multiplexes unary requests inside them, serializes every mutation through
//! the state store, and fans consistent state snapshots out to all
//! subscribed streams.
//!
//! Concurrency model: **single logical writer, many concurrent stream
//! readers**. All store mutations execute under one mutex; one task per
//! stream handles events in arrival order; the publisher broadcasts
//! immutable snapshots over a watch channel, so slow subscribers coalesce
//! to the latest snapshot. No lock is held across network I/O.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod publisher;
pub mod server;
pub(crate) mod session;

pub use publisher::StatePublisher;
pub use server::{Server, ServerError};
