// ABOUTME: Foundation types for the Durable Streams client
// ABOUTME: Error taxonomy, opaque offset/cursor newtypes, and wire constants
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Pierre Fitness Intelligence

#![deny(unsafe_code)]

//! # Durable Streams Core
//!
//! Foundation crate shared by `durable-streams` and `durable-streams-state`: the
//! error taxonomy, the opaque `Offset`/`StreamCursor` wire types, and the protocol's
//! header/query-param name constants. Kept as its own crate so it changes
//! infrequently and the rest of the workspace compiles incrementally against it.

/// Unified error taxonomy (`DurableStreamError`, `ErrorKind`) for protocol, transport,
/// and client-side programming errors.
pub mod error;

/// Opaque `Offset` and `StreamCursor` newtypes, and the `LiveMode` enum.
pub mod offset;

/// Wire-level constants: header names, query parameter names, SSE-compatible
/// content-type prefixes.
pub mod constants;

pub use error::{DurableStreamError, ErrorKind};
pub use offset::{LiveMode, Offset, StreamCursor};
