// Copyright 2026 the Strata Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Diagnostics for the strata compositor.
//!
//! The centerpiece is [`RecordingCompositor`], a backend that performs no
//! drawing but records every contract call as a [`BackendEvent`]. It
//! enforces the same phase state machine as the real backends, so protocol
//! tests exercise the begin/end pairing rules for free, and its shared
//! [`EventLog`] lets a test inspect the call sequence after the cache has
//! taken ownership of the backend.

mod recorder;

pub use recorder::{BackendEvent, EventLog, RecordingCompositor, RecordingFactory, format_events};
