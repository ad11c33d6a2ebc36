// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 itsakeyfut

//! Memory subsystem tests
//!
//! - `basic`: construction, reset and buffer access
//! - `regions`: physical classification, A20 masking, ROM alias
//! - `mmio`: handler registration and dispatch
//! - `descriptor`: raw descriptor fetch and table limit checks
//! - `code_tracking`: code-page marks and the write queue
//! - `helpers`: common test utilities

use super::*;

mod helpers;
