// Copyright (c) The testgrid Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Process exit codes.
//!
//! Success, hang, interrupted, test-failure, and undone all come from
//! [`testgrid_core::dispatcher::RunOutcome::exit_code`]; this is the one
//! code that table doesn't cover -- a structural failure (bad configuration,
//! a worker that couldn't even be spawned, a malformed reproduce file) that
//! never resolved to a run outcome at all.
pub const UNKNOWN_ERROR: i32 = 50;
