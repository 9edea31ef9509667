// Copyright (c) The testgrid Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Core scheduling logic for the testgrid parallel test dispatcher.
//!
//! This crate owns the part of the test runner that is hardest to get right:
//! sizing and supervising a pool of worker processes, multiplexing their
//! output back to a fixed set of observers, and reaping workers that die
//! without reporting in. It does not know how to run an individual test --
//! that's the job of a [`driver::Driver`] implementation -- and it does not
//! know how to discover suites from the filesystem.

pub mod config;
pub mod dispatcher;
pub mod driver;
pub mod errors;
pub mod ipc;
pub mod message;
pub mod observers;
pub mod reproduce;
pub mod signal;
pub mod task;
pub mod worker;

pub use config::RunnerConfig;
pub use dispatcher::{Dispatcher, RunOutcome};
pub use errors::DispatcherError;
pub use message::{Message, ShortStatus, TaskId};
pub use task::TaskGroup;
