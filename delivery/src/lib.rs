//! Push-driven goal resolution and local delivery supervision.
//!
//! For each push the crate decides which delivery goals apply, picks the one
//! implementation that fulfills each goal, and runs local build and deploy
//! processes on the implementation's behalf:
//!
//! - **[`core`]**: the goal model, push tests and decision trees, and the
//!   pure parts of supervision (log interpretation, startup watch, ports).
//! - **[`io`]**: project files, notifications, progress logs, configuration,
//!   and child processes.
//! - **[`mapper`]**: which implementation fulfills a goal for a push.
//! - **[`deploy`]** and **[`build`]**: local executors built on [`io`].
//!
//! [`context::DeliveryContext`] holds the wiring; [`plan`] drives a push
//! through it.

pub mod build;
pub mod context;
pub mod core;
pub mod deploy;
pub mod error;
pub mod io;
pub mod logging;
pub mod mapper;
pub mod plan;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
