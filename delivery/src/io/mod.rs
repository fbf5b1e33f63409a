//! Side-effecting boundaries: project files, notifications, progress logs,
//! configuration, and child processes.

pub mod channels;
pub mod config;
pub mod process;
pub mod progress_log;
pub mod project;
pub mod service;
