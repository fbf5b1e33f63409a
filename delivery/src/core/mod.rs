//! Goal model, push rules, and the pure pieces of process supervision.
//!
//! Nothing here spawns processes or touches the filesystem directly. Push
//! tests reach project state only through the [`Project`](crate::io::project::Project)
//! trait carried by the push.

pub mod decision_tree;
pub mod goal;
pub mod log_interpreter;
pub mod ports;
pub mod push;
pub mod types;
pub mod watch;
