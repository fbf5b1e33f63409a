//! Startup watch for long-running services.
//!
//! A service never exits on success, so readiness is read from its output.
//! The watch consumes one ordered stream of events: output lines as they
//! complete, then the exit once every line before it has been seen. Because
//! exit is only reported after the output is drained, a process that prints
//! its ready line and then dies still counts as started. A process that
//! exits without printing one has failed, whatever its exit code.

use regex::Regex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Spawned,
    Line(String),
    Exited { code: Option<i32>, signal: Option<i32> },
    /// The startup deadline passed.
    Deadline,
    /// Someone asked for the start to be abandoned.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchState {
    Starting,
    Running,
    /// A success pattern matched this line.
    Succeeded { line: String },
    Failed { code: Option<i32>, signal: Option<i32> },
    TimedOut,
    Cancelled,
}

impl WatchState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WatchState::Succeeded { .. }
                | WatchState::Failed { .. }
                | WatchState::TimedOut
                | WatchState::Cancelled
        )
    }
}

#[derive(Debug)]
pub struct ServiceWatch {
    patterns: Vec<Regex>,
    state: WatchState,
}

impl ServiceWatch {
    pub fn new(patterns: Vec<Regex>) -> Self {
        Self {
            patterns,
            state: WatchState::Starting,
        }
    }

    pub fn state(&self) -> &WatchState {
        &self.state
    }

    /// Advance the watch. Events after a terminal state are ignored.
    pub fn apply(&mut self, event: WatchEvent) -> &WatchState {
        if self.state.is_terminal() {
            return &self.state;
        }
        self.state = match event {
            WatchEvent::Spawned => WatchState::Running,
            WatchEvent::Line(line) => {
                if self.patterns.iter().any(|p| p.is_match(&line)) {
                    WatchState::Succeeded { line }
                } else {
                    WatchState::Running
                }
            }
            WatchEvent::Exited { code, signal } => WatchState::Failed { code, signal },
            WatchEvent::Deadline => WatchState::TimedOut,
            WatchEvent::Cancelled => WatchState::Cancelled,
        };
        &self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::config::SPRING_BOOT_STARTED;

    fn watch() -> ServiceWatch {
        ServiceWatch::new(vec![Regex::new(SPRING_BOOT_STARTED).expect("regex")])
    }

    #[test]
    fn success_line_resolves_before_exit() {
        let mut w = watch();
        w.apply(WatchEvent::Spawned);
        w.apply(WatchEvent::Line("Starting App".to_string()));
        assert_eq!(w.state(), &WatchState::Running);

        w.apply(WatchEvent::Line("Started App in 2.5 seconds (JVM running for 3.1)".to_string()));
        assert!(matches!(w.state(), WatchState::Succeeded { line } if line.starts_with("Started App")));

        w.apply(WatchEvent::Exited {
            code: Some(1),
            signal: None,
        });
        assert!(matches!(w.state(), WatchState::Succeeded { .. }));
    }

    #[test]
    fn exit_before_match_fails_even_with_zero_code() {
        let mut w = watch();
        w.apply(WatchEvent::Spawned);
        w.apply(WatchEvent::Line("building".to_string()));
        let state = w.apply(WatchEvent::Exited {
            code: Some(0),
            signal: None,
        });
        assert_eq!(state, &WatchState::Failed {
            code: Some(0),
            signal: None
        });
    }

    #[test]
    fn deadline_times_out_and_later_lines_are_ignored() {
        let mut w = watch();
        w.apply(WatchEvent::Spawned);
        w.apply(WatchEvent::Deadline);
        w.apply(WatchEvent::Line("Started App in 1.0 seconds".to_string()));
        assert_eq!(w.state(), &WatchState::TimedOut);
    }

    #[test]
    fn cancellation_wins_only_while_starting() {
        let mut w = watch();
        w.apply(WatchEvent::Spawned);
        assert_eq!(w.apply(WatchEvent::Cancelled), &WatchState::Cancelled);

        let mut started = watch();
        started.apply(WatchEvent::Line("Started App in 1.0 seconds".to_string()));
        started.apply(WatchEvent::Cancelled);
        assert!(matches!(started.state(), WatchState::Succeeded { .. }));
    }
}
