//! Heuristics that pull the interesting part out of a failed build or
//! deploy log.
//!
//! Each interpreter is a pure function. A chain tries interpreters in order
//! and the first one to return something wins.

use tracing::warn;

/// What an interpreter found worth showing a human.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterpretedLog {
    pub relevant_part: String,
    pub message: String,
    /// Whether the full log should be offered alongside the excerpt.
    pub include_full_log: bool,
}

impl InterpretedLog {
    fn new(relevant_part: impl Into<String>, message: &str, include_full_log: bool) -> Self {
        Self {
            relevant_part: relevant_part.into(),
            message: message.to_string(),
            include_full_log,
        }
    }
}

pub type LogInterpreter = fn(&str) -> Option<InterpretedLog>;

const FAILED_TO_START: &str = "APPLICATION FAILED TO START";
const CHECKOUT_ERROR: &str = "Error checking out artifact";
const SHORT_LOG_CHARS: usize = 200;

/// Run `chain` in order and return the first interpretation.
pub fn interpret_with(chain: &[LogInterpreter], log: &str) -> Option<InterpretedLog> {
    chain.iter().find_map(|interpret| interpret(log))
}

/// Spring Boot and Maven failures.
///
/// Checks, in order: the Spring Boot failure banner, `[ERROR]` lines, and a
/// lost local artifact cache.
pub fn spring_boot_log_interpreter(log: &str) -> Option<InterpretedLog> {
    if log.is_empty() {
        warn!("empty log");
        return None;
    }
    let lines: Vec<&str> = log.lines().collect();

    // The banner is framed by separator lines; the cause starts three lines
    // below it. Only the first banner counts, and one on the very first line
    // has no frame, so it is ignored.
    if let Some(index) = lines.iter().position(|line| *line == FAILED_TO_START)
        && index >= 1
    {
        let start = (index + 3).min(lines.len());
        let end = (index + 10).min(lines.len());
        let excerpt = lines[start..end].join("\n");
        if !excerpt.is_empty() {
            return Some(InterpretedLog::new(
                excerpt,
                "Application failed to start",
                false,
            ));
        }
    }

    let maven_errors: Vec<&str> = lines
        .iter()
        .copied()
        .filter(|line| line.starts_with("[ERROR]"))
        .collect();
    if !maven_errors.is_empty() {
        return Some(InterpretedLog::new(
            maven_errors.join("\n"),
            "Maven errors",
            true,
        ));
    }

    if log.contains(CHECKOUT_ERROR) {
        return Some(InterpretedLog::new(
            log,
            "I lost the local cache. Please rebuild",
            false,
        ));
    }
    None
}

/// Fallback for logs small enough to show whole.
pub fn short_log_interpreter(log: &str) -> Option<InterpretedLog> {
    if log.chars().count() < SHORT_LOG_CHARS {
        return Some(InterpretedLog::new(log, "This is the whole log.", false));
    }
    None
}

/// npm reports problems on `ERROR` lines or with an `ERR!` tag.
pub fn npm_log_interpreter(log: &str) -> Option<InterpretedLog> {
    let errors: Vec<&str> = log
        .lines()
        .filter(|line| line.starts_with("ERROR") || line.contains("ERR!"))
        .collect();
    if errors.is_empty() {
        return None;
    }
    Some(InterpretedLog::new(errors.join("\n"), "npm errors", true))
}

/// Interpreter chain used for local service deployments.
pub fn deploy_log_interpreter(log: &str) -> Option<InterpretedLog> {
    interpret_with(&[spring_boot_log_interpreter, short_log_interpreter], log)
}

/// Interpreter chain used for local npm builds.
pub fn build_log_interpreter(log: &str) -> Option<InterpretedLog> {
    interpret_with(&[npm_log_interpreter, short_log_interpreter], log)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn long_noise(lines: usize) -> String {
        (0..lines)
            .map(|i| format!("INFO line {i} of routine startup output"))
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[test]
    fn failure_banner_selects_window_below_it() {
        let mut lines: Vec<String> = vec!["2024 INFO boot".to_string(), "*****".to_string()];
        lines.push(FAILED_TO_START.to_string());
        lines.push("*****".to_string());
        lines.push(String::new());
        lines.push("Description:".to_string());
        for i in 0..10 {
            lines.push(format!("detail {i}"));
        }
        let log = lines.join("\n");

        let found = spring_boot_log_interpreter(&log).expect("interpreted");
        assert_eq!(found.message, "Application failed to start");
        assert!(!found.include_full_log);
        // Banner at index 2, window is lines [5, 12).
        let expected = lines[5..12].join("\n");
        assert_eq!(found.relevant_part, expected);
    }

    #[test]
    fn banner_on_first_line_is_not_a_failure_marker() {
        let log = format!("{FAILED_TO_START}\n{}", long_noise(20));
        assert_eq!(spring_boot_log_interpreter(&log), None);
    }

    #[test]
    fn only_the_first_banner_is_considered() {
        let mut lines: Vec<String> = vec![FAILED_TO_START.to_string(), "*****".to_string()];
        lines.push(FAILED_TO_START.to_string());
        for i in 0..12 {
            lines.push(format!("detail {i}"));
        }
        let log = lines.join("\n");
        assert_eq!(spring_boot_log_interpreter(&log), None);
    }

    #[test]
    fn banner_near_end_of_log_falls_through() {
        let log = format!("{}\n{FAILED_TO_START}\n***", long_noise(20));
        assert_eq!(spring_boot_log_interpreter(&log), None);
    }

    #[test]
    fn maven_error_lines_are_collected() {
        let log = format!(
            "{}\n[ERROR] Failed to execute goal\n[INFO] noise\n[ERROR] compilation failure",
            long_noise(10)
        );
        let found = spring_boot_log_interpreter(&log).expect("interpreted");
        assert_eq!(found.message, "Maven errors");
        assert!(found.include_full_log);
        assert_eq!(
            found.relevant_part,
            "[ERROR] Failed to execute goal\n[ERROR] compilation failure"
        );
    }

    #[test]
    fn lost_artifact_cache_is_recognised() {
        let log = format!("{}\nError checking out artifact foo.jar", long_noise(10));
        let found = spring_boot_log_interpreter(&log).expect("interpreted");
        assert_eq!(found.message, "I lost the local cache. Please rebuild");
        assert_eq!(found.relevant_part, log);
    }

    #[test]
    fn short_log_is_returned_whole_and_long_log_is_not() {
        let short = "java.net.BindException: Address already in use";
        let found = deploy_log_interpreter(short).expect("interpreted");
        assert_eq!(found.relevant_part, short);
        assert_eq!(found.message, "This is the whole log.");

        assert_eq!(deploy_log_interpreter(&long_noise(20)), None);
    }

    #[test]
    fn empty_log_is_short() {
        assert_eq!(spring_boot_log_interpreter(""), None);
        let found = deploy_log_interpreter("").expect("interpreted");
        assert_eq!(found.relevant_part, "");
    }

    #[test]
    fn short_threshold_counts_characters_not_bytes() {
        let log = "é".repeat(199);
        assert!(short_log_interpreter(&log).is_some());
        assert!(short_log_interpreter(&"é".repeat(200)).is_none());
    }

    #[test]
    fn npm_errors_are_collected() {
        let log = format!(
            "{}\nnpm ERR! code ELIFECYCLE\nERROR in ./src/index.ts",
            long_noise(10)
        );
        let found = build_log_interpreter(&log).expect("interpreted");
        assert_eq!(found.message, "npm errors");
        assert_eq!(
            found.relevant_part,
            "npm ERR! code ELIFECYCLE\nERROR in ./src/index.ts"
        );
    }
}
