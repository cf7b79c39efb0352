use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

pub const MAX_STACK_SIZE: usize = 10_000;
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_MAX_STEPS: u64 = 1_000_000;

#[derive(Debug, Copy, Clone, PartialOrd, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
}

impl LogLevel {
    /// Should a message at `level` be printed when `self` is the configured level?
    pub fn should_print_on_level(&self, level: LogLevel) -> bool {
        *self <= level
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
        })
    }
}

/// Per-query resource budgets and logging switches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Maximum size of the goal stack and of the choice stack.
    pub stack_limit: usize,
    /// Maximum number of goals a single query may execute. `None` disables the limit.
    pub max_steps: Option<u64>,
    /// Wall-clock budget for a query. `0` disables the timeout.
    pub timeout_ms: u64,
    /// Mirror engine log lines into the message queue at this level or above.
    pub log_level: Option<LogLevel>,
    /// Print log lines to stderr immediately instead of queueing them.
    pub log_stderr: bool,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            stack_limit: MAX_STACK_SIZE,
            max_steps: Some(DEFAULT_MAX_STEPS),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            log_level: None,
            log_stderr: false,
        }
    }
}

impl QueryConfig {
    /// Defaults overridden by `POLAR_TIMEOUT_MS`, `POLAR_MAX_STEPS`, `POLAR_STACK_LIMIT` and
    /// `POLAR_LOG`. Unparseable values are ignored.
    pub fn from_env() -> Self {
        fn parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
            std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
        }

        let mut config = Self::default();
        if let Some(timeout_ms) = parsed("POLAR_TIMEOUT_MS") {
            config.timeout_ms = timeout_ms;
        }
        if let Some(max_steps) = parsed::<u64>("POLAR_MAX_STEPS") {
            config.max_steps = if max_steps == 0 { None } else { Some(max_steps) };
        }
        if let Some(stack_limit) = parsed("POLAR_STACK_LIMIT") {
            config.stack_limit = stack_limit;
        }
        config.set_logging_options(std::env::var("POLAR_LOG").ok().as_deref());
        config
    }

    /// Interpret a comma-separated `POLAR_LOG` value.
    ///
    /// `off` and `0` mute all logging and take precedence over any other value. `now` prints
    /// to stderr. Otherwise the most verbose level named wins, defaulting to `info`.
    pub fn set_logging_options(&mut self, polar_log: Option<&str>) {
        let polar_log_vars: HashSet<String> = polar_log
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_lowercase())
            .filter(|v| !v.is_empty())
            .collect();

        self.log_stderr = polar_log_vars.contains("now");
        self.log_level = if polar_log_vars.is_empty()
            || polar_log_vars.contains("off")
            || polar_log_vars.contains("0")
        {
            None
        } else if polar_log_vars.contains(&LogLevel::Trace.to_string()) {
            Some(LogLevel::Trace)
        } else if polar_log_vars.contains(&LogLevel::Debug.to_string()) {
            Some(LogLevel::Debug)
        } else {
            Some(LogLevel::Info)
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_options() {
        use LogLevel::*;
        let mut config = QueryConfig::default();
        for (polar_log, level, stderr) in [
            (None, None, false),
            (Some(""), None, false),
            (Some("trace"), Some(Trace), false),
            (Some("debug,now"), Some(Debug), true),
            (Some("now"), Some(Info), true),
            (Some("trace,debug"), Some(Trace), false),
            (Some("trace,off"), None, false),
            (Some("0,debug"), None, false),
            (Some("Info"), Some(Info), false),
        ] {
            config.set_logging_options(polar_log);
            assert_eq!(config.log_level, level, "POLAR_LOG={:?}", polar_log);
            assert_eq!(config.log_stderr, stderr, "POLAR_LOG={:?}", polar_log);
        }
    }

    #[test]
    fn test_levels_are_ordered() {
        assert!(LogLevel::Trace.should_print_on_level(LogLevel::Info));
        assert!(LogLevel::Info.should_print_on_level(LogLevel::Info));
        assert!(!LogLevel::Info.should_print_on_level(LogLevel::Debug));
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let config: QueryConfig =
            serde_json::from_str(r#"{"timeout_ms": 0, "log_level": "debug"}"#).unwrap();
        assert_eq!(config.timeout_ms, 0);
        assert_eq!(config.log_level, Some(LogLevel::Debug));
        assert_eq!(config.stack_limit, MAX_STACK_SIZE);
        assert_eq!(config.max_steps, Some(DEFAULT_MAX_STEPS));
    }
}
