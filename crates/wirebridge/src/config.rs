//! Bridge configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::bridge::codec::DEFAULT_MAX_LINE_LENGTH;

/// Default per-request and connect timeout (30s).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Argument that tells the worker it is being driven over stdio.
pub const DEFAULT_BRIDGE_FLAG: &str = "--bridge";

pub const ENV_EXECUTABLE: &str = "WIREBRIDGE_EXECUTABLE";
pub const ENV_TIMEOUT_MS: &str = "WIREBRIDGE_TIMEOUT_MS";
pub const ENV_MAX_LINE_BYTES: &str = "WIREBRIDGE_MAX_LINE_BYTES";

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Executable to launch.
    pub program: PathBuf,
    /// Script passed as the first argument (e.g. the worker's entry point).
    pub script: Option<PathBuf>,
    /// Bridge-mode flag, passed after the script.
    pub bridge_flag: String,
    /// Extra arguments after the bridge flag.
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
    pub current_dir: Option<PathBuf>,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    /// Accepted for compatibility; no retry policy consults it.
    pub max_retries: u32,
    pub max_line_length: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("python"),
            script: None,
            bridge_flag: DEFAULT_BRIDGE_FLAG.to_string(),
            args: Vec::new(),
            envs: Vec::new(),
            current_dir: None,
            request_timeout: DEFAULT_TIMEOUT,
            connect_timeout: DEFAULT_TIMEOUT,
            max_retries: 3,
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
        }
    }
}

impl BridgeConfig {
    pub fn new(script: impl Into<PathBuf>) -> Self {
        Self {
            script: Some(script.into()),
            ..Self::default()
        }
    }

    /// Defaults overlaid with `WIREBRIDGE_*` environment variables.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from a variable lookup. Unparsable values are logged
    /// and ignored.
    pub fn with_env_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(program) = lookup(ENV_EXECUTABLE).filter(|p| !p.trim().is_empty()) {
            self.program = PathBuf::from(program);
        }
        if let Some(raw) = lookup(ENV_TIMEOUT_MS) {
            match raw.trim().parse::<u64>() {
                Ok(ms) => {
                    self.request_timeout = Duration::from_millis(ms);
                    self.connect_timeout = Duration::from_millis(ms);
                }
                Err(e) => tracing::warn!(var = ENV_TIMEOUT_MS, value = %raw, error = %e, "Ignoring invalid timeout"),
            }
        }
        if let Some(raw) = lookup(ENV_MAX_LINE_BYTES) {
            match raw.trim().parse::<usize>() {
                Ok(n) if n > 0 => self.max_line_length = n,
                Ok(_) => tracing::warn!(var = ENV_MAX_LINE_BYTES, "Ignoring zero line length"),
                Err(e) => tracing::warn!(var = ENV_MAX_LINE_BYTES, value = %raw, error = %e, "Ignoring invalid line length"),
            }
        }
        self
    }

    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    pub fn with_script(mut self, script: impl Into<PathBuf>) -> Self {
        self.script = Some(script.into());
        self
    }

    pub fn with_bridge_flag(mut self, flag: impl Into<String>) -> Self {
        self.bridge_flag = flag.into();
        self
    }

    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn with_current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets both the request and connect timeouts.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_request_timeout(timeout).with_connect_timeout(timeout)
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_max_line_length(mut self, max: usize) -> Self {
        self.max_line_length = max;
        self
    }

    /// Full argument list: script, bridge flag, extra args.
    pub fn command_args(&self) -> Vec<std::ffi::OsString> {
        let mut args = Vec::with_capacity(self.args.len() + 2);
        if let Some(ref script) = self.script {
            args.push(script.clone().into_os_string());
        }
        if !self.bridge_flag.is_empty() {
            args.push(self.bridge_flag.clone().into());
        }
        args.extend(self.args.iter().map(Into::into));
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.program, PathBuf::from("python"));
        assert_eq!(config.request_timeout, Duration::from_millis(30_000));
        assert_eq!(config.connect_timeout, Duration::from_millis(30_000));
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.bridge_flag, "--bridge");
    }

    #[test]
    fn command_args_order() {
        let config = BridgeConfig::new("backend/main.py").with_arg("--verbose");
        let args: Vec<String> = config
            .command_args()
            .into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(args, vec!["backend/main.py", "--bridge", "--verbose"]);
    }

    #[test]
    fn empty_bridge_flag_omitted() {
        let config = BridgeConfig::default().with_bridge_flag("");
        assert!(config.command_args().is_empty());
    }

    #[test]
    fn env_overrides_applied() {
        let config = BridgeConfig::default().with_env_overrides(lookup(&[
            (ENV_EXECUTABLE, "/usr/bin/python3"),
            (ENV_TIMEOUT_MS, "1500"),
            (ENV_MAX_LINE_BYTES, "4096"),
        ]));
        assert_eq!(config.program, PathBuf::from("/usr/bin/python3"));
        assert_eq!(config.request_timeout, Duration::from_millis(1500));
        assert_eq!(config.connect_timeout, Duration::from_millis(1500));
        assert_eq!(config.max_line_length, 4096);
    }

    #[test]
    fn invalid_env_values_ignored() {
        let config = BridgeConfig::default().with_env_overrides(lookup(&[
            (ENV_EXECUTABLE, "  "),
            (ENV_TIMEOUT_MS, "soon"),
            (ENV_MAX_LINE_BYTES, "0"),
        ]));
        assert_eq!(config.program, PathBuf::from("python"));
        assert_eq!(config.request_timeout, DEFAULT_TIMEOUT);
        assert_eq!(config.max_line_length, DEFAULT_MAX_LINE_LENGTH);
    }
}
