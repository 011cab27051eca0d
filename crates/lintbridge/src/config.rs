//! Bridge configuration.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;

use crate::bridge::codec::DEFAULT_MAX_FRAME_BUFFER;

/// Options passed through `initialize.initializationOptions`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializationOptions {
    pub disable_telemetry: bool,
    /// Required for code actions to carry rule details.
    pub include_rule_details_in_code_action: bool,
    #[serde(rename = "typeScriptLocation", skip_serializing_if = "Option::is_none")]
    pub typescript_location: Option<PathBuf>,
}

impl Default for InitializationOptions {
    fn default() -> Self {
        Self {
            disable_telemetry: true,
            include_rule_details_in_code_action: true,
            typescript_location: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Interface the acceptor binds on.
    pub host: String,
    pub max_frame_buffer: usize,
    /// How long to wait for the engine to dial back after launch.
    pub connect_timeout: Duration,
    /// Upper bound on a whole analysis run. None waits forever.
    pub analysis_timeout: Option<Duration>,
    pub initialization: InitializationOptions,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            max_frame_buffer: DEFAULT_MAX_FRAME_BUFFER,
            connect_timeout: Duration::from_secs(60),
            analysis_timeout: None,
            initialization: InitializationOptions::default(),
        }
    }
}

impl BridgeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overlaid with `LINTBRIDGE_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(host) = lookup("LINTBRIDGE_HOST") {
            config.host = host;
        }
        if let Some(size) = parse_var::<usize>(&lookup, "LINTBRIDGE_MAX_FRAME_BUFFER") {
            config.max_frame_buffer = size;
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "LINTBRIDGE_CONNECT_TIMEOUT_SECS") {
            config.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "LINTBRIDGE_ANALYSIS_TIMEOUT_SECS") {
            config.analysis_timeout = Some(Duration::from_secs(secs));
        }
        if let Some(location) = lookup("LINTBRIDGE_TYPESCRIPT_LOCATION") {
            config.initialization.typescript_location = Some(PathBuf::from(location));
        }

        config
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_max_frame_buffer(mut self, size: usize) -> Self {
        self.max_frame_buffer = size;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_analysis_timeout(mut self, timeout: Duration) -> Self {
        self.analysis_timeout = Some(timeout);
        self
    }

    pub fn with_initialization(mut self, options: InitializationOptions) -> Self {
        self.initialization = options;
        self
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T>
where
    T::Err: std::fmt::Display,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(key, value = %raw, error = %e, "Ignoring invalid environment value");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let config = BridgeConfig::new();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.max_frame_buffer, 5 * 1024 * 1024);
        assert_eq!(config.connect_timeout, Duration::from_secs(60));
        assert!(config.analysis_timeout.is_none());
    }

    #[test]
    fn environment_overrides_defaults() {
        let config = BridgeConfig::from_lookup(lookup(&[
            ("LINTBRIDGE_HOST", "0.0.0.0"),
            ("LINTBRIDGE_MAX_FRAME_BUFFER", "1024"),
            ("LINTBRIDGE_CONNECT_TIMEOUT_SECS", "5"),
            ("LINTBRIDGE_ANALYSIS_TIMEOUT_SECS", "120"),
            ("LINTBRIDGE_TYPESCRIPT_LOCATION", "/opt/ts"),
        ]));

        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.max_frame_buffer, 1024);
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
        assert_eq!(config.analysis_timeout, Some(Duration::from_secs(120)));
        assert_eq!(
            config.initialization.typescript_location,
            Some(PathBuf::from("/opt/ts"))
        );
    }

    #[test]
    fn invalid_values_are_ignored() {
        let config = BridgeConfig::from_lookup(lookup(&[
            ("LINTBRIDGE_MAX_FRAME_BUFFER", "lots"),
            ("LINTBRIDGE_CONNECT_TIMEOUT_SECS", "-1"),
        ]));

        assert_eq!(config.max_frame_buffer, DEFAULT_MAX_FRAME_BUFFER);
        assert_eq!(config.connect_timeout, Duration::from_secs(60));
    }

    #[test]
    fn builder_overrides() {
        let config = BridgeConfig::new()
            .with_host("::1")
            .with_max_frame_buffer(64)
            .with_connect_timeout(Duration::from_secs(1))
            .with_analysis_timeout(Duration::from_secs(2));

        assert_eq!(config.host, "::1");
        assert_eq!(config.max_frame_buffer, 64);
        assert_eq!(config.connect_timeout, Duration::from_secs(1));
        assert_eq!(config.analysis_timeout, Some(Duration::from_secs(2)));
    }

    #[test]
    fn initialization_options_wire_shape() {
        insta::assert_json_snapshot!(InitializationOptions::default(), @r#"
        {
          "disableTelemetry": true,
          "includeRuleDetailsInCodeAction": true
        }
        "#);

        let with_ts = InitializationOptions {
            typescript_location: Some(PathBuf::from("/opt/ts")),
            ..Default::default()
        };
        let json = serde_json::to_value(&with_ts).unwrap();
        assert_eq!(json["typeScriptLocation"], "/opt/ts");
    }
}
