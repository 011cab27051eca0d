//! Client identity reported to the engine during the handshake.

/// Name sent as `clientInfo.name`.
pub const CLIENT_NAME: &str = env!("CARGO_PKG_NAME");

/// Version sent as `clientInfo.version`.
pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            name: CLIENT_NAME.to_string(),
            version: CLIENT_VERSION.to_string(),
        }
    }
}

impl ClientInfo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report a different name, e.g. when embedded in another tool.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_crate_identity() {
        let info = ClientInfo::new();
        assert_eq!(info.name, "lintbridge");
        assert_eq!(info.version, CLIENT_VERSION);
    }

    #[test]
    fn serializes_as_client_info() {
        let info = ClientInfo::new().with_name("lint-cli");
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["name"], "lint-cli");
        assert_eq!(json["version"], CLIENT_VERSION);
    }
}
