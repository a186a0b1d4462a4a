use crate::client::session::{Session, SessionConfig};
use crate::errors::NewSessionError;
use priam_cql::frame::ProtocolVersion;
use priam_cql::frame::types::Consistency;

/// Builds a [Session] step by step.
///
/// ```no_run
/// # use priam::SessionBuilder;
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let session = SessionBuilder::new()
///     .host("10.0.0.1")
///     .keyspace("test")
///     .default_consistency(priam::Consistency::Quorum)
///     .build()
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct SessionBuilder {
    config: SessionConfig,
}

impl SessionBuilder {
    pub fn new() -> Self {
        SessionBuilder {
            config: SessionConfig::new(),
        }
    }

    /// Adds a seed host.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.hosts.push(host.into());
        self
    }

    /// Adds several seed hosts at once.
    pub fn hosts(mut self, hosts: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.config.hosts.extend(hosts.into_iter().map(Into::into));
        self
    }

    /// TCP port of every node; defaults to 9042.
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Credentials for the PasswordAuthenticator.
    pub fn credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.config.username = Some(username.into());
        self.config.password = Some(password.into());
        self
    }

    /// Issues `USE <keyspace>` on every new connection.
    pub fn keyspace(mut self, keyspace: impl Into<String>) -> Self {
        self.config.keyspace = Some(keyspace.into());
        self
    }

    /// Consistency used when a call passes none.
    pub fn default_consistency(mut self, consistency: Consistency) -> Self {
        self.config.default_consistency = Some(consistency);
        self
    }

    /// Number of primary connections to maintain; defaults to 1.
    pub fn primaries(mut self, primaries: usize) -> Self {
        self.config.primaries = primaries;
        self
    }

    /// Prefer nodes of this datacenter when choosing primaries.
    pub fn prefer_dc(mut self, datacenter: impl Into<String>) -> Self {
        self.config.prefer_dc = Some(datacenter.into());
        self
    }

    /// Wire protocol version to speak; defaults to v1.
    pub fn protocol_version(mut self, version: ProtocolVersion) -> Self {
        self.config.protocol_version = version;
        self
    }

    /// Disables body compression even when a codec is compiled in.
    pub fn without_compression(mut self) -> Self {
        self.config.compression = false;
        self
    }

    pub async fn build(self) -> Result<Session, NewSessionError> {
        Session::connect(self.config).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_accumulates_config() {
        let builder = SessionBuilder::new()
            .host("10.0.0.1")
            .hosts(["10.0.0.2", "10.0.0.3"])
            .port(19042)
            .credentials("user", "pass")
            .keyspace("test")
            .default_consistency(Consistency::Quorum)
            .primaries(3)
            .prefer_dc("DC1")
            .protocol_version(ProtocolVersion::V2)
            .without_compression();

        let config = builder.config;
        assert_eq!(config.hosts, vec!["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
        assert_eq!(config.port, 19042);
        assert_eq!(config.username.as_deref(), Some("user"));
        assert_eq!(config.keyspace.as_deref(), Some("test"));
        assert_eq!(config.default_consistency, Some(Consistency::Quorum));
        assert_eq!(config.primaries, 3);
        assert_eq!(config.prefer_dc.as_deref(), Some("DC1"));
        assert_eq!(config.protocol_version, ProtocolVersion::V2);
        assert!(!config.compression);
    }
}
