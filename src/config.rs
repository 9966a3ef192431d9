use std::net::SocketAddr;
use std::path::PathBuf;

/// TLS configuration for coordinator/minion communication.
///
/// When enabled, gRPC traffic uses mutual TLS: the coordinator presents
/// its certificate and verifies minion certificates, and minions do the
/// reverse. Both sides need certificates signed by the same CA.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// Enable TLS. If false, all other TLS settings are ignored.
    pub enabled: bool,

    /// Path to the CA certificate (PEM format).
    /// Used to verify peer certificates.
    pub ca_cert_path: Option<PathBuf>,

    /// Path to this process's certificate (PEM format).
    /// Presented to peers during the TLS handshake.
    pub cert_path: Option<PathBuf>,

    /// Path to this process's private key (PEM format).
    /// Must match the certificate.
    pub key_path: Option<PathBuf>,

    /// Allow insecure connections for development/testing.
    /// When true and TLS files are missing, runs in plaintext with a warning.
    /// When false and TLS files are missing, fails to start.
    pub allow_insecure: bool,
}

impl TlsConfig {
    /// Check if TLS is properly configured with all required files.
    pub fn is_complete(&self) -> bool {
        self.enabled
            && self.ca_cert_path.is_some()
            && self.cert_path.is_some()
            && self.key_path.is_some()
    }
}

/// Configuration for the coordinator process.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub listen_addr: SocketAddr,
    /// A minion that has not polled or heartbeat within this window is
    /// considered dead and its undelivered work is re-queued.
    pub heartbeat_timeout_ms: u64,
    /// How often the dead-minion sweep runs.
    pub dead_minion_check_interval_ms: u64,
    /// How often aged finished events are flushed to the publisher.
    pub event_flush_interval_ms: u64,
    /// Finished events younger than this are held back so stragglers
    /// from slow minions still publish in order.
    pub event_publish_margin_ms: u64,
    /// Percentage of targets (built or pruned) at which the
    /// most-rules-finished signal fires.
    pub most_rules_percent: u32,
    pub tls: TlsConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            // SAFETY: This is a hardcoded valid address that will always parse
            listen_addr: "127.0.0.1:50051"
                .parse()
                .expect("default listen address is valid"),
            heartbeat_timeout_ms: 5_000,
            dead_minion_check_interval_ms: 1_000,
            event_flush_interval_ms: 100,
            event_publish_margin_ms: 500,
            most_rules_percent: 80,
            tls: TlsConfig::default(),
        }
    }
}

impl CoordinatorConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }
}

/// Configuration for a minion process.
#[derive(Debug, Clone)]
pub struct MinionConfig {
    pub minion_id: String,
    /// Coordinator address in host:port form.
    pub coordinator_addr: String,
    /// How many work units may execute concurrently.
    pub max_parallel_units: usize,
    pub poll_interval_ms: u64,
    /// Upper bound on the random backoff after a failed coordinator call.
    pub retry_jitter_ms: u64,
    /// Shell command run per target; `{target}` is substituted.
    pub build_command: Option<String>,
    pub tls: TlsConfig,
}

impl Default for MinionConfig {
    fn default() -> Self {
        Self {
            minion_id: "minion-1".to_string(),
            coordinator_addr: "127.0.0.1:50051".to_string(),
            max_parallel_units: 10,
            poll_interval_ms: 100,
            retry_jitter_ms: 500,
            build_command: None,
            tls: TlsConfig::default(),
        }
    }
}

impl MinionConfig {
    pub fn new(minion_id: impl Into<String>, coordinator_addr: impl Into<String>) -> Self {
        Self {
            minion_id: minion_id.into(),
            coordinator_addr: coordinator_addr.into(),
            ..Default::default()
        }
    }
}

/// Client-side build strategy.
#[derive(Debug, Clone)]
pub struct RaceConfig {
    /// Run a local build racing the distributed one.
    pub racing_enabled: bool,
    /// Keep building locally if the distributed build fails.
    pub local_fallback: bool,
}

impl Default for RaceConfig {
    fn default() -> Self {
        Self {
            racing_enabled: false,
            local_fallback: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coordinator_config_default() {
        let cfg = CoordinatorConfig::default();
        assert_eq!(cfg.listen_addr.to_string(), "127.0.0.1:50051");
        assert_eq!(cfg.heartbeat_timeout_ms, 5_000);
        assert_eq!(cfg.dead_minion_check_interval_ms, 1_000);
        assert_eq!(cfg.event_flush_interval_ms, 100);
        assert_eq!(cfg.event_publish_margin_ms, 500);
        assert_eq!(cfg.most_rules_percent, 80);
        assert!(!cfg.tls.enabled);
    }

    #[test]
    fn coordinator_config_new_keeps_defaults() {
        let addr: SocketAddr = "10.0.0.1:9000".parse().unwrap();
        let cfg = CoordinatorConfig::new(addr);
        assert_eq!(cfg.listen_addr, addr);
        assert_eq!(cfg.most_rules_percent, 80);
    }

    #[test]
    fn minion_config_new() {
        let cfg = MinionConfig::new("minion-7", "coord.example.com:50051");
        assert_eq!(cfg.minion_id, "minion-7");
        assert_eq!(cfg.coordinator_addr, "coord.example.com:50051");
        assert_eq!(cfg.max_parallel_units, 10);
        assert_eq!(cfg.poll_interval_ms, 100);
        assert!(cfg.build_command.is_none());
    }

    #[test]
    fn race_config_default_is_synchronized_with_fallback() {
        let cfg = RaceConfig::default();
        assert!(!cfg.racing_enabled);
        assert!(cfg.local_fallback);
    }

    #[test]
    fn tls_config_is_complete_only_with_all_paths() {
        let complete = TlsConfig {
            enabled: true,
            ca_cert_path: Some(PathBuf::from("/ca.pem")),
            cert_path: Some(PathBuf::from("/cert.pem")),
            key_path: Some(PathBuf::from("/key.pem")),
            allow_insecure: false,
        };
        assert!(complete.is_complete());

        let mut disabled = complete.clone();
        disabled.enabled = false;
        assert!(!disabled.is_complete());

        let mut missing_key = complete;
        missing_key.key_path = None;
        assert!(!missing_key.is_complete());
    }
}
