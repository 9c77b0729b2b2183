use chrono::Duration;

/// Tunnel manager settings
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// First port of the local pool (inclusive)
    pub port_range_start: u16,
    /// Last port of the local pool (inclusive)
    pub port_range_end: u16,
    /// Skip pool ports some other process already listens on
    pub verify_os_ports: bool,
    /// No `touch` for this long expires the session
    pub idle_timeout: Duration,
    /// Sessions never live longer than this, counted from creation
    pub max_lifetime: Duration,
    /// No `touch` for this long marks an active session idle
    pub idle_after: Duration,
    /// Upper bound for launch + bind + probe inside `connect`
    pub setup_timeout: std::time::Duration,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            port_range_start: 8100,
            port_range_end: 8199,
            verify_os_ports: false,
            idle_timeout: Duration::minutes(15),
            max_lifetime: Duration::minutes(30),
            idle_after: Duration::minutes(2),
            setup_timeout: std::time::Duration::from_secs(5),
        }
    }
}
