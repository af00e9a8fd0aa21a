use std::path::PathBuf;
use std::time::Duration;

/// Runtime configuration for the fabric controllers.
///
/// Defaults are overridable through environment variables so deployments can
/// relocate the durable record store without code changes:
/// - `NETFAB_STATE_DB`: path of the sqlite record store
/// - `NETFAB_CMD_TIMEOUT_SECS`: default timeout for backend commands
#[derive(Debug, Clone)]
pub struct FabricConfig {
    /// Durable record store for the topology registry.
    pub state_db: PathBuf,
    /// Default bound on any backend command invocation.
    pub command_timeout: Duration,
    /// Bound on the traceroute diagnostic, which routinely runs long.
    pub trace_timeout: Duration,
}

impl FabricConfig {
    pub fn from_env() -> Self {
        let state_db = std::env::var("NETFAB_STATE_DB")
            .map_or_else(|_| PathBuf::from("/var/lib/netfab/state.db"), PathBuf::from);

        let command_timeout = std::env::var("NETFAB_CMD_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map_or(Duration::from_secs(30), Duration::from_secs);

        Self {
            state_db,
            command_timeout,
            trace_timeout: Duration::from_secs(30),
        }
    }
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            state_db: PathBuf::from("/var/lib/netfab/state.db"),
            command_timeout: Duration::from_secs(30),
            trace_timeout: Duration::from_secs(30),
        }
    }
}
