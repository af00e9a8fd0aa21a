//! Network diagnostics: ping and traceroute with explicit bounded timeouts
//! so a hung tool can never stall a controller.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};
use crate::exec::Executor;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingReport {
    pub target: String,
    pub packets_sent: u32,
    pub packet_loss_percent: u8,
    pub output: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TracerouteReport {
    pub target: String,
    pub output: String,
}

/// Targets are host names or addresses; anything outside that charset is
/// rejected before a process is spawned.
fn validate_target(target: &str) -> Result<()> {
    if target.is_empty() {
        return Err(Error::validation("target", "target must not be empty"));
    }
    if !target
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | ':' | '-' | '_'))
    {
        return Err(Error::validation(
            "target",
            format!("'{target}' is not a host name or address"),
        ));
    }
    Ok(())
}

/// Extract the packet-loss percentage from ping's statistics line, e.g.
/// `4 packets transmitted, 4 received, 0% packet loss, time 3004ms`.
fn parse_packet_loss(output: &str) -> Option<u8> {
    let stats = output.lines().find(|l| l.contains("packet loss"))?;
    let percent = stats
        .split(',')
        .find(|part| part.contains("packet loss"))?
        .trim()
        .split('%')
        .next()?
        .trim();
    percent.parse().ok()
}

/// Ping a host `count` times. The timeout scales with the count so slow
/// links still finish.
pub async fn ping(exec: &Executor, target: &str, count: u32) -> Result<PingReport> {
    validate_target(target)?;
    let count = count.clamp(1, 30);
    let timeout = Duration::from_secs(u64::from(count) * 2 + 5);

    let count_arg = count.to_string();
    let output = exec
        .run_with_timeout("ping", &["-c", &count_arg, target], timeout)
        .await?;

    let loss = parse_packet_loss(&output.stdout).unwrap_or(100);
    if !output.success && loss == 100 {
        return Err(Error::system(
            format!("ping {target}"),
            output.diagnostic(),
        ));
    }

    info!("ping {target}: {loss}% packet loss over {count} packets");
    Ok(PingReport {
        target: target.to_string(),
        packets_sent: count,
        packet_loss_percent: loss,
        output: output.stdout,
    })
}

/// Trace the route to a host. Carries its own explicit timeout because
/// traceroute routinely runs long on filtered paths.
pub async fn traceroute(
    exec: &Executor,
    target: &str,
    timeout: Duration,
) -> Result<TracerouteReport> {
    validate_target(target)?;

    let output = exec
        .run_with_timeout("traceroute", &["-n", target], timeout)
        .await?;
    if !output.success {
        return Err(Error::system(
            format!("traceroute {target}"),
            output.diagnostic(),
        ));
    }

    Ok(TracerouteReport {
        target: target.to_string(),
        output: output.stdout,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_charset() {
        assert!(validate_target("10.0.0.1").is_ok());
        assert!(validate_target("host-1.lab.example").is_ok());
        assert!(validate_target("fe80::1").is_ok());
        assert!(validate_target("").is_err());
        assert!(validate_target("host; rm -rf /").is_err());
        assert!(validate_target("a b").is_err());
    }

    #[test]
    fn test_parse_packet_loss() {
        let output = "\
PING 10.0.0.1 (10.0.0.1) 56(84) bytes of data.
64 bytes from 10.0.0.1: icmp_seq=1 ttl=64 time=0.045 ms

--- 10.0.0.1 ping statistics ---
4 packets transmitted, 4 received, 0% packet loss, time 3004ms
rtt min/avg/max/mdev = 0.045/0.053/0.061/0.008 ms
";
        assert_eq!(parse_packet_loss(output), Some(0));

        let lossy = "3 packets transmitted, 1 received, 66% packet loss, time 2010ms";
        assert_eq!(parse_packet_loss(lossy), Some(66));

        assert_eq!(parse_packet_loss("no stats here"), None);
    }
}
