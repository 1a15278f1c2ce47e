//! MAC to IP discovery on the lab network.
//!
//! The hypervisor knows each domain's MAC address but not the address its
//! guest picked up, so the lab network is scanned with an ARP scanner and
//! the answers are joined back to domains by MAC.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::NetworkConfig;
use crate::shell::{quote, HostShell};

/// `<ipv4> <whitespace> <mac>` at the start of a scan output line.
static SCAN_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d{1,3}(?:\.\d{1,3}){3})\s+((?:[0-9A-Fa-f]{1,2}[:-]){5}[0-9A-Fa-f]{1,2})(?:\s|$)")
        .expect("scan line pattern is valid")
});

/// Normalize a MAC address to lowercase, colon-separated, two-digit octets.
///
/// Accepts colon- or dash-separated octets (single-digit octets are zero
/// padded) or a contiguous hex string, which is split into pairs. The result
/// is a fixed point: normalizing it again changes nothing.
pub fn normalize_mac(mac: &str) -> String {
    let mac = mac.trim().to_ascii_lowercase();

    let groups: Vec<String> = if mac.contains(':') || mac.contains('-') {
        mac.split(|c: char| c == ':' || c == '-')
            .map(|group| format!("{:0>2}", group))
            .collect()
    } else {
        mac.chars()
            .collect::<Vec<_>>()
            .chunks(2)
            .map(|pair| format!("{:0>2}", pair.iter().collect::<String>()))
            .collect()
    };

    groups.join(":")
}

/// Parse address scan output into a normalized-MAC → IP map.
///
/// Lines that do not start with an IPv4 address followed by a MAC address
/// (headers, summaries, blank lines) are ignored. When a MAC shows up more
/// than once the last line wins.
pub fn parse_scan_output(output: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();

    for line in output.lines() {
        let Some(caps) = SCAN_LINE.captures(line) else {
            continue;
        };
        let ip = &caps[1];
        if ip.parse::<Ipv4Addr>().is_err() {
            continue;
        }
        map.insert(normalize_mac(&caps[2]), ip.to_string());
    }

    map
}

/// Runs the address scan over the configured range.
pub struct NetworkDiscovery {
    shell: Arc<dyn HostShell>,
    config: NetworkConfig,
}

impl NetworkDiscovery {
    pub fn new(shell: Arc<dyn HostShell>, config: NetworkConfig) -> Self {
        Self { shell, config }
    }

    /// Scan the configured interface and range.
    pub async fn scan(&self) -> HashMap<String, String> {
        self.scan_range(
            &self.config.interface,
            &self.config.lower_ip,
            &self.config.upper_ip,
        )
        .await
    }

    /// Scan `low_ip..=high_ip` on `interface`.
    ///
    /// A failing scan yields an empty map: callers treat every VM as
    /// currently unaddressed rather than aborting.
    pub async fn scan_range(
        &self,
        interface: &str,
        low_ip: &str,
        high_ip: &str,
    ) -> HashMap<String, String> {
        let command = format!(
            "{}{} --interface={} {}-{}",
            if self.config.use_sudo { "sudo " } else { "" },
            self.config.scan_command,
            quote(interface),
            quote(low_ip),
            quote(high_ip),
        );

        match self.shell.run(&command).await {
            Ok(result) if result.success => {
                let map = parse_scan_output(&result.stdout);
                debug!(interface = %interface, hosts = map.len(), "Address scan complete");
                map
            }
            Ok(result) => {
                warn!(interface = %interface, stderr = %result.stderr.trim(), "Address scan failed");
                HashMap::new()
            }
            Err(e) => {
                warn!(interface = %interface, error = %e, "Address scan could not be run");
                HashMap::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::ScriptedShell;
    use proptest::prelude::*;

    #[test]
    fn test_normalize_mac_pads_and_lowercases() {
        assert_eq!(normalize_mac("AA:B:CC:D:EE:F"), "aa:0b:cc:0d:ee:0f");
        assert_eq!(normalize_mac("aabbccddeeff"), "aa:bb:cc:dd:ee:ff");
        assert_eq!(normalize_mac("AA-BB-CC-DD-EE-01"), "aa:bb:cc:dd:ee:01");
    }

    #[test]
    fn test_optional_mac_stays_absent() {
        let absent: Option<&str> = None;
        assert_eq!(absent.map(normalize_mac), None);
    }

    proptest! {
        #[test]
        fn normalize_mac_is_idempotent(octets in proptest::collection::vec("[0-9a-fA-F]{1,2}", 6)) {
            let once = normalize_mac(&octets.join(":"));
            prop_assert_eq!(normalize_mac(&once), once);
        }

        #[test]
        fn normalize_contiguous_mac_is_idempotent(hex in "[0-9a-fA-F]{12}") {
            let once = normalize_mac(&hex);
            prop_assert_eq!(normalize_mac(&once), once.clone());
            prop_assert_eq!(once.len(), 17);
        }
    }

    #[test]
    fn test_parse_scan_output() {
        let output = "Interface: virbr0, type: EN10MB, MAC: 52:54:00:8a:11:22, IPv4: 192.168.1.1\n\
                      Starting arp-scan 1.10.0 with 253 hosts\n\
                      192.168.1.10   aa:bb:cc:dd:ee:ff (eth0)\n\
                      192.168.1.11\t52:54:00:0A:B:01\tQEMU\n\
                      \n\
                      999.1.1.1\taa:bb:cc:dd:ee:00\n\
                      2 packets received by filter, 0 packets dropped by kernel\n";

        let map = parse_scan_output(output);
        assert_eq!(map.len(), 2);
        assert_eq!(map["aa:bb:cc:dd:ee:ff"], "192.168.1.10");
        assert_eq!(map["52:54:00:0a:0b:01"], "192.168.1.11");
    }

    #[test]
    fn test_parse_scan_output_last_duplicate_wins() {
        let output = "10.0.0.5\taa:bb:cc:dd:ee:02\n10.0.0.9\tAA:BB:CC:DD:EE:02 (DUP: 2)\n";
        let map = parse_scan_output(output);
        assert_eq!(map.len(), 1);
        assert_eq!(map["aa:bb:cc:dd:ee:02"], "10.0.0.9");
    }

    #[test]
    fn test_parse_scan_output_ignores_headers() {
        assert!(parse_scan_output("Interface: lab0, datalink type: EN10MB\n").is_empty());
    }

    #[tokio::test]
    async fn test_scan_builds_command_and_parses() {
        let shell = Arc::new(ScriptedShell::new());
        shell.respond(
            "arp-scan --interface=lab0 10.0.0.2-10.0.0.9",
            true,
            "10.0.0.5\taa:bb:cc:dd:ee:02\n",
        );

        let config = NetworkConfig {
            interface: "lab0".to_string(),
            lower_ip: "10.0.0.2".to_string(),
            upper_ip: "10.0.0.9".to_string(),
            use_sudo: true,
            ..NetworkConfig::default()
        };
        let discovery = NetworkDiscovery::new(shell.clone(), config);

        let map = discovery.scan().await;
        assert_eq!(map["aa:bb:cc:dd:ee:02"], "10.0.0.5");
        assert_eq!(
            shell.commands(),
            vec!["sudo arp-scan --interface=lab0 10.0.0.2-10.0.0.9"]
        );
    }

    #[tokio::test]
    async fn test_failed_scan_is_empty() {
        let shell = Arc::new(ScriptedShell::new());
        shell.respond("arp-scan", false, "10.0.0.5\taa:bb:cc:dd:ee:02\n");

        let discovery = NetworkDiscovery::new(shell, NetworkConfig::default());
        assert!(discovery.scan().await.is_empty());
    }
}
