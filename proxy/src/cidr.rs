use ipnet::IpNet;
use std::net::IpAddr;
use tracing::warn;

/// Networks that are never reachable regardless of allowlists. The defaults
/// exist to defeat DNS tricks (rebinding, CNAME chains through internal
/// ranges) even when the allowlists are permissive.
const DEFAULT_BLOCKED: &[&str] = &[
    "10.0.0.0/8",
    "172.16.0.0/12",
    "192.168.0.0/16",
    "127.0.0.0/8",
    "169.254.0.0/16",
    "::1/128",
    "fc00::/7",
    "fe80::/10",
];

/// Immutable set of blocked networks: the fixed default ranges plus any
/// configured extras. Constructed once at startup, shared by reference.
#[derive(Debug)]
pub struct CidrBlocker {
    networks: Vec<IpNet>,
}

impl CidrBlocker {
    /// Build the blocker from configured extra ranges. Unparseable entries
    /// are skipped; the default set always applies.
    pub fn new(extra: &[String]) -> Self {
        let mut networks: Vec<IpNet> = DEFAULT_BLOCKED
            .iter()
            .filter_map(|cidr| cidr.parse().ok())
            .collect();
        for entry in extra {
            match entry.parse::<IpNet>() {
                Ok(net) => networks.push(net),
                Err(err) => warn!("skipping unparseable block-cidr entry {entry:?}: {err}"),
            }
        }
        Self { networks }
    }

    pub fn is_blocked(&self, ip: IpAddr) -> bool {
        self.networks.iter().any(|net| net.contains(&ip))
    }
}

impl Default for CidrBlocker {
    fn default() -> Self {
        Self::new(&[])
    }
}
