use std::net::IpAddr;

pub const REASON_NOT_IN_ALLOWLIST: &str = "domain not in allowlist";
pub const REASON_RESOLVED_IP_BLOCKED: &str = "resolved IP in blocked CIDR range";
pub const REASON_HOST_PORT_NOT_ALLOWED: &str = "host port not allowed";

pub fn resolved_ip_blocked(ip: IpAddr) -> String {
    format!("resolved IP {ip} is in blocked CIDR range")
}
