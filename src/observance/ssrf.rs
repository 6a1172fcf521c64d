//! SSRF guard for observance-source HTTP clients.
//!
//! The UN/UNESCO/WHO/Calendarific endpoints are operator-configured but
//! still external URLs, so they're validated the same way before fetch:
//! http(s)-only, standard ports only, no private/loopback/link-local/
//! metadata-endpoint targets.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, ToSocketAddrs};
use url::Url;

#[derive(Debug, Clone)]
pub struct SsrfGuard {
    pub allow_non_standard_ports: bool,
}

impl Default for SsrfGuard {
    fn default() -> Self {
        Self { allow_non_standard_ports: false }
    }
}

impl SsrfGuard {
    pub fn validate_url(&self, url: &Url) -> Result<(), String> {
        match url.scheme() {
            "http" | "https" => {}
            scheme => return Err(format!("scheme '{scheme}' not allowed (only http/https)")),
        }

        let port = url.port_or_known_default().unwrap_or(80);
        if !self.allow_non_standard_ports && port != 80 && port != 443 {
            return Err(format!("port {port} not allowed (only 80/443)"));
        }

        let host_str = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| "URL has no host".to_string())?;

        let ips = Self::resolve(host_str, port)?;
        if ips.is_empty() {
            return Err(format!("hostname '{host_str}' did not resolve to any IP"));
        }
        for ip in &ips {
            if Self::is_private_or_reserved(ip) {
                return Err(format!("IP {ip} is a private, loopback, or reserved address"));
            }
        }
        Ok(())
    }

    fn resolve(host_str: &str, port: u16) -> Result<Vec<IpAddr>, String> {
        if let Ok(ip) = host_str.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }
        format!("{host_str}:{port}")
            .to_socket_addrs()
            .map_err(|e| format!("failed to resolve '{host_str}': {e}"))
            .map(|addrs| addrs.map(|a| a.ip()).collect())
    }

    fn is_private_or_reserved(ip: &IpAddr) -> bool {
        match ip {
            IpAddr::V4(v4) => {
                v4.is_private()
                    || v4.is_loopback()
                    || v4.is_link_local()
                    || v4.is_multicast()
                    || v4.is_unspecified()
                    || v4.is_broadcast()
                    || Self::is_cloud_metadata_ipv4(v4)
            }
            IpAddr::V6(v6) => {
                v6.is_loopback()
                    || v6.is_unspecified()
                    || v6.is_multicast()
                    || Self::is_link_local_ipv6(v6)
                    || Self::is_unique_local_ipv6(v6)
                    || v6.to_ipv4_mapped().is_some_and(|v4| Self::is_private_or_reserved(&IpAddr::V4(v4)))
            }
        }
    }

    fn is_cloud_metadata_ipv4(ip: &Ipv4Addr) -> bool {
        ip.octets() == [169, 254, 169, 254]
    }

    fn is_link_local_ipv6(ip: &Ipv6Addr) -> bool {
        (ip.segments()[0] & 0xffc0) == 0xfe80
    }

    fn is_unique_local_ipv6(ip: &Ipv6Addr) -> bool {
        (ip.segments()[0] & 0xfe00) == 0xfc00
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_http_scheme() {
        let guard = SsrfGuard::default();
        let url = Url::parse("file:///etc/passwd").unwrap();
        assert!(guard.validate_url(&url).is_err());
    }

    #[test]
    fn rejects_loopback_ip_literal() {
        let guard = SsrfGuard::default();
        let url = Url::parse("http://127.0.0.1/x").unwrap();
        assert!(guard.validate_url(&url).is_err());
    }

    #[test]
    fn rejects_private_ip_literal() {
        let guard = SsrfGuard::default();
        let url = Url::parse("http://10.0.0.5/x").unwrap();
        assert!(guard.validate_url(&url).is_err());
    }

    #[test]
    fn rejects_cloud_metadata_endpoint() {
        let guard = SsrfGuard::default();
        let url = Url::parse("http://169.254.169.254/latest/meta-data/").unwrap();
        assert!(guard.validate_url(&url).is_err());
    }

    #[test]
    fn rejects_non_standard_port_by_default() {
        let guard = SsrfGuard::default();
        let url = Url::parse("http://93.184.216.34:8080/x").unwrap();
        assert!(guard.validate_url(&url).is_err());
    }

    #[test]
    fn allows_public_ip_on_standard_port() {
        let guard = SsrfGuard::default();
        let url = Url::parse("http://93.184.216.34/x").unwrap();
        assert!(guard.validate_url(&url).is_ok());
    }
}
