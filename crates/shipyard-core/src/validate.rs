//! Input validation shared by the API and the supervisors.

use std::sync::LazyLock;

use regex::Regex;

static DNS_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?\.)+[a-z]{2,63}$").expect("static regex")
});

/// Fully-qualified lowercase DNS name, e.g. `tenant.cloud.example.com`.
pub fn is_valid_dns_name(name: &str) -> bool {
    name.len() <= 253 && DNS_NAME.is_match(name)
}

/// Parse a Kubernetes version such as `1.29.3` or `v1.29.3`.
pub fn parse_kubernetes_version(version: &str) -> Result<semver::Version, semver::Error> {
    semver::Version::parse(version.strip_prefix('v').unwrap_or(version))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dns_names() {
        assert!(is_valid_dns_name("tenant.cloud.example.com"));
        assert!(is_valid_dns_name("a-b.example.io"));
        assert!(!is_valid_dns_name("Tenant.example.com"));
        assert!(!is_valid_dns_name("-bad.example.com"));
        assert!(!is_valid_dns_name("localhost"));
    }

    #[test]
    fn kubernetes_versions() {
        assert_eq!(parse_kubernetes_version("v1.29.3").unwrap().minor, 29);
        assert_eq!(parse_kubernetes_version("1.30.0").unwrap().major, 1);
        assert!(parse_kubernetes_version("latest").is_err());
    }
}
