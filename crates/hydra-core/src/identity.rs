//! Origin classification.
//!
//! An identity is a plain string naming either an internal application
//! (a key of the configured `ports` table) or an external domain checked
//! against the SSL allow-list. Classification is recomputed from the
//! tables on every call — nothing is cached, so table changes apply to
//! the next lookup immediately.

use crate::config::RelayTables;
use regex::Regex;
use std::sync::OnceLock;

/// How an identity classifies against the current tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityKind {
    /// Exactly one of the configured internal application names.
    App,
    /// Carries an allow-listed domain (the extracted domain is attached).
    Domain(String),
    /// Neither an app name nor an allow-listed domain. Admission treats
    /// this as reject.
    Unknown,
}

/// Two-or-more dot-separated word segments, anywhere in the identity.
fn domain_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\w+(?:\.\w+)+").expect("domain pattern compiles"))
}

/// Extract the first domain-like substring from an identity, if any.
///
/// `https://acme.studio110.local:443` yields `acme.studio110.local`.
pub fn extract_domain(identity: &str) -> Option<&str> {
    domain_pattern().find(identity).map(|m| m.as_str())
}

/// Classify an identity against the current tables.
pub fn classify(identity: &str, tables: &RelayTables) -> IdentityKind {
    if tables.ports.contains_key(identity) {
        return IdentityKind::App;
    }
    match extract_domain(identity) {
        Some(domain) if tables.allowed_ssl_domains.iter().any(|d| d == domain) => {
            IdentityKind::Domain(domain.to_string())
        }
        _ => IdentityKind::Unknown,
    }
}

/// Whether the identity is "our own": an app name or an allow-listed domain.
pub fn is_own_app(identity: &str, tables: &RelayTables) -> bool {
    !matches!(classify(identity, tables), IdentityKind::Unknown)
}

/// Whether the identity ends with the machine's `<hostname>.local` suffix.
///
/// Compared case-insensitively; this is the admission fallback for peers
/// reaching the relay through a local vhost.
pub fn has_local_suffix(identity: &str, hostname: &str) -> bool {
    let suffix = format!("{}.local", hostname.to_lowercase());
    identity.to_lowercase().ends_with(&suffix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn tables() -> RelayTables {
        RelayTables {
            ports: BTreeMap::from([
                ("cerberus".to_string(), 1232),
                ("medusa".to_string(), 1233),
                ("hydra".to_string(), 1234),
            ]),
            allowed_ssl_domains: vec![
                "acme.studio110.local".to_string(),
                "whaaat.io".to_string(),
            ],
            vhosts: BTreeMap::new(),
            hostname: "studio110".to_string(),
        }
    }

    #[test]
    fn app_names_classify_as_app() {
        assert_eq!(classify("medusa", &tables()), IdentityKind::App);
        assert_eq!(classify("cerberus", &tables()), IdentityKind::App);
    }

    #[test]
    fn allow_listed_domains_classify_as_domain() {
        assert_eq!(
            classify("acme.studio110.local", &tables()),
            IdentityKind::Domain("acme.studio110.local".to_string())
        );
    }

    #[test]
    fn domain_is_extracted_from_a_larger_origin_string() {
        assert_eq!(
            extract_domain("https://whaaat.io:443"),
            Some("whaaat.io")
        );
        assert_eq!(
            classify("https://whaaat.io:443", &tables()),
            IdentityKind::Domain("whaaat.io".to_string())
        );
    }

    #[test]
    fn unlisted_domains_are_unknown() {
        assert_eq!(classify("evil.com", &tables()), IdentityKind::Unknown);
    }

    #[test]
    fn identities_without_a_domain_are_unknown() {
        // No dot-separated segments to extract — reject for safety.
        assert_eq!(classify("gorgon", &tables()), IdentityKind::Unknown);
        assert_eq!(classify("", &tables()), IdentityKind::Unknown);
    }

    #[test]
    fn classification_tracks_table_changes() {
        let mut t = tables();
        assert_eq!(classify("new.example.com", &t), IdentityKind::Unknown);
        t.allowed_ssl_domains.push("new.example.com".to_string());
        assert_eq!(
            classify("new.example.com", &t),
            IdentityKind::Domain("new.example.com".to_string())
        );
    }

    #[test]
    fn local_suffix_check() {
        assert!(has_local_suffix("acme.studio110.local", "studio110"));
        assert!(has_local_suffix("acme.Studio110.LOCAL", "Studio110"));
        assert!(!has_local_suffix("acme.other.local", "studio110"));
        assert!(!has_local_suffix("medusa", "studio110"));
    }
}
