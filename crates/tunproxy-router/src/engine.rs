//! Routing engine
//!
//! `decide(inbound_tag, destination)`:
//!
//! 1. Look up the destination's country code `CC` and form `!CC`.
//! 2. Scan rules whose `in_tag` equals the inbound tag, in order. A rule
//!    listing `!CC` routes the connection direct immediately; otherwise its
//!    `out_tag` becomes the tentative choice (later rules overwrite it).
//! 3. Without a matching rule, a destination, or a country code, fall back
//!    to the first resolved outbound, or direct if there is none.

use std::fmt;
use std::net::IpAddr;
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};
use tunproxy_proto::DIRECT_TAG;

use crate::directory::OutboundDirectory;
use crate::geoip::{GeoIpLookup, NoGeoIp};

/// One routing rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub in_tag: String,
    pub out_tag: String,
    /// Negated country patterns (`!CC`), stored upper-case
    pub bypass: Vec<String>,
}

impl Rule {
    pub fn new(in_tag: impl Into<String>, out_tag: impl Into<String>, patterns: &[String]) -> Self {
        Self {
            in_tag: in_tag.into(),
            out_tag: out_tag.into(),
            bypass: patterns.iter().map(|p| p.trim().to_ascii_uppercase()).collect(),
        }
    }
}

/// Outcome of a routing decision
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Route {
    Direct,
    Tunnel(String),
}

impl Route {
    fn from_tag(tag: String) -> Self {
        if tag.eq_ignore_ascii_case(DIRECT_TAG) {
            Route::Direct
        } else {
            Route::Tunnel(tag)
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Route::Direct => f.write_str(DIRECT_TAG),
            Route::Tunnel(tag) => f.write_str(tag),
        }
    }
}

pub struct Router {
    rules: RwLock<Arc<Vec<Rule>>>,
    geoip: RwLock<Arc<dyn GeoIpLookup>>,
    directory: Arc<OutboundDirectory>,
}

impl Router {
    /// Router with no rules and no GeoIP database
    pub fn new(directory: Arc<OutboundDirectory>) -> Self {
        Self {
            rules: RwLock::new(Arc::new(Vec::new())),
            geoip: RwLock::new(Arc::new(NoGeoIp)),
            directory,
        }
    }

    pub fn with_geoip(self, geoip: Arc<dyn GeoIpLookup>) -> Self {
        self.set_geoip(geoip);
        self
    }

    pub fn with_rules(self, rules: Vec<Rule>) -> Self {
        self.load_rules(rules);
        self
    }

    /// Replace the rule table
    pub fn load_rules(&self, rules: Vec<Rule>) {
        debug!("Loaded {} routing rules", rules.len());
        *self.rules.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(rules);
    }

    pub fn set_geoip(&self, geoip: Arc<dyn GeoIpLookup>) {
        *self.geoip.write().unwrap_or_else(|e| e.into_inner()) = geoip;
    }

    pub fn directory(&self) -> &Arc<OutboundDirectory> {
        &self.directory
    }

    fn default_route(&self) -> Route {
        match self.directory.default_tag() {
            Some(tag) => Route::from_tag(tag),
            None => Route::Direct,
        }
    }

    pub fn decide(&self, inbound_tag: &str, destination: Option<IpAddr>) -> Route {
        let Some(ip) = destination else {
            return self.default_route();
        };

        let geoip = self.geoip.read().unwrap_or_else(|e| e.into_inner()).clone();
        let code = match geoip.country_code(ip) {
            Ok(code) => code,
            Err(e) => {
                warn!(ip = %ip, "GeoIP lookup failed: {}", e);
                return self.default_route();
            }
        };
        let negated = format!("!{}", code.to_ascii_uppercase());

        let rules = self.rules.read().unwrap_or_else(|e| e.into_inner()).clone();
        let mut selected: Option<&str> = None;
        for rule in rules.iter().filter(|r| r.in_tag == inbound_tag) {
            if rule.bypass.iter().any(|p| *p == negated) {
                debug!(inbound = %inbound_tag, ip = %ip, "Bypass rule matched {}", negated);
                return Route::Direct;
            }
            selected = Some(&rule.out_tag);
        }

        match selected {
            Some(tag) => Route::from_tag(tag.to_string()),
            None => self.default_route(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geoip::StaticGeoIp;

    const US_IP: &str = "8.8.8.8";
    const CN_IP: &str = "114.114.114.114";
    const UNKNOWN_IP: &str = "10.0.0.1";

    fn ip(s: &str) -> Option<IpAddr> {
        Some(s.parse().unwrap())
    }

    fn geoip() -> Arc<dyn GeoIpLookup> {
        Arc::new(
            StaticGeoIp::new()
                .with(US_IP.parse().unwrap(), "US")
                .with(CN_IP.parse().unwrap(), "cn"),
        )
    }

    fn directory_with(tags: &[&str]) -> Arc<OutboundDirectory> {
        let directory = Arc::new(OutboundDirectory::new());
        for (i, tag) in tags.iter().enumerate() {
            directory.resolve(tag, "1.2.3.4", 51000 + i as u16).unwrap();
        }
        directory
    }

    fn router(tags: &[&str], rules: Vec<Rule>) -> Router {
        Router::new(directory_with(tags))
            .with_geoip(geoip())
            .with_rules(rules)
    }

    #[test]
    fn test_negated_country_bypass() {
        let router = router(
            &["vpn1"],
            vec![Rule::new("lan", "vpn1", &["!US".to_string()])],
        );

        assert_eq!(router.decide("lan", ip(US_IP)), Route::Direct);
        assert_eq!(
            router.decide("lan", ip(CN_IP)),
            Route::Tunnel("vpn1".to_string())
        );
    }

    #[test]
    fn test_patterns_are_case_insensitive() {
        let router = router(&["vpn1"], vec![Rule::new("lan", "vpn1", &["!cn".to_string()])]);
        assert_eq!(router.decide("lan", ip(CN_IP)), Route::Direct);
    }

    #[test]
    fn test_default_is_first_directory_entry() {
        let router = router(
            &["vpn1"],
            vec![Rule::new("lan", "vpn1", &["!US".to_string()])],
        );

        assert_eq!(
            router.decide("guest", ip(US_IP)),
            Route::Tunnel("vpn1".to_string())
        );
    }

    #[test]
    fn test_default_is_direct_with_empty_directory() {
        let router = router(&[], Vec::new());
        assert_eq!(router.decide("guest", ip(US_IP)), Route::Direct);
        assert_eq!(router.decide("guest", None), Route::Direct);
    }

    #[test]
    fn test_geoip_failure_falls_back_to_default() {
        let router = router(
            &["vpn2", "vpn1"],
            vec![Rule::new("lan", "vpn1", &["!US".to_string()])],
        );

        assert_eq!(
            router.decide("lan", ip(UNKNOWN_IP)),
            Route::Tunnel("vpn2".to_string())
        );
        assert_eq!(router.decide("lan", None), Route::Tunnel("vpn2".to_string()));
    }

    #[test]
    fn test_last_matching_rule_wins() {
        let router = router(
            &["vpn1", "vpn2"],
            vec![
                Rule::new("lan", "vpn1", &[]),
                Rule::new("wifi", "vpn1", &[]),
                Rule::new("lan", "vpn2", &[]),
            ],
        );

        assert_eq!(
            router.decide("lan", ip(CN_IP)),
            Route::Tunnel("vpn2".to_string())
        );
    }

    #[test]
    fn test_bypass_short_circuits_later_rules() {
        let router = router(
            &["vpn1", "vpn2"],
            vec![
                Rule::new("lan", "vpn1", &["!US".to_string()]),
                Rule::new("lan", "vpn2", &[]),
            ],
        );

        assert_eq!(router.decide("lan", ip(US_IP)), Route::Direct);
    }

    #[test]
    fn test_direct_out_tag() {
        let router = router(&["vpn1"], vec![Rule::new("lan", "DIRECT", &[])]);
        assert_eq!(router.decide("lan", ip(CN_IP)), Route::Direct);
    }

    #[test]
    fn test_decision_is_deterministic() {
        let router = router(
            &["vpn1", "vpn2"],
            vec![
                Rule::new("lan", "vpn1", &["!US".to_string()]),
                Rule::new("lan", "vpn2", &["!JP".to_string()]),
            ],
        );

        let first = router.decide("lan", ip(CN_IP));
        for _ in 0..100 {
            assert_eq!(router.decide("lan", ip(CN_IP)), first);
        }
    }

    #[test]
    fn test_route_display() {
        assert_eq!(Route::Direct.to_string(), "direct");
        assert_eq!(Route::Tunnel("vpn1".to_string()).to_string(), "vpn1");
    }
}
