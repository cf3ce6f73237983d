//! Which queries may be answered by the local resolver

use log::warn;
use regex::Regex;
use ssdroid::net::Subnet;

use crate::acl::{Acl, Route};

/// Conditions for answering a query locally instead of forwarding it
#[derive(Debug, Clone, Default)]
pub struct DnsPolicy {
    /// Forward every query, the local resolver is never used
    pub forward_only: bool,
    /// Names matching this are always forwarded
    pub force_remote: Option<Regex>,
    /// When not empty, a local answer is only used if one of its addresses is inside of these subnets
    pub accepted_local_subnets: Vec<Subnet>,
}

impl DnsPolicy {
    pub fn forward_only() -> DnsPolicy {
        DnsPolicy {
            forward_only: true,
            ..DnsPolicy::default()
        }
    }

    /// Policy for `route`, whose ruleset is `acl`
    ///
    /// Routes proxying everything forward every query. Otherwise proxied hostnames always go to the remote DNS and,
    /// for rulesets in proxy mode, a local answer must fall into one of the bypassed subnets.
    pub fn from_acl(route: Route, acl: &Acl) -> DnsPolicy {
        match route {
            Route::All | Route::BypassLan => DnsPolicy::forward_only(),
            Route::ChinaList => DnsPolicy::default(),
            Route::BypassChina | Route::BypassLanChina | Route::Gfwlist | Route::CustomRules => DnsPolicy {
                forward_only: false,
                force_remote: hostname_matcher(acl.proxy_hostnames.iter()),
                accepted_local_subnets: if acl.bypass {
                    Vec::new()
                } else {
                    acl.subnets.iter().copied().collect()
                },
            },
        }
    }

    /// Check if `host` must be resolved remotely
    pub fn is_forced_remote(&self, host: &str) -> bool {
        match self.force_remote {
            Some(ref matcher) => matcher.is_match(host),
            None => false,
        }
    }

    /// Check if a local answer containing `addrs` can be trusted
    pub fn accepts_local(&self, addrs: &[std::net::IpAddr]) -> bool {
        self.accepted_local_subnets.is_empty()
            || self
                .accepted_local_subnets
                .iter()
                .any(|subnet| addrs.iter().any(|addr| subnet.matches(addr)))
    }
}

/// Union of hostname patterns, invalid ones are skipped
fn hostname_matcher<'a, I>(patterns: I) -> Option<Regex>
where
    I: Iterator<Item = &'a String>,
{
    let mut union = String::new();
    for pattern in patterns {
        if let Err(err) = Regex::new(pattern) {
            warn!("hostname pattern {} is not a valid regex, skipped, error: {}", pattern, err);
            continue;
        }
        if !union.is_empty() {
            union.push('|');
        }
        union.push_str("(?:");
        union.push_str(pattern);
        union.push(')');
    }

    if union.is_empty() {
        return None;
    }
    match Regex::new(&union) {
        Ok(r) => Some(r),
        Err(err) => {
            warn!("hostname patterns union is not a valid regex, error: {}", err);
            None
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn routes_without_acl_forward_everything() {
        let acl = Acl::from_str_with("[bypass_list]\n10.0.0.0/8\n", false);
        assert!(DnsPolicy::from_acl(Route::All, &acl).forward_only);
        assert!(DnsPolicy::from_acl(Route::BypassLan, &acl).forward_only);

        let p = DnsPolicy::from_acl(Route::ChinaList, &acl);
        assert!(!p.forward_only);
        assert!(p.force_remote.is_none());
        assert!(p.accepted_local_subnets.is_empty());
    }

    #[test]
    fn proxy_mode_acl_accepts_bypassed_subnets() {
        let acl = Acl::from_str_with(
            "[proxy_all]\n[bypass_list]\n1.0.0.0/8\n[proxy_list]\n(^|\\.)google\\.com$\n",
            false,
        );
        let p = DnsPolicy::from_acl(Route::BypassChina, &acl);
        assert!(!p.forward_only);
        assert!(p.is_forced_remote("www.google.com"));
        assert!(!p.is_forced_remote("google.com.cn"));
        assert!(p.accepts_local(&["1.2.3.4".parse().unwrap()]));
        assert!(!p.accepts_local(&["8.8.8.8".parse().unwrap()]));
    }

    #[test]
    fn bypass_mode_acl_accepts_any_local_answer() {
        let acl = Acl::from_str_with("[bypass_all]\n[proxy_list]\n8.8.0.0/16\nblocked\\.example\n(invalid\n", false);
        let p = DnsPolicy::from_acl(Route::Gfwlist, &acl);
        assert!(p.accepted_local_subnets.is_empty());
        assert!(p.accepts_local(&["8.8.8.8".parse().unwrap()]));
        assert!(p.is_forced_remote("blocked.example"));
        assert!(!p.is_forced_remote("(invalid"));
    }
}
