//! Access Control List (ACL) rulesets
//!
//! A ruleset decides which destinations bypass the proxy and which go through it. It is consumed by the
//! proxy process (as an `.acl` file) and by the local DNS forwarder.

use std::{
    collections::BTreeSet,
    fmt::{self, Write as _},
    io::{self, BufRead},
    sync::LazyLock,
};

use futures::future::{BoxFuture, FutureExt};
use log::{debug, trace, warn};
use regex::Regex;
use ssdroid::net::Subnet;
use url::Url;

pub use self::{
    fetcher::{HttpRuleFetcher, RuleFetcher},
    storage::{AclStore, Route},
};

mod fetcher;
mod storage;

/// Depth used when flattening the user's custom rules
pub const CUSTOM_RULES_FLATTEN_DEPTH: usize = 10;

static IMPORT_URL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^IMPORT_URL\s*<(.+)>\s*$").expect("IMPORT_URL regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Bypass,
    Proxy,
    Disabled,
}

/// ACL ruleset
///
/// ## Sections
///
/// ```plain
/// [bypass_all]
/// [proxy_list]
/// (^|\.)example\.com$
/// 10.0.0.0/8
/// #IMPORT_URL <https://example.com/extra.acl>
/// ```
///
/// | Header | Effect |
/// |--------|--------|
/// | `[bypass_all]`, `[reject_all]` | `bypass = true`, everything not listed connects directly |
/// | `[proxy_all]`, `[accept_all]` | `bypass = false`, everything not listed is proxied |
/// | `[bypass_list]`, `[black_list]` | following rules bypass the proxy |
/// | `[proxy_list]`, `[white_list]` | following rules go through the proxy |
/// | `[outbound_block_list]` and unknown headers | following rules are ignored |
///
/// A rule is a subnet literal (`1.2.3.4`, `10.0.0.0/8`, `::1`) or, failing that, a hostname regex. Both
/// hostname lists are kept. Of the subnets, only those of the exception list for the resolved mode survive:
/// proxy subnets in bypass mode, bypass subnets in proxy mode.
///
/// `#IMPORT_URL <url>` in a comment, anywhere in the file, imports the ruleset at `url`, see [`Acl::flatten`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Acl {
    pub bypass: bool,
    pub bypass_hostnames: BTreeSet<String>,
    pub proxy_hostnames: BTreeSet<String>,
    pub subnets: BTreeSet<Subnet>,
    pub urls: BTreeSet<Url>,
}

impl Acl {
    /// An empty ruleset in proxy mode
    pub fn new() -> Acl {
        Acl::default()
    }

    /// Parse a ruleset from a reader
    ///
    /// `default_bypass` is the mode used until a `[bypass_all]` / `[proxy_all]` header is seen. It also picks the
    /// initial section: the proxy list in bypass mode, the bypass list otherwise.
    pub fn from_reader<R: BufRead>(reader: R, default_bypass: bool) -> io::Result<Acl> {
        let mut parser = Parser::new(default_bypass);
        for line in reader.lines() {
            parser.parse_line(&line?);
        }
        Ok(parser.finish())
    }

    /// Parse a ruleset from a string
    pub fn from_str_with(text: &str, default_bypass: bool) -> Acl {
        let mut parser = Parser::new(default_bypass);
        for line in text.lines() {
            parser.parse_line(line);
        }
        parser.finish()
    }

    /// The user's custom rules, which always run in bypass mode
    ///
    /// A custom rules text written in proxy mode is switched to bypass mode and its subnets are dropped.
    pub fn custom_rules(text: Option<&str>) -> Acl {
        let mut acl = match text {
            Some(text) => Acl::from_str_with(text, true),
            None => Acl::from_str_with("", true),
        };
        if !acl.bypass {
            acl.bypass = true;
            acl.subnets.clear();
        }
        acl
    }

    /// Serialized custom rules, `None` if there is nothing worth storing
    pub fn to_custom_rules(&self) -> Option<String> {
        if (!self.bypass || self.subnets.is_empty())
            && self.bypass_hostnames.is_empty()
            && self.proxy_hostnames.is_empty()
            && self.urls.is_empty()
        {
            None
        } else {
            Some(self.to_string())
        }
    }

    /// Replace everything in this ruleset with a copy of `other`
    pub fn from_acl(&mut self, other: &Acl) -> &mut Acl {
        self.clone_from(other);
        self
    }

    /// Add every hostname, subnet and import of `other` into this ruleset, the mode is left untouched
    pub fn merge(&mut self, other: &Acl) {
        self.bypass_hostnames.extend(other.bypass_hostnames.iter().cloned());
        self.proxy_hostnames.extend(other.proxy_hostnames.iter().cloned());
        self.subnets.extend(other.subnets.iter().copied());
        self.urls.extend(other.urls.iter().cloned());
    }

    /// Check if there are no rules nor imports
    pub fn is_empty(&self) -> bool {
        self.bypass_hostnames.is_empty()
            && self.proxy_hostnames.is_empty()
            && self.subnets.is_empty()
            && self.urls.is_empty()
    }

    /// Resolve imports recursively, merging the imported rules into this ruleset
    ///
    /// Every import is fetched with `fetcher` and parsed with this ruleset's mode as default, then flattened with
    /// `max_depth - 1`. An import whose resolved mode differs from ours contributes its hostnames only. A failing
    /// import is skipped. Imports are cleared afterwards, including the ones left unresolved at depth `0`.
    pub fn flatten<'a, F>(&'a mut self, max_depth: usize, fetcher: &'a F) -> BoxFuture<'a, ()>
    where
        F: RuleFetcher + ?Sized,
    {
        async move {
            if max_depth > 0 {
                let urls = std::mem::take(&mut self.urls);
                for url in urls.iter() {
                    let text = match fetcher.fetch(url).await {
                        Ok(text) => text,
                        Err(err) => {
                            warn!("failed to import ACL from {}, error: {}", url, err);
                            continue;
                        }
                    };

                    let mut child = Acl::from_str_with(&text, self.bypass);
                    child.flatten(max_depth - 1, fetcher).await;

                    if child.bypass != self.bypass {
                        warn!(
                            "imported ACL {} has a conflicting mode, its subnets are discarded",
                            url
                        );
                        child.subnets.clear();
                    }

                    debug!(
                        "imported ACL {}, {} bypass hostnames, {} proxy hostnames, {} subnets",
                        url,
                        child.bypass_hostnames.len(),
                        child.proxy_hostnames.len(),
                        child.subnets.len()
                    );

                    self.bypass_hostnames.append(&mut child.bypass_hostnames);
                    self.proxy_hostnames.append(&mut child.proxy_hostnames);
                    self.subnets.append(&mut child.subnets);
                }
            }
            self.urls.clear();
        }
        .boxed()
    }
}

impl fmt::Display for Acl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if self.bypass { "[bypass_all]\n" } else { "[proxy_all]\n" })?;

        let subnets = self.subnets.iter().map(ToString::to_string);
        let (bypass_list, proxy_list): (Vec<String>, Vec<String>) = if self.bypass {
            (
                self.bypass_hostnames.iter().cloned().collect(),
                subnets.chain(self.proxy_hostnames.iter().cloned()).collect(),
            )
        } else {
            (
                subnets.chain(self.bypass_hostnames.iter().cloned()).collect(),
                self.proxy_hostnames.iter().cloned().collect(),
            )
        };

        for (header, list) in [("[bypass_list]", bypass_list), ("[proxy_list]", proxy_list)] {
            if list.is_empty() {
                continue;
            }
            f.write_str(header)?;
            f.write_char('\n')?;
            for item in list {
                f.write_str(&item)?;
                f.write_char('\n')?;
            }
        }

        for url in &self.urls {
            writeln!(f, "#IMPORT_URL <{url}>")?;
        }
        Ok(())
    }
}

struct Parser {
    acl: Acl,
    section: Section,
    bypass_subnets: BTreeSet<Subnet>,
    proxy_subnets: BTreeSet<Subnet>,
}

impl Parser {
    fn new(default_bypass: bool) -> Parser {
        Parser {
            acl: Acl {
                bypass: default_bypass,
                ..Acl::default()
            },
            section: if default_bypass { Section::Proxy } else { Section::Bypass },
            bypass_subnets: BTreeSet::new(),
            proxy_subnets: BTreeSet::new(),
        }
    }

    fn parse_line(&mut self, line: &str) {
        let (body, comment) = match line.split_once('#') {
            Some((body, comment)) => (body, Some(comment)),
            None => (line, None),
        };

        if let Some(caps) = comment.and_then(|c| IMPORT_URL_REGEX.captures(c)) {
            let raw = &caps[1];
            match Url::parse(raw) {
                Ok(url) => {
                    trace!("IMPORT-URL {}", url);
                    self.acl.urls.insert(url);
                }
                Err(err) => warn!("ACL import url {} is invalid, skipped, error: {}", raw, err),
            }
        }

        let input = body.trim();
        match input {
            "[outbound_block_list]" => self.section = Section::Disabled,
            "[black_list]" | "[bypass_list]" => self.section = Section::Bypass,
            "[white_list]" | "[proxy_list]" => self.section = Section::Proxy,
            "[reject_all]" | "[bypass_all]" => self.acl.bypass = true,
            "[accept_all]" | "[proxy_all]" => self.acl.bypass = false,
            _ if input.starts_with('[') && input.ends_with(']') => {
                trace!("unknown ACL section {}, rules ignored until the next section", input);
                self.section = Section::Disabled;
            }
            "" => {}
            rule => self.add_rule(rule),
        }
    }

    fn add_rule(&mut self, rule: &str) {
        let (hostnames, subnets) = match self.section {
            Section::Disabled => return,
            Section::Bypass => (&mut self.acl.bypass_hostnames, &mut self.bypass_subnets),
            Section::Proxy => (&mut self.acl.proxy_hostnames, &mut self.proxy_subnets),
        };
        match Subnet::parse(rule) {
            Some(subnet) => {
                trace!("SUBNET-RULE {:?} {}", self.section, subnet);
                subnets.insert(subnet);
            }
            None => {
                trace!("HOSTNAME-RULE {:?} {}", self.section, rule);
                hostnames.insert(rule.to_owned());
            }
        }
    }

    fn finish(mut self) -> Acl {
        self.acl.subnets = if self.acl.bypass {
            self.proxy_subnets
        } else {
            self.bypass_subnets
        };
        self.acl
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn subnet(s: &str) -> Subnet {
        s.parse().unwrap()
    }

    #[test]
    fn parse_sections_and_mode() {
        let acl = Acl::from_str_with(
            "[bypass_all]\n\
             [proxy_list]\n\
             (^|\\.)example\\.com$\n\
             8.8.8.0/24\n\
             [bypass_list]\n\
             (^|\\.)lan$\n\
             192.168.0.0/16\n",
            false,
        );
        assert!(acl.bypass);
        assert!(acl.proxy_hostnames.contains("(^|\\.)example\\.com$"));
        assert!(acl.bypass_hostnames.contains("(^|\\.)lan$"));
        assert_eq!(acl.subnets.iter().copied().collect::<Vec<_>>(), [subnet("8.8.8.0/24")]);
    }

    #[test]
    fn proxy_mode_keeps_bypass_subnets() {
        let acl = Acl::from_str_with("[proxy_all]\n10.0.0.0/8\n[proxy_list]\n1.1.1.1\n", true);
        assert!(!acl.bypass);
        assert_eq!(acl.subnets.iter().copied().collect::<Vec<_>>(), [subnet("10.0.0.0/8")]);
    }

    #[test]
    fn initial_section_follows_default_mode() {
        let acl = Acl::from_str_with("example\\.org\n", true);
        assert!(acl.proxy_hostnames.contains("example\\.org"));
        assert!(acl.bypass_hostnames.is_empty());

        let acl = Acl::from_str_with("example\\.org\n", false);
        assert!(acl.bypass_hostnames.contains("example\\.org"));
    }

    #[test]
    fn import_urls_and_comments() {
        let acl = Acl::from_str_with(
            "[outbound_block_list]\n\
             blocked\\.com # inline comment\n\
             #IMPORT_URL <https://example.com/a.acl>\n\
             #IMPORT_URL   <not a url>  \n\
             # IMPORT_URL <https://example.com/not-an-import.acl>\n\
             [proxy_list] #IMPORT_URL <http://example.com/b.acl>\n",
            false,
        );
        assert!(acl.bypass_hostnames.is_empty());
        assert!(acl.proxy_hostnames.is_empty());
        let urls: Vec<&str> = acl.urls.iter().map(Url::as_str).collect();
        assert_eq!(urls, ["http://example.com/b.acl", "https://example.com/a.acl"]);
    }

    #[test]
    fn unknown_section_disables_rules() {
        let acl = Acl::from_str_with("[proxy_list]\na\\.com\n[something_else]\nb\\.com\n[proxy_list]\nc\\.com\n", false);
        let hosts: Vec<&str> = acl.proxy_hostnames.iter().map(String::as_str).collect();
        assert_eq!(hosts, ["a\\.com", "c\\.com"]);
    }

    #[test]
    fn malformed_subnet_is_hostname() {
        let acl = Acl::from_str_with("[bypass_list]\n10.0.0.0/33\n", false);
        assert!(acl.subnets.is_empty());
        assert!(acl.bypass_hostnames.contains("10.0.0.0/33"));
    }

    #[test]
    fn display_round_trip() {
        for text in [
            "[bypass_all]\n[proxy_list]\n1.0.0.0/8\nx\\.com\n[bypass_list]\ny\\.com\n",
            "[proxy_all]\n[bypass_list]\n192.168.0.0/16\n::1\nlocal\n[proxy_list]\nremote\n",
            "[proxy_all]\n",
        ] {
            let acl = Acl::from_str_with(text, false);
            let reparsed = Acl::from_str_with(&acl.to_string(), false);
            assert_eq!(acl, reparsed, "{text}");
        }
    }

    #[test]
    fn display_layout() {
        let acl = Acl::from_str_with(
            "[proxy_all]\n[bypass_list]\n10.0.0.0/8\nlocal\n[proxy_list]\nremote\n#IMPORT_URL <https://a.example/x.acl>\n",
            false,
        );
        assert_eq!(
            acl.to_string(),
            "[proxy_all]\n[bypass_list]\n10.0.0.0/8\nlocal\n[proxy_list]\nremote\n#IMPORT_URL <https://a.example/x.acl>\n"
        );
    }

    #[test]
    fn custom_rules_forced_to_bypass() {
        let acl = Acl::custom_rules(Some("[proxy_all]\n[bypass_list]\n10.0.0.0/8\nlocal\n"));
        assert!(acl.bypass);
        assert!(acl.subnets.is_empty());
        assert!(acl.bypass_hostnames.contains("local"));

        let acl = Acl::custom_rules(None);
        assert!(acl.bypass);
        assert!(acl.to_custom_rules().is_none());

        let acl = Acl::custom_rules(Some("1.2.3.4\n"));
        assert_eq!(acl.to_custom_rules().as_deref(), Some("[bypass_all]\n[proxy_list]\n1.2.3.4\n"));
    }

    #[test]
    fn merge_and_copy() {
        let mut a = Acl::from_str_with("[bypass_list]\na\n", false);
        let b = Acl::from_str_with("[bypass_all]\n[proxy_list]\nb\n1.2.3.4\n", false);
        a.merge(&b);
        assert!(!a.bypass);
        assert!(a.bypass_hostnames.contains("a"));
        assert!(a.proxy_hostnames.contains("b"));
        assert_eq!(a.subnets.len(), 1);

        let mut c = Acl::new();
        assert!(c.is_empty());
        c.from_acl(&b);
        assert_eq!(c, b);
    }
}
