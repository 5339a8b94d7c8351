use arc_swap::ArcSwap;
use thiserror::Error;

/// Rule syntax errors, surfaced verbatim at the control API boundary as 400s.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RuleParseError {
    #[error("invalid allow-http entry {entry:?}: missing \":port\" suffix")]
    MissingPort { entry: String },
    #[error("invalid allow entry {entry:?}: empty domain")]
    EmptyDomain { entry: String },
    #[error("invalid allow entry {entry:?}: domain must not contain ':' or spaces")]
    InvalidDomain { entry: String },
    #[error("invalid allow-http entry {entry:?}: port pattern must be non-empty digits and '*'")]
    InvalidPort { entry: String },
    #[error("invalid allow-dns entry {entry:?}: DNS rules carry no port")]
    DnsEntryWithPort { entry: String },
}

/// Normalize host fragments for policy matching (trim, lowercase, strip the
/// trailing dot of fully qualified names).
pub fn normalize_host(host: &str) -> String {
    host.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// Match `port` against `pattern`, where `*` matches any run of characters
/// and every other character is literal. Greedy with backtracking, so
/// `"8*0"` matches both `"80"` and `"8010"`, and `"*"` matches `""`.
pub fn port_glob_match(pattern: &str, port: &str) -> bool {
    let p = pattern.as_bytes();
    let s = port.as_bytes();
    let mut pi = 0;
    let mut si = 0;
    let mut star: Option<(usize, usize)> = None;
    while si < s.len() {
        if pi < p.len() && p[pi] == s[si] && p[pi] != b'*' {
            pi += 1;
            si += 1;
        } else if pi < p.len() && p[pi] == b'*' {
            star = Some((pi, si));
            pi += 1;
        } else if let Some((star_pi, star_si)) = star {
            pi = star_pi + 1;
            si = star_si + 1;
            star = Some((star_pi, star_si + 1));
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == b'*' {
        pi += 1;
    }
    pi == p.len()
}

fn split_wildcard(domain: &str) -> (String, bool) {
    match domain.strip_prefix("*.") {
        Some(rest) => (normalize_host(rest), true),
        None => (normalize_host(domain), false),
    }
}

fn validate_domain(entry: &str, domain: &str) -> Result<(), RuleParseError> {
    if domain.is_empty() {
        return Err(RuleParseError::EmptyDomain {
            entry: entry.to_string(),
        });
    }
    if domain.contains(':') || domain.chars().any(char::is_whitespace) {
        return Err(RuleParseError::InvalidDomain {
            entry: entry.to_string(),
        });
    }
    Ok(())
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HttpRule {
    domain: String,
    port: String,
    wildcard: bool,
}

impl HttpRule {
    pub fn parse(entry: &str) -> Result<Self, RuleParseError> {
        let Some((domain, port)) = entry.rsplit_once(':') else {
            return Err(RuleParseError::MissingPort {
                entry: entry.to_string(),
            });
        };
        let (domain, wildcard) = split_wildcard(domain);
        validate_domain(entry, &domain)?;
        if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit() || b == b'*') {
            return Err(RuleParseError::InvalidPort {
                entry: entry.to_string(),
            });
        }
        Ok(Self {
            domain,
            port: port.to_string(),
            wildcard,
        })
    }

    /// Wildcard rules match strict subdomains only, never the apex.
    fn matches(&self, host: &str, port: &str) -> bool {
        let domain_match = if self.wildcard {
            host.len() > self.domain.len() + 1 && host.ends_with(&format!(".{}", self.domain))
        } else {
            host == self.domain
        };
        domain_match && port_glob_match(&self.port, port)
    }

    /// Domain-only match with DNS semantics, used when the DNS filter falls
    /// back to allow-http entries so one entry covers both layers.
    fn matches_domain(&self, host: &str) -> bool {
        let is_subdomain =
            host.len() > self.domain.len() + 1 && host.ends_with(&format!(".{}", self.domain));
        if self.wildcard {
            is_subdomain
        } else {
            host == self.domain || is_subdomain
        }
    }

    pub fn entry(&self) -> String {
        if self.wildcard {
            format!("*.{}:{}", self.domain, self.port)
        } else {
            format!("{}:{}", self.domain, self.port)
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DnsRule {
    domain: String,
    wildcard: bool,
}

impl DnsRule {
    pub fn parse(entry: &str) -> Result<Self, RuleParseError> {
        if entry.contains(':') {
            return Err(RuleParseError::DnsEntryWithPort {
                entry: entry.to_string(),
            });
        }
        let (domain, wildcard) = split_wildcard(entry);
        validate_domain(entry, &domain)?;
        Ok(Self { domain, wildcard })
    }

    /// DNS rules are subdomain-inclusive for non-wildcard entries: resolution
    /// precedes any connection, so a single entry covers the whole subtree.
    fn matches(&self, host: &str) -> bool {
        let is_subdomain =
            host.len() > self.domain.len() + 1 && host.ends_with(&format!(".{}", self.domain));
        if self.wildcard {
            is_subdomain
        } else {
            host == self.domain || is_subdomain
        }
    }

    pub fn entry(&self) -> String {
        if self.wildcard {
            format!("*.{}", self.domain)
        } else {
            self.domain.clone()
        }
    }
}

/// HTTP allowlist with lock-free readers. The rule slice is immutable; `add`
/// publishes a new slice with a compare-and-swap loop, so readers never
/// observe a partial update and writers never block readers.
#[derive(Debug)]
pub struct HttpAllowlist {
    rules: ArcSwap<Vec<HttpRule>>,
}

impl HttpAllowlist {
    pub fn new(entries: &[String]) -> Result<Self, RuleParseError> {
        let rules = entries
            .iter()
            .map(|entry| HttpRule::parse(entry))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            rules: ArcSwap::from_pointee(rules),
        })
    }

    /// True iff any rule matches; matching is additive.
    pub fn allows(&self, host: &str, port: &str) -> bool {
        let host = normalize_host(host);
        self.rules
            .load()
            .iter()
            .any(|rule| rule.matches(&host, port))
    }

    /// Append parsed rules atomically. All-or-nothing: a single malformed
    /// entry leaves the list untouched. Returns the canonical form of the
    /// appended entries.
    pub fn add(&self, entries: &[String]) -> Result<Vec<String>, RuleParseError> {
        let parsed = entries
            .iter()
            .map(|entry| HttpRule::parse(entry))
            .collect::<Result<Vec<_>, _>>()?;
        let added = parsed.iter().map(HttpRule::entry).collect();
        self.rules.rcu(|current| {
            let mut next = Vec::with_capacity(current.len() + parsed.len());
            next.extend(current.iter().cloned());
            next.extend(parsed.iter().cloned());
            next
        });
        Ok(added)
    }

    /// Port-agnostic domain check for the DNS layer (DNS resolution precedes
    /// any connection, so ports cannot apply yet).
    pub fn allows_domain(&self, host: &str) -> bool {
        let host = normalize_host(host);
        self.rules
            .load()
            .iter()
            .any(|rule| rule.matches_domain(&host))
    }

    pub fn entries(&self) -> Vec<String> {
        self.rules.load().iter().map(HttpRule::entry).collect()
    }
}

/// DNS allowlist; same copy-on-write semantics as [`HttpAllowlist`].
#[derive(Debug)]
pub struct DnsAllowlist {
    rules: ArcSwap<Vec<DnsRule>>,
}

impl DnsAllowlist {
    pub fn new(entries: &[String]) -> Result<Self, RuleParseError> {
        let rules = entries
            .iter()
            .map(|entry| DnsRule::parse(entry))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            rules: ArcSwap::from_pointee(rules),
        })
    }

    pub fn allows(&self, host: &str) -> bool {
        let host = normalize_host(host);
        self.rules.load().iter().any(|rule| rule.matches(&host))
    }

    pub fn add(&self, entries: &[String]) -> Result<Vec<String>, RuleParseError> {
        let parsed = entries
            .iter()
            .map(|entry| DnsRule::parse(entry))
            .collect::<Result<Vec<_>, _>>()?;
        let added = parsed.iter().map(DnsRule::entry).collect();
        self.rules.rcu(|current| {
            let mut next = Vec::with_capacity(current.len() + parsed.len());
            next.extend(current.iter().cloned());
            next.extend(parsed.iter().cloned());
            next
        });
        Ok(added)
    }

    pub fn entries(&self) -> Vec<String> {
        self.rules.load().iter().map(DnsRule::entry).collect()
    }
}

/// Ports on the host gateway reachable through the `host.vibepit`
/// pseudo-hostname. Reserved ports are rejected by the launcher before this
/// list reaches the proxy.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HostPortPolicy {
    ports: Vec<u16>,
}

impl HostPortPolicy {
    pub fn new(ports: Vec<u16>) -> Self {
        Self { ports }
    }

    pub fn permits(&self, port: u16) -> bool {
        self.ports.contains(&port)
    }
}
