//! Direct-route rules: which destinations bypass the upstream chain.
//!
//! Rules are literal IPv4 addresses or CIDR blocks, evaluated in
//! configuration order with first match winning. The match also reports the
//! index of the winning rule so observers can attribute direct routes to a
//! specific configuration entry.

use std::net::Ipv4Addr;

use crate::{ProxyError, Result};

/// One direct-route rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectRule {
    /// Matches a single address exactly.
    Exact(Ipv4Addr),
    /// Matches every address inside `network/prefix`.
    Cidr { network: Ipv4Addr, prefix: u8 },
}

impl DirectRule {
    /// Parse `a.b.c.d` or `a.b.c.d/len`.
    pub fn parse(rule: &str) -> Result<Self> {
        let invalid = |reason: &str| ProxyError::DirectRule {
            rule: rule.to_string(),
            reason: reason.to_string(),
        };

        match rule.split_once('/') {
            Some((addr, len)) => {
                let network: Ipv4Addr =
                    addr.trim().parse().map_err(|_| invalid("bad network address"))?;
                let prefix: u8 = len.trim().parse().map_err(|_| invalid("bad prefix length"))?;
                if prefix > 32 {
                    return Err(invalid("prefix length exceeds 32"));
                }
                Ok(DirectRule::Cidr { network, prefix })
            }
            None => {
                let addr = rule.trim().parse().map_err(|_| invalid("bad address"))?;
                Ok(DirectRule::Exact(addr))
            }
        }
    }

    pub fn matches(&self, ip: Ipv4Addr) -> bool {
        match self {
            DirectRule::Exact(addr) => ip == *addr,
            DirectRule::Cidr { network, prefix } => {
                let mask = prefix_mask(*prefix);
                u32::from(ip) & mask == u32::from(*network) & mask
            }
        }
    }
}

fn prefix_mask(prefix: u8) -> u32 {
    // `u32::MAX << 32` is UB territory, so /0 is its own case.
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix))
    }
}

/// Ordered rule set deciding direct-vs-proxied per destination IP.
#[derive(Debug, Clone, Default)]
pub struct Director {
    rules: Vec<DirectRule>,
}

impl Director {
    pub fn new(rules: Vec<DirectRule>) -> Self {
        Self { rules }
    }

    /// Parse a list of rule strings, preserving order.
    pub fn parse(specs: &[String]) -> Result<Self> {
        let rules = specs
            .iter()
            .map(|s| DirectRule::parse(s))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(rules))
    }

    /// Linear first-match scan.
    ///
    /// Returns `(true, index_of_winning_rule)` on a match, `(false, 0)`
    /// otherwise. Pure: the same address always yields the same answer.
    pub fn evaluate(&self, ip: Ipv4Addr) -> (bool, usize) {
        for (idx, rule) in self.rules.iter().enumerate() {
            if rule.matches(ip) {
                return (true, idx);
            }
        }
        (false, 0)
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
