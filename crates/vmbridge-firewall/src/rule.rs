use serde::{Deserialize, Serialize};
use vmbridge_packet::{IPPROTO_ICMP, IPPROTO_ICMPV6, IPPROTO_TCP, IPPROTO_UDP};

use crate::RuleError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Accept,
    Drop,
}

/// Protocol selector of a rule. `Icmp` covers both ICMPv4 and ICMPv6.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleProtocol {
    #[default]
    Any,
    Tcp,
    Udp,
    Icmp,
}

impl RuleProtocol {
    pub fn matches(self, protocol: u8) -> bool {
        match self {
            Self::Any => true,
            Self::Tcp => protocol == IPPROTO_TCP,
            Self::Udp => protocol == IPPROTO_UDP,
            Self::Icmp => protocol == IPPROTO_ICMP || protocol == IPPROTO_ICMPV6,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PortMatch {
    #[default]
    Any,
    Single(u16),
    /// Inclusive on both ends.
    Range { start: u16, end: u16 },
}

impl PortMatch {
    pub fn range(start: u16, end: u16) -> Result<Self, RuleError> {
        if start > end {
            return Err(RuleError::InvalidPortRange {
                value: format!("{start}-{end}"),
                reason: format!("start ({start}) must be <= end ({end})"),
            });
        }
        Ok(Self::Range { start, end })
    }

    /// A frame without a port (ICMP, later fragments) only matches `Any`.
    pub fn matches(self, port: Option<u16>) -> bool {
        match (self, port) {
            (Self::Any, _) => true,
            (Self::Single(want), Some(port)) => want == port,
            (Self::Range { start, end }, Some(port)) => (start..=end).contains(&port),
            (_, None) => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rule {
    pub action: Action,
    pub protocol: RuleProtocol,
    pub dst_port: PortMatch,
}

impl Rule {
    pub fn accept(protocol: RuleProtocol, dst_port: PortMatch) -> Self {
        Self {
            action: Action::Accept,
            protocol,
            dst_port,
        }
    }

    pub fn drop(protocol: RuleProtocol, dst_port: PortMatch) -> Self {
        Self {
            action: Action::Drop,
            protocol,
            dst_port,
        }
    }

    pub fn matches(&self, protocol: u8, dst_port: Option<u16>) -> bool {
        self.protocol.matches(protocol) && self.dst_port.matches(dst_port)
    }
}

/// First-match evaluation of an ordered rule list. No match is a drop.
pub fn evaluate(rules: &[Rule], protocol: u8, dst_port: Option<u16>) -> bool {
    rules
        .iter()
        .find(|rule| rule.matches(protocol, dst_port))
        .is_some_and(|rule| rule.action == Action::Accept)
}

/// On-disk form of a rule.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RuleConfig {
    pub action: Action,
    #[serde(default)]
    pub protocol: RuleProtocol,
    #[serde(default)]
    pub dst_port: Option<PortConfig>,
}

/// `443`, `"1000-2000"`, `"any"` or `{ "start": 1000, "end": 2000 }`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum PortConfig {
    Single(u16),
    Text(String),
    Explicit { start: u16, end: u16 },
}

impl PortConfig {
    pub fn to_port_match(&self) -> Result<PortMatch, RuleError> {
        match self {
            Self::Single(port) => Ok(PortMatch::Single(*port)),
            Self::Explicit { start, end } => PortMatch::range(*start, *end),
            Self::Text(text) => {
                let text = text.trim();
                if text.eq_ignore_ascii_case("any") {
                    return Ok(PortMatch::Any);
                }
                if let Ok(port) = text.parse::<u16>() {
                    return Ok(PortMatch::Single(port));
                }
                let (start, end) = text.split_once('-').ok_or_else(|| RuleError::InvalidPortRange {
                    value: text.to_string(),
                    reason: "expected a port, 'any', or 'start-end'".to_string(),
                })?;
                let parse = |s: &str| {
                    s.trim().parse::<u16>().map_err(|_| RuleError::InvalidPortRange {
                        value: text.to_string(),
                        reason: format!("invalid port '{}'", s.trim()),
                    })
                };
                PortMatch::range(parse(start)?, parse(end)?)
            }
        }
    }
}

impl RuleConfig {
    pub fn to_rule(&self) -> Result<Rule, RuleError> {
        let dst_port = match &self.dst_port {
            Some(port) => port.to_port_match()?,
            None => PortMatch::Any,
        };
        Ok(Rule {
            action: self.action,
            protocol: self.protocol,
            dst_port,
        })
    }
}
