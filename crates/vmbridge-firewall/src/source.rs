use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use crate::{Rule, RuleConfig, RuleError};

/// Supplier of per-source rule lists.
///
/// The evaluator only ever asks for the ordered rules of one source address; how the policy is
/// stored or generated is up to the implementation. `None` means the source knows nothing about
/// the address, which the evaluator treats as deny.
pub trait RuleSource: Send {
    fn lookup_rules(&self, ip: IpAddr) -> Option<Vec<Rule>>;

    /// Refresh the underlying policy. Sources without external state have nothing to do.
    fn reload(&mut self) -> Result<(), RuleError> {
        Ok(())
    }
}

impl<T: RuleSource + ?Sized> RuleSource for Box<T> {
    fn lookup_rules(&self, ip: IpAddr) -> Option<Vec<Rule>> {
        (**self).lookup_rules(ip)
    }

    fn reload(&mut self) -> Result<(), RuleError> {
        (**self).reload()
    }
}

/// In-memory rule table.
#[derive(Debug, Clone, Default)]
pub struct StaticRules {
    rules: HashMap<IpAddr, Vec<Rule>>,
}

impl StaticRules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rules(mut self, ip: IpAddr, rules: Vec<Rule>) -> Self {
        self.insert(ip, rules);
        self
    }

    pub fn insert(&mut self, ip: IpAddr, rules: Vec<Rule>) {
        self.rules.insert(ip, rules);
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Parse the JSON rule document: an object keyed by source address whose values are
    /// ordered rule lists.
    pub fn from_json(text: &str) -> Result<Self, RuleError> {
        let doc: BTreeMap<String, Vec<RuleConfig>> = serde_json::from_str(text)?;
        let mut out = Self::new();
        for (key, configs) in doc {
            let ip: IpAddr = key
                .trim()
                .parse()
                .map_err(|_| RuleError::InvalidAddress(key.clone()))?;
            let rules = configs
                .iter()
                .map(RuleConfig::to_rule)
                .collect::<Result<Vec<_>, _>>()?;
            out.insert(ip, rules);
        }
        Ok(out)
    }
}

impl RuleSource for StaticRules {
    fn lookup_rules(&self, ip: IpAddr) -> Option<Vec<Rule>> {
        self.rules.get(&ip).cloned()
    }
}

/// Rules loaded from a JSON file, re-read on [`RuleSource::reload`].
///
/// A failed reload leaves the previously loaded rules in place.
#[derive(Debug, Clone)]
pub struct RuleFile {
    path: PathBuf,
    rules: StaticRules,
}

impl RuleFile {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, RuleError> {
        let path = path.into();
        let rules = Self::read(&path)?;
        Ok(Self { path, rules })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn sources(&self) -> usize {
        self.rules.len()
    }

    fn read(path: &Path) -> Result<StaticRules, RuleError> {
        let text = std::fs::read_to_string(path).map_err(|source| RuleError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        StaticRules::from_json(&text)
    }
}

impl RuleSource for RuleFile {
    fn lookup_rules(&self, ip: IpAddr) -> Option<Vec<Rule>> {
        self.rules.lookup_rules(ip)
    }

    fn reload(&mut self) -> Result<(), RuleError> {
        self.rules = Self::read(&self.path)?;
        tracing::info!(
            path = %self.path.display(),
            sources = self.rules.len(),
            "rule file reloaded"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PortMatch, RuleProtocol};

    #[test]
    fn json_document_is_parsed_in_order() {
        let rules = StaticRules::from_json(
            r#"{
                "10.1.2.3": [
                    {"action": "accept", "protocol": "tcp", "dst_port": 443},
                    {"action": "accept", "protocol": "udp", "dst_port": "53"},
                    {"action": "drop"}
                ],
                "fd00::5": []
            }"#,
        )
        .unwrap();

        assert_eq!(rules.len(), 2);
        assert_eq!(
            rules.lookup_rules("10.1.2.3".parse().unwrap()),
            Some(vec![
                Rule::accept(RuleProtocol::Tcp, PortMatch::Single(443)),
                Rule::accept(RuleProtocol::Udp, PortMatch::Single(53)),
                Rule::drop(RuleProtocol::Any, PortMatch::Any),
            ])
        );
        assert_eq!(rules.lookup_rules("fd00::5".parse().unwrap()), Some(vec![]));
        assert_eq!(rules.lookup_rules("10.9.9.9".parse().unwrap()), None);
    }

    #[test]
    fn bad_keys_and_values_are_rejected() {
        assert!(matches!(
            StaticRules::from_json(r#"{"not-an-ip": []}"#),
            Err(RuleError::InvalidAddress(_))
        ));
        assert!(matches!(
            StaticRules::from_json(r#"{"10.0.0.1": [{"action": "maybe"}]}"#),
            Err(RuleError::Json(_))
        ));
        assert!(matches!(
            StaticRules::from_json(r#"{"10.0.0.1": [{"action": "drop", "dst_port": "9-1"}]}"#),
            Err(RuleError::InvalidPortRange { .. })
        ));
    }
}
