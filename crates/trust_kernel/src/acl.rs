//! Per-module access control: each rule maps investigator fingerprints to
//! weights, and an operation is authorized when the verified signers'
//! summed weight clears the rule's threshold.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Result, TrustError};

/// Name of the rule applied when no module-specific rule exists.
pub const DEFAULT_RULE: &str = "default";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AclInvestigator {
    pub fingerprint: String,
    pub weight: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AclRule {
    pub minimum_weight: u32,
    pub investigators: Vec<AclInvestigator>,
}

/// The full ACL: module name to rule, with a `default` entry applied to
/// modules without a rule of their own.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Acl {
    rules: BTreeMap<String, AclRule>,
}

impl Acl {
    /// An ACL holding only a default rule.
    pub fn single_default(minimum_weight: u32, investigators: Vec<AclInvestigator>) -> Self {
        let mut rules = BTreeMap::new();
        rules.insert(DEFAULT_RULE.to_string(), AclRule { minimum_weight, investigators });
        Acl { rules }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let acl: Acl = serde_json::from_str(json)?;
        acl.check()?;
        Ok(acl)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_json(&fs::read_to_string(path)?)
    }

    pub fn rule(&self, module: &str) -> Option<&AclRule> {
        self.rules.get(module).or_else(|| self.rules.get(DEFAULT_RULE))
    }

    pub fn insert(&mut self, module: &str, rule: AclRule) {
        self.rules.insert(module.to_string(), rule);
    }

    /// Ensure a fingerprint appears in a module's rule, adding it with the
    /// given weight when missing. Used to splice the scheduler identity
    /// into the `agentdestroy` rule at startup.
    pub fn ensure_investigator(&mut self, module: &str, fingerprint: &str, weight: u32) {
        let rule = self.rules.entry(module.to_string()).or_insert_with(|| AclRule {
            minimum_weight: 1,
            investigators: Vec::new(),
        });
        if !rule.investigators.iter().any(|i| i.fingerprint == fingerprint) {
            rule.investigators.push(AclInvestigator {
                fingerprint: fingerprint.to_string(),
                weight,
            });
        }
    }

    /// Structural validation: thresholds must be positive and every rule
    /// must name at least one investigator.
    pub fn check(&self) -> Result<()> {
        for (module, rule) in &self.rules {
            if rule.minimum_weight == 0 {
                return Err(TrustError::AclInvalid(format!(
                    "rule '{module}' has a zero weight threshold"
                )));
            }
            if rule.investigators.is_empty() {
                return Err(TrustError::AclInvalid(format!(
                    "rule '{module}' names no investigators"
                )));
            }
        }
        Ok(())
    }

    /// Authorize one operation: sum the weights of rule investigators
    /// whose fingerprint appears among the verified signers. Duplicate
    /// signatures from the same key count once.
    pub fn authorize(&self, module: &str, signer_fingerprints: &[String]) -> Result<()> {
        let rule = self
            .rule(module)
            .ok_or_else(|| TrustError::NoRuleForModule(module.to_string()))?;
        let signers: BTreeSet<&str> =
            signer_fingerprints.iter().map(String::as_str).collect();
        let got: u32 = rule
            .investigators
            .iter()
            .filter(|i| signers.contains(i.fingerprint.as_str()))
            .map(|i| i.weight)
            .sum();
        if got >= rule.minimum_weight {
            Ok(())
        } else {
            Err(TrustError::WeightBelowThreshold {
                module: module.to_string(),
                got,
                want: rule.minimum_weight,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn acl_two_signers() -> Acl {
        Acl::from_json(
            r#"{
                "default": {
                    "minimumWeight": 2,
                    "investigators": [
                        {"fingerprint": "AAA", "weight": 1},
                        {"fingerprint": "BBB", "weight": 1}
                    ]
                },
                "agentdestroy": {
                    "minimumWeight": 1,
                    "investigators": [{"fingerprint": "SCHED", "weight": 1}]
                }
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn module_rule_takes_precedence_over_default() {
        let acl = acl_two_signers();
        acl.authorize("agentdestroy", &["SCHED".to_string()]).unwrap();
        assert!(acl.authorize("agentdestroy", &["AAA".to_string()]).is_err());
    }

    #[test]
    fn default_rule_applies_to_unknown_modules() {
        let acl = acl_two_signers();
        acl.authorize("file", &["AAA".to_string(), "BBB".to_string()]).unwrap();
        assert!(matches!(
            acl.authorize("file", &["AAA".to_string()]),
            Err(TrustError::WeightBelowThreshold { got: 1, want: 2, .. })
        ));
    }

    #[test]
    fn missing_default_denies() {
        let acl = Acl::from_json(
            r#"{"file": {"minimumWeight": 1, "investigators": [{"fingerprint": "AAA", "weight": 1}]}}"#,
        )
        .unwrap();
        assert!(matches!(
            acl.authorize("netstat", &["AAA".to_string()]),
            Err(TrustError::NoRuleForModule(_))
        ));
    }

    #[test]
    fn duplicate_signer_counts_once() {
        let acl = acl_two_signers();
        let twice = vec!["AAA".to_string(), "AAA".to_string()];
        assert!(acl.authorize("file", &twice).is_err());
    }

    #[test]
    fn zero_threshold_rejected_at_load() {
        let err = Acl::from_json(
            r#"{"default": {"minimumWeight": 0, "investigators": [{"fingerprint": "A", "weight": 1}]}}"#,
        );
        assert!(matches!(err, Err(TrustError::AclInvalid(_))));
    }

    #[test]
    fn ensure_investigator_is_idempotent() {
        let mut acl = acl_two_signers();
        acl.ensure_investigator("agentdestroy", "SCHED", 1);
        acl.ensure_investigator("agentdestroy", "NEW", 1);
        let rule = acl.rule("agentdestroy").unwrap();
        assert_eq!(rule.investigators.len(), 2);
    }
}
