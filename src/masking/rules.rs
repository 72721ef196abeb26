//! Built-in pattern lists used when no external rules file is configured,
//! per §4.4's "Defaults" clause: classification must always be well-defined.

/// Default PII substrings, tested in declaration order.
pub fn default_pii_patterns() -> Vec<String> {
    ["email", "phone", "ssn", "address", "credit-card", "ip-address"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Default PHI substrings, tested before PII so an ambiguous column name
/// receives the stronger treatment (§4.4).
pub fn default_phi_patterns() -> Vec<String> {
    ["medical-record", "patient-id", "diagnosis", "prescription", "medication"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Process-wide masking rule set: two ordered pattern lists, loaded once at
/// start and reloadable only via restart (§3).
#[derive(Debug, Clone)]
pub struct MaskingRules {
    pub pii_patterns: Vec<String>,
    pub phi_patterns: Vec<String>,
}

impl MaskingRules {
    pub fn new(pii_patterns: Vec<String>, phi_patterns: Vec<String>) -> Self {
        MaskingRules { pii_patterns, phi_patterns }
    }

    /// Built-in pattern list used when no external rules file is present.
    pub fn defaults() -> Self {
        MaskingRules { pii_patterns: default_pii_patterns(), phi_patterns: default_phi_patterns() }
    }

    /// Builds rules from configuration, falling back to the built-in
    /// defaults for whichever list is empty.
    pub fn from_config(pii: Vec<String>, phi: Vec<String>) -> Self {
        MaskingRules {
            pii_patterns: if pii.is_empty() { default_pii_patterns() } else { pii },
            phi_patterns: if phi.is_empty() { default_phi_patterns() } else { phi },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_falls_back_to_builtin_defaults() {
        let rules = MaskingRules::from_config(vec![], vec![]);
        assert!(rules.pii_patterns.contains(&"email".to_string()));
        assert!(rules.phi_patterns.contains(&"diagnosis".to_string()));
    }

    #[test]
    fn non_empty_config_is_used_verbatim() {
        let rules = MaskingRules::from_config(vec!["custom".to_string()], vec![]);
        assert_eq!(rules.pii_patterns, vec!["custom".to_string()]);
        assert!(!rules.phi_patterns.is_empty());
    }
}
