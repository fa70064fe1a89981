//! Diagnostic knowledge base: finding vocabulary, condition profiles and
//! the test cost table.
//!
//! The core only defines the shape; the application loads it from TOML.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::error::DiagnoseError;
use crate::text;

fn default_false_positive_rate() -> f64 {
    0.05
}

/// A named finding and the complaint phrases that indicate it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FindingDefinition {
    pub name: String,
    #[serde(default)]
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionProfile {
    pub name: String,
    /// Canonical species the condition applies to. Empty means any.
    #[serde(default)]
    pub species: Vec<String>,
    pub prior: f64,
    /// P(finding | condition).
    #[serde(default)]
    pub findings: BTreeMap<String, f64>,
    /// Requires urgent intervention.
    #[serde(default)]
    pub emergent: bool,
}

impl ConditionProfile {
    pub fn applies_to(&self, species: &str) -> bool {
        self.species.is_empty() || self.species.iter().any(|s| s == species)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticTest {
    pub name: String,
    pub cost: f64,
    /// Sensitivity per condition: P(positive | condition).
    #[serde(default)]
    pub detects: BTreeMap<String, f64>,
    /// P(positive | condition not in `detects`).
    #[serde(default = "default_false_positive_rate")]
    pub false_positive_rate: f64,
}

impl DiagnosticTest {
    pub fn p_positive(&self, condition: &str) -> f64 {
        self.detects
            .get(condition)
            .copied()
            .unwrap_or(self.false_positive_rate)
            .clamp(1e-6, 1.0 - 1e-6)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeBase {
    #[serde(default)]
    pub findings: Vec<FindingDefinition>,
    #[serde(default)]
    pub conditions: Vec<ConditionProfile>,
    #[serde(default)]
    pub tests: Vec<DiagnosticTest>,
}

impl KnowledgeBase {
    /// Check probabilities, costs and name uniqueness.
    pub fn validate(&self) -> Result<(), DiagnoseError> {
        if self.conditions.is_empty() {
            return Err(invalid("knowledge base has no conditions"));
        }
        let mut names = HashSet::new();
        for c in &self.conditions {
            if !names.insert(c.name.as_str()) {
                return Err(invalid(format!("duplicate condition '{}'", c.name)));
            }
            if !(c.prior > 0.0 && c.prior <= 1.0) {
                return Err(invalid(format!("condition '{}' prior must be in (0, 1]", c.name)));
            }
            if let Some((f, p)) = c.findings.iter().find(|(_, p)| !(0.0..=1.0).contains(*p)) {
                return Err(invalid(format!(
                    "condition '{}' finding '{f}' likelihood {p} outside [0, 1]",
                    c.name
                )));
            }
        }

        let mut tests = HashSet::new();
        for t in &self.tests {
            if !tests.insert(t.name.as_str()) {
                return Err(invalid(format!("duplicate test '{}'", t.name)));
            }
            if t.cost < 0.0 {
                return Err(invalid(format!("test '{}' cost must be >= 0", t.name)));
            }
            if !(0.0..=1.0).contains(&t.false_positive_rate) {
                return Err(invalid(format!(
                    "test '{}' false_positive_rate must be in [0, 1]",
                    t.name
                )));
            }
            if let Some(c) = t.detects.keys().find(|c| !names.contains(c.as_str())) {
                return Err(invalid(format!(
                    "test '{}' references unknown condition '{c}'",
                    t.name
                )));
            }
        }
        Ok(())
    }

    pub fn conditions_for<'a>(&'a self, species: &'a str) -> impl Iterator<Item = &'a ConditionProfile> + 'a {
        self.conditions.iter().filter(move |c| c.applies_to(species))
    }

    pub fn condition(&self, name: &str) -> Option<&ConditionProfile> {
        self.conditions.iter().find(|c| c.name == name)
    }

    pub fn test(&self, name: &str) -> Option<&DiagnosticTest> {
        self.tests.iter().find(|t| t.name == name)
    }

    /// Findings whose keyword phrases all occur in `text`.
    pub fn match_findings(&self, text: &str) -> Vec<String> {
        let terms: HashSet<String> = text::analyze(text).into_iter().collect();
        self.findings
            .iter()
            .filter(|def| {
                def.keywords.iter().any(|kw| {
                    let kw_terms = text::analyze(kw);
                    !kw_terms.is_empty() && kw_terms.iter().all(|t| terms.contains(t))
                })
            })
            .map(|def| def.name.clone())
            .collect()
    }
}

fn invalid(msg: impl Into<String>) -> DiagnoseError {
    DiagnoseError::InvalidInput(msg.into())
}

#[cfg(test)]
pub(crate) fn fixture() -> KnowledgeBase {
    fn map(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    KnowledgeBase {
        findings: vec![
            FindingDefinition {
                name: "cough".into(),
                keywords: vec!["cough".into(), "honking".into()],
            },
            FindingDefinition {
                name: "nasal_discharge".into(),
                keywords: vec!["nasal discharge".into(), "runny nose".into()],
            },
            FindingDefinition {
                name: "lethargy".into(),
                keywords: vec!["lethargic".into(), "lethargy".into()],
            },
            FindingDefinition {
                name: "dyspnoea".into(),
                keywords: vec!["difficulty breathing".into(), "laboured breathing".into()],
            },
        ],
        conditions: vec![
            ConditionProfile {
                name: "infectious tracheobronchitis".into(),
                species: vec!["dog".into()],
                prior: 0.3,
                findings: map(&[("cough", 0.95), ("nasal_discharge", 0.4), ("lethargy", 0.2)]),
                emergent: false,
            },
            ConditionProfile {
                name: "pneumonia".into(),
                species: vec!["dog".into(), "cat".into()],
                prior: 0.15,
                findings: map(&[
                    ("cough", 0.7),
                    ("fever", 0.7),
                    ("lethargy", 0.8),
                    ("dyspnoea", 0.6),
                    ("tachypnoea", 0.7),
                ]),
                emergent: true,
            },
            ConditionProfile {
                name: "congestive heart failure".into(),
                species: vec!["dog".into(), "cat".into()],
                prior: 0.1,
                findings: map(&[
                    ("cough", 0.6),
                    ("dyspnoea", 0.7),
                    ("tachycardia", 0.7),
                    ("lethargy", 0.6),
                ]),
                emergent: true,
            },
            ConditionProfile {
                name: "collapsing trachea".into(),
                species: vec!["dog".into()],
                prior: 0.1,
                findings: map(&[("cough", 0.9)]),
                emergent: false,
            },
            ConditionProfile {
                name: "feline asthma".into(),
                species: vec!["cat".into()],
                prior: 0.2,
                findings: map(&[("cough", 0.8), ("dyspnoea", 0.6)]),
                emergent: false,
            },
        ],
        tests: vec![
            DiagnosticTest {
                name: "thoracic radiographs".into(),
                cost: 2.0,
                detects: map(&[
                    ("pneumonia", 0.9),
                    ("congestive heart failure", 0.85),
                    ("feline asthma", 0.6),
                ]),
                false_positive_rate: 0.1,
            },
            DiagnosticTest {
                name: "respiratory pcr panel".into(),
                cost: 3.0,
                detects: map(&[("infectious tracheobronchitis", 0.9)]),
                false_positive_rate: 0.05,
            },
            DiagnosticTest {
                name: "echocardiogram".into(),
                cost: 4.0,
                detects: map(&[("congestive heart failure", 0.95)]),
                false_positive_rate: 0.05,
            },
            DiagnosticTest {
                name: "fluoroscopy".into(),
                cost: 4.0,
                detects: map(&[("collapsing trachea", 0.9)]),
                false_positive_rate: 0.05,
            },
            DiagnosticTest {
                name: "complete blood count".into(),
                cost: 1.0,
                detects: map(&[("pneumonia", 0.7)]),
                false_positive_rate: 0.2,
            },
        ],
    }
}
