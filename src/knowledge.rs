//! Diagnostic knowledge base loading.

use anyhow::{Context, Result};
use harness_core::diagnose::KnowledgeBase;
use std::path::Path;

use crate::config::DiagnoseConfig;

const BUNDLED: &str = include_str!("../config/knowledge_base.toml");

/// Load `diagnose.knowledge_base`, or the bundled knowledge base when unset.
pub fn load_knowledge_base(config: &DiagnoseConfig) -> Result<KnowledgeBase> {
    match &config.knowledge_base {
        Some(path) => load_file(path),
        None => parse(BUNDLED).context("bundled knowledge base is invalid"),
    }
}

fn load_file(path: &Path) -> Result<KnowledgeBase> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read knowledge base: {}", path.display()))?;
    parse(&content).with_context(|| format!("Invalid knowledge base: {}", path.display()))
}

pub fn parse(content: &str) -> Result<KnowledgeBase> {
    let kb: KnowledgeBase = toml::from_str(content)?;
    kb.validate()?;
    tracing::debug!(
        conditions = kb.conditions.len(),
        tests = kb.tests.len(),
        findings = kb.findings.len(),
        "knowledge base loaded"
    );
    Ok(kb)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bundled_knowledge_base_is_valid() {
        let kb = load_knowledge_base(&DiagnoseConfig::default()).unwrap();
        assert!(kb.condition("infectious tracheobronchitis").is_some());
        assert!(kb.conditions_for("dog").count() >= 5);
        assert!(kb.conditions_for("horse").any(|c| c.emergent));
        assert!(kb.test("thoracic radiographs").is_some());
    }

    #[test]
    fn test_bundled_findings_match_kennel_cough_complaint() {
        let kb = parse(BUNDLED).unwrap();
        let found = kb.match_findings("Honking cough and runny nose since boarding");
        assert!(found.contains(&"cough".to_string()));
        assert!(found.contains(&"nasal_discharge".to_string()));
    }

    #[test]
    fn test_invalid_knowledge_base_rejected() {
        let err = parse("[[conditions]]\nname = \"x\"\nprior = 2.0\n").unwrap_err();
        assert!(err.to_string().contains("prior"));
    }

    #[test]
    fn test_missing_file_reports_path() {
        let config = DiagnoseConfig {
            knowledge_base: Some("/nonexistent/kb.toml".into()),
            ..Default::default()
        };
        let err = load_knowledge_base(&config).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/kb.toml"));
    }
}
