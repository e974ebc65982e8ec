use regex::RegexBuilder;
use serde::{Serialize, Deserialize};
use std::collections::BTreeSet;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("policy document is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Actions considered too dangerous to allow in a policy, e.g.
/// `s3:DeleteBucket,s3:DeleteObject`. IAM action names are matched
/// case-insensitively; entries keep their configured spelling for reporting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestrictedActions(BTreeSet<String>);

impl RestrictedActions {
    /// Parse a comma-separated list. Empty entries are skipped.
    pub fn parse(list: &str) -> Self {
        RestrictedActions(
            list.split(',')
                .map(|a| a.trim())
                .filter(|a| !a.is_empty())
                .map(|a| a.to_string())
                .collect(),
        )
    }

    pub fn is_empty(&self) -> bool { self.0.is_empty() }
    pub fn len(&self) -> usize { self.0.len() }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDocument {
    #[serde(rename="Version", default)]
    pub version: Option<String>,
    #[serde(rename="Statement")]
    pub statement: OneOrMany<Statement>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Statement {
    #[serde(rename="Sid", default)]
    pub sid: Option<String>,
    #[serde(rename="Effect")]
    pub effect: Effect,
    #[serde(rename="Action", default)]
    pub action: Option<OneOrMany<String>>,
    #[serde(rename="Resource", default)]
    pub resource: Option<OneOrMany<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Effect {
    Allow,
    Deny,
}

/// IAM documents write single-element lists as bare values.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        match self {
            OneOrMany::One(v) => std::slice::from_ref(v).iter(),
            OneOrMany::Many(vs) => vs.iter(),
        }
    }
}

/// Which restricted actions an offending document would allow.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all="camelCase")]
pub struct ComplianceReport {
    pub matched: BTreeSet<String>,
    pub statements_checked: usize,
}

impl ComplianceReport {
    pub fn is_compliant(&self) -> bool {
        self.matched.is_empty()
    }
}

/// Check an offending policy document (JSON text) against the restricted set.
///
/// Only `Allow` statements count; an action pattern may carry IAM wildcards
/// (`s3:*`, `s3:Delete?bject`), which are expanded before comparison.
pub fn check_document(document: &str, restricted: &RestrictedActions) -> Result<ComplianceReport, PolicyError> {
    let doc: PolicyDocument = serde_json::from_str(document)?;
    let mut matched = BTreeSet::new();
    let mut statements_checked = 0usize;
    for st in doc.statement.iter() {
        statements_checked += 1;
        if st.effect != Effect::Allow { continue; }
        let Some(actions) = &st.action else { continue };
        for pattern in actions.iter() {
            for action in restricted.iter() {
                if action_matches(pattern, action) {
                    matched.insert(action.to_string());
                }
            }
        }
    }
    Ok(ComplianceReport { matched, statements_checked })
}

fn action_matches(pattern: &str, action: &str) -> bool {
    if !pattern.contains('*') && !pattern.contains('?') {
        return pattern.eq_ignore_ascii_case(action);
    }
    let mut re = String::from("^");
    for c in pattern.chars() {
        match c {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            c => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push('$');
    RegexBuilder::new(&re)
        .case_insensitive(true)
        .build()
        .map(|r| r.is_match(action))
        .unwrap_or(false)
}
