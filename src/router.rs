//! Pure routing function: (subject, sender, body) -> collection name.
//!
//! Precedence: an explicit `Workspace:`/`Dossier:` marker in the body wins over
//! the ordered rule list, which wins over the configured default. The result is
//! always slugified.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

static MARKER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(?:Dossier|Workspace)\s*:\s*(.+)").unwrap());
static SENDER_DOMAIN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\w.-]+@([\w.-]+)").unwrap());

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    Sender,
    SenderContains,
    SenderDomain,
    Subject,
    SubjectContains,
    SubjectRegex,
    BodyContains,
    BodyRegex,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingRule {
    #[serde(rename = "type")]
    pub rule_type: RuleType,
    pub value: String,
    pub workspace: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RoutingRuleSet {
    pub rules: Vec<RoutingRule>,
}

impl RoutingRuleSet {
    pub fn load(path: &str) -> Self {
        match std::fs::read_to_string(path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                tracing::warn!("invalid routing rules file {path}: {e}");
                Self::default()
            }),
            Err(_) => {
                tracing::warn!("routing rules file {path} absent, using default-only routing");
                Self::default()
            }
        }
    }
}

pub struct EmailFields<'a> {
    pub sender: &'a str,
    pub subject: &'a str,
    pub body: &'a str,
}

fn extract_sender_domain(sender: &str) -> String {
    SENDER_DOMAIN_RE
        .captures(sender)
        .map(|c| c[1].to_lowercase())
        .unwrap_or_default()
}

fn match_rule(rule: &RoutingRule, sender_l: &str, subject: &str, subject_l: &str, body: &str, body_l: &str, sender_domain: &str) -> bool {
    let value = rule.value.trim();
    if value.is_empty() {
        return false;
    }
    let val_l = value.to_lowercase();
    match rule.rule_type {
        RuleType::Sender | RuleType::SenderContains => sender_l.contains(&val_l),
        RuleType::SenderDomain => sender_domain == val_l,
        RuleType::Subject | RuleType::SubjectContains => subject_l.contains(&val_l),
        RuleType::SubjectRegex => Regex::new(&format!("(?i){}", value))
            .map(|re| re.is_match(subject))
            .unwrap_or(false),
        RuleType::BodyContains => body_l.contains(&val_l),
        RuleType::BodyRegex => Regex::new(&format!("(?i){}", value))
            .map(|re| re.is_match(body))
            .unwrap_or(false),
    }
}

/// NFD-normalize, strip combining marks, lowercase, collapse separator runs to
/// `-`, trim.
pub fn slugify(text: &str, default_workspace: &str) -> String {
    if text.trim().is_empty() {
        return default_workspace.to_string();
    }

    let lowered = text.to_lowercase();
    let stripped: String = lowered.nfd().filter(|c| !is_combining_mark(*c)).collect();

    let kept: String = stripped
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c.is_whitespace() || *c == '-')
        .collect();

    static SEP_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[\s_-]+").unwrap());
    let collapsed = SEP_RE.replace_all(&kept, "-");
    let trimmed = collapsed.trim_matches('-');

    if trimmed.is_empty() {
        default_workspace.to_string()
    } else {
        trimmed.to_string()
    }
}

pub fn determine_collection(fields: EmailFields, rules: &RoutingRuleSet, default_workspace: &str) -> String {
    let sender = fields.sender.trim();
    let subject = fields.subject.trim();
    let body = fields.body.trim();

    let sender_l = sender.to_lowercase();
    let subject_l = subject.to_lowercase();
    let body_l = body.to_lowercase();
    let sender_domain = extract_sender_domain(sender);

    let mut raw_ws = default_workspace.to_string();
    let mut marker_found = false;

    for line in body.lines() {
        let clean = line.trim();
        if clean.is_empty() {
            continue;
        }
        if let Some(caps) = MARKER_RE.captures(clean) {
            let candidate = caps[1].trim();
            if !candidate.is_empty() {
                raw_ws = candidate.to_string();
                marker_found = true;
                break;
            }
        }
    }

    if !marker_found {
        for rule in &rules.rules {
            let workspace = rule.workspace.trim();
            if workspace.is_empty() {
                continue;
            }
            if match_rule(rule, &sender_l, subject, &subject_l, body, &body_l, &sender_domain) {
                raw_ws = workspace.to_string();
                break;
            }
        }
    }

    slugify(&raw_ws, default_workspace)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_marker_wins() {
        let rules = RoutingRuleSet { rules: vec![] };
        let got = determine_collection(
            EmailFields { sender: "x@y.z", subject: "anything", body: "Workspace: \u{00c9}t\u{00e9} 2024\nhello" },
            &rules,
            "general",
        );
        assert_eq!(got, "ete-2024");
    }

    #[test]
    fn sender_domain_rule() {
        let rules = RoutingRuleSet {
            rules: vec![RoutingRule {
                rule_type: RuleType::SenderDomain,
                value: "client.com".into(),
                workspace: "clients".into(),
            }],
        };
        let got = determine_collection(
            EmailFields { sender: "John <j@client.com>", subject: "hi", body: "no marker here" },
            &rules,
            "general",
        );
        assert_eq!(got, "clients");
    }

    #[test]
    fn explicit_marker_matching_default_still_skips_rules() {
        let rules = RoutingRuleSet {
            rules: vec![RoutingRule {
                rule_type: RuleType::SenderDomain,
                value: "client.com".into(),
                workspace: "clients".into(),
            }],
        };
        let got = determine_collection(
            EmailFields { sender: "j@client.com", subject: "hi", body: "Workspace: general" },
            &rules,
            "general",
        );
        assert_eq!(got, "general");
    }

    #[test]
    fn falls_back_to_default() {
        let rules = RoutingRuleSet { rules: vec![] };
        let got = determine_collection(
            EmailFields { sender: "a@b.com", subject: "hi", body: "nothing special" },
            &rules,
            "general",
        );
        assert_eq!(got, "general");
    }
}
