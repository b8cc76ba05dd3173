//! A small declarative reference [`Filter`](super::Filter) implementation
//!
//! Rather than embed a scripting host, this crate ships a substring/regex
//! matcher driven by a directory of `*.rule.yaml` files, loaded and sorted
//! by filename -- exercising the same `Filter` trait a real scripting
//! integration (Lua, Rhai, ...) would.

use crate::error::Result;
use crate::filter::Filter;
use crate::mail::Mail;
use crate::object_store::ObjectStore;
use crate::verdict::Verdict;
use regex::Regex;
use serde::Deserialize;
use tracing::warn;

/// One `*.rule.yaml` document.
#[derive(Debug, Clone, Deserialize)]
struct Rule {
    /// Folders this rule opts into sweeping; empty means "no opinion".
    #[serde(default)]
    mailboxes: Vec<String>,
    #[serde(default)]
    subject_contains: Option<String>,
    #[serde(default)]
    from_contains: Option<String>,
    #[serde(default)]
    subject_matches: Option<String>,
    #[serde(flatten)]
    action: RuleAction,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind")]
enum RuleAction {
    Move { target: String },
    Delete,
}

impl Rule {
    fn matches(&self, mail: &Mail) -> Result<bool> {
        if let Some(needle) = &self.subject_contains {
            if !mail.subject.to_lowercase().contains(&needle.to_lowercase()) {
                return Ok(false);
            }
        }
        if let Some(needle) = &self.from_contains {
            let needle = needle.to_lowercase();
            let found = mail.from.iter().any(|a| a.to_string().to_lowercase().contains(&needle));
            if !found {
                return Ok(false);
            }
        }
        if let Some(pattern) = &self.subject_matches {
            let re = Regex::new(pattern).map_err(|e| crate::error::Error::Config(format!("invalid subject_matches regex: {e}")))?;
            if !re.is_match(&mail.subject) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn verdict(&self) -> Verdict {
        match &self.action {
            RuleAction::Move { target } => Verdict::Move { target: target.clone() },
            RuleAction::Delete => Verdict::Delete,
        }
    }
}

/// Declarative matcher filter: a sorted, flattened list of [`Rule`]s
/// loaded once at construction time.
pub struct MatchFilter {
    rules: Vec<Rule>,
}

impl MatchFilter {
    /// Loads every `*.rule.yaml` file under `scripts_dir`, sorted by
    /// path. A rule file that fails to parse is logged and skipped -- one
    /// bad rule file does not prevent the others from loading.
    pub async fn load(store: &dyn ObjectStore, scripts_dir: &str) -> Result<Self> {
        let mut paths = store.list_files(scripts_dir).await?;
        paths.retain(|p| p.ends_with(".rule.yaml") || p.ends_with(".rule.yml"));
        paths.sort();

        let mut rules = Vec::with_capacity(paths.len());
        for path in paths {
            let bytes = store.read_file(&path).await?;
            match serde_yaml::from_slice::<Rule>(&bytes) {
                Ok(rule) => rules.push(rule),
                Err(e) => warn!(%path, error = %e, "failed to parse rule file, skipping"),
            }
        }
        Ok(Self { rules })
    }

    #[cfg(test)]
    fn from_rules(rules: Vec<Rule>) -> Self {
        Self { rules }
    }
}

impl Filter for MatchFilter {
    fn name(&self) -> &str {
        "match"
    }

    fn select_mailboxes(&self) -> Vec<String> {
        self.rules.iter().flat_map(|r| r.mailboxes.clone()).collect()
    }

    fn evaluate(&self, _folder: &str, mail: &Mail) -> Verdict {
        for rule in &self.rules {
            match rule.matches(mail) {
                Ok(true) => return rule.verdict(),
                Ok(false) => {}
                Err(e) => {
                    warn!(error = %e, "rule evaluation failed, skipping rule");
                }
            }
        }
        Verdict::Accept
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Address;
    use crate::object_store::LocalObjectStore;

    fn mail_with_subject(subject: &str) -> Mail {
        Mail {
            subject: subject.to_string(),
            ..Mail::default()
        }
    }

    #[test]
    fn subject_substring_match_is_case_insensitive() {
        let filter = MatchFilter::from_rules(vec![Rule {
            mailboxes: vec![],
            subject_contains: Some("Invoice".to_string()),
            from_contains: None,
            subject_matches: None,
            action: RuleAction::Move {
                target: "Folders/Bills".to_string(),
            },
        }]);

        let verdict = filter.evaluate("INBOX", &mail_with_subject("Your INVOICE is ready"));
        assert_eq!(
            verdict,
            Verdict::Move {
                target: "Folders/Bills".to_string()
            }
        );
    }

    #[test]
    fn non_matching_rule_falls_through_to_accept() {
        let filter = MatchFilter::from_rules(vec![Rule {
            mailboxes: vec![],
            subject_contains: Some("invoice".to_string()),
            from_contains: None,
            subject_matches: None,
            action: RuleAction::Delete,
        }]);

        assert_eq!(filter.evaluate("INBOX", &mail_with_subject("lunch?")), Verdict::Accept);
    }

    #[test]
    fn from_contains_checks_every_address() {
        let filter = MatchFilter::from_rules(vec![Rule {
            mailboxes: vec![],
            subject_contains: None,
            from_contains: Some("spammer@bad.test".to_string()),
            subject_matches: None,
            action: RuleAction::Delete,
        }]);

        let mail = Mail {
            from: vec![Address {
                name: None,
                email: "spammer@bad.test".to_string(),
            }],
            ..Mail::default()
        };
        assert_eq!(filter.evaluate("INBOX", &mail), Verdict::Delete);
    }

    #[tokio::test]
    async fn load_skips_unparseable_files_and_sorts_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());
        store.mkdir_all("rules").await.unwrap();
        store
            .write_file("rules/b.rule.yaml", b"kind: delete\nsubject_contains: spam\n")
            .await
            .unwrap();
        store.write_file("rules/a.rule.yaml", b"not: valid: yaml: [").await.unwrap();
        store.write_file("rules/ignored.txt", b"nope").await.unwrap();

        let filter = MatchFilter::load(&store, "rules").await.unwrap();
        assert_eq!(filter.rules.len(), 1);
    }
}
