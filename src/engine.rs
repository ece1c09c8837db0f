use std::{fs, io, path::PathBuf};

use regex::Regex;
use thiserror::Error;

use crate::rules::RedirectRule;

#[derive(Debug, Error)]
pub enum RuleEngineError {
    #[error("failed reading rule document at {}: {source}", .path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("invalid rule document json at {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("failed writing rule document at {}: {source}", .path.display())]
    Write { path: PathBuf, source: io::Error },
    #[error("failed serializing rule document: {0}")]
    Serialize(serde_json::Error),
    #[error("rule id {0} is already installed")]
    DuplicateId(u32),
    #[error("rule update rejected: {0}")]
    Rejected(String),
}

// The declarative redirection collaborator, visible to this process only as
// rule-id listing, batch removal, and batch addition.
pub trait RuleEngine {
    fn installed_rule_ids(&self) -> Result<Vec<u32>, RuleEngineError>;
    fn remove_rules(&mut self, ids: &[u32]) -> Result<(), RuleEngineError>;
    fn add_rules(&mut self, rules: Vec<RedirectRule>) -> Result<(), RuleEngineError>;
}

// An addition batch must not reuse an installed id (the engine holds one rule
// per id, never a replacement) and every filter must be a supported regex.
fn validate_batch(
    installed: &[RedirectRule],
    incoming: &[RedirectRule],
) -> Result<(), RuleEngineError> {
    for rule in incoming {
        let colliding = installed.iter().any(|existing| existing.id == rule.id)
            || incoming.iter().filter(|other| other.id == rule.id).count() > 1;
        if colliding {
            return Err(RuleEngineError::DuplicateId(rule.id));
        }
        Regex::new(&rule.condition.regex_filter).map_err(|err| {
            RuleEngineError::Rejected(format!(
                "rule {} carries an unsupported regex filter: {err}",
                rule.id
            ))
        })?;
    }
    Ok(())
}

// Installed rules materialized as a JSON document, so external rewriting
// tooling can consume them and a crash leaves the set observable for the
// startup repair pass.
#[derive(Debug, Clone)]
pub struct JsonRuleEngine {
    path: PathBuf,
}

impl JsonRuleEngine {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn read_rules(&self) -> Result<Vec<RedirectRule>, RuleEngineError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let text = fs::read_to_string(&self.path).map_err(|source| RuleEngineError::Read {
            path: self.path.clone(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| RuleEngineError::Parse {
            path: self.path.clone(),
            source,
        })
    }

    fn write_rules(&self, rules: &[RedirectRule]) -> Result<(), RuleEngineError> {
        let payload = serde_json::to_string_pretty(rules).map_err(RuleEngineError::Serialize)?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|source| RuleEngineError::Write {
                path: self.path.clone(),
                source,
            })?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, payload).map_err(|source| RuleEngineError::Write {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, &self.path).map_err(|source| RuleEngineError::Write {
            path: self.path.clone(),
            source,
        })?;
        Ok(())
    }
}

impl RuleEngine for JsonRuleEngine {
    fn installed_rule_ids(&self) -> Result<Vec<u32>, RuleEngineError> {
        Ok(self.read_rules()?.iter().map(|rule| rule.id).collect())
    }

    fn remove_rules(&mut self, ids: &[u32]) -> Result<(), RuleEngineError> {
        // Ids that are not installed are silently skipped.
        let mut rules = self.read_rules()?;
        rules.retain(|rule| !ids.contains(&rule.id));
        self.write_rules(&rules)
    }

    fn add_rules(&mut self, incoming: Vec<RedirectRule>) -> Result<(), RuleEngineError> {
        let mut rules = self.read_rules()?;
        validate_batch(&rules, &incoming)?;
        rules.extend(incoming);
        self.write_rules(&rules)
    }
}

#[cfg(test)]
#[derive(Debug, Clone, Default)]
pub struct MemoryRuleEngine {
    state: std::sync::Arc<std::sync::Mutex<MemoryEngineState>>,
}

#[cfg(test)]
#[derive(Debug, Default)]
struct MemoryEngineState {
    rules: Vec<RedirectRule>,
    removal_batches: Vec<Vec<u32>>,
    addition_batches: Vec<Vec<u32>>,
    reject_updates: bool,
}

#[cfg(test)]
impl MemoryRuleEngine {
    pub fn with_rules(rules: Vec<RedirectRule>) -> Self {
        let engine = Self::default();
        engine.lock().rules = rules;
        engine
    }

    pub fn reject_updates(&self, reject: bool) {
        self.lock().reject_updates = reject;
    }

    pub fn installed_ids(&self) -> Vec<u32> {
        self.lock().rules.iter().map(|rule| rule.id).collect()
    }

    pub fn removal_batches(&self) -> Vec<Vec<u32>> {
        self.lock().removal_batches.clone()
    }

    pub fn addition_batches(&self) -> Vec<Vec<u32>> {
        self.lock().addition_batches.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryEngineState> {
        self.state.lock().expect("engine state lock")
    }
}

#[cfg(test)]
impl RuleEngine for MemoryRuleEngine {
    fn installed_rule_ids(&self) -> Result<Vec<u32>, RuleEngineError> {
        Ok(self.installed_ids())
    }

    fn remove_rules(&mut self, ids: &[u32]) -> Result<(), RuleEngineError> {
        let mut state = self.lock();
        if state.reject_updates {
            return Err(RuleEngineError::Rejected("injected removal failure".to_owned()));
        }
        state.removal_batches.push(ids.to_vec());
        state.rules.retain(|rule| !ids.contains(&rule.id));
        Ok(())
    }

    fn add_rules(&mut self, incoming: Vec<RedirectRule>) -> Result<(), RuleEngineError> {
        let mut state = self.lock();
        if state.reject_updates {
            return Err(RuleEngineError::Rejected("injected addition failure".to_owned()));
        }
        validate_batch(&state.rules, &incoming)?;
        state
            .addition_batches
            .push(incoming.iter().map(|rule| rule.id).collect());
        state.rules.extend(incoming);
        Ok(())
    }
}
