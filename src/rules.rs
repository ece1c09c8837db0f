use serde::{Deserialize, Serialize};
use tracing::info;

use crate::engine::{RuleEngine, RuleEngineError};

// The two redirection rules this process owns. Reconciliation never touches
// ids outside this set.
pub const RULE_IDS: [u32; 2] = [1, 2];

const EN_CARD_FILTER: &str = r"^https://www\.jinteki\.net/img/cards/en/(.+)\.png$";
const ZH_CARD_FILTER: &str = r"^https://www\.jinteki\.net/img/cards/zh-simp/(.+)\.png$";
const LOCALIZED_TARGET: &str = r"https://play.sneakdoorbeta.net/img/cards/zh-simp/\1.webp";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedirectRule {
    pub id: u32,
    pub priority: u32,
    pub action: RuleAction,
    pub condition: RuleCondition,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleAction {
    #[serde(rename = "type")]
    pub kind: RuleActionKind,
    pub redirect: RedirectTarget,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleActionKind {
    Redirect,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedirectTarget {
    pub regex_substitution: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleCondition {
    pub regex_filter: String,
    pub resource_types: Vec<ResourceType>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    Image,
}

pub fn replacement_rules() -> Vec<RedirectRule> {
    vec![
        redirect_rule(1, EN_CARD_FILTER),
        redirect_rule(2, ZH_CARD_FILTER),
    ]
}

fn redirect_rule(id: u32, filter: &str) -> RedirectRule {
    RedirectRule {
        id,
        priority: 1,
        action: RuleAction {
            kind: RuleActionKind::Redirect,
            redirect: RedirectTarget {
                regex_substitution: LOCALIZED_TARGET.to_owned(),
            },
        },
        condition: RuleCondition {
            regex_filter: filter.to_owned(),
            resource_types: vec![ResourceType::Image],
        },
    }
}

#[cfg(test)]
impl RedirectRule {
    // Substitution templates reference capture groups as \1..\9. Tests use
    // this to assert what the installed rules actually do to a request.
    fn apply(&self, url: &str) -> Option<String> {
        let filter = regex::Regex::new(&self.condition.regex_filter).ok()?;
        let caps = filter.captures(url)?;
        let mut out = String::new();
        let mut template = self.action.redirect.regex_substitution.chars();
        while let Some(ch) = template.next() {
            if ch != '\\' {
                out.push(ch);
                continue;
            }
            match template.next() {
                Some(digit @ '0'..='9') => {
                    let index = digit as usize - '0' as usize;
                    if let Some(group) = caps.get(index) {
                        out.push_str(group.as_str());
                    }
                }
                Some(other) => {
                    out.push('\\');
                    out.push(other);
                }
                None => out.push('\\'),
            }
        }
        Some(out)
    }
}

pub struct RuleSynchronizer<E> {
    engine: E,
}

impl<E: RuleEngine> RuleSynchronizer<E> {
    pub fn new(engine: E) -> Self {
        Self { engine }
    }

    // Brings the installed set to exactly RULE_IDS when desired, and to none
    // of them otherwise. Rules owned by other mechanisms stay untouched.
    pub fn reconcile(&mut self, desired: bool) -> Result<(), RuleEngineError> {
        let installed = self.engine.installed_rule_ids()?;
        let owned: Vec<u32> = installed
            .iter()
            .copied()
            .filter(|id| RULE_IDS.contains(id))
            .collect();
        if !owned.is_empty() {
            self.engine.remove_rules(&owned)?;
        }
        if desired {
            self.engine.add_rules(replacement_rules())?;
            info!(rules = ?RULE_IDS, "card image redirection active");
        } else {
            info!("card image redirection inactive");
        }
        Ok(())
    }
}
