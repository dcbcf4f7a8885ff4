//! Public model names and the upstream models they resolve to.
//!
//! Several public aliases may share one upstream model. Resolution is an exact,
//! case-sensitive lookup; anything not listed is rejected before any session
//! or network work happens.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;

use crate::errors::AppError;
use crate::models::chat::ModelCard;

/// Fixed creation timestamp reported for every listed model.
pub const MODEL_CREATED: i64 = 1_686_935_002;
pub const MODEL_OWNER: &str = "chatgate";

static BUILTIN_ALIASES: Lazy<Vec<(&'static str, &'static str)>> = Lazy::new(|| {
    vec![
        ("gpt-4.1", "gpt-4.1"),
        ("gpt-4o", "gpt-4o"),
        ("gpt-4o-mini", "gpt-4o-mini"),
        ("gpt-4", "gpt-4.1"),
        ("gpt-3.5-turbo", "gpt-4o-mini"),
    ]
});

#[derive(Debug, Clone)]
pub struct ModelCatalog {
    aliases: BTreeMap<String, String>,
}

impl ModelCatalog {
    /// Built-in aliases overlaid with `extra` (later entries win).
    pub fn new(extra: &[(String, String)]) -> Self {
        let mut aliases: BTreeMap<String, String> = BUILTIN_ALIASES
            .iter()
            .map(|(a, u)| (a.to_string(), u.to_string()))
            .collect();
        for (alias, upstream) in extra {
            aliases.insert(alias.clone(), upstream.clone());
        }
        Self { aliases }
    }

    pub fn resolve(&self, public_name: &str) -> Result<&str, AppError> {
        self.aliases
            .get(public_name)
            .map(String::as_str)
            .ok_or_else(|| AppError::UnknownModel(public_name.to_string()))
    }

    pub fn list(&self) -> Vec<ModelCard> {
        self.aliases.keys().map(|id| card(id)).collect()
    }

    pub fn get(&self, public_name: &str) -> Option<ModelCard> {
        self.aliases.contains_key(public_name).then(|| card(public_name))
    }
}

fn card(id: &str) -> ModelCard {
    ModelCard {
        id: id.to_string(),
        object: "model".to_string(),
        created: MODEL_CREATED,
        owned_by: MODEL_OWNER.to_string(),
    }
}
