use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A row of `entities` — a tenant-scoped thing the fleet can talk about
/// (a person, a place, a project, …) with a canonical name and a set of
/// aliases it's also known by.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub id: Uuid,
    pub tenant_id: String,
    pub canonical_name: String,
    pub entity_type: Option<String>,
    pub aliases: Vec<String>,
    pub tombstoned_at: Option<DateTime<Utc>>,
    pub merged_into: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Entity {
    pub fn is_tombstoned(&self) -> bool {
        self.tombstoned_at.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct NewEntity {
    pub tenant_id: String,
    pub canonical_name: String,
    pub entity_type: Option<String>,
    pub aliases: Vec<String>,
}

/// A row of `facts` — a predicate/content pair attached to an entity, used
/// by the graph-neighborhood boost during resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fact {
    pub id: Uuid,
    pub entity_id: Uuid,
    pub predicate: String,
    pub content: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct NewFact {
    pub predicate: String,
    pub content: String,
}

/// Which discovery tier matched a candidate — carried through to the
/// response so a caller can see why a result ranked where it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NameMatch {
    Exact,
    Alias,
    PrefixOrSubstring,
    Fuzzy,
}

impl NameMatch {
    /// Tier base score, per the documented 100/80/50/20 ladder.
    pub fn base_score(self) -> f64 {
        match self {
            NameMatch::Exact => 100.0,
            NameMatch::Alias => 80.0,
            NameMatch::PrefixOrSubstring => 50.0,
            NameMatch::Fuzzy => 20.0,
        }
    }
}

/// Optional caller-supplied hints: `topic`/`mentioned_with` feed the
/// graph-neighborhood boost, and `domain_scores` is a per-entity numeric
/// boost applied at query time to candidates the caller already has an
/// opinion about. None of this persists — each resolve sees only the hints
/// it was handed.
#[derive(Debug, Clone, Default)]
pub struct ContextHints {
    pub topic: Option<String>,
    pub mentioned_with: Vec<String>,
    pub domain_scores: std::collections::HashMap<Uuid, f64>,
}

impl ContextHints {
    pub fn is_empty(&self) -> bool {
        self.topic.is_none() && self.mentioned_with.is_empty() && self.domain_scores.is_empty()
    }

    /// Lowercased whitespace tokens across `topic` and `mentioned_with`,
    /// deduplicated via a set.
    pub fn tokens(&self) -> std::collections::HashSet<String> {
        let mut tokens = std::collections::HashSet::new();
        if let Some(topic) = &self.topic {
            tokens.extend(tokenize(topic));
        }
        for m in &self.mentioned_with {
            tokens.extend(tokenize(m));
        }
        tokens
    }
}

pub fn tokenize(s: &str) -> impl Iterator<Item = String> + '_ {
    s.split_whitespace().map(|w| w.to_lowercase())
}

#[derive(Debug, Clone)]
pub struct ResolveInput {
    pub name: String,
    pub tenant_id: String,
    pub entity_type: Option<String>,
    pub context_hints: ContextHints,
    pub enable_fuzzy: bool,
}

/// A ranked resolution candidate returned to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityCandidate {
    pub entity_id: Uuid,
    pub canonical_name: String,
    pub entity_type: Option<String>,
    pub score: f64,
    pub name_match: NameMatch,
    pub aliases: Vec<String>,
}
