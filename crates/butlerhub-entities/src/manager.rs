use std::collections::HashMap;
use std::sync::Mutex;

use rusqlite::Connection;
use tracing::debug;
use uuid::Uuid;

use crate::db;
use crate::error::{EntityError, Result};
use crate::types::{Entity, EntityCandidate, NameMatch, NewEntity, NewFact, ResolveInput};

/// Facts considered per candidate when computing the graph-neighborhood
/// boost. Bounds the cost of tokenizing a chatty entity's history.
const FACTS_PER_CANDIDATE: usize = 500;
/// Maximum points the graph-neighborhood boost can add to a candidate's
/// score, on top of its tier base score.
const MAX_NEIGHBORHOOD_BOOST: f64 = 20.0;
/// Minimum bigram-similarity score (via `strsim::sorensen_dice`, used as a
/// practical trigram-similarity proxy — see DESIGN.md) for the fuzzy tier
/// to accept a candidate.
const FUZZY_THRESHOLD: f64 = 0.3;

/// Resolves entity mentions against a tenant's known entities and owns the
/// facts attached to them.
///
/// Thread-safe: wraps the SQLite connection in a Mutex, matching the
/// teacher's single-writer-connection convention.
pub struct EntityResolver {
    db: Mutex<Connection>,
}

impl EntityResolver {
    pub fn new(conn: Connection) -> Self {
        Self { db: Mutex::new(conn) }
    }

    pub fn create_entity(&self, new: NewEntity) -> Result<Entity> {
        let conn = self.db.lock().unwrap();
        db::create_entity(&conn, new)
    }

    pub fn get_entity(&self, id: Uuid) -> Result<Entity> {
        let conn = self.db.lock().unwrap();
        db::get_entity(&conn, id)
    }

    pub fn add_fact(&self, entity_id: Uuid, fact: NewFact) -> Result<()> {
        let conn = self.db.lock().unwrap();
        db::add_fact(&conn, entity_id, fact)?;
        Ok(())
    }

    /// Resolves a name mention to ranked entity candidates.
    ///
    /// Runs the four discovery tiers (exact canonical name, exact alias,
    /// prefix/substring, optional fuzzy), keeps the best tier per entity,
    /// applies the graph-neighborhood boost and any per-entity
    /// `domain_scores` from the caller's `context_hints`, drops
    /// non-positive scores, and sorts by `(-score, canonical_name)`.
    pub fn resolve(&self, input: ResolveInput) -> Result<Vec<EntityCandidate>> {
        let conn = self.db.lock().unwrap();

        let mut best: HashMap<Uuid, (Entity, NameMatch)> = HashMap::new();
        let mut note_tier = |entities: Vec<Entity>, tier: NameMatch, best: &mut HashMap<Uuid, (Entity, NameMatch)>| {
            for e in entities {
                best.entry(e.id).or_insert((e, tier));
            }
        };

        note_tier(
            db::find_by_exact_name(&conn, &input.tenant_id, &input.name, input.entity_type.as_deref())?,
            NameMatch::Exact,
            &mut best,
        );
        note_tier(
            db::find_by_alias(&conn, &input.tenant_id, &input.name, input.entity_type.as_deref())?,
            NameMatch::Alias,
            &mut best,
        );
        note_tier(
            db::find_by_substring(&conn, &input.tenant_id, &input.name, input.entity_type.as_deref())?,
            NameMatch::PrefixOrSubstring,
            &mut best,
        );

        if input.enable_fuzzy {
            let candidates = db::list_active_for_tenant(&conn, &input.tenant_id, input.entity_type.as_deref())?;
            let needle = input.name.to_lowercase();
            for e in candidates {
                if best.contains_key(&e.id) {
                    continue;
                }
                let sim = strsim::sorensen_dice(&needle, &e.canonical_name.to_lowercase());
                if sim > FUZZY_THRESHOLD {
                    best.insert(e.id, (e, NameMatch::Fuzzy));
                }
            }
        }

        let context_tokens = input.context_hints.tokens();

        let mut scored = Vec::with_capacity(best.len());
        for (entity, tier) in best.into_values() {
            let mut score = tier.base_score();

            if !context_tokens.is_empty() {
                let facts = db::list_active_facts(&conn, entity.id, FACTS_PER_CANDIDATE)?;
                let mut fact_tokens = std::collections::HashSet::new();
                for f in &facts {
                    fact_tokens.extend(crate::types::tokenize(&f.predicate));
                    fact_tokens.extend(crate::types::tokenize(&f.content));
                }
                score += jaccard_overlap(&context_tokens, &fact_tokens) * MAX_NEIGHBORHOOD_BOOST;
            }

            if let Some(boost) = input.context_hints.domain_scores.get(&entity.id) {
                score += boost;
            }

            if score > 0.0 {
                scored.push(EntityCandidate {
                    entity_id: entity.id,
                    canonical_name: entity.canonical_name,
                    entity_type: entity.entity_type,
                    score,
                    name_match: tier,
                    aliases: entity.aliases,
                });
            }
        }

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.canonical_name.cmp(&b.canonical_name))
        });

        debug!(tenant_id = %input.tenant_id, name = %input.name, found = scored.len(), "resolved entity candidates");
        Ok(scored)
    }

    /// Re-points `source`'s facts onto `target`, merges aliases, and
    /// tombstones `source`. Both entities must already exist.
    pub fn merge(&self, source_id: Uuid, target_id: Uuid) -> Result<Entity> {
        if source_id == target_id {
            return Err(EntityError::SelfMerge(source_id));
        }
        let conn = self.db.lock().unwrap();
        let source = db::get_entity(&conn, source_id)?;
        let target = db::get_entity(&conn, target_id)?;
        db::merge_entities(&conn, &source, &target)?;
        db::get_entity(&conn, target_id)
    }
}

fn jaccard_overlap(a: &std::collections::HashSet<String>, b: &std::collections::HashSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count() as f64;
    let union = a.union(b).count() as f64;
    if union == 0.0 {
        0.0
    } else {
        intersection / union
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ContextHints;

    fn resolver() -> EntityResolver {
        let conn = Connection::open_in_memory().unwrap();
        db::init_db(&conn).unwrap();
        EntityResolver::new(conn)
    }

    fn input(name: &str) -> ResolveInput {
        ResolveInput {
            name: name.to_string(),
            tenant_id: "t1".to_string(),
            entity_type: None,
            context_hints: ContextHints::default(),
            enable_fuzzy: false,
        }
    }

    #[test]
    fn exact_match_outranks_substring_match() {
        let r = resolver();
        r.create_entity(NewEntity {
            tenant_id: "t1".into(), canonical_name: "Jordan".into(), entity_type: None,
            aliases: vec![],
        }).unwrap();
        r.create_entity(NewEntity {
            tenant_id: "t1".into(), canonical_name: "Jordan Lake Park".into(), entity_type: None,
            aliases: vec![],
        }).unwrap();

        let results = r.resolve(input("Jordan")).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].canonical_name, "Jordan");
        assert_eq!(results[0].name_match, NameMatch::Exact);
    }

    #[test]
    fn fuzzy_tier_only_applies_when_enabled() {
        let r = resolver();
        r.create_entity(NewEntity {
            tenant_id: "t1".into(), canonical_name: "Katherine".into(), entity_type: None,
            aliases: vec![],
        }).unwrap();

        let mut no_fuzzy = input("Katharine");
        no_fuzzy.enable_fuzzy = false;
        assert!(r.resolve(no_fuzzy).unwrap().is_empty());

        let mut fuzzy = input("Katharine");
        fuzzy.enable_fuzzy = true;
        let results = r.resolve(fuzzy).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].name_match, NameMatch::Fuzzy);
    }

    #[test]
    fn context_hints_boost_matching_candidate() {
        let r = resolver();
        let e1 = r.create_entity(NewEntity {
            tenant_id: "t1".into(), canonical_name: "Acme Launch".into(), entity_type: None,
            aliases: vec![],
        }).unwrap();
        let e2 = r.create_entity(NewEntity {
            tenant_id: "t1".into(), canonical_name: "Acme Retro".into(), entity_type: None,
            aliases: vec![],
        }).unwrap();
        r.add_fact(e1.id, NewFact { predicate: "topic".into(), content: "rocket launch schedule".into() }).unwrap();
        r.add_fact(e2.id, NewFact { predicate: "topic".into(), content: "quarterly retrospective".into() }).unwrap();

        let mut with_hints = input("Acme");
        with_hints.context_hints = ContextHints {
            topic: Some("rocket launch".into()),
            ..Default::default()
        };

        let results = r.resolve(with_hints).unwrap();
        assert_eq!(results[0].entity_id, e1.id);
    }

    #[test]
    fn hinted_domain_scores_boost_only_the_named_entity() {
        let r = resolver();
        let sam = r.create_entity(NewEntity {
            tenant_id: "t1".into(), canonical_name: "Sam Park".into(), entity_type: None,
            aliases: vec![],
        }).unwrap();
        let other = r.create_entity(NewEntity {
            tenant_id: "t1".into(), canonical_name: "Sam Rivers".into(), entity_type: None,
            aliases: vec![],
        }).unwrap();

        let mut hinted = input("Sam");
        hinted.context_hints.domain_scores.insert(sam.id, 15.0);

        let results = r.resolve(hinted).unwrap();
        let boosted = results.iter().find(|c| c.entity_id == sam.id).unwrap();
        let unhinted = results.iter().find(|c| c.entity_id == other.id).unwrap();
        assert_eq!(boosted.score, NameMatch::PrefixOrSubstring.base_score() + 15.0);
        assert_eq!(unhinted.score, NameMatch::PrefixOrSubstring.base_score());
    }

    #[test]
    fn no_hints_means_no_boost() {
        let r = resolver();
        r.create_entity(NewEntity {
            tenant_id: "t1".into(), canonical_name: "Sam".into(), entity_type: None,
            aliases: vec![],
        }).unwrap();

        let results = r.resolve(input("Sam")).unwrap();
        assert_eq!(results[0].score, NameMatch::Exact.base_score());
    }

    #[test]
    fn merge_rejects_self_merge() {
        let r = resolver();
        let e = r.create_entity(NewEntity {
            tenant_id: "t1".into(), canonical_name: "Solo".into(), entity_type: None,
            aliases: vec![],
        }).unwrap();
        let err = r.merge(e.id, e.id).unwrap_err();
        assert!(matches!(err, EntityError::SelfMerge(_)));
    }
}
