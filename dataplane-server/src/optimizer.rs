//! Query optimizer: conservative syntactic rewrites plus
//! recommendation-only suggestions. Intentionally regex-level, not a
//! "Reflection/regex parsing", a fuller parser is never the answer here;
//! anything beyond safe syntactic rewriting becomes a recommendation.

use std::collections::HashMap;

use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RewriteLevel {
    Conservative,
    Moderate,
    Aggressive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Risk {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone)]
pub struct AppliedRewrite {
    pub rule: &'static str,
    pub estimated_benefit_pct: f64,
    pub rationale: String,
}

#[derive(Debug, Clone)]
pub struct Recommendation {
    pub rule: &'static str,
    pub risk: Risk,
    pub estimated_benefit_pct: f64,
    pub rationale: String,
    pub suggested_query: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RewriteResult {
    pub original: String,
    pub rewritten: String,
    pub applied: Vec<AppliedRewrite>,
    pub recommendations: Vec<Recommendation>,
}

#[derive(Debug, Clone)]
pub struct IndexDef {
    pub name: String,
    pub columns: Vec<String>,
    pub unique: bool,
}

static TRUE_LITERAL: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\b1\s*=\s*1\b").unwrap());
static FALSE_LITERAL: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\b0\s*=\s*1\b").unwrap());
static WHERE_TRUE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bWHERE\s+TRUE\s*(AND)?\s*").unwrap());
static WHERE_EQ: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)([A-Za-z_][A-Za-z0-9_]*)\s*=\s*(\?|'[^']*'|\d+)").unwrap());
static SELECT_STAR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^SELECT\s+\*\s+FROM\s+([A-Za-z_][A-Za-z0-9_]*)").unwrap());

/// Offline index/schema registry, populated by callers as schema
/// information becomes available (e.g. from a prior DDL or a loaded
/// catalog). Absent entries simply disable the rules that need them.
pub struct Optimizer {
    level: RewriteLevel,
    schemas: DashMap<String, Vec<String>>,
    indexes: DashMap<String, Vec<IndexDef>>,
    select_star_k: usize,
}

impl Optimizer {
    pub fn new(level: RewriteLevel) -> Self {
        Self {
            level,
            schemas: DashMap::new(),
            indexes: DashMap::new(),
            select_star_k: 8,
        }
    }

    pub fn register_schema(&self, table: impl Into<String>, columns: Vec<String>) {
        self.schemas.insert(table.into(), columns);
    }

    pub fn register_indexes(&self, table: impl Into<String>, indexes: Vec<IndexDef>) {
        self.indexes.insert(table.into(), indexes);
    }

    pub fn optimize(&self, query: &str) -> RewriteResult {
        let mut current = query.to_string();
        let mut applied = Vec::new();
        let mut recommendations = Vec::new();

        // Constant folding: always safe, always applied.
        let folded = fold_constants(&current);
        if folded != current {
            applied.push(AppliedRewrite {
                rule: "constant_folding",
                estimated_benefit_pct: 1.0,
                rationale: "folded boolean-literal comparisons (1=1 / 0=1)".to_string(),
            });
            current = folded;
        }

        // Predicate simplification: strip trivial WHERE TRUE.
        let simplified = simplify_predicates(&current);
        if simplified != current {
            applied.push(AppliedRewrite {
                rule: "predicate_simplification",
                estimated_benefit_pct: 1.0,
                rationale: "removed trivially-true WHERE clause".to_string(),
            });
            current = simplified;
        }

        if self.level >= RewriteLevel::Moderate {
            if let Some(rec) = self.suggest_index_hint(&current) {
                recommendations.push(rec);
            }
            if let Some(rec) = self.suggest_select_star_expansion(&current) {
                recommendations.push(rec);
            }
        }

        if self.level == RewriteLevel::Aggressive {
            recommendations.extend(self.suggest_complex_rewrites(&current));
        }

        RewriteResult {
            original: query.to_string(),
            rewritten: current,
            applied,
            recommendations,
        }
    }

    fn suggest_index_hint(&self, query: &str) -> Option<Recommendation> {
        let table = extract_table(query)?;
        let indexes = self.indexes.get(&table)?;
        let referenced: Vec<String> = WHERE_EQ
            .captures_iter(query)
            .map(|c| c[1].to_ascii_lowercase())
            .collect();
        if referenced.is_empty() {
            return None;
        }

        let mut best: Option<(&IndexDef, usize)> = None;
        for idx in indexes.iter() {
            let prefix_len = idx
                .columns
                .iter()
                .take_while(|c| referenced.contains(&c.to_ascii_lowercase()))
                .count();
            if prefix_len == 0 {
                continue;
            }
            let covering = prefix_len == idx.columns.len();
            let better = match &best {
                None => true,
                Some((cur, cur_len)) => {
                    // Tie-break: (unique, wider prefix match).
                    (idx.unique, prefix_len) > (cur.unique, *cur_len) || covering && prefix_len > *cur_len
                }
            };
            if better {
                best = Some((idx, prefix_len));
            }
        }

        best.map(|(idx, prefix_len)| Recommendation {
            rule: "index_hint",
            risk: Risk::Low,
            estimated_benefit_pct: (prefix_len as f64 / idx.columns.len().max(1) as f64) * 40.0,
            rationale: format!(
                "query predicates match a {}-column prefix of index '{}' on {}",
                prefix_len, idx.name, table
            ),
            suggested_query: None,
        })
    }

    fn suggest_select_star_expansion(&self, query: &str) -> Option<Recommendation> {
        let caps = SELECT_STAR.captures(query)?;
        let table = caps[1].to_string();
        let columns = self.schemas.get(&table)?;
        let chosen: Vec<&str> = columns.iter().take(self.select_star_k).map(|s| s.as_str()).collect();
        if chosen.is_empty() {
            return None;
        }
        let suggested = SELECT_STAR
            .replace(query, format!("SELECT {} FROM {}", chosen.join(", "), table))
            .to_string();
        Some(Recommendation {
            rule: "select_star_expansion",
            risk: Risk::Medium,
            estimated_benefit_pct: 10.0,
            rationale: format!("substituting explicit columns for SELECT * on '{table}' avoids over-fetching"),
            suggested_query: Some(suggested),
        })
    }

    fn suggest_complex_rewrites(&self, query: &str) -> Vec<Recommendation> {
        let mut out = Vec::new();
        let upper = query.to_ascii_uppercase();
        if upper.contains(" OR ") {
            out.push(Recommendation {
                rule: "or_to_union",
                risk: Risk::High,
                estimated_benefit_pct: 15.0,
                rationale: "OR predicate across indexed columns may perform better as a UNION".to_string(),
                suggested_query: None,
            });
        }
        if upper.contains("SELECT") && upper.matches("SELECT").count() > 1 {
            out.push(Recommendation {
                rule: "subquery_to_join",
                risk: Risk::High,
                estimated_benefit_pct: 20.0,
                rationale: "nested SELECT may be rewritable as a JOIN".to_string(),
                suggested_query: None,
            });
        }
        out
    }
}

fn fold_constants(query: &str) -> String {
    let q = TRUE_LITERAL.replace_all(query, "TRUE");
    FALSE_LITERAL.replace_all(&q, "FALSE").to_string()
}

fn simplify_predicates(query: &str) -> String {
    WHERE_TRUE.replace(query, "").to_string()
}

fn extract_table(query: &str) -> Option<String> {
    static FROM: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)FROM\s+([A-Za-z_][A-Za-z0-9_]*)").unwrap());
    FROM.captures(query).map(|c| c[1].to_string())
}

/// Per-table column usage, supplied externally (e.g. by the monitor or
/// a log reader) for the index advisor Kept here alongside the
/// optimizer's own schema registry since both describe table shape.
pub type SchemaCatalog = HashMap<String, Vec<String>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folds_boolean_literal_comparisons() {
        let opt = Optimizer::new(RewriteLevel::Conservative);
        let r = opt.optimize("SELECT * FROM t WHERE 1=1 AND id = 5");
        assert!(r.rewritten.contains("TRUE"));
        assert_eq!(r.applied.len(), 1);
    }

    #[test]
    fn strips_trivial_where_true() {
        let opt = Optimizer::new(RewriteLevel::Conservative);
        let r = opt.optimize("SELECT * FROM t WHERE TRUE AND id = 5");
        assert!(!r.rewritten.to_uppercase().contains("WHERE TRUE"));
    }

    #[test]
    fn index_hint_prefers_covering_and_unique() {
        let opt = Optimizer::new(RewriteLevel::Moderate);
        opt.register_indexes(
            "documents",
            vec![
                IndexDef { name: "idx_id".into(), columns: vec!["id".into()], unique: true },
                IndexDef {
                    name: "idx_title_id".into(),
                    columns: vec!["title".into(), "id".into()],
                    unique: false,
                },
            ],
        );
        let r = opt.optimize("SELECT * FROM documents WHERE id = 42");
        assert_eq!(r.recommendations.len(), 1);
        assert_eq!(r.recommendations[0].rule, "index_hint");
        assert!(r.recommendations[0].rationale.contains("idx_id"));
    }

    #[test]
    fn select_star_expansion_is_a_recommendation_not_applied() {
        let opt = Optimizer::new(RewriteLevel::Moderate);
        opt.register_schema("documents", vec!["id".into(), "title".into(), "body".into()]);
        let r = opt.optimize("SELECT * FROM documents");
        assert_eq!(r.rewritten, "SELECT * FROM documents");
        let rec = r.recommendations.iter().find(|r| r.rule == "select_star_expansion").unwrap();
        assert_eq!(rec.risk, Risk::Medium);
        assert!(rec.suggested_query.as_ref().unwrap().contains("id, title, body"));
    }

    #[test]
    fn aggressive_level_flags_or_as_recommendation_only() {
        let opt = Optimizer::new(RewriteLevel::Aggressive);
        let r = opt.optimize("SELECT * FROM t WHERE a = 1 OR b = 2");
        assert_eq!(r.rewritten, "SELECT * FROM t WHERE a = 1 OR b = 2");
        assert!(r.recommendations.iter().any(|r| r.rule == "or_to_union"));
    }
}
