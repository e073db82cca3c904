//! Index Advisor: an offline pass over observed queries that
//! produces ranked index recommendations. Regex-level like the
//! optimizer — usage counting, not a
//! parser.

use std::collections::HashMap;

use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::optimizer::IndexDef;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecommendationKind {
    MissingIndex,
    CompositeIndex,
    CoveringIndex,
    RedundantIndex,
    UnusedIndex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

fn priority_from_score(score: f64) -> Priority {
    if score >= 75.0 {
        Priority::Critical
    } else if score >= 50.0 {
        Priority::High
    } else if score >= 25.0 {
        Priority::Medium
    } else {
        Priority::Low
    }
}

#[derive(Debug, Clone)]
pub struct IndexRecommendation {
    pub kind: RecommendationKind,
    pub table: String,
    pub columns: Vec<String>,
    pub estimated_benefit_pct: f64,
    pub estimated_storage_cost_mb: f64,
    pub rationale: String,
    pub ddl: String,
    pub priority: Priority,
}

#[derive(Debug, Default)]
struct ColumnUsage {
    where_count: u64,
    order_count: u64,
}

static FROM: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)FROM\s+([A-Za-z_][A-Za-z0-9_]*)").unwrap());
static WHERE_COL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(?:WHERE|AND)\s+([A-Za-z_][A-Za-z0-9_]*)\s*(?:=|>|<|>=|<=|LIKE)\s*(?:\?|'[^']*'|\d+)").unwrap());
static JOIN_ON: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)JOIN\s+([A-Za-z_][A-Za-z0-9_]*).*?ON\s+([A-Za-z_][A-Za-z0-9_]*)\.([A-Za-z_][A-Za-z0-9_]*)\s*=\s*([A-Za-z_][A-Za-z0-9_]*)\.([A-Za-z_][A-Za-z0-9_]*)").unwrap()
});
static ORDER_BY: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)ORDER\s+BY\s+([A-Za-z0-9_,.\s]+?)(?:LIMIT|$)").unwrap());
static SELECT_COLS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^SELECT\s+([A-Za-z0-9_,.\s]+?)\s+FROM").unwrap());

fn extract_table(query: &str) -> Option<String> {
    FROM.captures(query).map(|c| c[1].to_ascii_lowercase())
}

fn extract_where_columns(query: &str) -> Vec<String> {
    WHERE_COL.captures_iter(query).map(|c| c[1].to_ascii_lowercase()).collect()
}

fn extract_join_edges(query: &str) -> Vec<(String, String, String, String)> {
    JOIN_ON
        .captures_iter(query)
        .map(|c| {
            (
                c[2].to_ascii_lowercase(),
                c[3].to_ascii_lowercase(),
                c[4].to_ascii_lowercase(),
                c[5].to_ascii_lowercase(),
            )
        })
        .collect()
}

fn extract_order_columns(query: &str) -> Vec<String> {
    let Some(caps) = ORDER_BY.captures(query) else { return Vec::new() };
    caps[1]
        .split(',')
        .filter_map(|part| {
            part.split_whitespace()
                .next()
                .map(|c| c.trim_end_matches(',').rsplit('.').next().unwrap_or(c).to_ascii_lowercase())
        })
        .collect()
}

/// `None` for `SELECT *` (not useful for covering-index analysis);
/// `Some(columns)` otherwise.
fn extract_select_columns(query: &str) -> Option<Vec<String>> {
    if Regex::new(r"(?i)^SELECT\s+\*").unwrap().is_match(query.trim()) {
        return None;
    }
    let caps = SELECT_COLS.captures(query)?;
    let cols: Vec<String> = caps[1]
        .split(',')
        .map(|c| c.trim().rsplit('.').next().unwrap_or(c.trim()).to_ascii_lowercase())
        .filter(|c| !c.is_empty())
        .collect();
    if cols.is_empty() {
        None
    } else {
        Some(cols)
    }
}

/// Counts column/join/select usage from observed queries and turns the
/// accumulated frequencies into ranked recommendations
pub struct IndexAdvisor {
    min_freq: u64,
    column_usage: DashMap<(String, String), ColumnUsage>,
    join_edges: DashMap<(String, String, String, String), u64>,
    select_sets: DashMap<(String, Vec<String>), u64>,
    existing_indexes: DashMap<String, Vec<IndexDef>>,
}

impl IndexAdvisor {
    pub fn new(min_freq: u64) -> Self {
        Self {
            min_freq,
            column_usage: DashMap::new(),
            join_edges: DashMap::new(),
            select_sets: DashMap::new(),
            existing_indexes: DashMap::new(),
        }
    }

    pub fn register_existing_indexes(&self, table: impl Into<String>, indexes: Vec<IndexDef>) {
        self.existing_indexes.insert(table.into(), indexes);
    }

    /// Feed one observed query into the usage counters. Cheap enough to
    /// call from the monitor's collection tick or a batch log reader.
    pub fn observe(&self, query: &str) {
        let Some(table) = extract_table(query) else { return };

        for col in extract_where_columns(query) {
            self.column_usage.entry((table.clone(), col)).or_default().where_count += 1;
        }
        for col in extract_order_columns(query) {
            self.column_usage.entry((table.clone(), col)).or_default().order_count += 1;
        }
        for edge in extract_join_edges(query) {
            *self.join_edges.entry(edge).or_insert(0) += 1;
        }
        if let Some(cols) = extract_select_columns(query) {
            *self.select_sets.entry((table, cols)).or_insert(0) += 1;
        }
    }

    fn frequency_of(&self, table: &str, column: &str) -> u64 {
        self.column_usage
            .get(&(table.to_string(), column.to_string()))
            .map(|u| u.where_count + u.order_count)
            .unwrap_or(0)
    }

    fn is_prefix_of_existing(&self, table: &str, column: &str) -> bool {
        self.existing_indexes
            .get(table)
            .map(|indexes| indexes.iter().any(|i| i.columns.first().map(|c| c.eq_ignore_ascii_case(column)).unwrap_or(false)))
            .unwrap_or(false)
    }

    fn missing_single_column(&self) -> Vec<IndexRecommendation> {
        self.column_usage
            .iter()
            .filter_map(|entry| {
                let (table, column) = entry.key().clone();
                let freq = entry.value().where_count + entry.value().order_count;
                if freq < self.min_freq || self.is_prefix_of_existing(&table, &column) {
                    return None;
                }
                let benefit = (freq as f64 * 2.0).min(60.0);
                let cost = 5.0;
                let score = freq as f64 * benefit / cost.max(1.0);
                Some(IndexRecommendation {
                    kind: RecommendationKind::MissingIndex,
                    table: table.clone(),
                    columns: vec![column.clone()],
                    estimated_benefit_pct: benefit,
                    estimated_storage_cost_mb: cost,
                    rationale: format!("'{column}' appears in {freq} observed WHERE/ORDER BY clauses on '{table}' with no covering index"),
                    ddl: format!("CREATE INDEX idx_{table}_{column} ON {table} ({column});"),
                    priority: priority_from_score(score),
                })
            })
            .collect()
    }

    fn composite_candidates(&self) -> Vec<IndexRecommendation> {
        self.join_edges
            .iter()
            .filter(|e| *e.value() >= self.min_freq)
            .filter_map(|entry| {
                let (table_a, col_a, table_b, col_b) = entry.key().clone();
                let freq = *entry.value();
                // Pair the join column with the hottest WHERE-filtered
                // column on the same table, if one exists.
                let filter_col = self
                    .column_usage
                    .iter()
                    .filter(|u| u.key().0 == table_a && u.key().1 != col_a && u.value().where_count > 0)
                    .max_by_key(|u| u.value().where_count)
                    .map(|u| u.key().1.clone());

                let Some(filter_col) = filter_col else { return None };
                let benefit = (freq as f64 * 3.0).min(70.0);
                let cost = 8.0;
                let score = freq as f64 * benefit / cost.max(1.0);
                Some(IndexRecommendation {
                    kind: RecommendationKind::CompositeIndex,
                    table: table_a.clone(),
                    columns: vec![col_a.clone(), filter_col.clone()],
                    estimated_benefit_pct: benefit,
                    estimated_storage_cost_mb: cost,
                    rationale: format!(
                        "'{table_a}.{col_a}' joins to '{table_b}.{col_b}' in {freq} queries and is frequently filtered alongside '{filter_col}'"
                    ),
                    ddl: format!("CREATE INDEX idx_{table_a}_{col_a}_{filter_col} ON {table_a} ({col_a}, {filter_col});"),
                    priority: priority_from_score(score),
                })
            })
            .collect()
    }

    fn covering_candidates(&self) -> Vec<IndexRecommendation> {
        self.select_sets
            .iter()
            .filter(|e| *e.value() >= self.min_freq)
            .filter_map(|entry| {
                let (table, columns) = entry.key().clone();
                let freq = *entry.value();
                let existing = self.existing_indexes.get(&table);
                let already_covers = existing
                    .as_ref()
                    .map(|indexes| indexes.iter().any(|i| columns.iter().all(|c| i.columns.iter().any(|ic| ic.eq_ignore_ascii_case(c)))))
                    .unwrap_or(false);
                if already_covers || columns.len() < 2 {
                    return None;
                }
                let benefit = (freq as f64 * 2.5).min(50.0);
                let cost = columns.len() as f64 * 3.0;
                let score = freq as f64 * benefit / cost.max(1.0);
                Some(IndexRecommendation {
                    kind: RecommendationKind::CoveringIndex,
                    table: table.clone(),
                    columns: columns.clone(),
                    estimated_benefit_pct: benefit,
                    estimated_storage_cost_mb: cost,
                    rationale: format!("{freq} queries repeatedly select exactly {:?} on '{table}' without a covering index", columns),
                    ddl: format!("CREATE INDEX idx_{table}_covering ON {table} ({});", columns.join(", ")),
                    priority: priority_from_score(score),
                })
            })
            .collect()
    }

    fn redundant_indexes(&self) -> Vec<IndexRecommendation> {
        let mut out = Vec::new();
        for entry in self.existing_indexes.iter() {
            let table = entry.key().clone();
            let indexes = entry.value();
            for a in indexes {
                for b in indexes {
                    if a.name == b.name || a.columns.len() >= b.columns.len() {
                        continue;
                    }
                    let is_prefix = a.columns.iter().zip(b.columns.iter()).all(|(x, y)| x.eq_ignore_ascii_case(y));
                    if is_prefix {
                        out.push(IndexRecommendation {
                            kind: RecommendationKind::RedundantIndex,
                            table: table.clone(),
                            columns: a.columns.clone(),
                            estimated_benefit_pct: 0.0,
                            estimated_storage_cost_mb: -(a.columns.len() as f64 * 2.0),
                            rationale: format!("index '{}' is a column prefix of '{}' on '{}' and adds no selectivity", a.name, b.name, table),
                            ddl: format!("DROP INDEX {};", a.name),
                            priority: Priority::Medium,
                        });
                    }
                }
            }
        }
        out
    }

    fn unused_indexes(&self) -> Vec<IndexRecommendation> {
        let mut out = Vec::new();
        for entry in self.existing_indexes.iter() {
            let table = entry.key().clone();
            for idx in entry.value() {
                let used = idx.columns.iter().any(|c| self.frequency_of(&table, c) > 0);
                if !used {
                    out.push(IndexRecommendation {
                        kind: RecommendationKind::UnusedIndex,
                        table: table.clone(),
                        columns: idx.columns.clone(),
                        estimated_benefit_pct: 0.0,
                        estimated_storage_cost_mb: -(idx.columns.len() as f64 * 2.0),
                        rationale: format!("index '{}' on '{}' matches none of the recently observed column usage", idx.name, table),
                        ddl: format!("DROP INDEX {};", idx.name),
                        priority: Priority::Low,
                    });
                }
            }
        }
        out
    }

    /// All recommendations, highest priority first.
    pub fn recommend(&self) -> Vec<IndexRecommendation> {
        let mut all = Vec::new();
        all.extend(self.missing_single_column());
        all.extend(self.composite_candidates());
        all.extend(self.covering_candidates());
        all.extend(self.redundant_indexes());
        all.extend(self.unused_indexes());
        all.sort_by(|a, b| b.priority.cmp(&a.priority));
        all
    }
}

pub type SchemaCatalog = HashMap<String, Vec<String>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recurring_where_column_yields_missing_index_recommendation() {
        let advisor = IndexAdvisor::new(3);
        for _ in 0..5 {
            advisor.observe("SELECT id FROM orders WHERE customer_id = ?");
        }
        let recs = advisor.recommend();
        let r = recs.iter().find(|r| r.kind == RecommendationKind::MissingIndex).unwrap();
        assert_eq!(r.table, "orders");
        assert_eq!(r.columns, vec!["customer_id".to_string()]);
        assert!(r.ddl.contains("CREATE INDEX"));
    }

    #[test]
    fn existing_prefix_index_suppresses_missing_recommendation() {
        let advisor = IndexAdvisor::new(1);
        advisor.register_existing_indexes(
            "orders",
            vec![IndexDef { name: "idx_customer".into(), columns: vec!["customer_id".into()], unique: false }],
        );
        advisor.observe("SELECT id FROM orders WHERE customer_id = ?");
        let recs = advisor.recommend();
        assert!(!recs.iter().any(|r| r.kind == RecommendationKind::MissingIndex));
    }

    #[test]
    fn join_plus_filter_produces_composite_recommendation() {
        let advisor = IndexAdvisor::new(2);
        for _ in 0..3 {
            advisor.observe("SELECT * FROM orders o JOIN customers c ON o.customer_id = c.id WHERE o.status = ?");
        }
        let recs = advisor.recommend();
        assert!(recs.iter().any(|r| r.kind == RecommendationKind::CompositeIndex && r.table == "orders"));
    }

    #[test]
    fn repeated_narrow_select_yields_covering_recommendation() {
        let advisor = IndexAdvisor::new(2);
        for _ in 0..4 {
            advisor.observe("SELECT id, status FROM orders WHERE region = ?");
        }
        let recs = advisor.recommend();
        assert!(recs.iter().any(|r| r.kind == RecommendationKind::CoveringIndex));
    }

    #[test]
    fn prefix_index_is_flagged_redundant() {
        let advisor = IndexAdvisor::new(1);
        advisor.register_existing_indexes(
            "orders",
            vec![
                IndexDef { name: "idx_a".into(), columns: vec!["customer_id".into()], unique: false },
                IndexDef { name: "idx_b".into(), columns: vec!["customer_id".into(), "status".into()], unique: false },
            ],
        );
        let recs = advisor.recommend();
        assert!(recs.iter().any(|r| r.kind == RecommendationKind::RedundantIndex && r.columns == vec!["customer_id".to_string()]));
    }

    #[test]
    fn index_with_no_observed_usage_is_flagged_unused() {
        let advisor = IndexAdvisor::new(1);
        advisor.register_existing_indexes(
            "orders",
            vec![IndexDef { name: "idx_stale".into(), columns: vec!["legacy_col".into()], unique: false }],
        );
        let recs = advisor.recommend();
        assert!(recs.iter().any(|r| r.kind == RecommendationKind::UnusedIndex));
    }

    #[test]
    fn select_star_is_not_counted_toward_covering_index() {
        let advisor = IndexAdvisor::new(1);
        advisor.observe("SELECT * FROM orders WHERE id = ?");
        assert!(advisor.select_sets.is_empty());
    }
}
