//! Hybrid query description and SQL assembly.

use crate::database::expression::Resolver;
use crate::error::Result;
use serde::{Deserialize, Serialize};

/// One vector-search subquery embedded in a [`Query`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarClause {
    pub vector: Vec<f32>,
    /// Candidates to pull from the index. Defaults to the query limit.
    #[serde(default)]
    pub topn: Option<usize>,
}

/// Structured query with optional similarity clauses.
///
/// ```json
/// { "select": "id, text, score", "where": "lang = 'en'",
///   "similar": [{ "vector": [0.1, 0.2], "topn": 10 }], "limit": 5 }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Query {
    pub select: Option<String>,
    #[serde(rename = "where")]
    pub filter: Option<String>,
    pub groupby: Option<String>,
    pub having: Option<String>,
    pub orderby: Option<String>,
    pub limit: Option<usize>,
    pub similar: Vec<SimilarClause>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn select(mut self, select: impl Into<String>) -> Self {
        self.select = Some(select.into());
        self
    }

    pub fn filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn groupby(mut self, groupby: impl Into<String>) -> Self {
        self.groupby = Some(groupby.into());
        self
    }

    pub fn having(mut self, having: impl Into<String>) -> Self {
        self.having = Some(having.into());
        self
    }

    pub fn orderby(mut self, orderby: impl Into<String>) -> Self {
        self.orderby = Some(orderby.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Adds a similarity clause.
    pub fn similar(mut self, vector: Vec<f32>, topn: Option<usize>) -> Self {
        self.similar.push(SimilarClause { vector, topn });
        self
    }
}

const FROM: &str = "FROM sections s \
     LEFT JOIN documents d ON s.uid = d.uid \
     LEFT JOIN scores sc ON s.id = sc.id";

/// Compiles `query` to a single SELECT statement.
///
/// `batches` is the number of staged similarity batches; each one restricts
/// the result to its ids. `limit` applies when the query carries none (0 = no limit).
pub fn compile(query: &Query, batches: usize, limit: usize) -> Result<String> {
    let mut resolver = Resolver::default();
    let select = resolver.select(query.select.as_deref().unwrap_or("*"))?;

    let mut sql = format!("SELECT {} {}", select, FROM);

    let mut conditions: Vec<String> = (0..batches)
        .map(|batch| format!("s.id IN (SELECT id FROM batch WHERE batch = {})", batch))
        .collect();
    if let Some(filter) = non_empty(&query.filter) {
        conditions.push(format!("({})", resolver.translate(filter)?));
    }
    if !conditions.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&conditions.join(" AND "));
    }

    if let Some(groupby) = non_empty(&query.groupby) {
        sql.push_str(" GROUP BY ");
        sql.push_str(&resolver.translate(groupby)?);
    }
    if let Some(having) = non_empty(&query.having) {
        sql.push_str(" HAVING ");
        sql.push_str(&resolver.translate(having)?);
    }

    match non_empty(&query.orderby) {
        Some(orderby) => {
            sql.push_str(" ORDER BY ");
            sql.push_str(&resolver.translate(orderby)?);
        }
        None if !query.similar.is_empty() => sql.push_str(" ORDER BY score DESC"),
        None => {}
    }

    // A zero query limit defers to the caller's limit
    match query.limit.filter(|&n| n > 0) {
        Some(limit) => sql.push_str(&format!(" LIMIT {}", limit)),
        None if limit > 0 => sql.push_str(&format!(" LIMIT {}", limit)),
        None => {}
    }

    tracing::debug!("Compiled query: {}", sql);
    Ok(sql)
}

fn non_empty(fragment: &Option<String>) -> Option<&str> {
    fragment.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_select_no_similarity() {
        let sql = compile(&Query::new(), 0, 0).unwrap();
        assert_eq!(sql, format!("SELECT * {}", FROM));
    }

    #[test]
    fn test_similarity_defaults_to_score_order() {
        let query = Query::new()
            .select("id, text, score")
            .similar(vec![1.0], None);
        let sql = compile(&query, 1, 3).unwrap();
        assert!(sql.starts_with("SELECT s.id, text, score FROM"));
        assert!(sql.ends_with(
            "WHERE s.id IN (SELECT id FROM batch WHERE batch = 0) ORDER BY score DESC LIMIT 3"
        ));
    }

    #[test]
    fn test_explicit_clauses_and_limit() {
        let query = Query::new()
            .select("tags, count(*) AS n")
            .filter("lang = 'en'")
            .groupby("tags")
            .having("n > 1")
            .orderby("n DESC")
            .limit(10)
            .similar(vec![1.0], None)
            .similar(vec![0.5], Some(4));
        let sql = compile(&query, 2, 3).unwrap();
        assert!(sql.contains(
            "WHERE s.id IN (SELECT id FROM batch WHERE batch = 0) \
             AND s.id IN (SELECT id FROM batch WHERE batch = 1) \
             AND (json_extract(data, '$.lang') = 'en')"
        ));
        assert!(sql.ends_with("GROUP BY s.tags HAVING n > 1 ORDER BY n DESC LIMIT 10"));
    }

    #[test]
    fn test_zero_query_limit_uses_caller_limit() {
        let sql = compile(&Query::new().limit(0), 0, 5).unwrap();
        assert!(sql.ends_with(" LIMIT 5"));

        let sql = compile(&Query::new().limit(0), 0, 0).unwrap();
        assert!(!sql.contains("LIMIT"));
    }

    #[test]
    fn test_deserialize_where_key() {
        let query: Query = serde_json::from_value(json!({
            "where": "id > 1",
            "similar": [{"vector": [0.1, 0.2], "topn": 2}],
            "extra": true
        }))
        .unwrap();
        assert_eq!(query.filter.as_deref(), Some("id > 1"));
        assert_eq!(query.similar[0].topn, Some(2));
        assert!(query.select.is_none());
    }
}
