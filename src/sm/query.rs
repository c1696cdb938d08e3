//! # List Queries
//!
//! Field and label query expressions for list calls.
//!
//! Predicates are joined with `and`. Values are single-quoted, with embedded
//! quotes doubled:
//!
//! ```text
//! fieldQuery=name eq 'orders-db' and context/namespace eq 'shop'
//! labelQuery=_k8sname eq 'orders-db'
//! ```

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredicateOp {
    Eq,
    In,
}

/// One `key op value(s)` term
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Predicate {
    pub key: String,
    pub op: PredicateOp,
    pub values: Vec<String>,
}

impl Predicate {
    /// Evaluate against the values found for `key`
    #[must_use]
    pub fn matches(&self, actual: &[String]) -> bool {
        actual.iter().any(|v| self.values.contains(v))
    }

    fn render(&self) -> String {
        match self.op {
            PredicateOp::Eq => format!(
                "{} eq {}",
                self.key,
                quote(self.values.first().map(String::as_str).unwrap_or_default())
            ),
            PredicateOp::In => format!(
                "{} in ({})",
                self.key,
                self.values
                    .iter()
                    .map(|v| quote(v))
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        }
    }
}

fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Builder for list call filters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListQuery {
    pub fields: Vec<Predicate>,
    pub labels: Vec<Predicate>,
    /// Ask the remote system to include each item's last operation
    pub attach_last_operations: bool,
}

impl ListQuery {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn field_eq(mut self, key: &str, value: &str) -> Self {
        self.fields.push(Predicate {
            key: key.to_string(),
            op: PredicateOp::Eq,
            values: vec![value.to_string()],
        });
        self
    }

    #[must_use]
    pub fn field_in(mut self, key: &str, values: &[&str]) -> Self {
        self.fields.push(Predicate {
            key: key.to_string(),
            op: PredicateOp::In,
            values: values.iter().map(|v| (*v).to_string()).collect(),
        });
        self
    }

    #[must_use]
    pub fn label_eq(mut self, key: &str, value: &str) -> Self {
        self.labels.push(Predicate {
            key: key.to_string(),
            op: PredicateOp::Eq,
            values: vec![value.to_string()],
        });
        self
    }

    #[must_use]
    pub fn label_in(mut self, key: &str, values: &[&str]) -> Self {
        self.labels.push(Predicate {
            key: key.to_string(),
            op: PredicateOp::In,
            values: values.iter().map(|v| (*v).to_string()).collect(),
        });
        self
    }

    #[must_use]
    pub fn with_last_operations(mut self) -> Self {
        self.attach_last_operations = true;
        self
    }

    #[must_use]
    pub fn field_query(&self) -> Option<String> {
        render_all(&self.fields)
    }

    #[must_use]
    pub fn label_query(&self) -> Option<String> {
        render_all(&self.labels)
    }

    /// URL query parameters for a list request
    #[must_use]
    pub fn to_params(&self) -> Vec<(&'static str, String)> {
        let mut params = Vec::new();
        if let Some(q) = self.field_query() {
            params.push(("fieldQuery", q));
        }
        if let Some(q) = self.label_query() {
            params.push(("labelQuery", q));
        }
        if self.attach_last_operations {
            params.push(("attach_last_operations", "true".to_string()));
        }
        params
    }
}

fn render_all(predicates: &[Predicate]) -> Option<String> {
    if predicates.is_empty() {
        return None;
    }
    Some(
        predicates
            .iter()
            .map(Predicate::render)
            .collect::<Vec<_>>()
            .join(" and "),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_renders_conjunction() {
        let query = ListQuery::new()
            .field_eq("name", "orders-db")
            .field_eq("context/namespace", "shop")
            .label_eq("_k8sname", "orders-db")
            .with_last_operations();
        assert_eq!(
            query.field_query().as_deref(),
            Some("name eq 'orders-db' and context/namespace eq 'shop'")
        );
        assert_eq!(
            query.label_query().as_deref(),
            Some("_k8sname eq 'orders-db'")
        );
        assert_eq!(query.to_params().len(), 3);
    }

    #[test]
    fn test_renders_in_and_escapes_quotes() {
        let query = ListQuery::new().field_in("catalog_name", &["a", "o'b"]);
        assert_eq!(
            query.field_query().as_deref(),
            Some("catalog_name in ('a', 'o''b')")
        );
        assert_eq!(query.label_query(), None);
    }

    #[test]
    fn test_predicate_matches_any_value() {
        let query = ListQuery::new().field_in("id", &["1", "2"]);
        assert!(query.fields[0].matches(&["2".to_string()]));
        assert!(!query.fields[0].matches(&["3".to_string()]));
    }
}
