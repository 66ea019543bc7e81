//! Index definitions.

use crate::error::{DbError, DbResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Definition of a collection index.
///
/// Paths are dotted key paths into the document body, e.g. `"address.city"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexSpec {
    /// Exact-match index over the values at `paths`.
    Value {
        /// Indexed key paths.
        paths: Vec<String>,
    },
    /// Token index over the string values at `paths`.
    FullText {
        /// Indexed key paths.
        paths: Vec<String>,
    },
}

impl IndexSpec {
    /// A value index.
    #[must_use]
    pub fn value<S: Into<String>>(paths: impl IntoIterator<Item = S>) -> Self {
        Self::Value {
            paths: paths.into_iter().map(Into::into).collect(),
        }
    }

    /// A full-text index.
    #[must_use]
    pub fn full_text<S: Into<String>>(paths: impl IntoIterator<Item = S>) -> Self {
        Self::FullText {
            paths: paths.into_iter().map(Into::into).collect(),
        }
    }

    /// The indexed paths.
    #[must_use]
    pub fn paths(&self) -> &[String] {
        match self {
            Self::Value { paths } | Self::FullText { paths } => paths,
        }
    }

    pub(crate) fn validate(&self) -> DbResult<()> {
        let paths = self.paths();
        if paths.is_empty() {
            return Err(DbError::invalid_argument("index needs at least one path"));
        }
        if paths.iter().any(|p| p.is_empty() || p.split('.').any(str::is_empty)) {
            return Err(DbError::invalid_argument("index path has an empty component"));
        }
        Ok(())
    }

    /// Table keys this index derives from `body`.
    pub(crate) fn keys_for(&self, body: &Map<String, Value>) -> Vec<String> {
        match self {
            Self::Value { paths } => {
                let values: Vec<Value> = paths
                    .iter()
                    .map(|p| resolve(body, p).cloned().unwrap_or(Value::Null))
                    .collect();
                if values.iter().all(Value::is_null) {
                    Vec::new()
                } else {
                    vec![value_key(&values)]
                }
            }
            Self::FullText { paths } => {
                let mut tokens: Vec<String> = paths
                    .iter()
                    .filter_map(|p| resolve(body, p).and_then(Value::as_str))
                    .flat_map(tokenize)
                    .collect();
                tokens.sort();
                tokens.dedup();
                tokens
            }
        }
    }

    /// Table keys a lookup for `key` must match, all of them.
    pub(crate) fn lookup_keys(&self, key: &[Value]) -> DbResult<Vec<String>> {
        match self {
            Self::Value { paths } => {
                if key.len() != paths.len() {
                    return Err(DbError::invalid_argument(format!(
                        "value index has {} paths, lookup gave {} values",
                        paths.len(),
                        key.len()
                    )));
                }
                Ok(vec![value_key(key)])
            }
            Self::FullText { .. } => match key {
                [Value::String(term)] => Ok(tokenize(term)),
                _ => Err(DbError::invalid_argument(
                    "full-text lookup takes a single string term",
                )),
            },
        }
    }
}

fn resolve<'a>(body: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = body.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

fn value_key(values: &[Value]) -> String {
    Value::Array(values.to_vec()).to_string()
}

/// Splits on whitespace and ASCII punctuation, lowercasing each token.
pub(crate) fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| c.is_whitespace() || c.is_ascii_punctuation())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn body(v: Value) -> Map<String, Value> {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn value_keys_follow_paths() {
        let spec = IndexSpec::value(["name", "address.city"]);
        let keys = spec.keys_for(&body(json!({"name": "ann", "address": {"city": "Oslo"}})));
        assert_eq!(keys, vec![r#"["ann","Oslo"]"#.to_string()]);
        assert_eq!(spec.lookup_keys(&[json!("ann"), json!("Oslo")]).unwrap(), keys);
    }

    #[test]
    fn documents_without_any_value_are_skipped() {
        let spec = IndexSpec::value(["missing"]);
        assert!(spec.keys_for(&body(json!({"other": 1}))).is_empty());
    }

    #[test]
    fn full_text_tokens() {
        assert_eq!(tokenize("Hello, World! hello"), vec!["hello", "world", "hello"]);
        let spec = IndexSpec::full_text(["text"]);
        let keys = spec.keys_for(&body(json!({"text": "Quick brown; quick fox"})));
        assert_eq!(keys, vec!["brown", "fox", "quick"]);
    }

    #[test]
    fn validation() {
        assert!(IndexSpec::value(Vec::<String>::new()).validate().is_err());
        assert!(IndexSpec::value(["a..b"]).validate().is_err());
        assert!(IndexSpec::full_text(["a.b"]).validate().is_ok());
    }

    #[test]
    fn lookup_arity_is_checked() {
        let spec = IndexSpec::value(["a", "b"]);
        assert!(spec.lookup_keys(&[json!(1)]).is_err());
        assert!(IndexSpec::full_text(["t"]).lookup_keys(&[json!(3)]).is_err());
    }
}
