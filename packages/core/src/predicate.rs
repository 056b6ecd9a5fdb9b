//! Value predicates evaluated by the predicate scanner.
//!
//! Any `Fn(&V) -> bool` closure is a predicate. [`FieldEquals`] covers the
//! common "field at this path equals this value" case for any serializable
//! value without writing a closure per value type.

use serde::Serialize;
use serde_json::Value as JsonValue;

/// Matching function over cached values.
pub trait ValuePredicate<V: ?Sized>: Send + Sync {
    /// Returns `true` if `value` satisfies the predicate.
    fn matches(&self, value: &V) -> bool;
}

impl<V: ?Sized, F> ValuePredicate<V> for F
where
    F: Fn(&V) -> bool + Send + Sync,
{
    fn matches(&self, value: &V) -> bool {
        self(value)
    }
}

/// Matches values whose field at a dotted path equals an expected JSON value.
///
/// The value is inspected through its serialized form, so it works for any
/// `Serialize` type. An empty path compares the whole value. Values that fail
/// to serialize, or that lack the path, never match.
#[derive(Debug, Clone)]
pub struct FieldEquals {
    path: Vec<String>,
    expected: JsonValue,
    ignore_case: bool,
}

impl FieldEquals {
    /// Creates a predicate for `path` (dot-separated, e.g. `"address.city"`).
    #[must_use]
    pub fn new(path: &str, expected: impl Into<JsonValue>) -> Self {
        let path = path
            .split('.')
            .filter(|segment| !segment.is_empty())
            .map(str::to_owned)
            .collect();
        Self {
            path,
            expected: expected.into(),
            ignore_case: false,
        }
    }

    /// Compares string fields case-insensitively.
    #[must_use]
    pub fn ignore_case(mut self) -> Self {
        self.ignore_case = true;
        self
    }

    /// Evaluates the predicate against an already-serialized value.
    #[must_use]
    pub fn matches_json(&self, value: &JsonValue) -> bool {
        let mut current = value;
        for segment in &self.path {
            current = match current {
                JsonValue::Object(fields) => match fields.get(segment) {
                    Some(field) => field,
                    None => return false,
                },
                JsonValue::Array(items) => match segment.parse::<usize>().ok().and_then(|i| items.get(i)) {
                    Some(item) => item,
                    None => return false,
                },
                _ => return false,
            };
        }

        match (current, &self.expected) {
            (JsonValue::String(actual), JsonValue::String(expected)) if self.ignore_case => {
                actual.to_lowercase() == expected.to_lowercase()
            }
            (actual, expected) => actual == expected,
        }
    }
}

impl<V: Serialize + ?Sized> ValuePredicate<V> for FieldEquals {
    fn matches(&self, value: &V) -> bool {
        serde_json::to_value(value).is_ok_and(|json| self.matches_json(&json))
    }
}

#[cfg(test)]
mod tests {
    use serde::Serialize;

    use super::*;

    #[derive(Serialize)]
    struct Address {
        city: String,
    }

    #[derive(Serialize)]
    struct User {
        first: String,
        age: u32,
        address: Address,
        tags: Vec<String>,
    }

    fn user(first: &str) -> User {
        User {
            first: first.to_string(),
            age: 31,
            address: Address {
                city: "Porto".to_string(),
            },
            tags: vec!["admin".to_string()],
        }
    }

    #[test]
    fn closures_are_predicates() {
        let predicate = |u: &User| u.first == "Ana";
        assert!(predicate.matches(&user("Ana")));
        assert!(!predicate.matches(&user("Bo")));
    }

    #[test]
    fn field_equals_top_level_and_nested() {
        assert!(FieldEquals::new("first", "Ana").matches(&user("Ana")));
        assert!(FieldEquals::new("age", 31).matches(&user("Ana")));
        assert!(FieldEquals::new("address.city", "Porto").matches(&user("Ana")));
        assert!(FieldEquals::new("tags.0", "admin").matches(&user("Ana")));
        assert!(!FieldEquals::new("address.zip", "4000").matches(&user("Ana")));
        assert!(!FieldEquals::new("tags.3", "admin").matches(&user("Ana")));
    }

    #[test]
    fn case_sensitivity_is_opt_in() {
        assert!(!FieldEquals::new("first", "ana").matches(&user("Ana")));
        assert!(FieldEquals::new("first", "ana").ignore_case().matches(&user("Ana")));
        assert!(FieldEquals::new("first", "FLÁVIO").ignore_case().matches(&user("Flávio")));
    }

    #[test]
    fn empty_path_compares_whole_value() {
        let predicate = FieldEquals::new("", "event data 1").ignore_case();
        assert!(predicate.matches(&"Event Data 1".to_string()));
        assert!(!predicate.matches(&"Event Data 2".to_string()));
    }
}
