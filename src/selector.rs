use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::LazyLock;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};
use regex::Regex;
use thiserror::Error;

const MAX_LABEL_NAME_LEN: usize = 63;
const MAX_LABEL_PREFIX_LEN: usize = 253;

static LABEL_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9]([-A-Za-z0-9_.]*[A-Za-z0-9])?$").expect("label name pattern")
});

static DNS_SUBDOMAIN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$")
        .expect("dns subdomain pattern")
});

#[derive(Debug, Error)]
pub enum SelectorError {
    #[error("failed to parse pod selector: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid label key '{key}': {reason}")]
    InvalidKey { key: String, reason: &'static str },
    #[error("invalid value '{value}' for label '{key}': {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: &'static str,
    },
    #[error("'{operator}' is not a valid label selector operator (key '{key}')")]
    UnknownOperator { key: String, operator: String },
    #[error("operator '{operator}' on key '{key}' requires at least one value")]
    MissingValues { key: String, operator: &'static str },
    #[error("operator '{operator}' on key '{key}' does not accept values")]
    UnexpectedValues { key: String, operator: &'static str },
    #[error("requirements on label '{key}' cannot be satisfied together")]
    Unsatisfiable { key: String },
}

/// A single compiled requirement of a label selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requirement {
    Equals { key: String, value: String },
    In { key: String, values: BTreeSet<String> },
    NotIn { key: String, values: BTreeSet<String> },
    Exists { key: String },
    DoesNotExist { key: String },
}

impl Requirement {
    pub fn key(&self) -> &str {
        match self {
            Requirement::Equals { key, .. }
            | Requirement::In { key, .. }
            | Requirement::NotIn { key, .. }
            | Requirement::Exists { key }
            | Requirement::DoesNotExist { key } => key,
        }
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self {
            Requirement::Equals { key, value } => labels.get(key) == Some(value),
            Requirement::In { key, values } => labels.get(key).is_some_and(|v| values.contains(v)),
            Requirement::NotIn { key, values } => {
                labels.get(key).is_none_or(|v| !values.contains(v))
            }
            Requirement::Exists { key } => labels.contains_key(key),
            Requirement::DoesNotExist { key } => !labels.contains_key(key),
        }
    }

    fn from_expression(expr: &LabelSelectorRequirement) -> Result<Self, SelectorError> {
        let key = expr.key.clone();
        validate_key(&key)?;
        let values = expr.values.as_deref().unwrap_or_default();

        let requirement = match expr.operator.as_str() {
            "In" => Requirement::In {
                values: value_set(&key, "In", values)?,
                key,
            },
            "NotIn" => Requirement::NotIn {
                values: value_set(&key, "NotIn", values)?,
                key,
            },
            "Exists" => {
                no_values(&key, "Exists", values)?;
                Requirement::Exists { key }
            }
            "DoesNotExist" => {
                no_values(&key, "DoesNotExist", values)?;
                Requirement::DoesNotExist { key }
            }
            other => {
                return Err(SelectorError::UnknownOperator {
                    key,
                    operator: other.to_string(),
                });
            }
        };
        Ok(requirement)
    }
}

fn value_set(
    key: &str,
    operator: &'static str,
    values: &[String],
) -> Result<BTreeSet<String>, SelectorError> {
    if values.is_empty() {
        return Err(SelectorError::MissingValues {
            key: key.to_string(),
            operator,
        });
    }
    for value in values {
        validate_value(key, value)?;
    }
    Ok(values.iter().cloned().collect())
}

fn no_values(key: &str, operator: &'static str, values: &[String]) -> Result<(), SelectorError> {
    if values.is_empty() {
        Ok(())
    } else {
        Err(SelectorError::UnexpectedValues {
            key: key.to_string(),
            operator,
        })
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Requirement::Equals { key, value } => write!(f, "{key}={value}"),
            Requirement::In { key, values } => write!(f, "{key} in ({})", join(values)),
            Requirement::NotIn { key, values } => write!(f, "{key} notin ({})", join(values)),
            Requirement::Exists { key } => f.write_str(key),
            Requirement::DoesNotExist { key } => write!(f, "!{key}"),
        }
    }
}

fn join(values: &BTreeSet<String>) -> String {
    values.iter().map(String::as_str).collect::<Vec<_>>().join(",")
}

/// Compiled pod label selector. Immutable once built and safe to share
/// across concurrent requests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodSelector {
    requirements: Vec<Requirement>,
}

impl PodSelector {
    /// Parses a JSON-encoded `metav1.LabelSelector`.
    pub fn parse(raw: &str) -> Result<Self, SelectorError> {
        let selector: LabelSelector = serde_json::from_str(raw)?;
        Self::compile(&selector)
    }

    pub fn compile(selector: &LabelSelector) -> Result<Self, SelectorError> {
        let mut requirements = Vec::new();

        for (key, value) in selector.match_labels.iter().flatten() {
            validate_key(key)?;
            validate_value(key, value)?;
            requirements.push(Requirement::Equals {
                key: key.clone(),
                value: value.clone(),
            });
        }

        for expr in selector.match_expressions.iter().flatten() {
            requirements.push(Requirement::from_expression(expr)?);
        }

        requirements.sort_by(|a, b| a.key().cmp(b.key()));
        check_satisfiable(&requirements)?;

        Ok(Self { requirements })
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|r| r.matches(labels))
    }

    pub fn selects_all(&self) -> bool {
        self.requirements.is_empty()
    }
}

impl fmt::Display for PodSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, requirement) in self.requirements.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{requirement}")?;
        }
        Ok(())
    }
}

fn validate_key(key: &str) -> Result<(), SelectorError> {
    let invalid = |reason| SelectorError::InvalidKey {
        key: key.to_string(),
        reason,
    };

    let name = match key.split_once('/') {
        Some((prefix, name)) => {
            if prefix.is_empty() {
                return Err(invalid("prefix part must be non-empty"));
            }
            if prefix.len() > MAX_LABEL_PREFIX_LEN {
                return Err(invalid("prefix part must be no more than 253 characters"));
            }
            if !DNS_SUBDOMAIN.is_match(prefix) {
                return Err(invalid("prefix part must be a lowercase DNS-1123 subdomain"));
            }
            name
        }
        None => key,
    };

    if name.is_empty() {
        return Err(invalid("name part must be non-empty"));
    }
    if name.len() > MAX_LABEL_NAME_LEN {
        return Err(invalid("name part must be no more than 63 characters"));
    }
    if !LABEL_NAME.is_match(name) {
        return Err(invalid(
            "name part must consist of alphanumeric characters, '-', '_' or '.', \
             and must start and end with an alphanumeric character",
        ));
    }
    Ok(())
}

fn validate_value(key: &str, value: &str) -> Result<(), SelectorError> {
    if value.is_empty() {
        return Ok(());
    }
    let reason = if value.len() > MAX_LABEL_NAME_LEN {
        Some("must be no more than 63 characters")
    } else if !LABEL_NAME.is_match(value) {
        Some(
            "must consist of alphanumeric characters, '-', '_' or '.', \
             and must start and end with an alphanumeric character",
        )
    } else {
        None
    };

    match reason {
        Some(reason) => Err(SelectorError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

/// Rejects selectors where the requirements on one key rule out every
/// possible label value.
fn check_satisfiable(requirements: &[Requirement]) -> Result<(), SelectorError> {
    let mut by_key: BTreeMap<&str, Vec<&Requirement>> = BTreeMap::new();
    for requirement in requirements {
        by_key.entry(requirement.key()).or_default().push(requirement);
    }

    for (key, reqs) in by_key {
        let mut must_exist = false;
        let mut must_not_exist = false;
        let mut allowed: Option<BTreeSet<&str>> = None;
        let mut excluded: BTreeSet<&str> = BTreeSet::new();

        for requirement in reqs {
            match requirement {
                Requirement::Equals { value, .. } => {
                    must_exist = true;
                    narrow(&mut allowed, [value.as_str()].into_iter().collect());
                }
                Requirement::In { values, .. } => {
                    must_exist = true;
                    narrow(&mut allowed, values.iter().map(String::as_str).collect());
                }
                Requirement::NotIn { values, .. } => {
                    excluded.extend(values.iter().map(String::as_str));
                }
                Requirement::Exists { .. } => must_exist = true,
                Requirement::DoesNotExist { .. } => must_not_exist = true,
            }
        }

        let no_value_left = allowed
            .as_ref()
            .is_some_and(|allowed| allowed.iter().all(|v| excluded.contains(v)));

        if (must_exist && must_not_exist) || no_value_left {
            return Err(SelectorError::Unsatisfiable {
                key: key.to_string(),
            });
        }
    }

    Ok(())
}

fn narrow<'a>(allowed: &mut Option<BTreeSet<&'a str>>, values: BTreeSet<&'a str>) {
    *allowed = Some(match allowed.take() {
        Some(previous) => previous.intersection(&values).copied().collect(),
        None => values,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_empty_selector_matches_everything() {
        let selector = PodSelector::parse("{}").unwrap();
        assert!(selector.selects_all());
        assert!(selector.matches(&labels(&[])));
        assert!(selector.matches(&labels(&[("app", "nginx")])));
    }

    #[test]
    fn test_match_labels() {
        let selector = PodSelector::parse(r#"{"matchLabels":{"app":"nginx"}}"#).unwrap();
        assert!(selector.matches(&labels(&[("app", "nginx"), ("tier", "web")])));
        assert!(!selector.matches(&labels(&[("app", "mysql")])));
        assert!(!selector.matches(&labels(&[])));
    }

    #[test]
    fn test_match_expressions() {
        let selector = PodSelector::parse(
            r#"{"matchExpressions":[
                {"key":"tier","operator":"In","values":["web","cache"]},
                {"key":"env","operator":"NotIn","values":["dev"]},
                {"key":"team","operator":"Exists"},
                {"key":"legacy","operator":"DoesNotExist"}
            ]}"#,
        )
        .unwrap();

        assert!(selector.matches(&labels(&[("tier", "web"), ("team", "a")])));
        assert!(selector.matches(&labels(&[("tier", "cache"), ("env", "prod"), ("team", "a")])));
        assert!(!selector.matches(&labels(&[("tier", "db"), ("team", "a")])));
        assert!(!selector.matches(&labels(&[("tier", "web"), ("env", "dev"), ("team", "a")])));
        assert!(!selector.matches(&labels(&[("tier", "web")])));
        assert!(!selector.matches(&labels(&[("tier", "web"), ("team", "a"), ("legacy", "")])));
    }

    #[test]
    fn test_missing_key_never_matches_in() {
        let selector =
            PodSelector::parse(r#"{"matchExpressions":[{"key":"app","operator":"In","values":["x"]}]}"#)
                .unwrap();
        assert!(!selector.matches(&labels(&[("other", "x")])));
    }

    #[test]
    fn test_display() {
        let selector = PodSelector::parse(
            r#"{"matchLabels":{"app":"nginx"},"matchExpressions":[
                {"key":"tier","operator":"In","values":["web","cache"]},
                {"key":"legacy","operator":"DoesNotExist"}
            ]}"#,
        )
        .unwrap();
        assert_eq!(selector.to_string(), "app=nginx,!legacy,tier in (cache,web)");
    }

    #[test]
    fn test_invalid_json() {
        assert!(matches!(
            PodSelector::parse("not json"),
            Err(SelectorError::Parse(_))
        ));
        assert!(matches!(
            PodSelector::parse(r#"{"matchLabels":["app"]}"#),
            Err(SelectorError::Parse(_))
        ));
    }

    #[test]
    fn test_unknown_operator() {
        let err = PodSelector::parse(
            r#"{"matchExpressions":[{"key":"app","operator":"Like","values":["x"]}]}"#,
        )
        .unwrap_err();
        assert!(matches!(err, SelectorError::UnknownOperator { ref operator, .. } if operator == "Like"));
    }

    #[test]
    fn test_operator_value_arity() {
        assert!(matches!(
            PodSelector::parse(r#"{"matchExpressions":[{"key":"app","operator":"In","values":[]}]}"#),
            Err(SelectorError::MissingValues { operator: "In", .. })
        ));
        assert!(matches!(
            PodSelector::parse(r#"{"matchExpressions":[{"key":"app","operator":"NotIn"}]}"#),
            Err(SelectorError::MissingValues { operator: "NotIn", .. })
        ));
        assert!(matches!(
            PodSelector::parse(
                r#"{"matchExpressions":[{"key":"app","operator":"Exists","values":["x"]}]}"#
            ),
            Err(SelectorError::UnexpectedValues { operator: "Exists", .. })
        ));
    }

    #[test]
    fn test_invalid_keys_and_values() {
        assert!(matches!(
            PodSelector::parse(r#"{"matchLabels":{"-app":"nginx"}}"#),
            Err(SelectorError::InvalidKey { .. })
        ));
        assert!(matches!(
            PodSelector::parse(r#"{"matchLabels":{"Example.COM/app":"nginx"}}"#),
            Err(SelectorError::InvalidKey { .. })
        ));
        assert!(matches!(
            PodSelector::parse(r#"{"matchLabels":{"app":"nginx!"}}"#),
            Err(SelectorError::InvalidValue { .. })
        ));
        let long = "a".repeat(64);
        assert!(matches!(
            PodSelector::parse(&format!(r#"{{"matchLabels":{{"app":"{long}"}}}}"#)),
            Err(SelectorError::InvalidValue { .. })
        ));

        assert!(PodSelector::parse(r#"{"matchLabels":{"example.com/app":""}}"#).is_ok());
    }

    #[test]
    fn test_conflicting_requirements() {
        assert!(matches!(
            PodSelector::parse(
                r#"{"matchLabels":{"app":"nginx"},
                    "matchExpressions":[{"key":"app","operator":"In","values":["mysql"]}]}"#
            ),
            Err(SelectorError::Unsatisfiable { ref key }) if key == "app"
        ));
        assert!(matches!(
            PodSelector::parse(
                r#"{"matchExpressions":[
                    {"key":"app","operator":"Exists"},
                    {"key":"app","operator":"DoesNotExist"}]}"#
            ),
            Err(SelectorError::Unsatisfiable { .. })
        ));
        assert!(matches!(
            PodSelector::parse(
                r#"{"matchExpressions":[
                    {"key":"app","operator":"In","values":["a","b"]},
                    {"key":"app","operator":"NotIn","values":["a","b"]}]}"#
            ),
            Err(SelectorError::Unsatisfiable { .. })
        ));
    }

    #[test]
    fn test_overlapping_requirements_still_compile() {
        let selector = PodSelector::parse(
            r#"{"matchLabels":{"app":"nginx"},"matchExpressions":[
                {"key":"app","operator":"In","values":["nginx","mysql"]},
                {"key":"app","operator":"NotIn","values":["mysql"]}]}"#,
        )
        .unwrap();
        assert!(selector.matches(&labels(&[("app", "nginx")])));
        assert!(!selector.matches(&labels(&[("app", "mysql")])));
    }
}
