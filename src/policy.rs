use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::store::Store;
use crate::types::RoleValue;

/// Allow rule for one `(path, method)` pair.
///
/// Path patterns are matched segment by segment:
/// - a literal segment matches itself,
/// - `:name` (or a `*` that is not last) matches exactly one non-empty segment,
/// - a trailing `*` matches the rest of the path, including further slashes.
///
/// So `/api/admin/*` governs `/api/admin/role/list` but not `/api/admin`.
/// Methods are compared exactly and must be upper-case tokens such as `GET`.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RuleFields")]
pub struct Rule {
    path: String,
    method: String,
}

#[derive(Deserialize)]
struct RuleFields {
    path: String,
    method: String,
}

impl TryFrom<RuleFields> for Rule {
    type Error = Error;

    fn try_from(fields: RuleFields) -> Result<Self> {
        Self::new(fields.path, fields.method)
    }
}

impl Rule {
    /// Creates a validated rule.
    pub fn new(path: impl AsRef<str>, method: impl AsRef<str>) -> Result<Self> {
        let path = path.as_ref().trim();
        let method = method.as_ref().trim();
        if !path.starts_with('/') {
            return Err(Error::InvalidRule(format!("path {path:?} must start with '/'")));
        }
        if path.chars().any(char::is_whitespace) {
            return Err(Error::InvalidRule(format!("path {path:?} contains whitespace")));
        }
        if method.is_empty() || !method.chars().all(|ch| ch.is_ascii_uppercase()) {
            return Err(Error::InvalidRule(format!(
                "method {method:?} must be an upper-case token"
            )));
        }
        Ok(Self {
            path: path.to_string(),
            method: method.to_string(),
        })
    }

    /// Returns the path pattern.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the HTTP method.
    pub fn method(&self) -> &str {
        &self.method
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    One,
    Rest,
}

#[derive(Debug, Clone)]
struct PathPattern {
    segments: Vec<Segment>,
}

impl PathPattern {
    fn compile(pattern: &str) -> Self {
        let parts: Vec<&str> = split_path(pattern).collect();
        let last = parts.len().saturating_sub(1);
        let segments = parts
            .iter()
            .enumerate()
            .map(|(idx, part)| match *part {
                "*" if idx == last => Segment::Rest,
                "*" => Segment::One,
                part if part.len() > 1 && part.starts_with(':') => Segment::One,
                part => Segment::Literal(part.to_string()),
            })
            .collect();
        Self { segments }
    }

    fn matches(&self, path: &str) -> bool {
        let mut request = split_path(path);
        for segment in &self.segments {
            let Some(part) = request.next() else {
                return false;
            };
            match segment {
                Segment::Rest => return true,
                Segment::One if part.is_empty() => return false,
                Segment::One => {}
                Segment::Literal(literal) if literal != part => return false,
                Segment::Literal(_) => {}
            }
        }
        request.next().is_none()
    }
}

fn split_path(path: &str) -> std::str::Split<'_, char> {
    path.strip_prefix('/').unwrap_or(path).split('/')
}

#[derive(Debug, Clone)]
struct CompiledRule {
    rule: Rule,
    pattern: PathPattern,
}

/// Immutable rule set of one role. Replaced wholesale, never edited in place.
#[derive(Debug, Default)]
struct RuleSet {
    rules: Vec<CompiledRule>,
}

impl RuleSet {
    fn compile(rules: &[Rule]) -> Self {
        let rules = rules
            .iter()
            .map(|rule| CompiledRule {
                pattern: PathPattern::compile(&rule.path),
                rule: rule.clone(),
            })
            .collect();
        Self { rules }
    }

    fn allows(&self, path: &str, method: &str) -> bool {
        self.rules
            .iter()
            .any(|compiled| compiled.rule.method == method && compiled.pattern.matches(path))
    }

    fn rules(&self) -> Vec<Rule> {
        self.rules.iter().map(|compiled| compiled.rule.clone()).collect()
    }
}

/// In-memory `(role, path, method)` policy backed by a [`Store`].
///
/// Each role's rules live in their own immutable set behind an `Arc`.
/// [`PolicyEngine::evaluate`] clones that `Arc` under a short read lock and
/// matches without holding any lock, so a concurrent
/// [`PolicyEngine::replace_rules`] is observed either fully or not at all.
pub struct PolicyEngine<S> {
    store: Arc<S>,
    sets: RwLock<HashMap<RoleValue, Arc<RuleSet>>>,
    writer: tokio::sync::Mutex<()>,
}

impl<S> fmt::Debug for PolicyEngine<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyEngine")
            .field("roles", &self.sets.read().len())
            .finish()
    }
}

impl<S> PolicyEngine<S>
where
    S: Store,
{
    /// Creates an engine with no rules.
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            sets: RwLock::new(HashMap::new()),
            writer: tokio::sync::Mutex::new(()),
        }
    }

    /// Creates an engine holding every role's stored rules.
    pub async fn load(store: Arc<S>) -> Result<Self> {
        let engine = Self::new(store);
        let roles = engine.store.list_roles().await?;
        let mut sets = HashMap::with_capacity(roles.len());
        for role in roles {
            let rules = engine
                .store
                .query_policy_rules_for_subject(&role.value)
                .await?;
            tracing::debug!(role = %role.value, rules = rules.len(), "loaded policy rules");
            sets.insert(role.value, Arc::new(RuleSet::compile(&rules)));
        }
        *engine.sets.write() = sets;
        Ok(engine)
    }

    /// Returns whether any rule of `role` admits `method` on `path`.
    pub fn evaluate(&self, role: &RoleValue, path: &str, method: &str) -> bool {
        let set = self.sets.read().get(role).cloned();
        set.is_some_and(|set| set.allows(path, method))
    }

    /// Atomically replaces every rule of `role`.
    ///
    /// The store is written first; the in-memory set is swapped only once the
    /// write has committed. If the write fails the role is left with no rules
    /// and [`Error::PolicyReplaceFailed`] is returned.
    pub async fn replace_rules(&self, role: &RoleValue, rules: Vec<Rule>) -> Result<()> {
        let _writer = self.writer.lock().await;
        let compiled = RuleSet::compile(&rules);

        match self
            .store
            .replace_policy_rules_for_subject(role, &rules)
            .await
        {
            Ok(()) => {
                self.sets.write().insert(role.clone(), Arc::new(compiled));
                tracing::info!(role = %role, rules = rules.len(), "policy rules replaced");
                Ok(())
            }
            Err(source) => {
                self.sets.write().insert(role.clone(), Arc::new(RuleSet::default()));
                tracing::error!(
                    role = %role,
                    error = %source,
                    "policy replace failed, role now has no rules"
                );
                Err(Error::PolicyReplaceFailed {
                    role: role.clone(),
                    source,
                })
            }
        }
    }

    /// Returns the rules currently enforced for `role`.
    pub fn rules_for(&self, role: &RoleValue) -> Vec<Rule> {
        self.sets
            .read()
            .get(role)
            .map(|set| set.rules())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(value: &str) -> PathPattern {
        PathPattern::compile(value)
    }

    #[test]
    fn rule_should_reject_lower_case_method() {
        let result = Rule::new("/api/admin/role", "get");
        assert!(matches!(result, Err(Error::InvalidRule(_))));
    }

    #[test]
    fn rule_should_reject_relative_path() {
        let result = Rule::new("api/admin/role", "GET");
        assert!(matches!(result, Err(Error::InvalidRule(_))));
    }

    #[test]
    fn literal_pattern_should_match_exact_path_only() {
        let p = pattern("/api/admin/role/list");
        assert!(p.matches("/api/admin/role/list"));
        assert!(!p.matches("/api/admin/role/list/1"));
        assert!(!p.matches("/api/admin/role"));
    }

    #[test]
    fn trailing_wildcard_should_match_subtree() {
        let p = pattern("/api/admin/*");
        assert!(p.matches("/api/admin/role/list"));
        assert!(p.matches("/api/admin/user"));
        assert!(p.matches("/api/admin/"));
        assert!(!p.matches("/api/admin"));
        assert!(!p.matches("/api/other/role"));
    }

    #[test]
    fn param_segment_should_match_one_segment() {
        let p = pattern("/api/admin/role/:id");
        assert!(p.matches("/api/admin/role/7"));
        assert!(!p.matches("/api/admin/role/"));
        assert!(!p.matches("/api/admin/role/7/menus"));
    }

    #[test]
    fn inner_wildcard_should_match_one_segment() {
        let p = pattern("/api/*/list");
        assert!(p.matches("/api/role/list"));
        assert!(!p.matches("/api/role/x/list"));
    }

    #[test]
    fn rule_set_should_require_exact_method() {
        let set = RuleSet::compile(&[Rule::new("/api/admin/*", "GET").unwrap()]);
        assert!(set.allows("/api/admin/role/list", "GET"));
        assert!(!set.allows("/api/admin/role/list", "POST"));
        assert!(!set.allows("/api/admin/role/list", "get"));
    }

    #[test]
    fn rule_deserialization_should_validate() {
        let rule: Rule =
            serde_json::from_str(r#"{"path":"/api/admin/*","method":"DELETE"}"#).unwrap();
        assert_eq!(rule, Rule::new("/api/admin/*", "DELETE").unwrap());
        assert!(serde_json::from_str::<Rule>(r#"{"path":"api","method":"GET"}"#).is_err());
        assert!(serde_json::from_str::<Rule>(r#"{"path":"/api","method":"get"}"#).is_err());
    }
}
