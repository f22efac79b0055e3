//! Lock identity derivation.
//!
//! A lock identity is a deterministic string key built from the host id, the
//! fully qualified job name and an optional scope suffix:
//!
//! | Scope | Identity |
//! |-------|----------|
//! | function | `<hostId>/<jobName>[.<scopeId>]` |
//! | host | `<hostId>/<scopeId>` |
//! | listener | function identity + `.Listener` |
//!
//! Scope ids may reference configuration values as `%name%`, resolved once
//! through a [`NameResolver`], and binding data as `{param}`, resolved per
//! invocation through [`ScopeTemplate::bind`].

use std::collections::HashMap;
use std::fmt;

use crate::error::{Error, Result};

/// Parameter values available when binding a scope template.
pub type BindingData = HashMap<String, String>;

/// Path prefix of lock records inside the lock container.
pub const LOCK_PATH_PREFIX: &str = "locks";

/// Suffix appended to listener-mode identities.
pub const LISTENER_SUFFIX: &str = ".Listener";

/// Resolves `%name%` configuration references.
pub trait NameResolver: Send + Sync + 'static {
    /// Returns the value for `name`, or `None` if it is not defined.
    fn resolve(&self, name: &str) -> Option<String>;
}

/// Resolves names from the process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvNameResolver;

impl NameResolver for EnvNameResolver {
    fn resolve(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

/// Resolves names from a fixed map.
#[derive(Debug, Clone, Default)]
pub struct MapNameResolver {
    values: HashMap<String, String>,
}

impl MapNameResolver {
    /// Creates a resolver over `values`.
    #[must_use]
    pub fn new(values: HashMap<String, String>) -> Self {
        Self { values }
    }

    /// Adds a value.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }
}

impl NameResolver for MapNameResolver {
    fn resolve(&self, name: &str) -> Option<String> {
        self.values.get(name).cloned()
    }
}

/// Replaces every `%name%` reference in `input`.
///
/// A lone `%` without a closing partner is kept verbatim.
///
/// # Errors
///
/// Returns a configuration error naming the first unresolved reference.
pub fn resolve_names(input: &str, resolver: &dyn NameResolver) -> Result<String> {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find('%') {
        let after = &rest[start + 1..];
        let Some(len) = after.find('%') else {
            break;
        };
        let name = &after[..len];
        if name.is_empty() {
            return Err(Error::configuration(format!(
                "empty '%%' reference in '{input}'"
            )));
        }
        let value = resolver.resolve(name).ok_or_else(|| {
            Error::configuration(format!("unable to resolve '%{name}%' in '{input}'"))
        })?;
        out.push_str(&rest[..start]);
        out.push_str(&value);
        rest = &after[len + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

/// A scope id with `{param}` placeholders bound at invocation time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeTemplate {
    source: String,
    segments: Vec<Segment>,
}

impl ScopeTemplate {
    /// Parses a scope template.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for unbalanced braces or empty
    /// parameter names.
    pub fn parse(source: &str) -> Result<Self> {
        let mut segments = Vec::new();
        let mut rest = source;

        while let Some(open) = rest.find(['{', '}']) {
            if rest[open..].starts_with('}') {
                return Err(Error::configuration(format!(
                    "unbalanced '}}' in scope '{source}'"
                )));
            }
            let after = &rest[open + 1..];
            let close = after.find('}').ok_or_else(|| {
                Error::configuration(format!("unterminated '{{' in scope '{source}'"))
            })?;
            let name = after[..close].trim();
            if name.is_empty() || name.contains('{') {
                return Err(Error::configuration(format!(
                    "invalid parameter name in scope '{source}'"
                )));
            }
            if open > 0 {
                segments.push(Segment::Literal(rest[..open].to_string()));
            }
            segments.push(Segment::Param(name.to_string()));
            rest = &after[close + 1..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }

        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    /// Returns the template text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Returns true if the template references binding data.
    #[must_use]
    pub fn has_parameters(&self) -> bool {
        self.segments
            .iter()
            .any(|segment| matches!(segment, Segment::Param(_)))
    }

    /// Returns the referenced parameter names in order.
    pub fn parameters(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|segment| match segment {
            Segment::Param(name) => Some(name.as_str()),
            Segment::Literal(_) => None,
        })
    }

    /// Binds the template against `data`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error naming the first missing parameter.
    pub fn bind(&self, data: &BindingData) -> Result<String> {
        let mut out = String::with_capacity(self.source.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Param(name) => {
                    let value = data.get(name).ok_or_else(|| {
                        Error::configuration(format!(
                            "no value for '{{{name}}}' in scope '{}'",
                            self.source
                        ))
                    })?;
                    out.push_str(value);
                }
            }
        }
        Ok(out)
    }
}

/// Deterministic key of a protected resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockIdentity(String);

impl LockIdentity {
    /// Wraps a preformatted identity.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `id` is empty.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(Error::configuration("lock identity must not be empty"));
        }
        Ok(Self(id))
    }

    /// Identity of a function-scoped lock.
    #[must_use]
    pub fn function(host_id: &str, job_name: &str, scope_id: Option<&str>) -> Self {
        match scope_id.filter(|s| !s.is_empty()) {
            Some(scope) => Self(format!("{host_id}/{job_name}.{scope}")),
            None => Self(format!("{host_id}/{job_name}")),
        }
    }

    /// Identity of a host-scoped lock; the job name is omitted so that
    /// different jobs sharing `scope_id` exclude each other.
    #[must_use]
    pub fn host(host_id: &str, scope_id: &str) -> Self {
        Self(format!("{host_id}/{scope_id}"))
    }

    /// Identity of the listener lock derived from `self`.
    #[must_use]
    pub fn listener(&self) -> Self {
        Self(format!("{}{LISTENER_SUFFIX}", self.0))
    }

    /// Returns the identity string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the storage path of the lock record.
    #[must_use]
    pub fn path(&self) -> String {
        format!("{LOCK_PATH_PREFIX}/{}", self.0)
    }
}

impl fmt::Display for LockIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for LockIdentity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(pairs: &[(&str, &str)]) -> BindingData {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn scope_template_binds_parameters() {
        let template = ScopeTemplate::parse("scope{P1}").expect("parse");
        assert!(template.has_parameters());
        assert_eq!(
            template.bind(&data(&[("P1", "Test1")])).expect("bind"),
            "scopeTest1"
        );

        let template = ScopeTemplate::parse("{Region}-{ Shard }").expect("parse");
        assert_eq!(template.parameters().collect::<Vec<_>>(), ["Region", "Shard"]);
        assert_eq!(
            template
                .bind(&data(&[("Region", "west"), ("Shard", "7")]))
                .expect("bind"),
            "west-7"
        );
    }

    #[test]
    fn missing_binding_is_a_configuration_error() {
        let template = ScopeTemplate::parse("scope{P1}").expect("parse");
        let err = template.bind(&BindingData::new()).expect_err("missing");
        assert!(matches!(err, Error::Configuration { .. }));
        assert!(err.to_string().contains("{P1}"));
    }

    #[test]
    fn malformed_templates_are_rejected() {
        assert!(ScopeTemplate::parse("scope{P1").is_err());
        assert!(ScopeTemplate::parse("scope}").is_err());
        assert!(ScopeTemplate::parse("scope{}").is_err());
        assert!(!ScopeTemplate::parse("plain").expect("parse").has_parameters());
    }

    #[test]
    fn names_resolve_through_resolver() {
        let resolver = MapNameResolver::default().with("var1", "Value1");
        assert_eq!(resolve_names("%var1%", &resolver).expect("resolve"), "Value1");
        assert_eq!(
            resolve_names("a-%var1%-b", &resolver).expect("resolve"),
            "a-Value1-b"
        );
        assert_eq!(resolve_names("100%", &resolver).expect("resolve"), "100%");

        let err = resolve_names("%missing%", &resolver).expect_err("unresolved");
        assert!(err.to_string().contains("%missing%"));
    }

    #[test]
    fn identity_formats() {
        assert_eq!(
            LockIdentity::function("host", "jobs.Nightly", None).as_str(),
            "host/jobs.Nightly"
        );
        assert_eq!(
            LockIdentity::function("host", "jobs.Nightly", Some("eu")).as_str(),
            "host/jobs.Nightly.eu"
        );
        assert_eq!(LockIdentity::host("host", "shared").as_str(), "host/shared");

        let listener = LockIdentity::function("host", "jobs.Queue", None).listener();
        assert_eq!(listener.as_str(), "host/jobs.Queue.Listener");
        assert_eq!(listener.path(), "locks/host/jobs.Queue.Listener");
    }

    #[test]
    fn identity_is_deterministic() {
        let a = LockIdentity::function("host", "job", Some("s"));
        let b = LockIdentity::function("host", "job", Some("s"));
        assert_eq!(a, b);
        assert!(LockIdentity::new("").is_err());
    }
}
