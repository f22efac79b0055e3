//! Singleton declarations and registration-time validation.
//!
//! A job opts into singleton execution with one or more
//! [`SingletonDeclaration`]s. [`validate_declarations`] checks them once, at
//! registration, and returns a [`SingletonPlan`] whose configuration
//! references are already resolved. Only `{param}` binding placeholders are
//! left for invocation time.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::identity::{BindingData, LockIdentity, NameResolver, ScopeTemplate, resolve_names};

/// What a singleton lock guards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SingletonMode {
    /// Each job invocation holds the lock while it runs.
    #[default]
    Function,
    /// The job's trigger listener holds the lock while it is running.
    Listener,
}

impl SingletonMode {
    /// Returns the mode as a label value.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Function => "function",
            Self::Listener => "listener",
        }
    }
}

/// How widely a singleton lock is shared.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SingletonScope {
    /// The lock is private to one job (optionally narrowed by a scope id).
    #[default]
    Function,
    /// The lock is shared by every job on the host that uses the same scope id.
    Host,
}

/// A job's request for singleton execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SingletonDeclaration {
    /// Optional scope qualifier; may contain `%name%` and `{param}` tokens.
    pub scope_id: Option<String>,
    /// What the lock guards.
    pub mode: SingletonMode,
    /// How widely the lock is shared.
    pub scope: SingletonScope,
    /// Overrides the policy's acquisition timeout.
    #[serde(with = "option_duration_ms")]
    pub acquisition_timeout: Option<Duration>,
    /// Overrides the policy's lease period for this mode.
    #[serde(with = "option_duration_ms")]
    pub lock_period: Option<Duration>,
    /// Storage account holding the lock; the default account when unset.
    pub account: Option<String>,
}

impl SingletonDeclaration {
    /// A function-mode declaration with no scope.
    #[must_use]
    pub fn function() -> Self {
        Self::default()
    }

    /// A listener-mode declaration with no scope.
    #[must_use]
    pub fn listener() -> Self {
        Self {
            mode: SingletonMode::Listener,
            ..Self::default()
        }
    }

    /// Sets the scope id.
    #[must_use]
    pub fn with_scope_id(mut self, scope_id: impl Into<String>) -> Self {
        self.scope_id = Some(scope_id.into());
        self
    }

    /// Sets the scope.
    #[must_use]
    pub fn with_scope(mut self, scope: SingletonScope) -> Self {
        self.scope = scope;
        self
    }

    /// Sets the storage account.
    #[must_use]
    pub fn with_account(mut self, account: impl Into<String>) -> Self {
        self.account = Some(account.into());
        self
    }

    /// Sets the acquisition timeout override.
    #[must_use]
    pub fn with_acquisition_timeout(mut self, timeout: Duration) -> Self {
        self.acquisition_timeout = Some(timeout);
        self
    }
}

/// The job a declaration is attached to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDescriptor {
    /// Fully qualified job name, used verbatim in lock identities.
    pub full_name: String,
    /// True if the job is driven by a trigger listener.
    pub triggered: bool,
}

impl JobDescriptor {
    /// Describes a job.
    #[must_use]
    pub fn new(full_name: impl Into<String>, triggered: bool) -> Self {
        Self {
            full_name: full_name.into(),
            triggered,
        }
    }
}

/// A validated declaration with configuration references resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSingleton {
    /// What the lock guards.
    pub mode: SingletonMode,
    /// How widely the lock is shared.
    pub scope: SingletonScope,
    /// Scope qualifier with `{param}` placeholders still unbound.
    pub scope_id: Option<ScopeTemplate>,
    /// Acquisition timeout override.
    pub acquisition_timeout: Option<Duration>,
    /// Lease period override.
    pub lock_period: Option<Duration>,
    /// Storage account override.
    pub account: Option<String>,
}

impl ResolvedSingleton {
    /// Derives the lock identity for one invocation.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the scope references a parameter
    /// missing from `binding_data`.
    pub fn lock_identity(
        &self,
        host_id: &str,
        job: &JobDescriptor,
        binding_data: &BindingData,
    ) -> Result<LockIdentity> {
        let scope_id = self
            .scope_id
            .as_ref()
            .map(|template| template.bind(binding_data))
            .transpose()?;

        let identity = match self.scope {
            SingletonScope::Function => {
                LockIdentity::function(host_id, &job.full_name, scope_id.as_deref())
            }
            SingletonScope::Host => {
                let scope_id = scope_id.filter(|s| !s.is_empty()).ok_or_else(|| {
                    Error::configuration(format!(
                        "host scoped singleton on '{}' bound to an empty scope id",
                        job.full_name
                    ))
                })?;
                LockIdentity::host(host_id, &scope_id)
            }
        };

        Ok(match self.mode {
            SingletonMode::Function => identity,
            SingletonMode::Listener => identity.listener(),
        })
    }
}

/// The validated singleton configuration of one job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SingletonPlan {
    /// The function-mode declaration, if any.
    pub function: Option<ResolvedSingleton>,
    /// The listener-mode declaration, if any.
    pub listener: Option<ResolvedSingleton>,
}

impl SingletonPlan {
    /// Returns true if the job has no singleton declarations.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.function.is_none() && self.listener.is_none()
    }
}

/// Validates a job's singleton declarations.
///
/// Rules:
/// - host scope requires a nonempty scope id
/// - listener mode is only allowed on triggered jobs
/// - at most one declaration per mode
/// - listener scope ids cannot reference binding data
///
/// `%name%` references are resolved here, so a missing setting fails
/// registration instead of the first invocation.
///
/// # Errors
///
/// Returns a configuration error for the first violated rule.
pub fn validate_declarations(
    job: &JobDescriptor,
    declarations: &[SingletonDeclaration],
    resolver: &dyn NameResolver,
) -> Result<SingletonPlan> {
    let mut plan = SingletonPlan::default();

    for declaration in declarations {
        let resolved = resolve_declaration(job, declaration, resolver)?;
        let slot = match declaration.mode {
            SingletonMode::Function => &mut plan.function,
            SingletonMode::Listener => &mut plan.listener,
        };
        if slot.is_some() {
            return Err(Error::configuration(format!(
                "only one {} mode singleton declaration is allowed on '{}'",
                declaration.mode.as_str(),
                job.full_name
            )));
        }
        *slot = Some(resolved);
    }

    Ok(plan)
}

fn resolve_declaration(
    job: &JobDescriptor,
    declaration: &SingletonDeclaration,
    resolver: &dyn NameResolver,
) -> Result<ResolvedSingleton> {
    if declaration.mode == SingletonMode::Listener && !job.triggered {
        return Err(Error::configuration(format!(
            "listener mode singleton requires a triggered job, '{}' has no trigger",
            job.full_name
        )));
    }

    let scope_id = declaration
        .scope_id
        .as_deref()
        .map(|raw| resolve_names(raw, resolver))
        .transpose()?
        .filter(|s| !s.is_empty());

    if declaration.scope == SingletonScope::Host && scope_id.is_none() {
        return Err(Error::configuration(format!(
            "host scoped singleton on '{}' requires a scope id",
            job.full_name
        )));
    }

    let scope_id = scope_id.as_deref().map(ScopeTemplate::parse).transpose()?;
    if declaration.mode == SingletonMode::Listener
        && scope_id.as_ref().is_some_and(ScopeTemplate::has_parameters)
    {
        return Err(Error::configuration(format!(
            "listener mode singleton on '{}' cannot use binding parameters in its scope id",
            job.full_name
        )));
    }

    for (name, value) in [
        ("acquisition timeout", declaration.acquisition_timeout),
        ("lock period", declaration.lock_period),
    ] {
        if value.is_some_and(|d| d.is_zero()) {
            return Err(Error::configuration(format!(
                "{name} override on '{}' must be positive",
                job.full_name
            )));
        }
    }

    Ok(ResolvedSingleton {
        mode: declaration.mode,
        scope: declaration.scope,
        scope_id,
        acquisition_timeout: declaration.acquisition_timeout,
        lock_period: declaration.lock_period,
        account: declaration.account.clone(),
    })
}

mod option_duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::ref_option)]
    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|v| v.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::MapNameResolver;

    fn triggered() -> JobDescriptor {
        JobDescriptor::new("jobs.Orders.Process", true)
    }

    #[test]
    fn function_declaration_with_bound_scope() {
        let resolver = MapNameResolver::default();
        let plan = validate_declarations(
            &triggered(),
            &[SingletonDeclaration::function().with_scope_id("scope{P1}")],
            &resolver,
        )
        .expect("valid");

        let function = plan.function.expect("function");
        let data = BindingData::from([("P1".to_string(), "Test1".to_string())]);
        let id = function
            .lock_identity("host", &triggered(), &data)
            .expect("identity");
        assert_eq!(id.as_str(), "host/jobs.Orders.Process.scopeTest1");
    }

    #[test]
    fn config_references_resolve_at_registration() {
        let resolver = MapNameResolver::default().with("var1", "Value1");
        let plan = validate_declarations(
            &triggered(),
            &[SingletonDeclaration::function()
                .with_scope(SingletonScope::Host)
                .with_scope_id("%var1%")],
            &resolver,
        )
        .expect("valid");

        let id = plan
            .function
            .expect("function")
            .lock_identity("host", &triggered(), &BindingData::new())
            .expect("identity");
        assert_eq!(id.as_str(), "host/Value1");

        let err = validate_declarations(
            &triggered(),
            &[SingletonDeclaration::function().with_scope_id("%nope%")],
            &resolver,
        )
        .expect_err("unresolved");
        assert!(matches!(err, Error::Configuration { .. }));
    }

    #[test]
    fn host_scope_requires_scope_id() {
        let err = validate_declarations(
            &triggered(),
            &[SingletonDeclaration::function().with_scope(SingletonScope::Host)],
            &MapNameResolver::default(),
        )
        .expect_err("no scope id");
        assert!(err.to_string().contains("requires a scope id"));
    }

    #[test]
    fn listener_mode_requires_trigger() {
        let job = JobDescriptor::new("jobs.Manual", false);
        let err = validate_declarations(
            &job,
            &[SingletonDeclaration::listener()],
            &MapNameResolver::default(),
        )
        .expect_err("not triggered");
        assert!(err.to_string().contains("triggered"));
    }

    #[test]
    fn one_declaration_per_mode() {
        let resolver = MapNameResolver::default();
        let err = validate_declarations(
            &triggered(),
            &[
                SingletonDeclaration::function(),
                SingletonDeclaration::function().with_scope_id("x"),
            ],
            &resolver,
        )
        .expect_err("duplicate");
        assert!(err.to_string().contains("only one function"));

        let plan = validate_declarations(
            &triggered(),
            &[SingletonDeclaration::function(), SingletonDeclaration::listener()],
            &resolver,
        )
        .expect("one of each");
        assert!(plan.function.is_some() && plan.listener.is_some());
    }

    #[test]
    fn listener_identity_and_parameter_ban() {
        let resolver = MapNameResolver::default();
        let plan = validate_declarations(&triggered(), &[SingletonDeclaration::listener()], &resolver)
            .expect("valid");
        let id = plan
            .listener
            .expect("listener")
            .lock_identity("host", &triggered(), &BindingData::new())
            .expect("identity");
        assert_eq!(id.as_str(), "host/jobs.Orders.Process.Listener");

        let err = validate_declarations(
            &triggered(),
            &[SingletonDeclaration::listener().with_scope_id("{P1}")],
            &resolver,
        )
        .expect_err("parameters");
        assert!(err.to_string().contains("binding parameters"));
    }

    #[test]
    fn zero_overrides_are_rejected() {
        let err = validate_declarations(
            &triggered(),
            &[SingletonDeclaration::function().with_acquisition_timeout(Duration::ZERO)],
            &MapNameResolver::default(),
        )
        .expect_err("zero");
        assert!(err.to_string().contains("acquisition timeout"));
    }

    #[test]
    fn declarations_deserialize() {
        let decl: SingletonDeclaration = serde_json::from_str(
            r#"{"scopeId": "{Region}", "scope": "host", "acquisitionTimeout": 5000}"#,
        )
        .expect("json");
        assert_eq!(decl.scope, SingletonScope::Host);
        assert_eq!(decl.acquisition_timeout, Some(Duration::from_secs(5)));
        assert_eq!(decl.mode, SingletonMode::Function);
    }
}
