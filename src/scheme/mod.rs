//! Type registry shared by the harness client.
//!
//! A [Scheme] maps every api-version to the kinds it serves, each of them described by a [KindDefinition].
//! Kinds are write-once: registering a kind again is only accepted when the new definition is compatible with the
//! registered one.
mod installer;

pub use installer::{register, KindScope, SchemeInstaller, TypeGroup};

#[cfg(test)]
pub use installer::MockSchemeInstaller;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::JSONSchemaProps;
use kube::core::GroupVersionKind;
use kube::discovery::ApiResource;
use std::collections::BTreeMap;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum SchemeError {
    #[error("kind `{kind}` of `{api_version}` is already registered with an incompatible definition")]
    Conflict { api_version: String, kind: String },

    #[error("invalid kind definition: {0}")]
    InvalidDefinition(String),
}

/// Failure installing a type group, carrying the identifier of the offending group.
#[derive(thiserror::Error, Debug, PartialEq)]
#[error("registering type group `{group}`: {source}")]
pub struct RegistrationError {
    pub group: String,
    #[source]
    pub source: SchemeError,
}

/// Everything the harness needs to know to serve a kind without asking the api-server.
#[derive(Debug, Clone, PartialEq)]
pub struct KindDefinition {
    pub resource: ApiResource,
    pub namespaced: bool,
    /// OpenAPI schema of the kind when it is known.
    pub schema: Option<JSONSchemaProps>,
}

impl KindDefinition {
    pub fn new(resource: ApiResource, namespaced: bool) -> Self {
        Self {
            resource,
            namespaced,
            schema: None,
        }
    }

    pub fn with_schema(mut self, schema: JSONSchemaProps) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn gvk(&self) -> GroupVersionKind {
        GroupVersionKind::gvk(
            &self.resource.group,
            &self.resource.version,
            &self.resource.kind,
        )
    }

    fn validate(&self) -> Result<(), SchemeError> {
        let r = &self.resource;
        if r.kind.is_empty() || r.version.is_empty() || r.plural.is_empty() {
            return Err(SchemeError::InvalidDefinition(format!(
                "kind, version and plural are required, got kind=`{}` version=`{}` plural=`{}`",
                r.kind, r.version, r.plural
            )));
        }
        Ok(())
    }

    /// Two definitions are compatible when they describe the same endpoint and scope. A missing schema is compatible
    /// with any schema.
    fn is_compatible_with(&self, other: &KindDefinition) -> bool {
        let schemas_match = match (&self.schema, &other.schema) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        };
        self.resource == other.resource && self.namespaced == other.namespaced && schemas_match
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Scheme {
    // api_version -> kind -> definition
    kinds: BTreeMap<String, BTreeMap<String, KindDefinition>>,
}

impl Scheme {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a kind to the scheme.
    ///
    /// Adding a compatible definition again is a no-op, except that a definition carrying a schema replaces one
    /// that didn't.
    pub fn add_kind(&mut self, definition: KindDefinition) -> Result<(), SchemeError> {
        definition.validate()?;
        let api_version = definition.resource.api_version.clone();
        let kind = definition.resource.kind.clone();

        let group_kinds = self.kinds.entry(api_version.clone()).or_default();
        match group_kinds.get_mut(&kind) {
            None => {
                group_kinds.insert(kind, definition);
                Ok(())
            }
            Some(registered) if registered.is_compatible_with(&definition) => {
                if registered.schema.is_none() && definition.schema.is_some() {
                    *registered = definition;
                }
                Ok(())
            }
            Some(_) => Err(SchemeError::Conflict { api_version, kind }),
        }
    }

    pub fn resolve(&self, gvk: &GroupVersionKind) -> Option<&KindDefinition> {
        self.kinds.get(&gvk.api_version())?.get(&gvk.kind)
    }

    pub fn recognizes(&self, gvk: &GroupVersionKind) -> bool {
        self.resolve(gvk).is_some()
    }

    /// Returns true if the typed resource `K` has been registered.
    pub fn contains<K>(&self) -> bool
    where
        K: kube::Resource<DynamicType = ()>,
    {
        self.recognizes(&GroupVersionKind::gvk(
            &K::group(&()),
            &K::version(&()),
            &K::kind(&()),
        ))
    }

    /// All the registered kinds, sorted by api-version and kind.
    pub fn kinds(&self) -> impl Iterator<Item = &KindDefinition> {
        self.kinds.values().flat_map(|kinds| kinds.values())
    }

    /// Registered api-versions, i.e. `group/version` or `version` for the core group.
    pub fn api_versions(&self) -> impl Iterator<Item = &str> {
        self.kinds.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }
}
