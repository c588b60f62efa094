use super::{KindDefinition, RegistrationError, Scheme, SchemeError};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::{ClusterResourceScope, NamespaceResourceScope};
use kube::core::GroupVersionKind;
use kube::discovery::ApiResource;
use kube::{CustomResourceExt, Resource};
use tracing::debug;

const NAMESPACED_SCOPE: &str = "Namespaced";

/// Something able to add a group of kinds to a [Scheme].
#[cfg_attr(test, mockall::automock)]
pub trait SchemeInstaller: Send + Sync {
    /// Identifier of the type group, reported when the installation fails.
    fn name(&self) -> String;

    fn install(&self, scheme: &mut Scheme) -> Result<(), SchemeError>;
}

/// Maps a resource scope marker to whether its objects live in a namespace.
pub trait KindScope {
    const NAMESPACED: bool;
}

impl KindScope for NamespaceResourceScope {
    const NAMESPACED: bool = true;
}

impl KindScope for ClusterResourceScope {
    const NAMESPACED: bool = false;
}

/// Stock [SchemeInstaller] holding a fixed list of kind definitions.
///
/// ```ignore
/// let machines = TypeGroup::new("machine.openshift.io/v1beta1").with_custom_resource::<Machine>();
/// let config = TypeGroup::new("config.openshift.io/v1").with_kind::<Infrastructure>();
/// register(&mut scheme, [&machines as &dyn SchemeInstaller, &config])?;
/// ```
#[derive(Debug, Clone, Default)]
pub struct TypeGroup {
    name: String,
    definitions: Vec<KindDefinition>,
}

impl TypeGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            definitions: Vec::new(),
        }
    }

    pub fn with_definition(mut self, definition: KindDefinition) -> Self {
        self.definitions.push(definition);
        self
    }

    /// Adds a typed resource, its scope is taken from the resource scope marker.
    pub fn with_kind<K>(self) -> Self
    where
        K: Resource<DynamicType = ()>,
        K::Scope: KindScope,
    {
        self.with_definition(KindDefinition::new(
            ApiResource::erase::<K>(&()),
            <K::Scope as KindScope>::NAMESPACED,
        ))
    }

    /// Adds a custom resource including the OpenAPI schema of its version.
    pub fn with_custom_resource<K>(self) -> Self
    where
        K: Resource<DynamicType = ()> + CustomResourceExt,
        K::Scope: KindScope,
    {
        let version = K::version(&());
        let schema = K::crd()
            .spec
            .versions
            .into_iter()
            .find(|v| v.name == version)
            .and_then(|v| v.schema)
            .and_then(|s| s.open_api_v3_schema);

        let mut definition = KindDefinition::new(
            ApiResource::erase::<K>(&()),
            <K::Scope as KindScope>::NAMESPACED,
        );
        definition.schema = schema;
        self.with_definition(definition)
    }

    /// Builds a type group with every served version of the provided CRD.
    pub fn from_crd(crd: &CustomResourceDefinition) -> Self {
        let spec = &crd.spec;
        let namespaced = spec.scope == NAMESPACED_SCOPE;
        let name = crd
            .metadata
            .name
            .clone()
            .unwrap_or_else(|| format!("{}.{}", spec.names.plural, spec.group));

        spec.versions
            .iter()
            .filter(|v| v.served)
            .fold(Self::new(name), |group, version| {
                let gvk = GroupVersionKind::gvk(&spec.group, &version.name, &spec.names.kind);
                let mut definition = KindDefinition::new(
                    ApiResource::from_gvk_with_plural(&gvk, &spec.names.plural),
                    namespaced,
                );
                definition.schema = version
                    .schema
                    .as_ref()
                    .and_then(|s| s.open_api_v3_schema.clone());
                group.with_definition(definition)
            })
    }

    pub fn definitions(&self) -> &[KindDefinition] {
        &self.definitions
    }
}

impl SchemeInstaller for TypeGroup {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn install(&self, scheme: &mut Scheme) -> Result<(), SchemeError> {
        self.definitions
            .iter()
            .try_for_each(|definition| scheme.add_kind(definition.clone()))
    }
}

/// Installs every group into `scheme`.
///
/// The installation is all-or-nothing: groups are installed on a copy of the scheme which replaces the original
/// only when every group succeeded. The first failing group aborts the registration and the remaining ones are not
/// installed.
pub fn register<'a, I>(scheme: &mut Scheme, installers: I) -> Result<(), RegistrationError>
where
    I: IntoIterator<Item = &'a dyn SchemeInstaller>,
{
    let mut staged = scheme.clone();
    for installer in installers {
        let group = installer.name();
        debug!(%group, "installing type group");
        installer
            .install(&mut staged)
            .map_err(|source| RegistrationError { group, source })?;
    }
    *scheme = staged;
    Ok(())
}
