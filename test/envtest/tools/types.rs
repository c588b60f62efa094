use k8s_envtest::scheme::TypeGroup;
use kube::core::GroupVersionKind;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// Installed from fixtures/machine.crd.yaml
#[derive(Default, CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(group = "machine.openshift.io", version = "v1beta1", kind = "Machine", namespaced)]
pub struct MachineSpec {
    #[serde(rename = "providerID", skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
}

// Cluster scoped, installed from its generated CRD
#[derive(Default, CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(group = "config.openshift.io", version = "v1", kind = "Infrastructure")]
pub struct InfrastructureSpec {
    #[serde(rename = "platformType", skip_serializing_if = "Option::is_none")]
    pub platform_type: Option<String>,
}

pub fn machine_gvk() -> GroupVersionKind {
    GroupVersionKind::gvk("machine.openshift.io", "v1beta1", "Machine")
}

pub fn machine_types() -> TypeGroup {
    TypeGroup::new("machine.openshift.io/v1beta1").with_custom_resource::<Machine>()
}

pub fn config_types() -> TypeGroup {
    TypeGroup::new("config.openshift.io/v1").with_custom_resource::<Infrastructure>()
}
