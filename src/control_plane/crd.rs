use super::error::{ProvisionError, TeardownError};
use super::last_poll_error;
use crate::retry::{poll_until, Backoff};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{DeleteParams, Patch, PatchParams};
use kube::core::GroupVersionKind;
use kube::{Api, Client, ResourceExt};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

pub(crate) const FIELD_MANAGER: &str = "k8s-envtest";

/// Server-side applies every definition and waits until all of them can be served, all within `timeout`.
pub(crate) async fn install_crds(
    client: &Client,
    crds: &[CustomResourceDefinition],
    timeout: Duration,
    backoff: Backoff,
) -> Result<(), ProvisionError> {
    if crds.is_empty() {
        return Ok(());
    }

    let deadline = Instant::now() + timeout;
    let api: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();
    for crd in crds {
        let name = crd.name_any();
        debug!(crd = %name, "applying crd");
        let remaining = deadline.saturating_duration_since(Instant::now());
        tokio::time::timeout(remaining, api.patch(&name, &params, &Patch::Apply(crd)))
            .await
            .map_err(|_| ProvisionError::TimedOut {
                operation: format!("applying crd `{name}`"),
                timeout,
            })?
            .map_err(|source| ProvisionError::CrdInstall {
                name: name.clone(),
                source,
            })?;
    }

    let api = &api;
    let remaining = deadline.saturating_duration_since(Instant::now());
    poll_until(remaining, backoff, || async move {
        for crd in crds {
            ensure_served(client, api, crd).await?;
        }
        Ok::<(), String>(())
    })
    .await
    .map_err(|err| ProvisionError::CrdNotEstablished {
        timeout,
        last_error: last_poll_error(err),
    })?;

    info!(count = crds.len(), "crds installed");
    Ok(())
}

/// Names of the definitions the cluster doesn't serve yet.
pub(crate) async fn absent_crds(
    client: &Client,
    crds: &[CustomResourceDefinition],
    timeout: Duration,
) -> Result<Vec<String>, ProvisionError> {
    let api: Api<CustomResourceDefinition> = Api::all(client.clone());
    let lookup = async {
        let mut absent = Vec::new();
        for crd in crds {
            let name = crd.name_any();
            match api.get_opt(&name).await? {
                Some(_) => debug!(crd = %name, "crd already present in the cluster"),
                None => absent.push(name),
            }
        }
        Ok::<_, kube::Error>(absent)
    };
    Ok(tokio::time::timeout(timeout, lookup)
        .await
        .map_err(|_| ProvisionError::TimedOut {
            operation: "looking up installed crds".to_string(),
            timeout,
        })??)
}

async fn ensure_served(
    client: &Client,
    api: &Api<CustomResourceDefinition>,
    crd: &CustomResourceDefinition,
) -> Result<(), String> {
    let name = crd.name_any();
    let current = api.get(&name).await.map_err(|e| format!("{name}: {e}"))?;
    if !is_established(&current) {
        return Err(format!("{name} is not established yet"));
    }

    for version in crd.spec.versions.iter().filter(|v| v.served) {
        let gvk = GroupVersionKind::gvk(&crd.spec.group, &version.name, &crd.spec.names.kind);
        kube::discovery::pinned_kind(client, &gvk)
            .await
            .map_err(|e| format!("{}/{} {} not discoverable: {e}", gvk.group, gvk.version, gvk.kind))?;
    }
    Ok(())
}

pub(crate) fn is_established(crd: &CustomResourceDefinition) -> bool {
    crd.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Established" && c.status == "True")
        })
}

/// Deletes the named definitions within `timeout`, collecting every failure. Definitions already gone are ignored.
pub(crate) async fn uninstall_crds(
    client: &Client,
    names: &[String],
    timeout: Duration,
) -> Result<(), TeardownError> {
    let api: Api<CustomResourceDefinition> = Api::all(client.clone());
    let removal = async {
        let mut errors = Vec::new();
        for name in names {
            match api.delete(name, &DeleteParams::default()).await {
                Ok(_) => debug!(crd = %name, "crd uninstalled"),
                Err(kube::Error::Api(response)) if response.code == 404 => {
                    debug!(crd = %name, "crd already removed")
                }
                Err(source) => errors.push(TeardownError::UninstallCrd {
                    name: name.clone(),
                    source,
                }),
            }
        }
        errors
    };
    let errors = tokio::time::timeout(timeout, removal)
        .await
        .map_err(|_| TeardownError::TimedOut {
            operation: "uninstalling crds".to_string(),
            timeout,
        })?;
    TeardownError::from_errors(errors)
}
