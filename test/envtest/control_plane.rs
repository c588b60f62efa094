use crate::tools::logging::init_logger;
use crate::tools::types::{config_types, machine_gvk, machine_types, Infrastructure, Machine, MachineSpec};
use crate::tools::{is_listening, machine_crd_path, server_port};
use assert_matches::assert_matches;
use futures::StreamExt;
use k8s_envtest::client::SchemeClient;
use k8s_envtest::config::EnvTestConfig;
use k8s_envtest::control_plane::{EnvTest, ExistingCluster, ManifestRef, ProvisionError, Provisioner};
use k8s_envtest::retry::eventually;
use k8s_envtest::scheme::{register, Scheme, SchemeInstaller};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::PostParams;
use kube::{Api, CustomResourceExt};
use std::sync::Arc;
use std::time::Duration;

fn envtest() -> EnvTest {
    init_logger();
    EnvTest::new(EnvTestConfig::from_env().unwrap())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ignore = "needs envtest binaries"]
async fn start_then_stop_releases_everything() {
    let control_plane = envtest()
        .start(&[ManifestRef::from(machine_crd_path())])
        .await
        .unwrap();

    let port = server_port(control_plane.descriptor.server());
    let dir = control_plane
        .descriptor
        .kubeconfig_path()
        .and_then(|path| path.parent())
        .map(|dir| dir.to_path_buf())
        .unwrap();
    assert!(is_listening(port).await);
    assert!(dir.exists());

    control_plane.handle.stop().await.unwrap();

    assert!(!is_listening(port).await);
    assert!(!dir.exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ignore = "needs envtest binaries"]
async fn unreadable_manifest_fails_without_starting_anything() {
    let dir = tempfile::tempdir().unwrap();
    let malformed = dir.path().join("broken.yaml");
    std::fs::write(&malformed, "kind: CustomResourceDefinition\nspec: 42\n").unwrap();

    assert_matches!(
        envtest()
            .start(&[ManifestRef::from(dir.path().join("missing.yaml"))])
            .await,
        Err(ProvisionError::Manifest(_))
    );
    assert_matches!(
        envtest().start(&[ManifestRef::from(malformed)]).await,
        Err(ProvisionError::Manifest(_))
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ignore = "needs envtest binaries"]
async fn create_watch_and_stale_descriptor() {
    let mut scheme = Scheme::new();
    let machines = machine_types();
    let config = config_types();
    register(&mut scheme, [&machines as &dyn SchemeInstaller, &config]).unwrap();
    let scheme = Arc::new(scheme);

    let control_plane = envtest()
        .start(&[
            ManifestRef::from(machine_crd_path()),
            ManifestRef::from(Infrastructure::crd()),
        ])
        .await
        .unwrap();
    let descriptor = control_plane.descriptor.clone();
    let client = SchemeClient::new(descriptor.client().await.unwrap(), scheme);
    let namespace = client.create_namespace("machines").await.unwrap();

    let mut watch = client.watch(&machine_gvk(), Some(&namespace)).unwrap();

    let machine = Machine::new(
        "worker-0",
        MachineSpec {
            provider_id: Some("aws:///us-east-1a/i-0123".to_string()),
        },
    );
    client
        .namespaced_api::<Machine>(&namespace)
        .unwrap()
        .create(&PostParams::default(), &machine)
        .await
        .unwrap();

    let watched = tokio::time::timeout(Duration::from_secs(10), watch.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(watched.metadata.name.as_deref(), Some("worker-0"));

    let (reader, ns) = (&client, namespace.as_str());
    let read = eventually(Duration::from_secs(5), Duration::from_millis(100), || async move {
        match reader.get(&machine_gvk(), "worker-0", Some(ns)).await {
            Ok(Some(machine)) => Ok(machine),
            Ok(None) => Err("not found yet".to_string()),
            Err(err) => Err(err.to_string()),
        }
    })
    .await
    .unwrap();
    assert_eq!(read.data["spec"]["providerID"], "aws:///us-east-1a/i-0123");

    drop(watch);
    control_plane.handle.stop().await.unwrap();

    // the descriptor is stale, requests fail fast instead of hanging
    let stale = descriptor.client().await.unwrap();
    let result = tokio::time::timeout(Duration::from_secs(30), stale.apiserver_version())
        .await
        .expect("request against a stopped control plane must not hang");
    assert!(result.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ignore = "needs envtest binaries"]
async fn existing_cluster_keeps_the_crds_it_found() {
    let cluster = envtest()
        .start(&[ManifestRef::from(machine_crd_path())])
        .await
        .unwrap();
    let kubeconfig = cluster.descriptor.kubeconfig_path().unwrap().to_path_buf();

    let existing = ExistingCluster::new(EnvTestConfig {
        use_existing_cluster: true,
        existing_cluster_kubeconfig: Some(kubeconfig),
        ..EnvTestConfig::from_env().unwrap()
    });
    let reused = existing
        .start(&[
            ManifestRef::from(machine_crd_path()),
            ManifestRef::from(Infrastructure::crd()),
        ])
        .await
        .unwrap();
    reused.handle.stop().await.unwrap();

    let crds: Api<CustomResourceDefinition> = Api::all(cluster.descriptor.client().await.unwrap());
    assert!(crds
        .get_opt("machines.machine.openshift.io")
        .await
        .unwrap()
        .is_some());
    let crds = &crds;
    eventually(Duration::from_secs(10), Duration::from_millis(200), || async move {
        match crds.get_opt("infrastructures.config.openshift.io").await {
            Ok(None) => Ok(()),
            Ok(Some(_)) => Err("infrastructures crd still present".to_string()),
            Err(err) => Err(err.to_string()),
        }
    })
    .await
    .unwrap();

    cluster.handle.stop().await.unwrap();
}
