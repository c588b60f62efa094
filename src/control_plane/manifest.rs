use super::error::ManifestError;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use serde::{de, Deserialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const CRD_KIND: &str = "CustomResourceDefinition";
const MANIFEST_EXTENSIONS: [&str; 3] = ["yaml", "yml", "json"];

/// Reference to a resource definition to install in the control plane before it is handed to test cases.
#[derive(Debug, Clone, PartialEq)]
pub enum ManifestRef {
    /// A manifest file, or a directory whose `.yaml`, `.yml` and `.json` files are all read.
    Path(PathBuf),
    /// An already built definition.
    Crd(Box<CustomResourceDefinition>),
}

impl From<PathBuf> for ManifestRef {
    fn from(path: PathBuf) -> Self {
        ManifestRef::Path(path)
    }
}

impl From<&Path> for ManifestRef {
    fn from(path: &Path) -> Self {
        ManifestRef::Path(path.to_path_buf())
    }
}

impl From<&str> for ManifestRef {
    fn from(path: &str) -> Self {
        ManifestRef::Path(PathBuf::from(path))
    }
}

impl From<CustomResourceDefinition> for ManifestRef {
    fn from(crd: CustomResourceDefinition) -> Self {
        ManifestRef::Crd(Box::new(crd))
    }
}

/// Reads every referenced definition.
///
/// Documents of other kinds are skipped. Definitions are keyed by name, a later definition with the same name
/// replaces the previous one. Missing paths are errors unless `error_if_missing` is false, in which case they are
/// skipped.
pub fn load_crds(
    manifests: &[ManifestRef],
    error_if_missing: bool,
) -> Result<Vec<CustomResourceDefinition>, ManifestError> {
    let mut crds: BTreeMap<String, CustomResourceDefinition> = BTreeMap::new();

    for manifest in manifests {
        let loaded = match manifest {
            ManifestRef::Crd(crd) => vec![(**crd).clone()],
            ManifestRef::Path(path) => load_path(path, error_if_missing)?,
        };
        for crd in loaded {
            let name = crd
                .metadata
                .name
                .clone()
                .ok_or_else(|| ManifestError::UnnamedCrd(describe(manifest)))?;
            if crds.insert(name.clone(), crd).is_some() {
                warn!(crd = %name, "crd defined more than once, the last definition is used");
            }
        }
    }

    Ok(crds.into_values().collect())
}

fn describe(manifest: &ManifestRef) -> String {
    match manifest {
        ManifestRef::Path(path) => path.display().to_string(),
        ManifestRef::Crd(crd) => format!("inline crd of group `{}`", crd.spec.group),
    }
}

fn load_path(
    path: &Path,
    error_if_missing: bool,
) -> Result<Vec<CustomResourceDefinition>, ManifestError> {
    if !path.exists() {
        if error_if_missing {
            return Err(ManifestError::Missing(path.to_path_buf()));
        }
        warn!(path = %path.display(), "skipping missing manifest path");
        return Ok(Vec::new());
    }

    if path.is_dir() {
        let mut files = fs::read_dir(path)
            .map_err(|source| unreadable(path, source))?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|source| unreadable(path, source))?;
        files.retain(|file| file.is_file() && is_manifest_file(file));
        files.sort();

        let mut crds = Vec::new();
        for file in files {
            crds.extend(read_file(&file)?);
        }
        return Ok(crds);
    }

    read_file(path)
}

fn is_manifest_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| MANIFEST_EXTENSIONS.contains(&ext))
}

fn unreadable(path: &Path, source: std::io::Error) -> ManifestError {
    ManifestError::Unreadable {
        path: path.to_path_buf(),
        source,
    }
}

fn read_file(path: &Path) -> Result<Vec<CustomResourceDefinition>, ManifestError> {
    let content = fs::read_to_string(path).map_err(|source| unreadable(path, source))?;
    parse_crds(&content).map_err(|source| ManifestError::Malformed {
        path: path.to_path_buf(),
        source,
    })
}

/// Parses the custom resource definitions of a multi-document YAML (or JSON) manifest.
///
/// Every non-empty document must be a kubernetes object, objects of other kinds are skipped.
pub fn parse_crds(content: &str) -> Result<Vec<CustomResourceDefinition>, serde_yaml::Error> {
    let mut crds = Vec::new();
    for document in serde_yaml::Deserializer::from_str(content) {
        let value = serde_yaml::Value::deserialize(document)?;
        if value.is_null() {
            continue;
        }
        let api_version = value.get("apiVersion").and_then(|v| v.as_str());
        let kind = match (api_version, value.get("kind").and_then(|k| k.as_str())) {
            (Some(_), Some(kind)) => kind,
            _ => {
                return Err(de::Error::custom(
                    "document is not a kubernetes object, `apiVersion` and `kind` are required",
                ))
            }
        };
        if kind != CRD_KIND {
            debug!(%kind, "skipping non crd document");
            continue;
        }
        crds.push(serde_yaml::from_value(value)?);
    }
    Ok(crds)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::fs::File;
    use std::io::Write;
    use tempfile::tempdir;

    pub(crate) fn crd_yaml(group: &str, kind: &str, plural: &str) -> String {
        format!(
            r#"
apiVersion: apiextensions.k8s.io/v1
kind: CustomResourceDefinition
metadata:
  name: {plural}.{group}
spec:
  group: {group}
  names:
    kind: {kind}
    listKind: {kind}List
    plural: {plural}
    singular: {singular}
  scope: Namespaced
  versions:
  - name: v1
    served: true
    storage: true
    schema:
      openAPIV3Schema:
        type: object
        x-kubernetes-preserve-unknown-fields: true
"#,
            singular = kind.to_lowercase()
        )
    }

    fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        write!(File::create(&path).unwrap(), "{content}").unwrap();
        path
    }

    #[test]
    fn parses_multi_document_manifests_skipping_other_kinds() {
        let content = format!(
            "---\n{}\n---\napiVersion: v1\nkind: Namespace\nmetadata:\n  name: skipped\n---\n{}",
            crd_yaml("example.com", "Foo", "foos"),
            crd_yaml("example.com", "Bar", "bars")
        );
        let crds = parse_crds(&content).unwrap();
        let kinds: Vec<_> = crds.iter().map(|c| c.spec.names.kind.as_str()).collect();
        assert_eq!(kinds, vec!["Foo", "Bar"]);
    }

    #[test]
    fn malformed_manifest_is_an_error() {
        let dir = tempdir().unwrap();
        let path = write(
            dir.path(),
            "broken.yaml",
            "kind: CustomResourceDefinition\nspec: [not, a, spec]\n",
        );
        assert_matches!(
            load_crds(&[ManifestRef::Path(path)], true),
            Err(ManifestError::Malformed { .. })
        );
    }

    #[test]
    fn documents_that_are_not_objects_are_malformed() {
        let dir = tempdir().unwrap();
        for (name, content) in [
            ("text.yaml", "this is not a resource manifest at all"),
            ("list.yaml", "- a\n- b"),
            ("untyped.yaml", "metadata:\n  name: foos.example.com\n"),
        ] {
            let path = write(dir.path(), name, content);
            assert_matches!(
                load_crds(&[ManifestRef::Path(path)], true),
                Err(ManifestError::Malformed { .. }),
                "{name}"
            );
        }

        let mixed = format!(
            "{}\n---\nnot: [an, object]\n",
            crd_yaml("example.com", "Foo", "foos")
        );
        assert!(parse_crds(&mixed).is_err());
    }

    #[test]
    fn missing_path_honours_error_if_missing() {
        let missing = ManifestRef::from("/non/existing/crds");
        assert_matches!(
            load_crds(std::slice::from_ref(&missing), true),
            Err(ManifestError::Missing(_))
        );
        assert!(load_crds(&[missing], false).unwrap().is_empty());
    }

    #[test]
    fn directories_are_read_in_order_and_deduplicated() {
        let dir = tempdir().unwrap();
        write(dir.path(), "b.yaml", &crd_yaml("example.com", "Bar", "bars"));
        write(dir.path(), "a.yml", &crd_yaml("example.com", "Foo", "foos"));
        write(dir.path(), "notes.txt", "not a manifest");
        let inline = parse_crds(&crd_yaml("example.com", "Foo", "foos"))
            .unwrap()
            .remove(0);

        let crds = load_crds(
            &[ManifestRef::from(dir.path()), ManifestRef::from(inline)],
            true,
        )
        .unwrap();

        let names: Vec<_> = crds
            .iter()
            .map(|c| c.metadata.name.clone().unwrap())
            .collect();
        assert_eq!(names, vec!["bars.example.com", "foos.example.com"]);
    }

    #[test]
    fn unnamed_crd_is_rejected() {
        let mut crd = parse_crds(&crd_yaml("example.com", "Foo", "foos"))
            .unwrap()
            .remove(0);
        crd.metadata.name = None;
        assert_matches!(
            load_crds(&[ManifestRef::from(crd)], true),
            Err(ManifestError::UnnamedCrd(_))
        );
    }
}
