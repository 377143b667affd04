use anyhow::{anyhow, Context, Result};
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map as JsonMap, Value};
use sha2::{Digest as _, Sha256};
use std::{
    collections::{BTreeMap as Map, BTreeSet as Set},
    fs::File,
    io::{self, Read, Write},
    path::Path,
};
use tar::{Archive, Builder as TarBuilder, EntryType, Header};

use crate::{models::Image, store::LayerStore};

const MANIFEST_FILE: &str = "manifest.json";

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ArchiveManifest {
    config: String,
    #[serde(default)]
    repo_tags: Option<Vec<String>>,
    layers: Vec<String>,
}

/// Adds `:latest` to tags that do not name a tag.
pub fn normalize_tag(tag: &str) -> String {
    let last_slash = tag.rfind('/').map(|index| index + 1).unwrap_or(0);
    if tag[last_slash..].contains(':') {
        tag.to_string()
    } else {
        format!("{}:latest", tag)
    }
}

/// Reads the JSON documents of a docker-archive: its manifest and the base
/// image config it points at.
fn read_base(base_archive: &Path) -> Result<(ArchiveManifest, Value)> {
    let mut documents = Map::new();

    let mut archive = Archive::new(File::open(base_archive)?);
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.to_string_lossy().into_owned();
        if path.ends_with(".json") {
            let mut contents = Vec::new();
            entry.read_to_end(&mut contents)?;
            documents.insert(path, contents);
        }
    }

    let manifest = documents
        .get(MANIFEST_FILE)
        .ok_or_else(|| anyhow!("{:?} has no {}", base_archive, MANIFEST_FILE))?;
    let mut manifests: Vec<ArchiveManifest> =
        serde_json::from_slice(manifest).context("could not parse base manifest")?;
    if manifests.len() != 1 {
        return Err(anyhow!(
            "{:?} contains {} images, expected exactly one",
            base_archive,
            manifests.len()
        ));
    }
    let manifest = manifests.remove(0);

    let config = documents
        .get(&manifest.config)
        .ok_or_else(|| anyhow!("{:?} is missing its config {}", base_archive, manifest.config))?;
    let config = serde_json::from_slice(config).context("could not parse base config")?;

    Ok((manifest, config))
}

/// The base image config with the runtime settings, layers and history of
/// `image` applied on top.
fn merged_config(base: &Value, image: &Image) -> Result<Value> {
    let mut config = base.clone();
    let root = config
        .as_object_mut()
        .ok_or_else(|| anyhow!("base config is not an object"))?;

    let runtime = root
        .entry("config")
        .or_insert_with(|| Value::Object(JsonMap::new()));
    if !runtime.is_object() {
        *runtime = Value::Object(JsonMap::new());
    }
    if let Some(runtime) = runtime.as_object_mut() {
        let ports = image
            .config
            .exposed_ports
            .iter()
            .map(|port| (port.to_string(), json!({})))
            .collect::<JsonMap<_, _>>();

        runtime.insert("Env".into(), json!(image.config.env_list()));
        runtime.insert("Cmd".into(), json!(image.config.cmd));
        runtime.insert(
            "WorkingDir".into(),
            json!(image.config.working_dir.clone().unwrap_or_default()),
        );
        runtime.insert("ExposedPorts".into(), Value::Object(ports));
        runtime.insert("Labels".into(), json!(image.config.labels));
    }

    let rootfs = root
        .entry("rootfs")
        .or_insert_with(|| json!({ "type": "layers", "diff_ids": [] }));
    let diff_ids = rootfs
        .get_mut("diff_ids")
        .and_then(Value::as_array_mut)
        .ok_or_else(|| anyhow!("base config has no rootfs diff ids"))?;
    diff_ids.extend(image.layers.iter().map(|layer| json!(layer.diff_id)));

    let history = root
        .entry("history")
        .or_insert_with(|| Value::Array(Vec::new()));
    if let Some(history) = history.as_array_mut() {
        history.extend(image.history.iter().map(|entry| {
            if entry.empty_layer {
                json!({ "created_by": entry.created_by, "empty_layer": true })
            } else {
                json!({ "created_by": entry.created_by })
            }
        }));
    }

    Ok(config)
}

fn append_file<W: Write, R: Read>(
    tar: &mut TarBuilder<W>,
    path: &str,
    size: u64,
    data: R,
) -> io::Result<()> {
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Regular);
    header.set_mode(0o644);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header.set_size(size);
    tar.append_data(&mut header, path, data)
}

/// Writes `image` as a docker-archive loadable by podman and docker. The
/// base image's layers are taken from `base_archive`, itself a
/// docker-archive of the base image.
pub fn export_docker_archive<W: Write>(
    store: &LayerStore,
    image: &Image,
    tag: &str,
    base_archive: &Path,
    writer: W,
) -> Result<W> {
    let (base_manifest, base_config) = read_base(base_archive)?;
    let mut tar = TarBuilder::new(writer);

    let base_layers = base_manifest.layers.iter().cloned().collect::<Set<_>>();
    let mut archive = Archive::new(File::open(base_archive)?);
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.to_string_lossy().into_owned();
        if base_layers.contains(&path) {
            let mut header = entry.header().clone();
            tar.append_data(&mut header, &path, &mut entry)?;
        }
    }

    let mut layers = base_manifest.layers.clone();
    let mut written = Set::new();
    for layer in image.layers.iter() {
        let hex = layer.diff_id.trim_start_matches("sha256:");
        let path = format!("{}/layer.tar", hex);

        if written.insert(path.clone()) {
            let blob = File::open(store.blob_path(&layer.digest))
                .with_context(|| format!("layer {} is missing from the store", layer.digest))?;
            append_file(&mut tar, &path, layer.size, blob)?;
        }
        layers.push(path);
    }

    let config = serde_json::to_vec(&merged_config(&base_config, image)?)?;
    let config_path = format!("{:x}.json", Sha256::digest(&config));
    append_file(&mut tar, &config_path, config.len() as u64, config.as_slice())?;

    let manifest = vec![ArchiveManifest {
        config: config_path,
        repo_tags: Some(vec![normalize_tag(tag)]),
        layers,
    }];
    let manifest = serde_json::to_vec(&manifest)?;
    append_file(&mut tar, MANIFEST_FILE, manifest.len() as u64, manifest.as_slice())?;

    debug!("exported {} as a docker-archive", tag);
    Ok(tar.into_inner()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        context::LayerTree,
        models::{BaseImage, HistoryEntry, ImageConfig, ImageId, Port},
    };
    use std::fs;
    use tempfile::tempdir;

    fn write_base_archive(path: &Path) {
        let config = br#"{"architecture":"amd64","os":"linux","config":{"Env":["PATH=/usr/bin"]},"rootfs":{"type":"layers","diff_ids":["sha256:base"]},"history":[{"created_by":"base"}]}"#;
        let manifest = br#"[{"Config":"cfg.json","RepoTags":["python:3.12-slim"],"Layers":["base/layer.tar"]}]"#;

        let mut tar = TarBuilder::new(File::create(path).unwrap());
        append_file(&mut tar, "base/layer.tar", 4, &b"base"[..]).unwrap();
        append_file(&mut tar, "cfg.json", config.len() as u64, &config[..]).unwrap();
        append_file(&mut tar, MANIFEST_FILE, manifest.len() as u64, &manifest[..]).unwrap();
        tar.finish().unwrap();
    }

    #[test]
    fn normalizes_tags() {
        assert_eq!(normalize_tag("records-api"), "records-api:latest");
        assert_eq!(normalize_tag("records-api:v1"), "records-api:v1");
        assert_eq!(
            normalize_tag("registry:5000/records-api"),
            "registry:5000/records-api:latest"
        );
    }

    #[test]
    fn exports_base_and_built_layers() {
        let dir = tempdir().unwrap();
        let base_archive = dir.path().join("base.tar");
        write_base_archive(&base_archive);

        let store = LayerStore::open(dir.path().join("store")).unwrap();
        let mut tree = LayerTree::new();
        tree.add_dir_all("/app");
        let layer = store.commit_layer(&tree, "WORKDIR /app").unwrap();

        let mut config = ImageConfig::default();
        config.env.insert("PYTHONUNBUFFERED".into(), "1".into());
        config.working_dir = Some("/app".into());
        config.exposed_ports.insert(Port::tcp(8000));
        config.cmd = vec!["gunicorn".into()];

        let image = Image {
            id: ImageId("built".into()),
            base: BaseImage {
                reference: "python:3.12-slim".parse().unwrap(),
                id: ImageId("base".into()),
                config: ImageConfig::default(),
            },
            config,
            layers: vec![layer.clone()],
            history: vec![
                HistoryEntry {
                    created_by: "FROM python:3.12-slim".into(),
                    empty_layer: true,
                },
                HistoryEntry {
                    created_by: "WORKDIR /app".into(),
                    empty_layer: false,
                },
            ],
        };

        let bytes =
            export_docker_archive(&store, &image, "records-api", &base_archive, Vec::new()).unwrap();
        let exported = dir.path().join("out.tar");
        fs::write(&exported, &bytes).unwrap();

        let (manifest, config) = read_base(&exported).unwrap();
        assert_eq!(manifest.repo_tags, Some(vec!["records-api:latest".to_string()]));
        assert_eq!(manifest.layers.len(), 2);
        assert_eq!(manifest.layers[0], "base/layer.tar");

        assert_eq!(config["config"]["Env"], json!(["PYTHONUNBUFFERED=1"]));
        assert_eq!(config["config"]["ExposedPorts"], json!({ "8000/tcp": {} }));
        assert_eq!(config["config"]["WorkingDir"], json!("/app"));
        assert_eq!(
            config["rootfs"]["diff_ids"],
            json!(["sha256:base", layer.diff_id])
        );
        assert_eq!(config["history"].as_array().unwrap().len(), 3);
        assert_eq!(config["architecture"], json!("amd64"));
    }
}
