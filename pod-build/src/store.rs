use anyhow::{anyhow, Context, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};
use tempfile::NamedTempFile;

use crate::{
    context::LayerTree,
    hasher::{blake3_digest, HashingWriter},
    models::{CacheKey, Digest, Image, ImageId, LayerRecord},
};

pub const STORE_DIR_NAME: &str = ".pod-build";

const BLOBS_DIR: &str = "blobs";
const CACHE_DIR: &str = "cache";
const IMAGES_DIR: &str = "images";
const TMP_DIR: &str = "tmp";

#[derive(Debug, Serialize, Deserialize)]
struct CacheEntry {
    key: CacheKey,
    layer: LayerRecord,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaggedImage {
    pub tag: String,
    pub image: Image,
}

/// Content-addressed storage for layer blobs, the layer cache index and
/// tagged images. Every file is written to `tmp/` first and renamed into
/// place, so readers never observe partial blobs or tags.
pub struct LayerStore {
    root: PathBuf,
}

impl LayerStore {
    pub fn open<P: AsRef<Path>>(root: P) -> Result<LayerStore> {
        let root = root.as_ref().to_path_buf();
        for dir in &[BLOBS_DIR, CACHE_DIR, IMAGES_DIR, TMP_DIR] {
            fs::create_dir_all(root.join(dir))
                .with_context(|| format!("could not create store directory {:?}", root.join(dir)))?;
        }
        debug!("opened layer store at {:?}", root);

        Ok(LayerStore { root })
    }

    pub fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.root.join(BLOBS_DIR).join(digest.hex())
    }

    pub fn has_blob(&self, digest: &Digest) -> bool {
        self.blob_path(digest).is_file()
    }

    /// Writes `tree` as a layer blob and returns its record.
    pub fn commit_layer(&self, tree: &LayerTree, created_by: &str) -> Result<LayerRecord> {
        let temp = NamedTempFile::new_in(self.root.join(TMP_DIR))?;
        let writer = HashingWriter::new(BufWriter::new(temp));
        let writer = tree.write(writer)?;
        let (buffered, digest, diff_id, size) = writer.finish();

        let temp = buffered
            .into_inner()
            .map_err(|err| anyhow!("could not flush layer: {}", err.error()))?;

        let path = self.blob_path(&digest);
        if path.is_file() {
            debug!("layer {} already stored", digest);
        } else {
            temp.persist(&path)
                .with_context(|| format!("could not store layer {}", digest))?;
            debug!("stored layer {} with {} entries", digest, tree.len());
        }

        Ok(LayerRecord {
            digest,
            diff_id,
            size,
            created_by: created_by.into(),
        })
    }

    fn cache_path(&self, key: &CacheKey) -> PathBuf {
        self.root.join(CACHE_DIR).join(format!("{}.json", key.0))
    }

    /// Looks up the layer recorded for `key`. Entries whose blob has gone
    /// missing are treated as misses.
    pub fn cached_layer(&self, key: &CacheKey) -> Result<Option<LayerRecord>> {
        let path = self.cache_path(key);
        if !path.is_file() {
            return Ok(None);
        }

        let entry: CacheEntry = serde_json::from_reader(File::open(&path)?)
            .with_context(|| format!("corrupt cache entry {:?}", path))?;

        if !self.has_blob(&entry.layer.digest) {
            debug!("cache entry {} points at a missing blob", key.0);
            return Ok(None);
        }

        Ok(Some(entry.layer))
    }

    pub fn cache_layer(&self, key: &CacheKey, layer: &LayerRecord) -> Result<()> {
        let entry = CacheEntry {
            key: key.clone(),
            layer: layer.clone(),
        };
        self.write_json(&self.cache_path(key), &entry)
    }

    fn image_path(&self, tag: &str) -> PathBuf {
        let file_name = tag
            .chars()
            .map(|c| match c {
                '/' | ':' | '@' => '_',
                c => c,
            })
            .collect::<String>();
        let hash = blake3_digest(tag.as_bytes());

        self.root
            .join(IMAGES_DIR)
            .join(format!("{}-{}.json", file_name, &hash.hex()[..12]))
    }

    /// Records `image` under `tag`, replacing any image previously tagged so.
    pub fn tag_image(&self, tag: &str, image: &Image) -> Result<()> {
        let tagged = TaggedImage {
            tag: tag.into(),
            image: image.clone(),
        };
        self.write_json(&self.image_path(tag), &tagged)?;
        info!("tagged {} as {}", image.id.0, tag);

        Ok(())
    }

    pub fn image(&self, tag: &str) -> Result<Option<Image>> {
        let path = self.image_path(tag);
        if !path.is_file() {
            return Ok(None);
        }

        let tagged: TaggedImage = serde_json::from_reader(File::open(&path)?)
            .with_context(|| format!("corrupt image record {:?}", path))?;

        Ok(Some(tagged.image))
    }

    pub fn images(&self) -> Result<Vec<TaggedImage>> {
        let mut images = Vec::new();

        for entry in fs::read_dir(self.root.join(IMAGES_DIR))? {
            let path = entry?.path();
            if path.extension().map(|ext| ext == "json").unwrap_or(false) {
                let tagged: TaggedImage = serde_json::from_reader(File::open(&path)?)
                    .with_context(|| format!("corrupt image record {:?}", path))?;
                images.push(tagged);
            }
        }

        images.sort_by(|a, b| a.tag.cmp(&b.tag));
        Ok(images)
    }

    pub fn temp_dir(&self) -> Result<tempfile::TempDir> {
        Ok(tempfile::Builder::new()
            .prefix("scratch")
            .tempdir_in(self.root.join(TMP_DIR))?)
    }

    fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        let mut temp = NamedTempFile::new_in(self.root.join(TMP_DIR))?;
        serde_json::to_writer_pretty(&mut temp, value)?;
        temp.flush()?;
        temp.persist(path)
            .with_context(|| format!("could not write {:?}", path))?;

        Ok(())
    }
}

/// Content address of an image: the blake3 digest of its layers and config.
pub fn image_id(image: &Image) -> Result<ImageId> {
    let canonical = serde_json::to_vec(&(&image.base.id, &image.config, &image.layers))?;
    Ok(ImageId(blake3_digest(&canonical).hex().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        context::ContextFilter,
        models::{BaseImage, ImageConfig},
    };
    use std::fs;
    use tempfile::tempdir;

    fn tree_with(dir: &Path, name: &str, contents: &str) -> LayerTree {
        let file = dir.join(name);
        fs::write(&file, contents).unwrap();
        let mut tree = LayerTree::new();
        tree.add_path(&file, &format!("/app/{}", name), &ContextFilter::default())
            .unwrap();
        tree
    }

    fn image(layers: Vec<LayerRecord>) -> Image {
        let mut image = Image {
            id: ImageId(String::new()),
            base: BaseImage {
                reference: "python:3.12-slim".parse().unwrap(),
                id: ImageId("base".into()),
                config: ImageConfig::default(),
            },
            config: ImageConfig::default(),
            layers,
            history: Vec::new(),
        };
        image.id = image_id(&image).unwrap();
        image
    }

    #[test]
    fn commits_layers_by_content() {
        let dir = tempdir().unwrap();
        let store = LayerStore::open(dir.path().join("store")).unwrap();

        let first = store
            .commit_layer(&tree_with(dir.path(), "a.txt", "same"), "COPY a.txt")
            .unwrap();
        let second = store
            .commit_layer(&tree_with(dir.path(), "a.txt", "same"), "COPY a.txt")
            .unwrap();
        let third = store
            .commit_layer(&tree_with(dir.path(), "a.txt", "changed"), "COPY a.txt")
            .unwrap();

        assert_eq!(first.digest, second.digest);
        assert_ne!(first.digest, third.digest);
        assert!(first.diff_id.starts_with("sha256:"));
        assert_eq!(fs::metadata(store.blob_path(&first.digest)).unwrap().len(), first.size);
    }

    #[test]
    fn cache_misses_when_blob_is_gone() {
        let dir = tempdir().unwrap();
        let store = LayerStore::open(dir.path().join("store")).unwrap();
        let layer = store
            .commit_layer(&tree_with(dir.path(), "a.txt", "x"), "COPY a.txt")
            .unwrap();
        let key = CacheKey("k1".into());

        assert_eq!(store.cached_layer(&key).unwrap(), None);
        store.cache_layer(&key, &layer).unwrap();
        assert_eq!(store.cached_layer(&key).unwrap(), Some(layer.clone()));

        fs::remove_file(store.blob_path(&layer.digest)).unwrap();
        assert_eq!(store.cached_layer(&key).unwrap(), None);
    }

    #[test]
    fn tags_replace_previous_images() {
        let dir = tempdir().unwrap();
        let store = LayerStore::open(dir.path()).unwrap();
        let layer = store
            .commit_layer(&tree_with(dir.path(), "a.txt", "x"), "COPY a.txt")
            .unwrap();

        let first = image(Vec::new());
        let second = image(vec![layer]);
        assert_ne!(first.id, second.id);

        store.tag_image("records-api:latest", &first).unwrap();
        store.tag_image("records-api:latest", &second).unwrap();

        assert_eq!(store.image("records-api:latest").unwrap(), Some(second));
        assert_eq!(store.image("other:latest").unwrap(), None);
        assert_eq!(store.images().unwrap().len(), 1);
    }
}
