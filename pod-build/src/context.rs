use ignore::{
    gitignore::{Gitignore, GitignoreBuilder},
    WalkBuilder,
};
use log::debug;
use std::{
    collections::BTreeMap as Map,
    ffi::OsString,
    fs::{self, File, Metadata},
    io::{self, Write},
    path::{Path, PathBuf},
};
use tar::{Builder as TarBuilder, EntryType, Header};

use crate::{
    error::StagingError,
    recipe::{copy_target, resolve_path},
};

const IGNORE_FILES: &[&str] = &[".containerignore", ".dockerignore"];

#[derive(Clone, Debug, PartialEq, Eq)]
enum LayerSource {
    Directory,
    File(PathBuf),
    Symlink(PathBuf),
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct LayerEntry {
    mode: u32,
    source: LayerSource,
}

/// Decides which entries of the build context are never staged: matches of
/// the context's ignore file, entries with an excluded file name, and
/// everything below an excluded directory.
#[derive(Clone, Debug, Default)]
pub struct ContextFilter {
    root: PathBuf,
    ignore: Option<Gitignore>,
    names: Vec<OsString>,
    paths: Vec<PathBuf>,
}

impl ContextFilter {
    /// Reads `.containerignore`, or failing that `.dockerignore`, from the
    /// top of `root`. Ignore files anywhere else are plain files.
    fn load(root: &Path) -> Result<ContextFilter, StagingError> {
        let mut filter = ContextFilter {
            root: root.to_path_buf(),
            ..ContextFilter::default()
        };

        if let Some(path) = IGNORE_FILES
            .iter()
            .map(|name| root.join(name))
            .find(|path| path.is_file())
        {
            let mut builder = GitignoreBuilder::new(root);
            if let Some(err) = builder.add(&path) {
                return Err(err.into());
            }
            filter.ignore = Some(builder.build()?);
            debug!("using ignore file {:?}", path);
        }

        Ok(filter)
    }

    pub fn excludes(&self, path: &Path, is_dir: bool) -> bool {
        if let Some(name) = path.file_name() {
            if self.names.iter().any(|excluded| excluded.as_os_str() == name) {
                return true;
            }
        }

        if self.paths.iter().any(|excluded| path.starts_with(excluded)) {
            return true;
        }

        match &self.ignore {
            Some(ignore) if path.starts_with(&self.root) && path != self.root => ignore
                .matched_path_or_any_parents(path, is_dir)
                .is_ignore(),
            _ => false,
        }
    }
}

/// The files of one layer, keyed by their path inside the image. Entries are
/// written in path order with zeroed ownership and timestamps, so the same
/// tree always produces the same tarball.
#[derive(Clone, Debug, Default)]
pub struct LayerTree {
    entries: Map<String, LayerEntry>,
}

impl LayerTree {
    pub fn new() -> LayerTree {
        LayerTree::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(|path| path.as_str())
    }

    /// Adds `path` and every missing parent as directories.
    pub fn add_dir_all(&mut self, path: &str) {
        let mut current = String::new();
        for part in path.split('/').filter(|part| !part.is_empty()) {
            if !current.is_empty() {
                current.push('/');
            }
            current.push_str(part);

            self.entries.entry(current.clone()).or_insert(LayerEntry {
                mode: 0o755,
                source: LayerSource::Directory,
            });
        }
    }

    fn insert(&mut self, path: &str, metadata: &Metadata, source: LayerSource) {
        let path = path.trim_start_matches('/');
        if let Some((parent, _)) = path.rsplit_once('/') {
            self.add_dir_all(parent);
        }

        self.entries.insert(
            path.to_string(),
            LayerEntry {
                mode: permissions(metadata, &source),
                source,
            },
        );
    }

    /// Adds the file or directory at `host_path` under `target`.
    pub fn add_path(
        &mut self,
        host_path: &Path,
        target: &str,
        filter: &ContextFilter,
    ) -> Result<(), StagingError> {
        let metadata = fs::symlink_metadata(host_path)?;

        if !metadata.is_dir() {
            let source = source_for(host_path, &metadata)?;
            self.insert(target, &metadata, source);
            return Ok(());
        }

        let filter = filter.clone();
        let walk = WalkBuilder::new(host_path)
            .standard_filters(false)
            .filter_entry(move |entry| {
                let is_dir = entry.file_type().map(|ty| ty.is_dir()).unwrap_or(false);
                !filter.excludes(entry.path(), is_dir)
            })
            .build();

        for result in walk {
            let entry = result?;
            let relative = entry
                .path()
                .strip_prefix(host_path)
                .map_err(|_| StagingError::OutsideContext(entry.path().display().to_string()))?;

            let relative = relative.to_string_lossy();
            let path = if relative.is_empty() {
                target.to_string()
            } else {
                format!("{}/{}", target.trim_end_matches('/'), relative)
            };

            let metadata = fs::symlink_metadata(entry.path())?;
            let source = source_for(entry.path(), &metadata)?;
            self.insert(&path, &metadata, source);
        }

        Ok(())
    }

    /// Captures everything below `root` as if `root` were `/`.
    pub fn from_dir(root: &Path) -> Result<LayerTree, StagingError> {
        let mut tree = LayerTree::new();

        let walk = WalkBuilder::new(root).standard_filters(false).build();
        for result in walk {
            let entry = result?;
            if entry.path() == root {
                continue;
            }

            let relative = entry
                .path()
                .strip_prefix(root)
                .map_err(|_| StagingError::OutsideContext(entry.path().display().to_string()))?;
            let metadata = fs::symlink_metadata(entry.path())?;
            let source = source_for(entry.path(), &metadata)?;
            tree.insert(&relative.to_string_lossy(), &metadata, source);
        }

        Ok(tree)
    }

    pub fn write<W: Write>(&self, writer: W) -> io::Result<W> {
        let mut tar = TarBuilder::new(writer);

        for (path, entry) in self.entries.iter() {
            let mut header = Header::new_gnu();
            header.set_mtime(0);
            header.set_uid(0);
            header.set_gid(0);
            header.set_mode(entry.mode);

            match &entry.source {
                LayerSource::Directory => {
                    header.set_entry_type(EntryType::Directory);
                    header.set_size(0);
                    tar.append_data(&mut header, path, io::empty())?;
                }
                LayerSource::File(host_path) => {
                    let file = File::open(host_path)?;
                    header.set_entry_type(EntryType::Regular);
                    header.set_size(file.metadata()?.len());
                    tar.append_data(&mut header, path, file)?;
                }
                LayerSource::Symlink(link_target) => {
                    header.set_entry_type(EntryType::Symlink);
                    header.set_size(0);
                    tar.append_link(&mut header, path, link_target)?;
                }
            }
        }

        tar.into_inner()
    }
}

fn source_for(path: &Path, metadata: &Metadata) -> io::Result<LayerSource> {
    let file_type = metadata.file_type();
    if file_type.is_dir() {
        Ok(LayerSource::Directory)
    } else if file_type.is_symlink() {
        Ok(LayerSource::Symlink(fs::read_link(path)?))
    } else {
        Ok(LayerSource::File(path.to_path_buf()))
    }
}

/// Canonical form of `path`, resolving symlinks in the part that exists.
fn absolute(path: &Path) -> PathBuf {
    let path = if path.is_relative() {
        match std::env::current_dir() {
            Ok(dir) => dir.join(path),
            Err(_) => path.to_path_buf(),
        }
    } else {
        path.to_path_buf()
    };

    let mut missing = Vec::new();
    let mut existing = path.as_path();
    loop {
        if let Ok(canonical) = existing.canonicalize() {
            return missing
                .iter()
                .rev()
                .fold(canonical, |acc: PathBuf, part| acc.join(part));
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                missing.push(name.to_os_string());
                existing = parent;
            }
            _ => return path.clone(),
        }
    }
}

/// True when `..` components climb above the directory the path starts in.
fn escapes(path: &str) -> bool {
    let mut depth = 0usize;
    for part in path.split('/') {
        match part {
            "" | "." => (),
            ".." if depth == 0 => return true,
            ".." => depth -= 1,
            _ => depth += 1,
        }
    }
    false
}

#[cfg(unix)]
fn permissions(metadata: &Metadata, _source: &LayerSource) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn permissions(_metadata: &Metadata, source: &LayerSource) -> u32 {
    match source {
        LayerSource::Directory => 0o755,
        _ => 0o644,
    }
}

/// The directory tree a recipe copies its sources from.
#[derive(Clone, Debug)]
pub struct BuildContext {
    root: PathBuf,
    filter: ContextFilter,
}

impl BuildContext {
    pub fn new<P: AsRef<Path>>(root: P) -> Result<BuildContext, StagingError> {
        let root = root.as_ref();
        let root = root
            .canonicalize()
            .map_err(|_| StagingError::MissingSource(root.to_path_buf()))?;

        let filter = ContextFilter::load(&root)?;
        Ok(BuildContext { root, filter })
    }

    /// Never stage entries with this file name, wherever they appear.
    pub fn exclude<S: Into<OsString>>(mut self, name: S) -> BuildContext {
        self.filter.names.push(name.into());
        self
    }

    /// Never stage `path` or anything below it. Paths outside the context
    /// are ignored. `path` does not have to exist yet.
    pub fn exclude_path<P: AsRef<Path>>(mut self, path: P) -> BuildContext {
        let path = absolute(path.as_ref());
        if path.starts_with(&self.root) {
            debug!("excluding {:?} from the build context", path);
            self.filter.paths.push(path);
        }
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps a recipe source path to the host path it names. Sources must
    /// exist and must not leave the context.
    pub fn resolve(&self, src: &str) -> Result<PathBuf, StagingError> {
        if src.starts_with('/') {
            return Err(StagingError::OutsideContext(src.into()));
        }

        if escapes(src) {
            return Err(StagingError::OutsideContext(src.into()));
        }

        let normalized = resolve_path("/", src);
        let path = self.root.join(normalized.trim_start_matches('/'));
        if fs::symlink_metadata(&path).is_err() {
            return Err(StagingError::MissingSource(path));
        }

        let canonical = path.canonicalize()?;
        if !canonical.starts_with(&self.root) {
            return Err(StagingError::OutsideContext(src.into()));
        }

        Ok(path)
    }

    /// Collects the layer produced by copying `sources` to `dest` with
    /// `workdir` as the current directory.
    pub fn stage(
        &self,
        workdir: &str,
        sources: &[String],
        dest: &str,
    ) -> Result<LayerTree, StagingError> {
        let mut tree = LayerTree::new();

        for src in sources {
            let host_path = self.resolve(src)?;
            let target = copy_target(workdir, src, dest, sources.len());
            debug!("staging {:?} as {}", host_path, target);
            tree.add_path(&host_path, &target, &self.filter)?;
        }

        Ok(tree)
    }
}
