use log::{debug, info, warn};
use std::path::PathBuf;

use crate::{
    context::{BuildContext, LayerTree},
    error::{BuildError, RecipeError, ResolutionError, StepError},
    hasher::DigestHasher,
    manifest::{self, Manifest},
    models::{
        BaseImage, BuildPolicy, CacheKey, HistoryEntry, Image, ImageConfig, ImageId, LayerRecord,
        PullPolicy,
    },
    recipe::{copy_target, resolve_path, Recipe, Step},
    services::{BuildObserver, ImageBackend, InstallRequest, Installer, StepOutcome, StepReport},
    store::{image_id, LayerStore},
};

pub const LABEL_RECIPE_HASH: &str = "io.pod-build.recipe.hash";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BuildState {
    Pending,
    Running { step: usize },
    Built(ImageId),
    Failed { step: usize, error: String },
}

#[derive(Clone, Debug)]
pub struct BuildOutcome {
    pub tag: String,
    pub image: Image,
    pub reports: Vec<StepReport>,
}

/// What earlier steps left behind for the later ones.
struct Progress {
    base: Option<BaseImage>,
    config: ImageConfig,
    workdir: String,
    key: Option<CacheKey>,
    layers: Vec<LayerRecord>,
    history: Vec<HistoryEntry>,
    /// Image paths written by copy steps, with the host path they came from.
    staged: Vec<(String, PathBuf)>,
}

impl Progress {
    fn new() -> Progress {
        Progress {
            base: None,
            config: ImageConfig::default(),
            workdir: "/".into(),
            key: None,
            layers: Vec::new(),
            history: Vec::new(),
            staged: Vec::new(),
        }
    }

    fn host_path(&self, image_path: &str) -> Option<PathBuf> {
        self.staged.iter().rev().find_map(|(target, host)| {
            if image_path == target {
                Some(host.clone())
            } else {
                image_path
                    .strip_prefix(&format!("{}/", target.trim_end_matches('/')))
                    .map(|rest| host.join(rest))
            }
        })
    }
}

/// Runs recipes as a linear pipeline: every step runs once, in order, and
/// the first failure stops the build without tagging anything.
pub struct Builder {
    backend: Box<dyn ImageBackend>,
    installer: Box<dyn Installer>,
    store: LayerStore,
    context: BuildContext,
    build_policy: BuildPolicy,
    pull_policy: PullPolicy,
    state: BuildState,
}

impl Builder {
    pub fn init<B, I>(backend: B, installer: I, store: LayerStore, context: BuildContext) -> Builder
    where
        B: 'static + ImageBackend,
        I: 'static + Installer,
    {
        Builder {
            backend: Box::new(backend),
            installer: Box::new(installer),
            store,
            context,
            build_policy: BuildPolicy::IfChanged,
            pull_policy: PullPolicy::IfNotPresent,
            state: BuildState::Pending,
        }
    }

    pub fn build_policy(mut self, build_policy: BuildPolicy) -> Builder {
        self.build_policy = build_policy;
        self
    }

    pub fn pull_policy(mut self, pull_policy: PullPolicy) -> Builder {
        self.pull_policy = pull_policy;
        self
    }

    pub fn state(&self) -> &BuildState {
        &self.state
    }

    pub fn store(&self) -> &LayerStore {
        &self.store
    }

    pub fn build(
        &mut self,
        recipe: &Recipe,
        tag: &str,
        observer: &mut dyn BuildObserver,
    ) -> Result<BuildOutcome, BuildError> {
        self.state = BuildState::Pending;
        if let Err(error) = recipe.validate() {
            return Err(self.fail(0, error.into()));
        }

        let total = recipe.steps.len();
        let mut progress = Progress::new();
        let mut reports = Vec::with_capacity(total);

        for (index, step) in recipe.steps.iter().enumerate() {
            let index = index + 1;
            self.state = BuildState::Running { step: index };
            observer.step_started(index, total, step);

            let (key, outcome, layer) = match self.run_step(step, &mut progress) {
                Ok(result) => result,
                Err(source) => {
                    let error = BuildError::StepFailed {
                        index,
                        total,
                        instruction: step.to_string(),
                        source,
                    };
                    return Err(self.fail(index, error));
                }
            };

            if let Some(base) = &progress.base {
                if let Step::From(_) = step {
                    observer.base_resolved(base);
                }
            }

            progress.history.push(HistoryEntry {
                created_by: step.to_string(),
                empty_layer: layer.is_none(),
            });
            if let Some(layer) = &layer {
                progress.layers.push(layer.clone());
            }
            progress.key = Some(key.clone());

            let report = StepReport {
                index,
                total,
                step: step.clone(),
                key,
                outcome,
                layer,
            };
            observer.step_finished(&report);
            reports.push(report);
        }

        let mut config = progress.config;
        let mut hasher = blake3::Hasher::new();
        hasher.input(recipe);
        config
            .labels
            .insert(LABEL_RECIPE_HASH.into(), hasher.finalize().to_hex().to_string());

        let base = match progress.base {
            Some(base) => base,
            None => return Err(self.fail(0, RecipeError::MissingFrom.into())),
        };

        let mut image = Image {
            id: ImageId(String::new()),
            base,
            config,
            layers: progress.layers,
            history: progress.history,
        };

        let tagged = image_id(&image).and_then(|id| {
            image.id = id;
            self.store.tag_image(tag, &image)
        });
        if let Err(source) = tagged {
            let error = BuildError::Tag {
                tag: tag.into(),
                source,
            };
            return Err(self.fail(total, error));
        }

        self.state = BuildState::Built(image.id.clone());
        observer.finished(&image.id, &image.config);

        Ok(BuildOutcome {
            tag: tag.into(),
            image,
            reports,
        })
    }

    /// Records `error` as the terminal state. Step 0 means the build failed
    /// before any step ran.
    fn fail(&mut self, step: usize, error: BuildError) -> BuildError {
        warn!("{}", error);
        self.state = BuildState::Failed {
            step,
            error: error.to_string(),
        };
        error
    }

    fn run_step(
        &mut self,
        step: &Step,
        progress: &mut Progress,
    ) -> Result<(CacheKey, StepOutcome, Option<LayerRecord>), StepError> {
        match step {
            Step::From(reference) => {
                let mut pulled = false;
                if self.pull_policy == PullPolicy::Always {
                    self.backend.pull_image(reference)?;
                    pulled = true;
                }

                let base = match self.backend.get_image(reference)? {
                    Some(base) => base,
                    None if !pulled => {
                        info!("base image {} not present, pulling", reference);
                        self.backend.pull_image(reference)?;
                        pulled = true;
                        self.backend
                            .get_image(reference)?
                            .ok_or_else(|| ResolutionError::BaseImageNotFound(reference.clone()))?
                    }
                    None => return Err(ResolutionError::BaseImageNotFound(reference.clone()).into()),
                };
                debug!("resolved base image {} to {}", reference, base.id.0);

                let key = chain_key(None, step, &[base.id.0.as_str()]);
                progress.config = base.config.clone();
                progress.workdir = base
                    .config
                    .working_dir
                    .clone()
                    .filter(|dir| !dir.is_empty())
                    .unwrap_or_else(|| "/".into());
                progress.base = Some(base);

                let outcome = if pulled {
                    StepOutcome::Pulled
                } else {
                    StepOutcome::Metadata
                };
                Ok((key, outcome, None))
            }
            Step::Env(env) => {
                progress
                    .config
                    .env
                    .extend(env.iter().map(|(key, value)| (key.clone(), value.clone())));
                Ok((chain_key(progress.key.as_ref(), step, &[]), StepOutcome::Metadata, None))
            }
            Step::Workdir(path) => {
                progress.workdir = resolve_path(&progress.workdir, path);
                progress.config.working_dir = Some(progress.workdir.clone());

                let mut tree = LayerTree::new();
                tree.add_dir_all(&progress.workdir);
                self.commit(step, progress, tree)
            }
            Step::Copy { src, dest } => {
                let tree = self.context.stage(&progress.workdir, src, dest)?;
                for source in src {
                    let target = copy_target(&progress.workdir, source, dest, src.len());
                    let host = self.context.resolve(source)?;
                    progress.staged.push((target, host));
                }
                self.commit(step, progress, tree)
            }
            Step::Install { manifest, extras } => self.install(step, progress, manifest, extras),
            Step::Expose(port) => {
                progress.config.exposed_ports.insert(*port);
                Ok((chain_key(progress.key.as_ref(), step, &[]), StepOutcome::Metadata, None))
            }
            Step::Label(labels) => {
                progress
                    .config
                    .labels
                    .extend(labels.iter().map(|(key, value)| (key.clone(), value.clone())));
                Ok((chain_key(progress.key.as_ref(), step, &[]), StepOutcome::Metadata, None))
            }
            Step::Cmd(cmd) => {
                progress.config.cmd = cmd.clone();
                Ok((chain_key(progress.key.as_ref(), step, &[]), StepOutcome::Metadata, None))
            }
        }
    }

    /// Stores a layer produced directly from files, keyed by its own digest.
    fn commit(
        &mut self,
        step: &Step,
        progress: &Progress,
        tree: LayerTree,
    ) -> Result<(CacheKey, StepOutcome, Option<LayerRecord>), StepError> {
        if tree.is_empty() {
            return Ok((chain_key(progress.key.as_ref(), step, &[]), StepOutcome::Metadata, None));
        }

        let layer = self.store.commit_layer(&tree, &step.to_string())?;
        let key = chain_key(progress.key.as_ref(), step, &[layer.digest.0.as_str()]);

        let outcome = match self.store.cached_layer(&key)? {
            Some(_) if self.build_policy == BuildPolicy::IfChanged => StepOutcome::Cached,
            _ => {
                self.store.cache_layer(&key, &layer)?;
                StepOutcome::Built
            }
        };

        Ok((key, outcome, Some(layer)))
    }

    fn install(
        &mut self,
        step: &Step,
        progress: &Progress,
        manifest_path: &str,
        extras: &[String],
    ) -> Result<(CacheKey, StepOutcome, Option<LayerRecord>), StepError> {
        let target = resolve_path(&progress.workdir, manifest_path);
        let host = progress
            .host_path(&target)
            .ok_or_else(|| ResolutionError::Read {
                path: PathBuf::from(&target),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "manifest was not staged by an earlier step",
                ),
            })?;

        let manifest = manifest::load(&host, extras)?;
        let requirements = manifest.install_args();
        let inputs = requirements.iter().map(String::as_str).collect::<Vec<_>>();
        let key = chain_key(progress.key.as_ref(), step, &inputs);

        if requirements.is_empty() {
            info!("{:?} declares no dependencies", host);
            return Ok((key, StepOutcome::Metadata, None));
        }

        if self.build_policy == BuildPolicy::IfChanged {
            if let Some(layer) = self.store.cached_layer(&key)? {
                debug!("reusing dependency layer {}", layer.digest);
                return Ok((key, StepOutcome::Cached, Some(layer)));
            }
        }

        let base = progress
            .base
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("no base image selected"))?;

        let scratch = self.store.temp_dir()?;
        let request = InstallRequest {
            image: base.id.0.clone(),
            env: progress.config.env_list(),
            working_dir: progress.workdir.clone(),
            requirements,
            root: scratch.path().to_path_buf(),
        };

        info!(
            "installing {} requirements from {:?}",
            request.requirements.len(),
            host
        );
        self.installer
            .install(&request)
            .map_err(|err| ResolutionError::InstallFailed(format!("{:#}", err)))?;

        let tree = LayerTree::from_dir(scratch.path())?;
        let layer = self.store.commit_layer(&tree, &step.to_string())?;
        self.store.cache_layer(&key, &layer)?;

        Ok((key, StepOutcome::Built, Some(layer)))
    }
}

/// Verifies a recipe without building it: every copy source must be in the
/// context and every manifest must resolve. Returns the resolved manifests.
pub fn preflight(recipe: &Recipe, context: &BuildContext) -> Result<Vec<Manifest>, BuildError> {
    recipe.validate()?;

    let total = recipe.steps.len();
    let mut progress = Progress::new();
    let mut manifests = Vec::new();

    for (index, step) in recipe.steps.iter().enumerate() {
        let checked: Result<(), StepError> = match step {
            Step::Workdir(path) => {
                progress.workdir = resolve_path(&progress.workdir, path);
                Ok(())
            }
            Step::Copy { src, dest } => context.stage(&progress.workdir, src, dest).map(|_| {
                for source in src {
                    let target = copy_target(&progress.workdir, source, dest, src.len());
                    progress.staged.push((target, context.root().join(source)));
                }
            }).map_err(StepError::from),
            Step::Install { manifest, extras } => {
                let target = resolve_path(&progress.workdir, manifest);
                match progress.host_path(&target) {
                    Some(host) => manifest::load(&host, extras)
                        .map(|manifest| manifests.push(manifest))
                        .map_err(StepError::from),
                    None => Err(StepError::from(ResolutionError::Read {
                        path: PathBuf::from(&target),
                        source: std::io::Error::new(
                            std::io::ErrorKind::NotFound,
                            "manifest was not staged by an earlier step",
                        ),
                    })),
                }
            }
            _ => Ok(()),
        };

        checked.map_err(|source| BuildError::StepFailed {
            index: index + 1,
            total,
            instruction: step.to_string(),
            source,
        })?;
    }

    Ok(manifests)
}

/// Cache key of a step: its predecessor's key, the step itself and whatever
/// content the step consumes.
pub fn chain_key(parent: Option<&CacheKey>, step: &Step, inputs: &[&str]) -> CacheKey {
    let mut hasher = blake3::Hasher::new();
    hasher.input(parent);
    hasher.input(step);
    hasher.input(inputs);
    CacheKey(hasher.finalize().to_hex().to_string())
}
