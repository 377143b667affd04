use anyhow::Result;
use std::path::{Path, PathBuf};

use crate::{
    models::{BaseImage, CacheKey, ImageConfig, ImageId, ImageRef, LayerRecord},
    recipe::{Recipe, Step},
};

pub trait RecipeFrontend {
    fn recipe(&mut self, recipe_path: &Path) -> Result<Recipe>;
}

pub trait ImageBackend {
    fn get_image(&mut self, reference: &ImageRef) -> Result<Option<BaseImage>>;

    fn pull_image(&mut self, reference: &ImageRef) -> Result<()>;

    /// Writes the image `id` as a docker-archive tarball to `destination`.
    fn save_image(&mut self, id: &ImageId, destination: &Path) -> Result<()>;

    fn load_image(&mut self, archive: &Path) -> Result<ImageId>;

    fn run_image(&mut self, request: &RunRequest) -> Result<i32>;
}

/// Everything an installer needs to install dependencies into a scratch root.
#[derive(Clone, Debug)]
pub struct InstallRequest {
    /// Id of the base image the installer runs in.
    pub image: String,
    /// Environment in effect at the install step.
    pub env: Vec<String>,
    pub working_dir: String,
    pub requirements: Vec<String>,
    /// Host directory standing in for `/` of the image.
    pub root: PathBuf,
}

pub trait Installer {
    /// Installs every requirement below `request.root`. Any failure must be
    /// reported as an error, nothing is retried.
    fn install(&mut self, request: &InstallRequest) -> Result<()>;
}

#[derive(Clone, Debug)]
pub struct RunRequest {
    pub image: String,
    pub publish: Vec<String>,
    pub env_file: Option<PathBuf>,
    pub command: Vec<String>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StepOutcome {
    Metadata,
    Pulled,
    Built,
    Cached,
}

#[derive(Clone, Debug)]
pub struct StepReport {
    pub index: usize,
    pub total: usize,
    pub step: Step,
    pub key: CacheKey,
    pub outcome: StepOutcome,
    pub layer: Option<LayerRecord>,
}

/// Receives progress while a recipe is built.
pub trait BuildObserver {
    fn step_started(&mut self, _index: usize, _total: usize, _step: &Step) {}

    fn step_finished(&mut self, _report: &StepReport) {}

    fn base_resolved(&mut self, _base: &BaseImage) {}

    fn finished(&mut self, _image: &ImageId, _config: &ImageConfig) {}
}

impl BuildObserver for () {}
