use std::{io, path::PathBuf};
use thiserror::Error;

use crate::models::ImageRef;

/// Problems with the recipe itself, found before any step runs.
#[derive(Debug, Error)]
pub enum RecipeError {
    #[error("could not parse recipe {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("recipe has no steps")]
    Empty,
    #[error("the first step must select a base image")]
    MissingFrom,
    #[error("step {0} selects a second base image, multi-stage recipes are not supported")]
    MultipleFrom(usize),
    #[error("invalid image reference {0:?}")]
    InvalidImageRef(String),
    #[error("invalid port {0:?}")]
    InvalidPort(String),
    #[error("step {0} has an empty command")]
    EmptyCommand(usize),
    #[error("step {0} copies nothing")]
    EmptyCopy(usize),
    #[error("step {index} installs from {manifest:?}, which no earlier step copied into the image")]
    ManifestNotStaged { index: usize, manifest: String },
}

/// The dependency manifest could not be turned into an installed layer.
#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error("could not read manifest {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("could not parse manifest {path:?}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("manifest {0:?} does not declare a dependency list")]
    MissingDependencies(PathBuf),
    #[error("manifest {path:?} has no optional dependency group {extra:?}")]
    UnknownExtra { path: PathBuf, extra: String },
    #[error("invalid requirement {requirement:?}: {reason}")]
    InvalidRequirement {
        requirement: String,
        reason: &'static str,
    },
    #[error("base image {0} is not available")]
    BaseImageNotFound(ImageRef),
    #[error("installing dependencies failed: {0}")]
    InstallFailed(String),
}

/// A copy step referenced something the build context cannot provide.
#[derive(Debug, Error)]
pub enum StagingError {
    #[error("{0:?} does not exist in the build context")]
    MissingSource(PathBuf),
    #[error("{0:?} is outside the build context")]
    OutsideContext(String),
    #[error("could not walk the build context: {0}")]
    Walk(#[from] ignore::Error),
    #[error("io error while staging: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum StepError {
    #[error(transparent)]
    Resolution(#[from] ResolutionError),
    #[error(transparent)]
    Staging(#[from] StagingError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Recipe(#[from] RecipeError),
    #[error("step {index}/{total} `{instruction}` failed: {source}")]
    StepFailed {
        index: usize,
        total: usize,
        instruction: String,
        #[source]
        source: StepError,
    },
    #[error("could not tag image {tag:?}: {source}")]
    Tag {
        tag: String,
        #[source]
        source: anyhow::Error,
    },
}
