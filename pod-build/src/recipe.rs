use std::{
    collections::{BTreeMap as Map, BTreeSet as Set},
    fmt,
};

use crate::{
    error::RecipeError,
    models::{ImageRef, Port},
};

pub const DEFAULT_BASE_NAME: &str = "python";
pub const DEFAULT_BASE_TAG: &str = "3.12-slim";
pub const DEFAULT_WORKDIR: &str = "/app";
pub const DEFAULT_MANIFEST: &str = "pyproject.toml";
pub const DEFAULT_SOURCE: &str = "src";
pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_SERVER_CONFIG: &str = "gunicorn.conf.py";
pub const DEFAULT_APP_FACTORY: &str = "app:create_app()";

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub enum Step {
    From(ImageRef),
    Env(Map<String, String>),
    Workdir(String),
    Copy { src: Vec<String>, dest: String },
    Install { manifest: String, extras: Vec<String> },
    Expose(Port),
    Label(Map<String, String>),
    Cmd(Vec<String>),
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn pairs(map: &Map<String, String>) -> String {
            map.iter()
                .map(|(key, value)| format!("{}={}", key, value))
                .collect::<Vec<_>>()
                .join(" ")
        }

        match self {
            Step::From(image) => write!(f, "FROM {}", image),
            Step::Env(env) => write!(f, "ENV {}", pairs(env)),
            Step::Workdir(path) => write!(f, "WORKDIR {}", path),
            Step::Copy { src, dest } => write!(f, "COPY {} {}", src.join(" "), dest),
            Step::Install { manifest, extras } if extras.is_empty() => {
                write!(f, "INSTALL {}", manifest)
            }
            Step::Install { manifest, extras } => {
                write!(f, "INSTALL {}[{}]", manifest, extras.join(","))
            }
            Step::Expose(port) => write!(f, "EXPOSE {}", port),
            Step::Label(labels) => write!(f, "LABEL {}", pairs(labels)),
            Step::Cmd(cmd) => write!(f, "CMD {:?}", cmd),
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct Recipe {
    pub name: Option<String>,
    pub steps: Vec<Step>,
}

impl Recipe {
    /// The build-and-launch recipe for a WSGI application served by gunicorn:
    /// dependencies are installed from the manifest before the source tree is
    /// copied, so source-only changes reuse the dependency layer.
    pub fn default_wsgi() -> Recipe {
        let env = |pairs: &[(&str, &str)]| {
            Step::Env(
                pairs
                    .iter()
                    .map(|(key, value)| (key.to_string(), value.to_string()))
                    .collect(),
            )
        };

        Recipe {
            name: None,
            steps: vec![
                Step::From(ImageRef {
                    name: DEFAULT_BASE_NAME.into(),
                    tag: DEFAULT_BASE_TAG.into(),
                    digest: None,
                }),
                env(&[("PYTHONDONTWRITEBYTECODE", "1"), ("PYTHONUNBUFFERED", "1")]),
                Step::Workdir(DEFAULT_WORKDIR.into()),
                Step::Copy {
                    src: vec![DEFAULT_MANIFEST.into()],
                    dest: "./".into(),
                },
                Step::Install {
                    manifest: DEFAULT_MANIFEST.into(),
                    extras: Vec::new(),
                },
                Step::Copy {
                    src: vec![DEFAULT_SOURCE.into()],
                    dest: format!("./{}", DEFAULT_SOURCE),
                },
                env(&[("PYTHONPATH", "/app/src")]),
                Step::Expose(Port::tcp(DEFAULT_PORT)),
                Step::Cmd(vec![
                    "gunicorn".into(),
                    "-c".into(),
                    DEFAULT_SERVER_CONFIG.into(),
                    DEFAULT_APP_FACTORY.into(),
                ]),
            ],
        }
    }

    pub fn base(&self) -> Option<&ImageRef> {
        match self.steps.first() {
            Some(Step::From(image)) => Some(image),
            _ => None,
        }
    }

    /// Checks the ordering invariants every recipe must hold before a build
    /// is attempted. Step indices in errors are 1-based.
    pub fn validate(&self) -> Result<(), RecipeError> {
        if self.steps.is_empty() {
            return Err(RecipeError::Empty);
        }

        if self.base().is_none() {
            return Err(RecipeError::MissingFrom);
        }

        let mut workdir = "/".to_string();
        let mut staged = Set::new();

        for (index, step) in self.steps.iter().enumerate().skip(1) {
            let index = index + 1;
            match step {
                Step::From(_) => return Err(RecipeError::MultipleFrom(index)),
                Step::Workdir(path) => workdir = resolve_path(&workdir, path),
                Step::Copy { src, dest } => {
                    if src.is_empty() {
                        return Err(RecipeError::EmptyCopy(index));
                    }
                    for src in src {
                        staged.insert(copy_target(&workdir, src, dest, src_count(step)));
                    }
                }
                Step::Install { manifest, .. } => {
                    let target = resolve_path(&workdir, manifest);
                    let covered = staged
                        .iter()
                        .any(|path: &String| target == *path || is_within(&target, path));
                    if !covered {
                        return Err(RecipeError::ManifestNotStaged {
                            index,
                            manifest: manifest.clone(),
                        });
                    }
                }
                Step::Cmd(cmd) if cmd.is_empty() => return Err(RecipeError::EmptyCommand(index)),
                _ => (),
            }
        }

        Ok(())
    }

    /// Non-fatal observations about step ordering.
    pub fn lints(&self) -> Vec<String> {
        let mut lints = Vec::new();

        let mut workdir = "/".to_string();
        let mut copies = Vec::new();
        let mut manifests = Set::new();
        for (index, step) in self.steps.iter().enumerate() {
            match step {
                Step::Workdir(path) => workdir = resolve_path(&workdir, path),
                Step::Copy { src, dest } if manifests.is_empty() => {
                    let targets: Vec<String> = src
                        .iter()
                        .map(|path| copy_target(&workdir, path, dest, src.len()))
                        .collect();
                    copies.push((index, src, targets));
                }
                Step::Install { manifest, .. } => {
                    manifests.insert(resolve_path(&workdir, manifest));
                }
                _ => (),
            }
        }

        if !manifests.is_empty() {
            for (index, src, targets) in copies {
                if !targets.iter().all(|target| manifests.contains(target)) {
                    lints.push(format!(
                        "step {} copies {} before dependencies are installed, changes to it will rebuild the dependency layer",
                        index + 1,
                        src.join(" ")
                    ));
                }
            }
        }

        let cmd_count = self
            .steps
            .iter()
            .filter(|step| matches!(step, Step::Cmd(_)))
            .count();
        if cmd_count == 0 {
            lints.push("recipe does not define a default command".into());
        } else if cmd_count > 1 {
            lints.push(format!(
                "recipe defines {} default commands, only the last one takes effect",
                cmd_count
            ));
        }

        lints
    }
}

fn src_count(step: &Step) -> usize {
    match step {
        Step::Copy { src, .. } => src.len(),
        _ => 0,
    }
}

/// Resolves `path` against the absolute directory `base`, normalising `.`
/// and `..` components. The result is always absolute.
pub fn resolve_path(base: &str, path: &str) -> String {
    let joined = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("{}/{}", base, path)
    };

    let mut parts: Vec<&str> = Vec::new();
    for part in joined.split('/') {
        match part {
            "" | "." => (),
            ".." => {
                parts.pop();
            }
            part => parts.push(part),
        }
    }

    format!("/{}", parts.join("/"))
}

/// Where a copied source lands in the image. A destination ending in `/`,
/// or any destination of a multi-source copy, is a directory that receives
/// the source by its file name.
pub fn copy_target(workdir: &str, src: &str, dest: &str, sources: usize) -> String {
    let dest_is_dir = dest.ends_with('/') || dest == "." || sources > 1;
    let dest = resolve_path(workdir, dest);
    if dest_is_dir {
        let name = src
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or(src);
        resolve_path(&dest, name)
    } else {
        dest
    }
}

fn is_within(path: &str, dir: &str) -> bool {
    dir == "/" || path.starts_with(&format!("{}/", dir))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_recipe_is_valid_and_clean() {
        let recipe = Recipe::default_wsgi();
        recipe.validate().unwrap();
        assert!(recipe.lints().is_empty(), "{:?}", recipe.lints());
        assert_eq!(recipe.base().unwrap().to_string(), "python:3.12-slim");
        assert_eq!(recipe.steps.len(), 9);
    }

    #[test]
    fn resolves_paths() {
        assert_eq!(resolve_path("/", "app"), "/app");
        assert_eq!(resolve_path("/app", "./src"), "/app/src");
        assert_eq!(resolve_path("/app", "../etc/./x"), "/etc/x");
        assert_eq!(resolve_path("/app", "/opt"), "/opt");
        assert_eq!(resolve_path("/", "../.."), "/");
    }

    #[test]
    fn copy_targets_follow_directory_semantics() {
        assert_eq!(copy_target("/app", "pyproject.toml", "./", 1), "/app/pyproject.toml");
        assert_eq!(copy_target("/app", "pyproject.toml", ".", 1), "/app/pyproject.toml");
        assert_eq!(copy_target("/app", "src", "./src", 1), "/app/src");
        assert_eq!(copy_target("/app", "a/b.txt", "lib", 2), "/app/lib/b.txt");
    }

    #[test]
    fn rejects_install_before_manifest_is_staged() {
        let mut recipe = Recipe::default_wsgi();
        recipe.steps.swap(3, 4);

        match recipe.validate() {
            Err(RecipeError::ManifestNotStaged { index, manifest }) => {
                assert_eq!(index, 4);
                assert_eq!(manifest, DEFAULT_MANIFEST);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn rejects_missing_or_repeated_base() {
        let mut recipe = Recipe::default_wsgi();
        let from = recipe.steps.remove(0);
        assert!(matches!(recipe.validate(), Err(RecipeError::MissingFrom)));

        recipe.steps.insert(0, from.clone());
        recipe.steps.push(from);
        assert!(matches!(
            recipe.validate(),
            Err(RecipeError::MultipleFrom(10))
        ));

        let empty = Recipe {
            name: None,
            steps: Vec::new(),
        };
        assert!(matches!(empty.validate(), Err(RecipeError::Empty)));
    }

    #[test]
    fn lints_source_copied_before_install() {
        let mut recipe = Recipe::default_wsgi();
        let source = recipe.steps.remove(5);
        recipe.steps.insert(3, source);

        recipe.validate().unwrap();
        let lints = recipe.lints();
        assert_eq!(lints.len(), 1);
        assert!(lints[0].contains("copies src"));
    }

    #[test]
    fn lints_whole_context_copied_before_install() {
        for src in &["./", ".", "toml"] {
            let mut recipe = Recipe::default_wsgi();
            recipe.steps[3] = Step::Copy {
                src: vec![src.to_string()],
                dest: "./".into(),
            };

            let lints = recipe.lints();
            assert_eq!(lints.len(), 1, "{}: {:?}", src, lints);
            assert!(lints[0].starts_with("step 4 copies"), "{}", lints[0]);
        }
    }

    #[test]
    fn manifest_copy_is_matched_by_resolved_path() {
        let mut recipe = Recipe::default_wsgi();
        recipe.steps[3] = Step::Copy {
            src: vec!["pyproject.toml".into()],
            dest: "/app/pyproject.toml".into(),
        };
        assert!(recipe.lints().is_empty(), "{:?}", recipe.lints());

        recipe.steps[3] = Step::Copy {
            src: vec!["pyproject.toml".into()],
            dest: "/opt/".into(),
        };
        recipe.steps[4] = Step::Install {
            manifest: "/opt/pyproject.toml".into(),
            extras: Vec::new(),
        };
        recipe.validate().unwrap();
        assert!(recipe.lints().is_empty(), "{:?}", recipe.lints());
    }
}
