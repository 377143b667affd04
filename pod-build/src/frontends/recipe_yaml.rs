use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap as Map, fs, path::Path};

use crate::{
    error::RecipeError,
    models::{ImageRef, Port},
    recipe::{Recipe, Step},
    services::RecipeFrontend,
};

pub const RECIPE_FILE_NAMES: &[&str] = &["pod-build.yaml", "pod-build.yml"];

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RecipeFile {
    #[serde(default)]
    name: Option<String>,
    from: String,
    #[serde(default)]
    steps: Vec<StepDef>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum StepDef {
    Env(MapList),
    Workdir(String),
    Copy(CopyDef),
    Install(InstallDef),
    Expose(PortDef),
    Label(MapList),
    Cmd(CommandDef),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum CopyDef {
    /// `src... dest`, split on whitespace.
    Short(String),
    Extended {
        #[serde(default)]
        src: Sources,
        dest: String,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum Sources {
    One(String),
    Many(Vec<String>),
}

impl Default for Sources {
    fn default() -> Self {
        Sources::Many(Vec::new())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum InstallDef {
    Short(String),
    Extended {
        manifest: String,
        #[serde(default)]
        extras: Vec<String>,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum PortDef {
    Number(u16),
    Text(String),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum CommandDef {
    Exec(Vec<String>),
    Shell(String),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum MapList {
    Map(Map<String, String>),
    List(Vec<String>),
}

impl MapList {
    pub fn to_map(self) -> Map<String, String> {
        match self {
            MapList::Map(map) => map,
            MapList::List(list) => list.into_iter().map(MapList::split_value).collect(),
        }
    }

    fn split_value(value: String) -> (String, String) {
        match value.split_once('=') {
            Some((key, value)) => (key.into(), value.into()),
            None => (value, "".into()),
        }
    }
}

impl StepDef {
    fn into_step(self) -> Result<Step, RecipeError> {
        let step = match self {
            StepDef::Env(env) => Step::Env(env.to_map()),
            StepDef::Workdir(path) => Step::Workdir(path),
            StepDef::Copy(CopyDef::Short(line)) => {
                let mut parts = line.split_whitespace().map(String::from).collect::<Vec<_>>();
                let dest = parts.pop().unwrap_or_default();
                Step::Copy { src: parts, dest }
            }
            StepDef::Copy(CopyDef::Extended { src, dest }) => {
                let src = match src {
                    Sources::One(src) => vec![src],
                    Sources::Many(src) => src,
                };
                Step::Copy { src, dest }
            }
            StepDef::Install(InstallDef::Short(manifest)) => Step::Install {
                manifest,
                extras: Vec::new(),
            },
            StepDef::Install(InstallDef::Extended { manifest, extras }) => {
                Step::Install { manifest, extras }
            }
            StepDef::Expose(PortDef::Number(number)) => {
                Step::Expose(number.to_string().parse::<Port>()?)
            }
            StepDef::Expose(PortDef::Text(text)) => Step::Expose(text.parse()?),
            StepDef::Label(labels) => Step::Label(labels.to_map()),
            StepDef::Cmd(CommandDef::Exec(args)) => Step::Cmd(args),
            StepDef::Cmd(CommandDef::Shell(line)) => {
                Step::Cmd(vec!["/bin/sh".into(), "-c".into(), line])
            }
        };

        Ok(step)
    }

    fn from_step(step: &Step) -> Option<StepDef> {
        let def = match step {
            Step::From(_) => return None,
            Step::Env(env) => StepDef::Env(MapList::Map(env.clone())),
            Step::Workdir(path) => StepDef::Workdir(path.clone()),
            Step::Copy { src, dest } if src.len() == 1 => StepDef::Copy(CopyDef::Extended {
                src: Sources::One(src[0].clone()),
                dest: dest.clone(),
            }),
            Step::Copy { src, dest } => StepDef::Copy(CopyDef::Extended {
                src: Sources::Many(src.clone()),
                dest: dest.clone(),
            }),
            Step::Install { manifest, extras } if extras.is_empty() => {
                StepDef::Install(InstallDef::Short(manifest.clone()))
            }
            Step::Install { manifest, extras } => StepDef::Install(InstallDef::Extended {
                manifest: manifest.clone(),
                extras: extras.clone(),
            }),
            Step::Expose(port) => StepDef::Expose(PortDef::Text(port.to_string())),
            Step::Label(labels) => StepDef::Label(MapList::Map(labels.clone())),
            Step::Cmd(cmd) => StepDef::Cmd(CommandDef::Exec(cmd.clone())),
        };

        Some(def)
    }
}

/// Reads `pod-build.yaml` recipes.
pub struct YamlFrontend;

impl YamlFrontend {
    pub fn new() -> YamlFrontend {
        YamlFrontend
    }

    pub fn parse(&self, recipe_path: &Path, text: &str) -> Result<Recipe, RecipeError> {
        let file: RecipeFile =
            serde_yaml::from_str(text).map_err(|source| RecipeError::Parse {
                path: recipe_path.to_path_buf(),
                source,
            })?;

        let mut steps = vec![Step::From(file.from.parse::<ImageRef>()?)];
        for step in file.steps {
            steps.push(step.into_step()?);
        }

        Ok(Recipe {
            name: file.name,
            steps,
        })
    }

    /// Serialises a recipe back into the file format.
    pub fn render(&self, recipe: &Recipe) -> Result<String> {
        let from = recipe.base().ok_or(RecipeError::MissingFrom)?;
        let file = RecipeFile {
            name: recipe.name.clone(),
            from: from.to_string(),
            steps: recipe.steps.iter().filter_map(StepDef::from_step).collect(),
        };

        Ok(serde_yaml::to_string(&file)?)
    }
}

impl RecipeFrontend for YamlFrontend {
    fn recipe(&mut self, recipe_path: &Path) -> Result<Recipe> {
        let text = fs::read_to_string(recipe_path)?;
        let recipe = self.parse(recipe_path, &text)?;
        recipe.validate()?;

        Ok(recipe)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    const RECIPE: &str = r#"
name: records-api
from: python:3.12-slim
steps:
  - env:
      PYTHONDONTWRITEBYTECODE: "1"
      PYTHONUNBUFFERED: "1"
  - workdir: /app
  - copy: pyproject.toml ./
  - install: pyproject.toml
  - copy:
      src: src
      dest: ./src
  - env: ["PYTHONPATH=/app/src"]
  - expose: 8000
  - cmd: ["gunicorn", "-c", "gunicorn.conf.py", "app:create_app()"]
"#;

    #[test]
    fn parses_the_default_layout() {
        let recipe = YamlFrontend::new()
            .parse(&PathBuf::from("pod-build.yaml"), RECIPE)
            .unwrap();

        let mut expected = Recipe::default_wsgi();
        expected.name = Some("records-api".into());
        assert_eq!(recipe, expected);
    }

    #[test]
    fn renders_what_it_parses() {
        let frontend = YamlFrontend::new();
        let recipe = Recipe::default_wsgi();
        let text = frontend.render(&recipe).unwrap();
        let parsed = frontend
            .parse(&PathBuf::from("pod-build.yaml"), &text)
            .unwrap();

        assert_eq!(parsed, recipe);
    }

    #[test]
    fn accepts_shell_commands_and_extras() {
        let text = r#"
from: python:3.12
steps:
  - copy: pyproject.toml /srv/
  - install:
      manifest: /srv/pyproject.toml
      extras: [server]
  - expose: "9000/udp"
  - cmd: gunicorn app:app
"#;
        let recipe = YamlFrontend::new()
            .parse(&PathBuf::from("pod-build.yaml"), text)
            .unwrap();

        assert_eq!(
            recipe.steps[2],
            Step::Install {
                manifest: "/srv/pyproject.toml".into(),
                extras: vec!["server".into()],
            }
        );
        assert_eq!(recipe.steps[3].to_string(), "EXPOSE 9000/udp");
        assert_eq!(
            recipe.steps[4],
            Step::Cmd(vec!["/bin/sh".into(), "-c".into(), "gunicorn app:app".into()])
        );
        recipe.validate().unwrap();
    }

    #[test]
    fn reports_bad_recipes() {
        let frontend = YamlFrontend::new();
        let path = PathBuf::from("pod-build.yaml");

        assert!(matches!(
            frontend.parse(&path, "steps: []\n"),
            Err(RecipeError::Parse { .. })
        ));
        assert!(matches!(
            frontend.parse(&path, "from: \"python 3\"\n"),
            Err(RecipeError::InvalidImageRef(_))
        ));
        assert!(matches!(
            frontend.parse(&path, "from: python\nsteps:\n  - expose: 0\n"),
            Err(RecipeError::InvalidPort(_))
        ));
        assert!(matches!(
            frontend.parse(&path, "from: python\nsteps:\n  - run: make\n"),
            Err(RecipeError::Parse { .. })
        ));
    }
}
