use std::{collections::BTreeMap as Map, fmt::Write};

use crate::recipe::{Recipe, Step};

/// Shell program that prints a manifest's dependency list one per line.
fn extraction_script(manifest: &str, extras: &[String]) -> String {
    let groups = extras
        .iter()
        .map(|extra| format!("+p['project']['optional-dependencies']['{}']", extra))
        .collect::<String>();

    if manifest.ends_with(".toml") {
        format!(
            "python -c \"import tomllib; p = tomllib.load(open('{}', 'rb')); print('\\n'.join(p['project']['dependencies']{}))\"",
            manifest, groups
        )
    } else {
        // grep exits 1 when nothing is selected, 2 when the file is unreadable.
        format!(
            "{{ grep -v -e '^\\s*#' -e '^\\s*$' {} || [ $? -eq 1 ]; }}",
            manifest
        )
    }
}

fn quote(value: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| format!("\"{}\"", value))
}

fn pairs(map: &Map<String, String>) -> String {
    map.iter()
        .map(|(key, value)| format!("{}={}", key, quote(value)))
        .collect::<Vec<_>>()
        .join(" ")
}

fn exec_form(args: &[String]) -> String {
    let args = args.iter().map(|arg| quote(arg)).collect::<Vec<_>>();
    format!("[{}]", args.join(", "))
}

/// Renders `recipe` as an equivalent Containerfile, for building the same
/// image with podman or docker directly.
pub fn render(recipe: &Recipe) -> String {
    let mut out = String::new();

    for step in recipe.steps.iter() {
        let _ = match step {
            Step::From(image) => writeln!(out, "FROM {}", image),
            Step::Env(env) => writeln!(out, "ENV {}", pairs(env)),
            Step::Workdir(path) => writeln!(out, "WORKDIR {}", path),
            Step::Copy { src, dest } => {
                let mut args = src.clone();
                args.push(dest.clone());
                writeln!(out, "COPY {}", exec_form(&args))
            }
            Step::Install { manifest, extras } => writeln!(
                out,
                "RUN {} > /tmp/requirements.txt \\\n    && pip install --no-cache-dir -r /tmp/requirements.txt \\\n    && rm /tmp/requirements.txt",
                extraction_script(manifest, extras)
            ),
            Step::Expose(port) => writeln!(out, "EXPOSE {}", port),
            Step::Label(labels) => writeln!(out, "LABEL {}", pairs(labels)),
            Step::Cmd(cmd) => writeln!(out, "CMD {}", exec_form(cmd)),
        };
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_the_default_recipe() {
        let rendered = render(&Recipe::default_wsgi());
        let lines = rendered.lines().collect::<Vec<_>>();

        assert_eq!(lines[0], "FROM python:3.12-slim");
        assert_eq!(lines[1], "ENV PYTHONDONTWRITEBYTECODE=\"1\" PYTHONUNBUFFERED=\"1\"");
        assert_eq!(lines[2], "WORKDIR /app");
        assert_eq!(lines[3], "COPY [\"pyproject.toml\", \"./\"]");
        assert!(lines[4].starts_with("RUN python -c \"import tomllib;"));
        assert!(rendered.contains("pip install --no-cache-dir -r /tmp/requirements.txt"));
        assert!(rendered.contains("COPY [\"src\", \"./src\"]"));
        assert!(rendered.contains("ENV PYTHONPATH=\"/app/src\""));
        assert!(rendered.contains("EXPOSE 8000/tcp"));
        assert!(rendered.ends_with(
            "CMD [\"gunicorn\", \"-c\", \"gunicorn.conf.py\", \"app:create_app()\"]\n"
        ));
    }

    #[test]
    fn extracts_requirements_files_without_python() {
        let script = extraction_script("requirements.txt", &[]);
        assert!(script.starts_with("{ grep"));

        let script = extraction_script("pyproject.toml", &["server".into()]);
        assert!(script.contains("+p['project']['optional-dependencies']['server']"));
    }

    #[test]
    fn comment_only_requirements_files_do_not_fail_the_run() {
        let mut recipe = Recipe::default_wsgi();
        recipe.steps[3] = Step::Copy {
            src: vec!["requirements.txt".into()],
            dest: "./".into(),
        };
        recipe.steps[4] = Step::Install {
            manifest: "requirements.txt".into(),
            extras: Vec::new(),
        };

        let rendered = render(&recipe);
        assert!(rendered.contains(
            "RUN { grep -v -e '^\\s*#' -e '^\\s*$' requirements.txt || [ $? -eq 1 ]; } > /tmp/requirements.txt \\\n"
        ));
    }
}
