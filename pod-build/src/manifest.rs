use log::debug;
use serde::Deserialize;
use std::{
    collections::BTreeMap as Map,
    fs,
    path::{Path, PathBuf},
};

use crate::error::ResolutionError;

/// A single validated dependency requirement.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct Requirement {
    pub raw: String,
    /// Name normalised the way package indexes compare names.
    pub name: String,
    pub extras: Vec<String>,
    pub specifier: String,
    pub marker: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Manifest {
    pub path: PathBuf,
    pub requirements: Vec<Requirement>,
}

impl Manifest {
    /// The requirement strings in the order they are handed to the installer.
    pub fn install_args(&self) -> Vec<String> {
        self.requirements.iter().map(|req| req.raw.clone()).collect()
    }
}

#[derive(Debug, Deserialize)]
struct PyProject {
    project: Option<Project>,
}

#[derive(Debug, Deserialize)]
struct Project {
    dependencies: Option<Vec<String>>,
    #[serde(default, rename = "optional-dependencies")]
    optional_dependencies: Map<String, Vec<String>>,
}

/// Reads a dependency manifest. Files named `*.toml` are read as
/// `pyproject.toml`, everything else in `requirements.txt` format.
pub fn load<P: AsRef<Path>>(path: P, extras: &[String]) -> Result<Manifest, ResolutionError> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).map_err(|source| ResolutionError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let is_toml = path
        .extension()
        .map(|extension| extension == "toml")
        .unwrap_or(false);

    let manifest = if is_toml {
        parse_pyproject(path, &text, extras)?
    } else {
        parse_requirements_txt(path, &text)?
    };

    debug!(
        "resolved {} requirements from {:?}",
        manifest.requirements.len(),
        path
    );

    Ok(manifest)
}

pub fn parse_pyproject(
    path: &Path,
    text: &str,
    extras: &[String],
) -> Result<Manifest, ResolutionError> {
    let pyproject: PyProject = toml::from_str(text).map_err(|source| ResolutionError::Malformed {
        path: path.to_path_buf(),
        source,
    })?;

    let project = pyproject
        .project
        .ok_or_else(|| ResolutionError::MissingDependencies(path.to_path_buf()))?;
    let mut raw = project
        .dependencies
        .ok_or_else(|| ResolutionError::MissingDependencies(path.to_path_buf()))?;

    for extra in extras {
        let group = project
            .optional_dependencies
            .get(extra)
            .ok_or_else(|| ResolutionError::UnknownExtra {
                path: path.to_path_buf(),
                extra: extra.clone(),
            })?;
        raw.extend(group.iter().cloned());
    }

    let requirements = raw
        .iter()
        .map(|requirement| parse_requirement(requirement))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Manifest {
        path: path.to_path_buf(),
        requirements,
    })
}

pub fn parse_requirements_txt(path: &Path, text: &str) -> Result<Manifest, ResolutionError> {
    let mut requirements = Vec::new();

    for line in text.lines() {
        let line = match line.find(" #") {
            Some(index) => &line[..index],
            None => line,
        };
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if line.starts_with('-') {
            return Err(ResolutionError::InvalidRequirement {
                requirement: line.into(),
                reason: "installer options are not supported in manifests",
            });
        }
        requirements.push(parse_requirement(line)?);
    }

    Ok(Manifest {
        path: path.to_path_buf(),
        requirements,
    })
}

/// Validates one requirement of the form
/// `name[extra,...] specifier ; marker` or `name @ url`.
pub fn parse_requirement(raw: &str) -> Result<Requirement, ResolutionError> {
    let invalid = |reason| ResolutionError::InvalidRequirement {
        requirement: raw.into(),
        reason,
    };

    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(invalid("empty requirement"));
    }

    let (body, marker) = match trimmed.find(';') {
        Some(index) => {
            let marker = trimmed[index + 1..].trim();
            if marker.is_empty() {
                return Err(invalid("empty environment marker"));
            }
            validate_marker(marker).map_err(invalid)?;
            (trimmed[..index].trim(), Some(marker.to_string()))
        }
        None => (trimmed, None),
    };

    let name_end = body
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.'))
        .unwrap_or_else(|| body.len());
    let name = &body[..name_end];
    if !is_valid_name(name) {
        return Err(invalid("not a valid package name"));
    }

    let mut rest = body[name_end..].trim_start();

    let mut extras = Vec::new();
    if rest.starts_with('[') {
        let close = rest.find(']').ok_or_else(|| invalid("unterminated extras"))?;
        for extra in rest[1..close].split(',') {
            let extra = extra.trim();
            if !is_valid_name(extra) {
                return Err(invalid("not a valid extra name"));
            }
            extras.push(normalize_name(extra));
        }
        rest = rest[close + 1..].trim_start();
    }

    let specifier = if rest.starts_with('@') {
        let url = rest[1..].trim();
        if url.is_empty() || url.contains(char::is_whitespace) {
            return Err(invalid("invalid direct reference"));
        }
        rest.to_string()
    } else {
        let specifier = rest.trim_start_matches('(').trim_end_matches(')').trim();
        for clause in specifier.split(',').filter(|_| !specifier.is_empty()) {
            validate_clause(clause.trim()).map_err(invalid)?;
        }
        specifier.to_string()
    };

    Ok(Requirement {
        raw: trimmed.to_string(),
        name: normalize_name(name),
        extras,
        specifier,
        marker,
    })
}

fn validate_clause(clause: &str) -> Result<(), &'static str> {
    const OPERATORS: &[&str] = &["===", "~=", "==", "!=", "<=", ">=", "<", ">"];

    let operator = OPERATORS
        .iter()
        .find(|operator| clause.starts_with(*operator))
        .ok_or("version clause has no comparison operator")?;

    let version = clause[operator.len()..].trim();
    if version.is_empty() {
        return Err("version clause has no version");
    }
    let valid = version
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '*' | '+' | '-' | '_' | '!'));
    if !valid {
        return Err("version contains invalid characters");
    }

    Ok(())
}

/// Every `and`/`or` operand of a marker must be a comparison with both
/// sides present.
fn validate_marker(marker: &str) -> Result<(), &'static str> {
    const OPERATORS: &[&str] = &[
        "===", "~=", "==", "!=", "<=", ">=", "<", ">", " not in ", " in ",
    ];

    let flattened = format!(" {} ", marker.replace(|c: char| c == '(' || c == ')', " "));
    for operand in flattened.split(" or ").flat_map(|part| part.split(" and ")) {
        let operand = operand.trim();
        let (index, operator) = OPERATORS
            .iter()
            .filter_map(|operator| operand.find(operator).map(|index| (index, *operator)))
            .min_by_key(|(index, _)| *index)
            .ok_or("environment marker has no comparison operator")?;

        let left = operand[..index].trim();
        let right = operand[index + operator.len()..].trim();
        if left.is_empty() || right.is_empty() {
            return Err("environment marker comparison is incomplete");
        }
    }

    Ok(())
}

fn is_valid_name(name: &str) -> bool {
    let bytes = name.as_bytes();
    match (bytes.first(), bytes.last()) {
        (Some(first), Some(last)) => {
            first.is_ascii_alphanumeric()
                && last.is_ascii_alphanumeric()
                && bytes
                    .iter()
                    .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
        }
        _ => false,
    }
}

/// Lowercases and collapses runs of `-`, `_` and `.` into a single `-`.
pub fn normalize_name(name: &str) -> String {
    let mut normalized = String::with_capacity(name.len());
    let mut in_separator = false;

    for c in name.chars() {
        if matches!(c, '-' | '_' | '.') {
            if !in_separator {
                normalized.push('-');
            }
            in_separator = true;
        } else {
            normalized.push(c.to_ascii_lowercase());
            in_separator = false;
        }
    }

    normalized
}

#[cfg(test)]
mod tests {
    use super::*;

    const PYPROJECT: &str = r#"
[project]
name = "records-api"
version = "0.1.0"
dependencies = [
    "Flask>=3.0",
    "flask-cors",
    "gunicorn==22.0.0",
    "azure-cosmos>=4.7,<5",
    "pydantic[email] ~= 2.7",
    "python-dotenv; python_version >= '3.8'",
]

[project.optional-dependencies]
dev = ["pytest>=8"]
"#;

    #[test]
    fn extracts_project_dependencies() {
        let manifest = parse_pyproject(Path::new("pyproject.toml"), PYPROJECT, &[]).unwrap();
        let names = manifest
            .requirements
            .iter()
            .map(|req| req.name.as_str())
            .collect::<Vec<_>>();

        assert_eq!(
            names,
            vec!["flask", "flask-cors", "gunicorn", "azure-cosmos", "pydantic", "python-dotenv"]
        );
        assert_eq!(manifest.requirements[3].specifier, ">=4.7,<5");
        assert_eq!(manifest.requirements[4].extras, vec!["email"]);
        assert_eq!(
            manifest.requirements[5].marker.as_deref(),
            Some("python_version >= '3.8'")
        );
        assert_eq!(manifest.install_args()[0], "Flask>=3.0");
    }

    #[test]
    fn includes_requested_extras() {
        let manifest =
            parse_pyproject(Path::new("pyproject.toml"), PYPROJECT, &["dev".into()]).unwrap();
        assert_eq!(manifest.requirements.last().unwrap().name, "pytest");

        let error =
            parse_pyproject(Path::new("pyproject.toml"), PYPROJECT, &["docs".into()]).unwrap_err();
        assert!(matches!(error, ResolutionError::UnknownExtra { .. }));
    }

    #[test]
    fn rejects_unresolvable_package_names() {
        let text = "[project]\nname = \"x\"\ndependencies = [\"!!!not-a-real-pkg!!!\"]\n";
        let error = parse_pyproject(Path::new("pyproject.toml"), text, &[]).unwrap_err();

        match error {
            ResolutionError::InvalidRequirement { requirement, .. } => {
                assert_eq!(requirement, "!!!not-a-real-pkg!!!")
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn rejects_malformed_manifests() {
        let error = parse_pyproject(Path::new("pyproject.toml"), "[project", &[]).unwrap_err();
        assert!(matches!(error, ResolutionError::Malformed { .. }));

        let error =
            parse_pyproject(Path::new("pyproject.toml"), "[tool.black]\nline-length = 100\n", &[])
                .unwrap_err();
        assert!(matches!(error, ResolutionError::MissingDependencies(_)));
    }

    #[test]
    fn validates_requirement_syntax() {
        assert!(parse_requirement("requests").is_ok());
        assert!(parse_requirement("zope.interface>=5").is_ok());
        assert!(parse_requirement("pkg @ https://example.com/pkg-1.0.tar.gz").is_ok());
        assert!(parse_requirement("numpy (>=1.26)").is_ok());

        assert!(parse_requirement("").is_err());
        assert!(parse_requirement("-e .").is_err());
        assert!(parse_requirement("requests>=").is_err());
        assert!(parse_requirement("requests 2.0").is_err());
        assert!(parse_requirement("requests[").is_err());
        assert!(parse_requirement("requests; ").is_err());
    }

    #[test]
    fn environment_markers_must_be_comparisons() {
        for marker in &[
            "python_version >= '3.8'",
            "sys_platform == 'linux' and python_version<\"3.13\"",
            "(os_name == 'nt' or os_name == 'posix') and extra == 'dev'",
            "'linux' in sys_platform",
            "platform_machine not in 'arm64 aarch64'",
        ] {
            let raw = format!("requests>=2; {}", marker);
            assert!(parse_requirement(&raw).is_ok(), "{}", raw);
        }

        for raw in &[
            "requests>=2;1",
            "requests; linux",
            "requests; python_version >=",
            "requests; os_name == 'nt' and",
        ] {
            match parse_requirement(raw) {
                Err(ResolutionError::InvalidRequirement { requirement, .. }) => {
                    assert_eq!(requirement, *raw)
                }
                other => panic!("{} was accepted: {:?}", raw, other),
            }
        }
    }

    #[test]
    fn reads_requirements_txt() {
        let text = "# pinned\nflask==3.0.3  # web\n\ngunicorn\n";
        let manifest = parse_requirements_txt(Path::new("requirements.txt"), text).unwrap();
        assert_eq!(manifest.install_args(), vec!["flask==3.0.3", "gunicorn"]);

        let error =
            parse_requirements_txt(Path::new("requirements.txt"), "-r base.txt\n").unwrap_err();
        assert!(matches!(error, ResolutionError::InvalidRequirement { .. }));
    }

    #[test]
    fn normalizes_names() {
        assert_eq!(normalize_name("Flask_Cors"), "flask-cors");
        assert_eq!(normalize_name("zope..interface"), "zope-interface");
    }
}
