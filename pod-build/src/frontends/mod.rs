use std::path::{Path, PathBuf};

pub mod recipe_yaml;

pub use recipe_yaml::{YamlFrontend, RECIPE_FILE_NAMES};

/// Looks for a recipe file in `path` and each of its ancestors.
pub fn find_recipe_file<P: AsRef<Path>>(path: P) -> Option<PathBuf> {
    for path in path.as_ref().ancestors() {
        for name in RECIPE_FILE_NAMES {
            let recipe_path = path.join(name);
            if recipe_path.exists() {
                return Some(recipe_path);
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn finds_recipes_in_ancestors() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("src/app");
        fs::create_dir_all(&nested).unwrap();

        assert_eq!(find_recipe_file(&nested), None);

        fs::write(dir.path().join("pod-build.yml"), "from: python\n").unwrap();
        assert_eq!(find_recipe_file(&nested), Some(dir.path().join("pod-build.yml")));
    }
}
