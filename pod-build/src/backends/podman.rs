use anyhow::{anyhow, Context, Result};
use log::{debug, info};
use serde::Deserialize;
use std::{
    collections::BTreeMap as Map,
    ffi::OsStr,
    path::{Path, PathBuf},
    process::{Command, Output, Stdio},
};

use crate::{
    models::{BaseImage, ImageConfig, ImageId, ImageRef},
    services::{ImageBackend, InstallRequest, Installer, RunRequest},
};

const INSTALL_ROOT: &str = "/pod-build-root";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectImage {
    id: String,
    #[serde(default)]
    config: Option<InspectConfig>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectConfig {
    #[serde(default)]
    env: Option<Vec<String>>,
    #[serde(default)]
    cmd: Option<Vec<String>>,
    #[serde(default)]
    working_dir: Option<String>,
    #[serde(default)]
    exposed_ports: Option<Map<String, serde_json::Value>>,
    #[serde(default)]
    labels: Option<Map<String, String>>,
}

impl InspectConfig {
    fn into_config(self) -> ImageConfig {
        let env = self
            .env
            .unwrap_or_default()
            .into_iter()
            .map(|pair| match pair.split_once('=') {
                Some((key, value)) => (key.to_string(), value.to_string()),
                None => (pair, String::new()),
            })
            .collect();

        let exposed_ports = self
            .exposed_ports
            .unwrap_or_default()
            .keys()
            .filter_map(|port| port.parse().ok())
            .collect();

        ImageConfig {
            env,
            working_dir: self.working_dir.filter(|dir| !dir.is_empty()),
            exposed_ports,
            cmd: self.cmd.unwrap_or_default(),
            labels: self.labels.unwrap_or_default(),
        }
    }
}

/// Talks to podman through its command line interface.
#[derive(Clone, Debug)]
pub struct PodmanBackend {
    program: PathBuf,
}

impl PodmanBackend {
    pub fn connect<P: Into<PathBuf>>(program: P) -> Result<PodmanBackend> {
        let backend = PodmanBackend {
            program: program.into(),
        };

        let output = backend.output(&["--version"])?;
        info!(
            "using {}",
            String::from_utf8_lossy(&output.stdout).trim()
        );

        Ok(backend)
    }

    fn command<I, S>(&self, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut command = Command::new(&self.program);
        command.args(args);
        debug!("running {:?}", command);
        command
    }

    /// Runs podman with captured output and fails on a non-zero exit.
    fn output<I, S>(&self, args: I) -> Result<Output>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let output = self
            .command(args)
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("could not run {:?}", self.program))?;

        if !output.status.success() {
            return Err(anyhow!(
                "podman exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }

        Ok(output)
    }

    /// Runs podman with its output going straight to the terminal.
    fn status<I, S>(&self, args: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let status = self
            .command(args)
            .stdin(Stdio::null())
            .status()
            .with_context(|| format!("could not run {:?}", self.program))?;

        if !status.success() {
            return Err(anyhow!("podman exited with {}", status));
        }

        Ok(())
    }
}

impl ImageBackend for PodmanBackend {
    fn get_image(&mut self, reference: &ImageRef) -> Result<Option<BaseImage>> {
        let reference_arg = reference.to_string();

        let exists = self
            .command(&["image", "exists", reference_arg.as_str()])
            .stdin(Stdio::null())
            .status()
            .with_context(|| format!("could not run {:?}", self.program))?;
        match exists.code() {
            Some(0) => (),
            Some(1) => return Ok(None),
            _ => return Err(anyhow!("podman image exists failed with {}", exists)),
        }

        let output = self.output(&["image", "inspect", reference_arg.as_str()])?;
        let mut images: Vec<InspectImage> = serde_json::from_slice(&output.stdout)
            .context("could not parse podman image inspect output")?;

        if images.is_empty() {
            return Ok(None);
        }
        let image = images.remove(0);

        Ok(Some(BaseImage {
            reference: reference.clone(),
            id: ImageId(image.id),
            config: image.config.unwrap_or_default().into_config(),
        }))
    }

    fn pull_image(&mut self, reference: &ImageRef) -> Result<()> {
        println!("Pulling {}", reference);
        self.status(&["pull", reference.to_string().as_str()])
    }

    fn save_image(&mut self, id: &ImageId, destination: &Path) -> Result<()> {
        let args = vec![
            OsStr::new("save"),
            OsStr::new("--format"),
            OsStr::new("docker-archive"),
            OsStr::new("-o"),
            destination.as_os_str(),
            OsStr::new(&id.0),
        ];

        self.output(args)?;
        Ok(())
    }

    fn load_image(&mut self, archive: &Path) -> Result<ImageId> {
        let output = self.output(vec![OsStr::new("load"), OsStr::new("-i"), archive.as_os_str()])?;
        let stdout = String::from_utf8_lossy(&output.stdout);

        let loaded = stdout
            .lines()
            .filter_map(|line| line.rsplit_once(": ").map(|(_, image)| image.trim()))
            .last()
            .ok_or_else(|| anyhow!("podman load did not report a loaded image: {}", stdout))?;

        Ok(ImageId(loaded.into()))
    }

    fn run_image(&mut self, request: &RunRequest) -> Result<i32> {
        let mut args = vec![OsStr::new("run"), OsStr::new("--rm")];
        for publish in request.publish.iter() {
            args.push(OsStr::new("-p"));
            args.push(OsStr::new(publish));
        }
        if let Some(env_file) = &request.env_file {
            args.push(OsStr::new("--env-file"));
            args.push(env_file.as_os_str());
        }
        args.push(OsStr::new(&request.image));
        args.extend(request.command.iter().map(|arg| OsStr::new(arg)));

        let status = self
            .command(args)
            .status()
            .with_context(|| format!("could not run {:?}", self.program))?;

        Ok(status.code().unwrap_or(1))
    }
}

impl Installer for PodmanBackend {
    fn install(&mut self, request: &InstallRequest) -> Result<()> {
        let volume = format!("{}:{}:Z", request.root.display(), INSTALL_ROOT);

        let mut args = vec![
            "run".to_string(),
            "--rm".into(),
            "--pull=never".into(),
            "--volume".into(),
            volume,
            "--workdir".into(),
            request.working_dir.clone(),
        ];
        for env in request.env.iter() {
            args.push("--env".into());
            args.push(env.clone());
        }
        args.push(request.image.clone());
        args.extend(
            [
                "python",
                "-m",
                "pip",
                "install",
                "--no-cache-dir",
                "--disable-pip-version-check",
                "--root-user-action=ignore",
                "--root",
                INSTALL_ROOT,
            ]
            .iter()
            .map(|arg| arg.to_string()),
        );
        args.extend(request.requirements.iter().cloned());

        self.status(args)
            .context("dependency installation failed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Port;

    #[test]
    fn converts_inspect_output() {
        let json = r#"[{
            "Id": "f1e2d3",
            "Config": {
                "Env": ["PATH=/usr/local/bin:/usr/bin", "LANG=C.UTF-8", "EMPTY"],
                "Cmd": ["python3"],
                "WorkingDir": "",
                "ExposedPorts": {"5000/tcp": {}},
                "Labels": null
            }
        }]"#;

        let mut images: Vec<InspectImage> = serde_json::from_str(json).unwrap();
        let image = images.remove(0);
        assert_eq!(image.id, "f1e2d3");

        let config = image.config.unwrap().into_config();
        assert_eq!(config.env["PATH"], "/usr/local/bin:/usr/bin");
        assert_eq!(config.env["EMPTY"], "");
        assert_eq!(config.cmd, vec!["python3"]);
        assert_eq!(config.working_dir, None);
        assert!(config.exposed_ports.contains(&Port::tcp(5000)));
        assert!(config.labels.is_empty());
    }
}
