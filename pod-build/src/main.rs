use anyhow::{anyhow, Context, Result};
use crossterm::{
    style::{self, Colorize, Styler},
    QueueableCommand,
};
use log::{info, warn};
use number_prefix::NumberPrefix;
use std::{
    env,
    fs::{self, File},
    io::{stdout, BufWriter, Stdout, Write},
    path::{Path, PathBuf},
    process,
};
use structopt::StructOpt;

use pod_build::{
    archive::{export_docker_archive, normalize_tag},
    backends::PodmanBackend,
    builder::{preflight, Builder},
    containerfile,
    context::BuildContext,
    frontends::{find_recipe_file, YamlFrontend, RECIPE_FILE_NAMES},
    models::{BaseImage, BuildPolicy, Image, ImageConfig, ImageId, PullPolicy},
    recipe::{Recipe, Step},
    services::{BuildObserver, ImageBackend, RecipeFrontend, RunRequest, StepOutcome, StepReport},
    store::{LayerStore, STORE_DIR_NAME},
};

#[derive(Debug, StructOpt)]
#[structopt(
    name = "pod-build",
    about = "Builds container images for Python web services from a declarative recipe."
)]
struct Opt {
    #[structopt(short, long, parse(from_os_str))]
    /// Recipe to use instead of searching for pod-build.yaml.
    file: Option<PathBuf>,

    #[structopt(long, env = "POD_BUILD_STORE", parse(from_os_str))]
    /// Layer store directory, defaults to .pod-build next to the recipe.
    store: Option<PathBuf>,

    #[structopt(long, env = "POD_BUILD_PODMAN", default_value = "podman")]
    podman: String,

    #[structopt(subcommand)]
    command: Command,
}

#[derive(Debug, StructOpt)]
enum Command {
    /// Writes the default recipe for a WSGI service to pod-build.yaml.
    Init {
        #[structopt(long)]
        /// Overwrite an existing recipe.
        force: bool,
    },
    /// Validates the recipe and resolves its manifests without building.
    Check,
    Build {
        #[structopt(short, long)]
        /// Tag for the image, defaults to the recipe name.
        tag: Option<String>,

        #[structopt(short, long)]
        /// Pull the base image even if it is present.
        pull: bool,

        #[structopt(long)]
        /// Rebuild every layer.
        no_cache: bool,
    },
    /// Prints an equivalent Containerfile.
    Containerfile,
    Images,
    Inspect { tag: Option<String> },
    /// Writes an image as a docker-archive.
    Export {
        tag: Option<String>,

        #[structopt(short, long, parse(from_os_str))]
        output: PathBuf,
    },
    /// Loads an image into podman and runs it with its ports published.
    Run {
        #[structopt(short, long)]
        tag: Option<String>,

        #[structopt(long, parse(from_os_str))]
        env_file: Option<PathBuf>,

        #[structopt(short, long)]
        /// Publish an extra port, in podman's `host:container` form.
        publish: Vec<String>,

        #[structopt(last = true)]
        /// Command overriding the image's default command.
        command: Vec<String>,
    },
}

/// Where the recipe lives and what it builds.
struct Project {
    recipe_path: PathBuf,
    recipe: Recipe,
    context: BuildContext,
    store_path: PathBuf,
    default_tag: String,
}

impl Project {
    fn load(opt: &Opt) -> Result<Project> {
        let recipe_path = match &opt.file {
            Some(path) => path.clone(),
            None => find_recipe_file(env::current_dir()?).ok_or_else(|| {
                anyhow!(
                    "Couldn't find a {} file in the current working directory or any of its parents.",
                    RECIPE_FILE_NAMES[0]
                )
            })?,
        };
        info!("found recipe {:?}", recipe_path);

        let recipe = YamlFrontend::new()
            .recipe(&recipe_path)
            .with_context(|| format!("could not read recipe {:?}", recipe_path))?;
        info!("parsed recipe with {} steps", recipe.steps.len());

        let context_dir = recipe_path
            .parent()
            .map(Path::to_path_buf)
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| PathBuf::from("."));
        let context = BuildContext::new(&context_dir)?.exclude(STORE_DIR_NAME);
        info!("build context {:?}", context.root());

        let store_path = opt
            .store
            .clone()
            .unwrap_or_else(|| context.root().join(STORE_DIR_NAME));
        let context = context.exclude_path(&store_path);

        let name = match &recipe.name {
            Some(name) => name.clone(),
            None => context
                .root()
                .file_name()
                .and_then(|name| name.to_str())
                .ok_or_else(|| anyhow!("Couldn't determine the image name."))?
                .to_lowercase(),
        };

        Ok(Project {
            recipe_path,
            recipe,
            context,
            store_path,
            default_tag: normalize_tag(&name),
        })
    }

    fn tag(&self, tag: &Option<String>) -> String {
        tag.as_deref()
            .map(normalize_tag)
            .unwrap_or_else(|| self.default_tag.clone())
    }

    fn store(&self) -> Result<LayerStore> {
        LayerStore::open(&self.store_path)
    }

    fn image(&self, tag: &str) -> Result<Image> {
        self.store()?
            .image(tag)?
            .ok_or_else(|| anyhow!("no image tagged {}, run `pod-build build` first", tag))
    }
}

fn main() -> Result<()> {
    pretty_env_logger::init_custom_env("LOG");

    let opt = Opt::from_args();

    let mut stdout = stdout();

    if let Command::Init { force } = opt.command {
        return init(&mut stdout, opt.file.as_deref(), force);
    }

    let project = Project::load(&opt)?;

    match &opt.command {
        Command::Init { .. } => (),
        Command::Check => {
            print_lints(&mut stdout, &project.recipe)?;

            let manifests = preflight(&project.recipe, &project.context)?;
            for manifest in manifests.iter() {
                println!(
                    "{:?}: {} requirements",
                    manifest.path,
                    manifest.requirements.len()
                );
            }

            stdout
                .queue(style::PrintStyledContent("ok".green().bold()))?
                .queue(style::Print(format!(" {:?}\n", project.recipe_path)))?
                .flush()?;
        }
        Command::Build {
            tag,
            pull,
            no_cache,
        } => {
            print_lints(&mut stdout, &project.recipe)?;

            let pull_policy = if *pull {
                PullPolicy::Always
            } else {
                PullPolicy::IfNotPresent
            };
            let build_policy = if *no_cache {
                BuildPolicy::Always
            } else {
                BuildPolicy::IfChanged
            };

            let backend = PodmanBackend::connect(&opt.podman)?;
            info!("connected to podman");

            let tag = project.tag(tag);
            let mut builder =
                Builder::init(backend.clone(), backend, project.store()?, project.context.clone())
                    .build_policy(build_policy)
                    .pull_policy(pull_policy);

            let mut observer = TerminalObserver::new(stdout);
            let outcome = builder.build(&project.recipe, &tag, &mut observer)?;

            observer.stdout.queue(style::Print(format!(
                "Successfully built {} as {}\n",
                short_id(&outcome.image.id),
                outcome.tag
            )))?;
            observer.stdout.flush()?;
        }
        Command::Containerfile => {
            print!("{}", containerfile::render(&project.recipe));
        }
        Command::Images => {
            let images = project.store()?.images()?;
            if images.is_empty() {
                println!("No images built yet.");
            }

            for tagged in images.iter() {
                let size = tagged.image.layers.iter().map(|layer| layer.size).sum();
                println!(
                    "{:<40} {:<14} {:>3} layers  {}",
                    tagged.tag,
                    short_id(&tagged.image.id),
                    tagged.image.layers.len(),
                    human_size(size)
                );
            }
        }
        Command::Inspect { tag } => {
            let image = project.image(&project.tag(tag))?;
            println!("{}", serde_json::to_string_pretty(&image)?);
        }
        Command::Export { tag, output } => {
            let tag = project.tag(tag);
            let image = project.image(&tag)?;
            let store = project.store()?;
            let mut backend = PodmanBackend::connect(&opt.podman)?;

            export(&mut backend, &store, &image, &tag, output)?;

            stdout
                .queue(style::PrintStyledContent("done".green().bold()))?
                .queue(style::Print(format!(" wrote {} to {:?}\n", tag, output)))?
                .flush()?;
        }
        Command::Run {
            tag,
            env_file,
            publish,
            command,
        } => {
            let tag = project.tag(tag);
            let image = project.image(&tag)?;
            let store = project.store()?;
            let mut backend = PodmanBackend::connect(&opt.podman)?;

            let scratch = store.temp_dir()?;
            let archive = scratch.path().join("image.tar");
            export(&mut backend, &store, &image, &tag, &archive)?;
            let loaded = backend.load_image(&archive)?;
            info!("loaded {} as {}", tag, loaded.0);

            let mut published = image
                .config
                .exposed_ports
                .iter()
                .map(|port| format!("{}:{}", port.number, port))
                .collect::<Vec<_>>();
            published.extend(publish.iter().cloned());

            let code = backend.run_image(&RunRequest {
                image: loaded.0,
                publish: published,
                env_file: env_file.clone(),
                command: command.clone(),
            })?;

            if code != 0 {
                drop(scratch);
                process::exit(code);
            }
        }
    }

    Ok(())
}

fn init(stdout: &mut Stdout, file: Option<&Path>, force: bool) -> Result<()> {
    let path = match file {
        Some(path) => path.to_path_buf(),
        None => env::current_dir()?.join(RECIPE_FILE_NAMES[0]),
    };

    if path.exists() && !force {
        return Err(anyhow!(
            "{:?} already exists, rerun with --force to overwrite it.",
            path
        ));
    }

    let recipe = Recipe::default_wsgi();
    fs::write(&path, YamlFrontend::new().render(&recipe)?)
        .with_context(|| format!("could not write {:?}", path))?;

    stdout
        .queue(style::PrintStyledContent("done".green().bold()))?
        .queue(style::Print(format!(" wrote {:?}\n", path)))?
        .flush()?;

    Ok(())
}

fn print_lints(stdout: &mut impl Write, recipe: &Recipe) -> Result<()> {
    for lint in recipe.lints() {
        stdout
            .queue(style::PrintStyledContent("WARN: ".yellow().bold()))?
            .queue(style::Print(format!("{}\n", lint)))?;
    }
    stdout.flush()?;

    Ok(())
}

/// Writes `image` as a docker-archive to `output`, taking the base layers
/// from podman.
fn export(
    backend: &mut dyn ImageBackend,
    store: &LayerStore,
    image: &Image,
    tag: &str,
    output: &Path,
) -> Result<()> {
    let scratch = store.temp_dir()?;
    let base_archive = scratch.path().join("base.tar");
    backend
        .save_image(&image.base.id, &base_archive)
        .with_context(|| format!("could not save base image {}", image.base.reference))?;

    let file =
        File::create(output).with_context(|| format!("could not create {:?}", output))?;
    let mut writer = export_docker_archive(store, image, tag, &base_archive, BufWriter::new(file))?;
    writer.flush()?;

    Ok(())
}

fn short_id(id: &ImageId) -> &str {
    &id.0[..id.0.len().min(12)]
}

fn human_size(bytes: u64) -> String {
    match NumberPrefix::binary(bytes as f32) {
        NumberPrefix::Standalone(bytes) => format!("{} bytes", bytes),
        NumberPrefix::Prefixed(prefix, n) => format!("{:.1} {}B", n, prefix),
    }
}

/// Prints build progress as `Step i/n : INSTRUCTION ... done`.
struct TerminalObserver {
    stdout: Stdout,
}

impl TerminalObserver {
    fn new(stdout: Stdout) -> TerminalObserver {
        TerminalObserver { stdout }
    }

    fn print_started(&mut self, index: usize, total: usize, step: &Step) -> Result<()> {
        self.stdout
            .queue(style::Print(format!("Step {}/{} : {} ... ", index, total, step)))?
            .flush()?;

        Ok(())
    }

    fn print_finished(&mut self, report: &StepReport) -> Result<()> {
        let marker = match report.outcome {
            StepOutcome::Metadata | StepOutcome::Built => "done".green().bold(),
            StepOutcome::Cached => "cached".cyan().bold(),
            StepOutcome::Pulled => "pulled".green().bold(),
        };
        self.stdout.queue(style::PrintStyledContent(marker))?;

        if let Some(layer) = &report.layer {
            self.stdout.queue(style::Print(format!(
                " ({}, {})",
                &layer.digest.hex()[..12],
                human_size(layer.size)
            )))?;
        }

        self.stdout.queue(style::Print("\n"))?.flush()?;

        Ok(())
    }
}

impl BuildObserver for TerminalObserver {
    fn step_started(&mut self, index: usize, total: usize, step: &Step) {
        if let Err(err) = self.print_started(index, total, step) {
            warn!("could not print progress: {}", err);
        }
    }

    fn step_finished(&mut self, report: &StepReport) {
        if let Err(err) = self.print_finished(report) {
            warn!("could not print progress: {}", err);
        }
    }

    fn base_resolved(&mut self, base: &BaseImage) {
        info!("base image {} is {}", base.reference, base.id.0);
    }

    fn finished(&mut self, image: &ImageId, config: &ImageConfig) {
        info!(
            "built {} exposing {:?} running {:?}",
            image.0, config.exposed_ports, config.cmd
        );
    }
}
