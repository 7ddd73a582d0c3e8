use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use facecull_core::{
    default_config_path, ImageOutcome, RunConfiguration, RunStatistics, SeetaFaceLocator,
};
use facecull_engine::{CancelHandle, ChannelSink, PipelineEngine, PipelineEvent};
use facecull_inference::{default_vision_model, GenerationOptions, OllamaClient};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing_subscriber::EnvFilter;

const DEFAULT_ASK_PROMPT: &str = "Describe the image.";

#[derive(Parser)]
#[command(name = "facecull", about = "Sort image folders into usable face shots")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Classify every image in the input folders
    Run(RunArgs),
    /// List models installed on the inference server
    Models {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Check that the inference server is reachable
    Ping {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Send a single image and prompt to the model
    Ask {
        image: PathBuf,
        #[arg(short, long, default_value = DEFAULT_ASK_PROMPT)]
        prompt: String,
        #[arg(long)]
        temperature: Option<f32>,
        #[arg(long)]
        max_tokens: Option<u32>,
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Create or inspect the configuration file
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Write a configuration file with default values
    Init {
        /// Destination (defaults to ~/.config/facecull/config.toml)
        path: Option<PathBuf>,
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Print the configuration a run would use
    Show {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Configuration file (defaults to ~/.config/facecull/config.toml if present)
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Input folder; repeat for several. Replaces the configured folders.
    #[arg(short, long = "input")]
    inputs: Vec<PathBuf>,
    #[arg(short, long)]
    output: Option<PathBuf>,
    #[arg(long)]
    min_width: Option<u32>,
    #[arg(long)]
    min_height: Option<u32>,
    /// Save only the detected face region
    #[arg(long)]
    crop: bool,
    /// Ask the model to confirm each face
    #[arg(long)]
    validate: bool,
    /// Write a caption file for each accepted image
    #[arg(long)]
    captions: bool,
    #[arg(long)]
    caption_limit: Option<usize>,
    /// Use the first vision-capable model installed on the server
    #[arg(long)]
    auto_model: bool,
}

impl RunArgs {
    /// Layer command-line flags over a loaded configuration.
    fn apply(&self, config: &mut RunConfiguration) {
        if !self.inputs.is_empty() {
            config.input_folders = self.inputs.clone();
        }
        if let Some(output) = &self.output {
            config.output_directory = output.clone();
        }
        if let Some(width) = self.min_width {
            config.min_width = width;
        }
        if let Some(height) = self.min_height {
            config.min_height = height;
        }
        if self.caption_limit.is_some() {
            config.caption_limit = self.caption_limit;
        }
        config.crop_faces |= self.crop;
        config.ai_validate |= self.validate;
        config.generate_captions |= self.captions;
    }
}

// reqwest's blocking client must not be created or dropped inside a tokio
// runtime, so main stays synchronous and only the event loop runs async.
fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run(args),
        Commands::Models { config } => {
            let config = load_config(config.as_deref())?;
            let client = OllamaClient::new(config.inference)?;
            let models = client
                .list_models()
                .with_context(|| format!("failed to list models at {}", client.settings().base_url))?;

            if models.is_empty() {
                println!("No models installed");
            }
            let default = default_vision_model(&models).map(|m| m.name.clone());
            for model in &models {
                let marker = if default.as_ref() == Some(&model.name) { "*" } else { " " };
                println!("{marker} {}  [{}]", model.name, model.families.join(", "));
            }
            Ok(())
        }
        Commands::Ping { config } => {
            let config = load_config(config.as_deref())?;
            let client = OllamaClient::new(config.inference)?;
            let base_url = client.settings().base_url.clone();
            client
                .ping()
                .with_context(|| format!("{base_url} is not reachable"))?;
            println!("{base_url} is reachable");
            Ok(())
        }
        Commands::Ask {
            image,
            prompt,
            temperature,
            max_tokens,
            config,
        } => {
            let config = load_config(config.as_deref())?;
            let bytes = std::fs::read(&image)
                .with_context(|| format!("failed to read {}", image.display()))?;

            let client = OllamaClient::new(config.inference)?;
            let mut options = GenerationOptions::from(client.settings());
            if let Some(temperature) = temperature {
                options.temperature = temperature;
            }
            if let Some(max_tokens) = max_tokens {
                options.max_tokens = max_tokens;
            }

            let text = client.infer_with(&bytes, &prompt, &options)?;
            println!("{text}");
            Ok(())
        }
        Commands::Config { command } => match command {
            ConfigCommand::Init { path, force } => {
                let path = path.unwrap_or_else(default_config_path);
                init_config(&path, force)?;
                println!("Wrote {}", path.display());
                Ok(())
            }
            ConfigCommand::Show { config } => {
                let config = load_config(config.as_deref())?;
                print!("{}", config.to_toml_string()?);
                Ok(())
            }
        },
    }
}

fn run(args: RunArgs) -> Result<()> {
    let mut config = load_config(args.config.as_deref())?;
    args.apply(&mut config);
    config.validate()?;

    if args.auto_model {
        let models = OllamaClient::new(config.inference.clone())?
            .list_models()
            .context("failed to list models for --auto-model")?;
        let Some(model) = default_vision_model(&models) else {
            bail!("no vision-capable model installed on {}", config.inference.base_url);
        };
        tracing::info!(model = %model.name, "selected vision model");
        config.inference.model = model.name.clone();
    }

    let locator = SeetaFaceLocator::load(&config.detector)?;
    let client = OllamaClient::new(config.inference.clone())?;
    let engine = PipelineEngine::new(Arc::new(locator), Arc::new(client));

    let (sink, rx) = ChannelSink::new();
    if !engine.start(config, Box::new(sink))? {
        bail!("a run is already in progress");
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build event loop")?;
    let stats = runtime.block_on(render_events(rx, engine.cancel_handle()));
    engine.wait();

    let Some(stats) = stats else {
        bail!("engine exited without reporting statistics");
    };
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

/// Print events until the worker drops its sink. Ctrl-C cancels the run
/// after the image in flight.
async fn render_events(
    mut rx: UnboundedReceiver<PipelineEvent>,
    cancel: CancelHandle,
) -> Option<RunStatistics> {
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut stats = None;
    let mut interrupted = false;
    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(PipelineEvent::Finished(finished)) => stats = Some(finished),
                Some(event) => render(&event),
                None => break,
            },
            signal = &mut ctrl_c, if !interrupted => {
                interrupted = true;
                match signal {
                    Ok(()) => {
                        eprintln!("Cancelling after the current image...");
                        cancel.cancel();
                    }
                    Err(e) => tracing::warn!(error = %e, "failed to listen for Ctrl-C"),
                }
            }
        }
    }
    stats
}

fn render(event: &PipelineEvent) {
    match event {
        PipelineEvent::Progress { percent } => eprintln!("[{percent:>3}%]"),
        PipelineEvent::Status { message } => eprintln!("{message}"),
        PipelineEvent::ImageResult(outcome) => println!("{}", outcome_line(outcome)),
        PipelineEvent::CurrentImage { path } => tracing::debug!(path = %path.display(), "current image"),
        PipelineEvent::Finished(_) => {}
    }
}

fn outcome_line(outcome: &ImageOutcome) -> String {
    let verdict = if outcome.accepted { "ACCEPT" } else { "REJECT" };
    let mut line = format!("{verdict} {}: {}", outcome.file_name, outcome.reason);
    if outcome.was_cropped {
        line.push_str(" (cropped)");
    }
    if !outcome.ai_text.is_empty() {
        line.push_str(&format!(" | {}", outcome.ai_text));
    }
    line
}

/// Load the explicit file, else the default file if it exists, else defaults;
/// then apply `FACECULL_*` environment overrides.
fn load_config(explicit: Option<&Path>) -> Result<RunConfiguration> {
    let mut config = load_config_from(explicit, &default_config_path())?;
    config.apply_env_overrides();
    Ok(config)
}

fn load_config_from(explicit: Option<&Path>, default_path: &Path) -> Result<RunConfiguration> {
    match explicit {
        Some(path) => Ok(RunConfiguration::load(path)?),
        None if default_path.exists() => Ok(RunConfiguration::load(default_path)?),
        None => Ok(RunConfiguration::default()),
    }
}

fn init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    RunConfiguration::default().save(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use facecull_core::ReasonCode;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_flags_override_config() {
        let cli = Cli::try_parse_from([
            "facecull", "run", "-i", "/a", "--input", "/b", "-o", "/out", "--min-width", "256",
            "--crop", "--captions", "--caption-limit", "80",
        ])
        .unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };

        let mut config = RunConfiguration {
            input_folders: vec![PathBuf::from("/configured")],
            min_height: 128,
            ai_validate: true,
            ..RunConfiguration::default()
        };
        args.apply(&mut config);

        assert_eq!(config.input_folders, vec![PathBuf::from("/a"), PathBuf::from("/b")]);
        assert_eq!(config.output_directory, PathBuf::from("/out"));
        assert_eq!(config.min_width, 256);
        assert_eq!(config.min_height, 128);
        assert!(config.crop_faces);
        assert!(config.ai_validate, "absent flag keeps the configured toggle");
        assert!(config.generate_captions);
        assert_eq!(config.caption_limit, Some(80));
    }

    #[test]
    fn test_ask_default_prompt() {
        let cli = Cli::try_parse_from(["facecull", "ask", "face.jpg"]).unwrap();
        match cli.command {
            Commands::Ask { prompt, temperature, .. } => {
                assert_eq!(prompt, DEFAULT_ASK_PROMPT);
                assert_eq!(temperature, None);
            }
            _ => panic!("expected ask"),
        }
    }

    #[test]
    fn test_load_config_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let default_path = dir.path().join("config.toml");
        let explicit = dir.path().join("other.toml");

        let loaded = load_config_from(None, &default_path).unwrap();
        assert_eq!(loaded, RunConfiguration::default());

        std::fs::write(&default_path, "min_width = 10\n").unwrap();
        std::fs::write(&explicit, "min_width = 20\n").unwrap();
        assert_eq!(load_config_from(None, &default_path).unwrap().min_width, 10);
        assert_eq!(load_config_from(Some(&explicit), &default_path).unwrap().min_width, 20);

        assert!(load_config_from(Some(&dir.path().join("missing.toml")), &default_path).is_err());
    }

    #[test]
    fn test_init_config_refuses_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.toml");

        init_config(&path, false).unwrap();
        let written = RunConfiguration::load(&path).unwrap();
        assert_eq!(written, RunConfiguration::default());

        assert!(init_config(&path, false).is_err());
        init_config(&path, true).unwrap();
    }

    #[test]
    fn test_outcome_line() {
        let rejected = ImageOutcome::rejected("a.png", ReasonCode::NoFace);
        assert_eq!(outcome_line(&rejected), "REJECT a.png: No face detected");

        let accepted = ImageOutcome {
            file_name: "b.jpg".into(),
            accepted: true,
            reason: ReasonCode::Processed,
            was_cropped: true,
            ai_text: "smiling".into(),
            ai_error: None,
        };
        assert_eq!(
            outcome_line(&accepted),
            "ACCEPT b.jpg: Processed successfully (cropped) | smiling"
        );
    }
}
