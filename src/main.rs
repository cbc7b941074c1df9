use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use shelfsight::classifier::Classifier;
use shelfsight::config::ClassifierConfig;
use shelfsight::model::{EmbeddingModel, FeatureExtractor};
use shelfsight::server;
use shelfsight::state::{ModelPhase, ModelState};
use shelfsight::store::{FeatureStore, SqliteFeatureStore};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "shelfsight", version)]
#[command(about = "Identify product images against a corpus of labeled reference images")]
struct Cli {
    /// Config file (defaults to ./shelfsight.toml when present)
    #[arg(short, long, global = true, env = "SHELFSIGHT_CONFIG")]
    config: Option<PathBuf>,

    /// Log filter, e.g. `debug` or `shelfsight=trace,tower_http=debug`. RUST_LOG takes precedence.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the HTTP classification endpoint
    Serve {
        /// Port to listen on (overrides the config file)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Classify one image file
    Classify {
        image: PathBuf,

        /// Also list the closest references
        #[arg(long)]
        top: Option<usize>,
    },

    /// Add reference images for one product
    Ingest {
        #[arg(short, long)]
        label: String,

        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Add reference images from a `<root>/<label>/<image>` directory tree
    IngestDir {
        root: PathBuf,
    },

    /// Remove every reference image of a product
    Remove {
        #[arg(short, long)]
        label: String,
    },

    /// List the products in the corpus with their sample counts
    Labels,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level, cli.json_logs);

    let mut config = ClassifierConfig::load(cli.config.as_deref())?;
    let store: Arc<dyn FeatureStore> = Arc::new(SqliteFeatureStore::open(&config.store)?);

    match cli.command {
        Commands::Serve { port } => {
            if let Some(port) = port {
                config.server.port = port;
            }
            run_server(config, store)
        }
        Commands::Classify { image, top } => {
            let classifier = classifier_with_model(&config, store)?;
            let bytes = std::fs::read(&image).with_context(|| format!("reading {:?}", image))?;
            print_json(&classifier.classify(&bytes)?)?;
            if let Some(k) = top {
                print_json(&classifier.top_matches(&bytes, k)?)?;
            }
            Ok(())
        }
        Commands::Ingest { label, files } => {
            let classifier = classifier_with_model(&config, store)?;
            print_json(&classifier.ingest_files(&label, &files)?)
        }
        Commands::IngestDir { root } => {
            let classifier = classifier_with_model(&config, store)?;
            print_json(&classifier.ingest_directory(&root)?)
        }
        Commands::Remove { label } => {
            let removed = store.remove_label(&label)?;
            tracing::info!("Removed {} reference(s) for {:?}", removed, label);
            print_json(&serde_json::json!({ "label": label, "removed": removed }))
        }
        Commands::Labels => print_json(&store.labels()?),
    }
}

fn init_logging(default_filter: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr)).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr)).init();
    }
}

fn load_model(config: &ClassifierConfig) -> shelfsight::Result<Arc<dyn FeatureExtractor>> {
    let model = EmbeddingModel::new(&config.model)?;
    Ok(Arc::new(model))
}

/// For one-shot commands: load the model up front and fail if it can't be loaded.
fn classifier_with_model(config: &ClassifierConfig, store: Arc<dyn FeatureStore>) -> anyhow::Result<Classifier> {
    let model = Arc::new(ModelState::new());
    if model.load(|| load_model(config)) != ModelPhase::Ready {
        anyhow::bail!(
            "embedding model could not be loaded: {}",
            model.load_error().unwrap_or_default()
        );
    }
    Ok(Classifier::new(model, store, config.thresholds))
}

/// Starts listening right away and loads the model in the background;
/// requests arriving before it is ready are answered with 503.
fn run_server(config: ClassifierConfig, store: Arc<dyn FeatureStore>) -> anyhow::Result<()> {
    let model = Arc::new(ModelState::new());
    let classifier = Classifier::new(Arc::clone(&model), store, config.thresholds);

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async move {
        let model_config = config.clone();
        tokio::task::spawn_blocking(move || {
            let now = std::time::Instant::now();
            let phase = model.load(|| load_model(&model_config));
            tracing::info!("Embedding model {} after {:?}", phase, now.elapsed());
        });

        server::serve(classifier, &config.server).await
    })
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
