mod config;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use config::Config;
use facemesh_core::{
    check_consistency, is_positive_match, FeatureVector, MatchCandidate, QualityAssessor,
    QualityReport, QualityVerdict,
};
use facemesh_store::{EnrollMode, NewTemplate, StoreOptions, TemplateStore};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "facemesh", version, about = "Face template store and matcher")]
struct Cli {
    /// Configuration file (default: $XDG_CONFIG_HOME/facemesh/config.toml)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a new identity, or rename an existing one with --update
    Enroll {
        #[arg(long)]
        id: String,
        /// Display name
        #[arg(long)]
        name: String,
        /// Record that the subject consented to enrollment
        #[arg(long)]
        consent: bool,
        /// Update the identity if it already exists
        #[arg(long)]
        update: bool,
    },
    /// Append feature templates to an enrolled identity
    AddTemplate(AddTemplateArgs),
    /// Remove an identity and all of its templates
    Remove {
        #[arg(long)]
        id: String,
    },
    /// List enrolled identities
    List,
    /// Show store statistics
    Stats,
    /// Find identities whose id or display name contains QUERY
    Search { query: String },
    /// Rank enrolled identities against a probe vector
    Match {
        /// Comma-separated feature values
        #[arg(long, value_parser = parse_vector, allow_hyphen_values = true)]
        probe: FeatureVector,
        #[arg(long)]
        top_k: Option<usize>,
        /// Minimum confidence to report
        #[arg(long, allow_hyphen_values = true)]
        threshold: Option<f32>,
    },
    /// Score a probe vector against one claimed identity
    Verify {
        #[arg(long)]
        id: String,
        /// Comma-separated feature values
        #[arg(long, value_parser = parse_vector, allow_hyphen_values = true)]
        probe: FeatureVector,
    },
    /// Assess the quality of a face image without storing anything
    Assess { image: PathBuf },
    /// Print the effective configuration as TOML
    Config,
}

#[derive(Args)]
struct AddTemplateArgs {
    #[arg(long)]
    id: String,
    /// Comma-separated feature values (repeatable)
    #[arg(long = "vector", value_parser = parse_vector, allow_hyphen_values = true)]
    vectors: Vec<FeatureVector>,
    /// JSON file holding an array of feature values (repeatable)
    #[arg(long = "vector-file", value_name = "PATH")]
    vector_files: Vec<PathBuf>,
    /// Source image; screened for quality, its score is stored with each template
    #[arg(long, conflicts_with = "quality")]
    image: Option<PathBuf>,
    /// Quality score to record when no image is given (default 1.0)
    #[arg(long)]
    quality: Option<f32>,
    /// Source tag (default: image file name, or "cli")
    #[arg(long)]
    provenance: Option<String>,
}

/// A match result annotated with the caller-side acceptance decision.
#[derive(Debug, Serialize)]
struct ScoredCandidate {
    #[serde(flatten)]
    candidate: MatchCandidate,
    positive: bool,
}

impl ScoredCandidate {
    fn new(candidate: MatchCandidate, positive_threshold: f32) -> Self {
        let positive = is_positive_match(candidate.confidence, positive_threshold);
        Self {
            candidate,
            positive,
        }
    }
}

#[derive(Debug, Serialize)]
struct AddTemplateOutput {
    identity_id: String,
    added: usize,
    template_count: usize,
    quality_score: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    warning: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    quality: Option<QualityReport>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    run(cli.command, &config)
}

fn run(command: Commands, config: &Config) -> Result<()> {
    match command {
        Commands::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
        Commands::Assess { image } => print_json(&assess(&image, config)?),
        Commands::Enroll {
            id,
            name,
            consent,
            update,
        } => {
            let store = open_store(config)?;
            let mode = if update {
                EnrollMode::Update
            } else {
                EnrollMode::Create
            };
            store.enroll(&id, &name, consent, mode)?;
            print_json(&store.identity(&id))
        }
        Commands::AddTemplate(args) => {
            let store = open_store(config)?;
            print_json(&add_templates(&store, config, args)?)
        }
        Commands::Remove { id } => {
            let store = open_store(config)?;
            store.remove_identity(&id)?;
            print_json(&serde_json::json!({ "removed": id }))
        }
        Commands::List => print_json(&open_store(config)?.list_identities()),
        Commands::Stats => print_json(&open_store(config)?.stats()),
        Commands::Search { query } => print_json(&open_store(config)?.search(&query)),
        Commands::Match {
            probe,
            top_k,
            threshold,
        } => {
            let store = open_store(config)?;
            let candidates = store.match_probe(
                &probe,
                top_k.unwrap_or(config.matching.top_k),
                threshold.unwrap_or(config.matching.report_threshold),
            )?;
            let scored: Vec<ScoredCandidate> = candidates
                .into_iter()
                .map(|c| ScoredCandidate::new(c, config.matching.positive_threshold))
                .collect();
            print_json(&scored)
        }
        Commands::Verify { id, probe } => {
            let store = open_store(config)?;
            let candidate = store.verify(&id, &probe)?;
            print_json(&ScoredCandidate::new(
                candidate,
                config.matching.positive_threshold,
            ))
        }
    }
}

fn open_store(config: &Config) -> Result<TemplateStore> {
    let options = StoreOptions {
        dimension: config.store.dimension,
        weights: config.matching.weights()?,
    };
    let dir = &config.store.data_dir;
    TemplateStore::open(dir.clone(), options)
        .with_context(|| format!("opening template store at {}", dir.display()))
}

fn assess(path: &Path, config: &Config) -> Result<QualityReport> {
    let assessor = QualityAssessor::new(config.quality.assessor_config())?;
    let img = image::open(path).with_context(|| format!("loading image {}", path.display()))?;
    let report = assessor.assess_image(&img);
    tracing::debug!(
        image = %path.display(),
        overall = report.overall_score,
        exposure = ?report.exposure,
        "image assessed"
    );
    Ok(report)
}

/// Screen, check and append a batch of templates in a single commit.
fn add_templates(
    store: &TemplateStore,
    config: &Config,
    args: AddTemplateArgs,
) -> Result<AddTemplateOutput> {
    let mut vectors = args.vectors;
    for path in &args.vector_files {
        vectors.push(read_vector_file(path)?);
    }
    if vectors.is_empty() {
        bail!("no feature vectors given; pass --vector or --vector-file");
    }
    check_consistency(&vectors, config.enrollment.consistency_threshold)
        .context("enrollment samples disagree with each other")?;

    let mut warning = None;
    let (quality_score, report) = match &args.image {
        Some(path) => {
            let report = assess(path, config)?;
            match config.quality.gate().evaluate(&report) {
                QualityVerdict::Accept => {}
                QualityVerdict::Warn(reason) => {
                    tracing::warn!(image = %path.display(), %reason, "accepting low quality image");
                    warning = Some(reason);
                }
                QualityVerdict::Reject(reason) => {
                    bail!("image {} rejected: {reason}", path.display())
                }
            }
            (report.overall_score, Some(report))
        }
        None => (args.quality.unwrap_or(1.0), None),
    };

    let provenance = args
        .provenance
        .or_else(|| {
            args.image
                .as_deref()
                .and_then(Path::file_name)
                .map(|n| n.to_string_lossy().into_owned())
        })
        .unwrap_or_else(|| "cli".to_string());

    let added = vectors.len();
    let templates = vectors
        .into_iter()
        .map(|v| NewTemplate::new(v, quality_score, provenance.clone()))
        .collect();
    store.add_templates(&args.id, templates)?;

    Ok(AddTemplateOutput {
        template_count: store
            .identity(&args.id)
            .map(|i| i.template_count)
            .unwrap_or(added),
        identity_id: args.id,
        added,
        quality_score,
        warning,
        quality: report,
    })
}

fn parse_vector(s: &str) -> Result<FeatureVector, String> {
    let values = s
        .split(',')
        .map(|part| {
            part.trim()
                .parse::<f32>()
                .map_err(|e| format!("invalid feature value {part:?}: {e}"))
        })
        .collect::<Result<Vec<f32>, String>>()?;
    FeatureVector::new(values).map_err(|e| e.to_string())
}

fn read_vector_file(path: &Path) -> Result<FeatureVector> {
    let bytes =
        std::fs::read(path).with_context(|| format!("reading vector file {}", path.display()))?;
    serde_json::from_slice(&bytes)
        .with_context(|| format!("parsing vector file {}", path.display()))
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
