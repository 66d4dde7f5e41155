mod tasks;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cebra")]
#[command(about = "Contrastive embeddings of time-series recordings")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Train a solver and write its checkpoint and history to the output directory
    Train(TrainArgs),
    /// Embed recordings with a trained checkpoint
    Transform(TransformArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SolverArg {
    /// One recording, contrastive
    Single,
    /// Several recordings aligned in one embedding space
    Multi,
    /// Encoder plus readout trained on the labels
    Supervised,
}

#[derive(Args)]
pub struct TrainArgs {
    /// Dataset files (safetensors with `neural` and optional `continuous` / `discrete`).
    /// Pass several for multi-session training.
    #[arg(short, long = "data", required = true)]
    pub data: Vec<PathBuf>,

    #[arg(long, value_enum, default_value = "single")]
    pub solver: SolverArg,

    /// JSON solver config; flags below override its fields
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[arg(short, long, default_value = "1000")]
    pub steps: usize,

    #[arg(short, long, default_value = "cebra-run")]
    pub output_dir: PathBuf,

    /// Resume from this checkpoint instead of a fresh initialization
    #[arg(long)]
    pub resume: Option<PathBuf>,

    #[arg(long)]
    pub model: Option<String>,

    #[arg(short, long)]
    pub batch_size: Option<usize>,

    #[arg(long)]
    pub lr: Option<f64>,

    #[arg(long)]
    pub output_dimension: Option<usize>,

    #[arg(long)]
    pub hidden_units: Option<usize>,

    /// time, time_delta, delta or discrete
    #[arg(long)]
    pub conditional: Option<String>,

    #[arg(long)]
    pub time_offset: Option<usize>,

    #[arg(long)]
    pub delta: Option<f32>,

    /// infonce or mse
    #[arg(long)]
    pub criterion: Option<String>,

    /// cosine or euclidean
    #[arg(long)]
    pub distance: Option<String>,

    #[arg(long)]
    pub temperature: Option<f32>,

    /// constant or auto
    #[arg(long)]
    pub temperature_mode: Option<String>,

    #[arg(long)]
    pub min_temperature: Option<f32>,

    #[arg(long)]
    pub share_encoder: bool,

    /// cpu, cuda, cuda:N, cuda_if_available, metal[:N] or mps
    #[arg(long, env = "CEBRA_DEVICE")]
    pub device: Option<String>,

    #[arg(long)]
    pub seed: Option<u64>,

    #[arg(long)]
    pub log_interval: Option<usize>,

    /// Steps between checkpoints in the output directory, 0 disables them
    #[arg(long)]
    pub checkpoint_interval: Option<usize>,
}

#[derive(Args)]
pub struct TransformArgs {
    /// Checkpoint written by `train`
    #[arg(short, long)]
    pub checkpoint: PathBuf,

    #[arg(short, long = "data", required = true)]
    pub data: Vec<PathBuf>,

    #[arg(long, value_enum, default_value = "single")]
    pub solver: SolverArg,

    /// Output safetensors file
    #[arg(short, long, default_value = "embedding.safetensors")]
    pub output: PathBuf,

    #[arg(long, env = "CEBRA_DEVICE", default_value = "cuda_if_available")]
    pub device: String,
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    match cli.command {
        Command::Train(args) => tasks::train::run(args),
        Command::Transform(args) => tasks::transform::run(args),
    }
}
