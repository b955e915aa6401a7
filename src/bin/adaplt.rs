use adaplt::model::{eval, HasherKind, HyperParam, TreeVariant, TunerVariant};
use adaplt::{DataSet, Model};
use clap::{Args, Parser, Subcommand};
use const_default::ConstDefault;
use itertools::Itertools;
use log::info;
use std::fs::File;
use std::io::{BufWriter, Result, Write};
use std::path::PathBuf;

const DEFAULT: HyperParam = HyperParam::DEFAULT;

#[derive(Parser)]
#[command(
    name = "adaplt",
    about = "Online multi-label classification with adaptive probabilistic label trees",
    version
)]
struct Cli {
    /// Number of worker threads; 0 uses all logical cores
    #[arg(long, global = true, default_value_t = 0)]
    n_threads: usize,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a model on a dataset in the Extreme Classification Repository format
    Train(TrainArgs),
    /// Test a saved model on a dataset
    Test(TestArgs),
}

#[derive(Args)]
struct TrainArgs {
    /// Path to the training data file
    training_data_path: PathBuf,

    /// Directory to save the trained model in
    #[arg(long)]
    model_path: Option<PathBuf>,

    /// Shape of the label tree
    #[arg(long, value_enum, default_value = "complete")]
    tree_structure: TreeVariant,

    /// Maximum number of children per tree node
    #[arg(long, default_value_t = DEFAULT.k)]
    arity: usize,

    /// Tree structure file; required when --tree-structure is precomputed
    #[arg(long)]
    tree_file: Option<PathBuf>,

    /// Feature hashing strategy; mask needs a power-of-two hash dimension
    #[arg(long, value_enum, default_value = "mask")]
    hasher: HasherKind,

    /// Size of the shared hashed weight array
    #[arg(long, default_value_t = DEFAULT.hash_dim)]
    hash_dim: usize,

    #[arg(long, default_value_t = DEFAULT.hasher_seed)]
    hasher_seed: u32,

    /// Learning rate
    #[arg(long, default_value_t = DEFAULT.gamma)]
    gamma: f64,

    /// L2 regularization strength
    #[arg(long, default_value_t = DEFAULT.lambda)]
    lambda: f64,

    /// Number of passes over the training data
    #[arg(long, default_value_t = DEFAULT.epochs)]
    epochs: usize,

    /// Per-label decision threshold tuning strategy
    #[arg(long, value_enum, default_value = "ofo")]
    threshold_tuner: TunerVariant,

    /// Initial numerator for OFO threshold counters
    #[arg(long, default_value_t = DEFAULT.ofo_a_seed)]
    ofo_a: u64,

    /// Initial denominator for OFO threshold counters
    #[arg(long, default_value_t = DEFAULT.ofo_b_seed)]
    ofo_b: u64,

    /// Weight of a leaf's probability against its depth when choosing where
    /// a new label grows
    #[arg(long, default_value_t = DEFAULT.probability_weight)]
    probability_weight: f64,

    /// Grow new labels next to low-probability leaves instead of high
    #[arg(long)]
    prefer_lowest_prob_leaf: bool,

    /// Grow new labels next to deep leaves instead of shallow ones
    #[arg(long)]
    prefer_deepest_leaf: bool,

    #[arg(long, default_value_t = DEFAULT.rng_seed)]
    rng_seed: u64,
}

impl TrainArgs {
    fn hyper_param(&self) -> HyperParam {
        HyperParam {
            tree_variant: self.tree_structure,
            k: self.arity,
            tree_file: self.tree_file.as_ref().map(|p| p.display().to_string()),
            hasher: self.hasher,
            hash_dim: self.hash_dim,
            hasher_seed: self.hasher_seed,
            gamma: self.gamma,
            lambda: self.lambda,
            epochs: self.epochs,
            tuner: self.threshold_tuner,
            ofo_a_seed: self.ofo_a,
            ofo_b_seed: self.ofo_b,
            probability_weight: self.probability_weight,
            prefer_highest_prob_leaf: !self.prefer_lowest_prob_leaf,
            prefer_shallow_leaf: !self.prefer_deepest_leaf,
            rng_seed: self.rng_seed,
        }
    }
}

#[derive(Args)]
struct TestArgs {
    /// Path to the saved model directory
    model_path: PathBuf,

    /// Path to the test data file
    test_data_path: PathBuf,

    /// Number of top predictions to report per example
    #[arg(long, default_value_t = 5)]
    k_top: usize,

    /// File to write top-k predictions to, one "label:score" list per line
    #[arg(long)]
    out_path: Option<PathBuf>,
}

fn train(args: TrainArgs) -> Result<()> {
    let hyper = args.hyper_param();
    hyper.validate()?;
    let dataset = DataSet::load_xc_repo_data_file(&args.training_data_path)?;
    let mut model = hyper.allocate(&dataset)?;
    model.train(&dataset);
    if let Some(path) = &args.model_path {
        model.save(path)?;
    }
    Ok(())
}

fn test(args: TestArgs) -> Result<()> {
    let model = Model::load(&args.model_path)?;
    let dataset = DataSet::load_xc_repo_data_file(&args.test_data_path)?;

    let (predictions, _) = eval::test_all(&model, &dataset, args.k_top);
    info!(
        "Example-averaged F1 {:.4}",
        eval::example_f1(&model, &dataset)
    );

    if let Some(path) = &args.out_path {
        let mut writer = BufWriter::new(File::create(path)?);
        for prediction in &predictions {
            writeln!(
                writer,
                "{}",
                prediction
                    .iter()
                    .map(|(label, score)| format!("{}:{:.5}", label, score))
                    .join(" ")
            )?;
        }
        info!("Saved predictions to {}", path.display());
    }
    Ok(())
}

fn main() -> Result<()> {
    simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Info)
        .init()
        .unwrap();

    let cli = Cli::parse();
    rayon::ThreadPoolBuilder::new()
        .num_threads(cli.n_threads)
        .build_global()
        .unwrap();

    match cli.command {
        Commands::Train(args) => train(args),
        Commands::Test(args) => test(args),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
