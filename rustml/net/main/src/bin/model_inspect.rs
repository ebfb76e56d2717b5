use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use rustml_net::{ArchitectureFile, CheckpointManifest, PackageManifest, TensorFile, ARCHITECTURE_FILE};

/// RustML model inspector: model packages, checkpoints and tensor files.
#[derive(Parser)]
#[command(name = "rustml-model-inspect", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show a model package manifest and its tensor table.
    Info {
        /// Package directory.
        dir: PathBuf,

        /// Only list tensors whose name contains this pattern.
        #[arg(long)]
        filter: Option<String>,
    },

    /// Show a checkpoint manifest and its shard table.
    Checkpoint {
        /// Checkpoint directory.
        dir: PathBuf,

        /// Also list every record of every shard.
        #[arg(long)]
        records: bool,
    },

    /// Show the header of a binary tensor file.
    Tensor {
        /// Path to the tensor file.
        path: PathBuf,

        /// Print the first N rows.
        #[arg(long, default_value_t = 0)]
        rows: usize,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match &cli.command {
        Command::Info { dir, filter } => {
            let manifest = PackageManifest::read(dir)
                .with_context(|| format!("Failed to read package manifest in {}", dir.display()))?;
            println!("Format version: {}", manifest.format_version);
            println!("Architecture:   {}", manifest.architecture_type);
            println!("Inputs:         {}", manifest.io.inputs);
            println!("Outputs:        {}", manifest.io.outputs);
            println!("Epoch:          {}", manifest.epoch);
            println!("Tensor files:   {}", manifest.tensor_files.join(", "));

            let arch_path = dir.join(ARCHITECTURE_FILE);
            match std::fs::read_to_string(&arch_path)
                .map_err(anyhow::Error::from)
                .and_then(|text| serde_json::from_str::<ArchitectureFile>(&text).map_err(anyhow::Error::from))
            {
                Ok(spec) => {
                    println!("Optimizer:      {:?}", spec.training.optimizer);
                    println!("Learning rate:  {}", spec.training.learning_rate);
                    println!("Batch size:     {}", spec.training.batch_size);
                }
                Err(e) => eprintln!("Could not read {}: {e}", arch_path.display()),
            }

            let mut count = 0usize;
            let mut total = 0usize;
            for t in manifest
                .tensors
                .iter()
                .filter(|t| filter.as_ref().map_or(true, |pat| t.name.contains(pat.as_str())))
            {
                let numel: usize = t.shape.iter().product();
                println!("{:<40} {:?}  {}", t.name, t.shape, numel);
                count += 1;
                total += numel;
            }
            eprintln!("{count} tensor(s), {total} parameter(s)");
        }

        Command::Checkpoint { dir, records } => {
            let manifest = CheckpointManifest::read(dir)
                .with_context(|| format!("Failed to read checkpoint manifest in {}", dir.display()))?;
            println!("Format version: {}", manifest.format_version);
            println!("Architecture:   {}", manifest.architecture.kind_name());
            println!("Epoch:          {}", manifest.epoch);
            println!("Optimizer step: {}", manifest.optimizer_step);
            println!("Loss scale:     {}", manifest.loss_scale);
            println!("Inputs:         {}", manifest.io.inputs);
            println!("Outputs:        {}", manifest.io.outputs);
            for shard in &manifest.shards {
                println!("{:<20} {:>12} bytes  {} record(s)", shard.file, shard.bytes, shard.tensors.len());
                if *records {
                    for t in &shard.tensors {
                        println!("    {:<40} {:?}  {}", t.name, t.part, t.count);
                    }
                }
            }
            eprintln!("{} shard(s), {} bytes", manifest.shards.len(), manifest.total_bytes());
        }

        Command::Tensor { path, rows } => {
            let file = TensorFile::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
            let header = file.header();
            println!("Version:      {}", header.version);
            println!("DType:        {}", header.dtype);
            println!("Rows:         {}", header.rows);
            println!("Cols:         {}", header.cols);
            println!("Data offset:  {}", header.data_offset);
            for r in 0..(*rows).min(file.rows()) {
                println!("[{r}] {:?}", file.row(r));
            }
        }
    }

    Ok(())
}
