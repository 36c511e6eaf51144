use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use taxcount_rs::bridge::{call, ResultEnvelope};
use taxcount_rs::logging::init_logger;
use taxcount_rs::types::CountReport;

#[derive(Parser)]
#[command(name = "taxcount-rs")]
#[command(about = "Per-cell and per-molecule taxon counts from reads and classifier reports", long_about = None)]
struct Cli {
    /// Log progress at info level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join reads against reports and count (barcode, umi, taxon) buckets
    Count {
        /// JSON call configuration
        config: PathBuf,

        /// Also write the count table as TSV
        #[arg(long)]
        tsv: Option<PathBuf>,
    },

    /// Index classifier reports only and summarize them per taxon
    Index {
        /// JSON report configuration
        config: PathBuf,
    },

    /// Print crate version and decode backend
    Version,
}

fn spinner(color: &str, msg: &'static str) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    let template = format!("{{spinner:.{color}}} {{msg}}");
    let style = ProgressStyle::with_template(&template)
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);
    spinner.set_style(style);
    spinner.set_message(msg);
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner
}

fn read_config(path: &PathBuf) -> Result<String, String> {
    fs::read_to_string(path).map_err(|e| format!("cannot read {}: {}", path.display(), e))
}

fn write_tsv(envelope: &ResultEnvelope<serde_json::Value>, out: &PathBuf) -> Result<(), String> {
    let ResultEnvelope::Ok(value) = envelope else {
        return Ok(());
    };
    let report: CountReport =
        serde_json::from_value(value.clone()).map_err(|e| format!("unexpected count_taxa result: {e}"))?;
    fs::write(out, report.to_tsv()).map_err(|e| format!("cannot write {}: {}", out.display(), e))
}

fn run(cli: Cli) -> Result<ResultEnvelope<serde_json::Value>, String> {
    match cli.command {
        Commands::Count { config, tsv } => {
            let args = read_config(&config)?;
            let spinner = spinner("green", "Counting taxa...");
            let envelope = call("count_taxa", &args);
            spinner.finish_and_clear();
            if let Some(out) = tsv {
                write_tsv(&envelope, &out)?;
            }
            Ok(envelope)
        }
        Commands::Index { config } => {
            let args = read_config(&config)?;
            let spinner = spinner("blue", "Indexing reports...");
            let envelope = call("index_report", &args);
            spinner.finish_and_clear();
            Ok(envelope)
        }
        Commands::Version => Ok(call("version", "{}")),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logger(cli.verbose);

    let envelope = match run(cli) {
        Ok(envelope) => envelope,
        Err(msg) => ResultEnvelope::err(msg),
    };
    println!("{}", envelope.to_json());

    if envelope.is_ok() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
