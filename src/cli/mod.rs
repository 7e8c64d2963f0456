pub mod config;
pub mod scenario;
pub mod validate;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "barrage")]
#[command(about = "Load testing engine: virtual users, metrics and thresholds", long_about = None)]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true, default_value_t = false)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a load test
    Run {
        /// Path to the test definition (YAML/JSON)
        definition: PathBuf,

        /// Number of virtual users (overrides the definition)
        #[arg(long, env = "BARRAGE_VUS")]
        vus: Option<usize>,

        /// Test duration, e.g. 30s or 5m (overrides the definition)
        #[arg(short, long, env = "BARRAGE_DURATION")]
        duration: Option<String>,

        /// Metric output, e.g. json=metrics.jsonl, json=out.jsonl,flushPeriod=500ms or elasticsearch=url=http://localhost:9200
        #[arg(short, long)]
        out: Vec<String>,

        /// Print the end-of-test summary as JSON instead of text
        #[arg(long, default_value_t = false)]
        json: bool,

        /// Export the end-of-test summary to a JSON file
        #[arg(long)]
        summary_export: Option<PathBuf>,
    },
    /// Validate a test definition without running it
    Validate {
        /// Path to the test definition (YAML/JSON)
        definition: PathBuf,
    },
    /// Print the JSON schema of the test definition format
    Schema,
}
