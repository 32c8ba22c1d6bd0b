// ========================================================================================
//
//                               THE VISITGRID COMMAND LINE
//
// ========================================================================================
//
// Two entry points share one binary. `encode` streams an event file through the
// pipeline and writes per-visit timelines plus severity baselines into an output
// directory. `bootstrap` turns a hand-curated definition sheet into the catalog rows
// that must lead every event file.

use clap::{Parser, Subcommand, ValueEnum};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process;
use visitgrid::artifact::DirectorySink;
use visitgrid::bootstrap::{BootstrapError, bootstrap};
use visitgrid::config::{EncoderConfig, NormalizationMethod};
use visitgrid::pipeline::{Pipeline, PipelineError};
use visitgrid::types::PatientId;

#[derive(Parser)]
#[command(
    name = "visitgrid",
    version,
    about = "Encodes clinical event streams into fixed-size visit timelines.",
    long_about = "Encodes per-event clinical observations into fixed-size hourly visit timelines \
                 and scores every visit with rule-based severity systems."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum NormArg {
    MinMax,
    Reference,
    ReferenceMinMax,
}

impl From<NormArg> for NormalizationMethod {
    fn from(arg: NormArg) -> Self {
        match arg {
            NormArg::MinMax => NormalizationMethod::MinMax,
            NormArg::Reference => NormalizationMethod::Reference,
            NormArg::ReferenceMinMax => NormalizationMethod::ReferenceMinMax,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Encode an event file into visit timelines and severity baselines
    Encode {
        /// Event file (CSV, optionally gzip-compressed)
        #[arg(value_name = "EVENTS")]
        input: PathBuf,

        /// Directory that receives the train/test/val timelines and score files
        #[arg(long, short)]
        output: PathBuf,

        /// TOML configuration; omitted fields keep their defaults
        #[arg(long)]
        config: Option<PathBuf>,

        /// Override the number of hourly columns per timeline
        #[arg(long)]
        horizon_hours: Option<usize>,

        /// Override the number of rows after which a batch is flushed
        #[arg(long)]
        batch_rows: Option<usize>,

        /// Override the normalization method
        #[arg(long, value_enum)]
        norm_method: Option<NormArg>,

        /// Admit every patient id instead of the configured window
        #[arg(long)]
        no_patient_window: bool,

        /// Skip severity scoring
        #[arg(long)]
        no_scoring: bool,
    },

    /// Write catalog rows from a variable definition sheet
    Bootstrap {
        /// Definition sheet (CSV with a header row)
        #[arg(value_name = "DEFINITIONS")]
        definitions: PathBuf,

        /// Destination file; standard output when omitted
        #[arg(long, short)]
        output: Option<PathBuf>,

        /// Patient id that tags the catalog rows
        #[arg(long, default_value_t = 0)]
        sentinel: u64,
    },
}

struct EncodeOverrides {
    horizon_hours: Option<usize>,
    batch_rows: Option<usize>,
    norm_method: Option<NormArg>,
    no_patient_window: bool,
    no_scoring: bool,
}

fn resolve_config(path: Option<&Path>, overrides: EncodeOverrides) -> Result<EncoderConfig, PipelineError> {
    let mut config = match path {
        Some(path) => {
            log::info!("Loading configuration from '{}'.", path.display());
            EncoderConfig::load(path)?
        }
        None => EncoderConfig::default(),
    };
    if let Some(hours) = overrides.horizon_hours {
        config.horizon_hours = hours;
    }
    if let Some(rows) = overrides.batch_rows {
        config.batch_rows = rows;
    }
    if let Some(method) = overrides.norm_method {
        config.normalization.method = method.into();
    }
    if overrides.no_patient_window {
        config.patient_window = None;
    }
    if overrides.no_scoring {
        config.scoring.enabled = false;
    }
    Ok(config)
}

fn run_encode(input: &Path, output: &Path, config: EncoderConfig) -> Result<(), PipelineError> {
    let pipeline = Pipeline::new(config)?;
    let mut sink = DirectorySink::new(output)?;
    let summary = pipeline.run_path(input, &mut sink)?;
    eprintln!(
        "\nSuccess! Encoded {} visits from {} rows into '{}'.",
        summary.visits_flushed,
        summary.rows_read,
        output.display()
    );
    Ok(())
}

fn run_bootstrap(definitions: &Path, output: Option<&Path>, sentinel: u64) -> Result<(), PipelineError> {
    let reader = BufReader::new(File::open(definitions).map_err(BootstrapError::from)?);
    let writer: Box<dyn Write> = match output {
        Some(path) => Box::new(BufWriter::new(
            File::create(path).map_err(BootstrapError::from)?,
        )),
        None => Box::new(BufWriter::new(io::stdout().lock())),
    };
    bootstrap(reader, PatientId(sentinel), writer)?;
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Encode {
            input,
            output,
            config,
            horizon_hours,
            batch_rows,
            norm_method,
            no_patient_window,
            no_scoring,
        } => {
            let overrides = EncodeOverrides {
                horizon_hours,
                batch_rows,
                norm_method,
                no_patient_window,
                no_scoring,
            };
            resolve_config(config.as_deref(), overrides).and_then(|config| run_encode(&input, &output, config))
        }
        Commands::Bootstrap {
            definitions,
            output,
            sentinel,
        } => run_bootstrap(&definitions, output.as_deref(), sentinel),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
