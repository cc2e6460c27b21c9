mod output_writer;
mod scenario_processor;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use log::{info, warn};
use output_writer::{OutputFormat, OutputWriter};
use pivot_engine::{
    AbatementMode, AnnualizeOptions, CapitalTiming, CostMode, CrfSource, Preset, ReferenceData,
    Registry, RunConfig, ValueStreamOptions,
};
use scenario_processor::{discover_scenarios, print_summary, EngineOutput, ScenarioProcessor, Task};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Instant;

#[derive(Parser)]
#[command(name = "expansion_results_processor")]
#[command(about = "Post-process capacity-expansion model runs into result tables")]
struct Cli {
    /// Folder of scenario runs, or a single run folder with an outputs/ directory
    #[arg(long, env = "RESULTS_RUNS_DIR", default_value = "runs", global = true)]
    runs: PathBuf,

    /// Folder with deflator.csv, cost_cat_type.csv, rsmap.csv and hours.csv
    #[arg(long, env = "RESULTS_REFERENCE_DIR", default_value = "inputs", global = true)]
    reference: PathBuf,

    /// Destination for result tables
    #[arg(long, env = "RESULTS_OUTPUT_DIR", default_value = "results", global = true)]
    output: PathBuf,

    /// JSON file with discount_rate, pv_year and dollar_year
    #[arg(long, env = "RESULTS_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Discount rate (fraction)
    #[arg(long, env = "RESULTS_DISCOUNT_RATE", global = true)]
    discount_rate: Option<f64>,

    /// Present-value year
    #[arg(long, env = "RESULTS_PV_YEAR", global = true)]
    pv_year: Option<i32>,

    /// Output dollar year
    #[arg(long, env = "RESULTS_DOLLAR_YEAR", global = true)]
    dollar_year: Option<i32>,

    /// Write Parquet instead of CSV
    #[arg(long, global = true)]
    parquet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List registered results
    List,
    /// Print a result's chart presets as JSON
    Presets { result: String },
    /// Run registered results on every scenario
    Run {
        results: Vec<String>,
        /// Run every registered result
        #[arg(long)]
        all: bool,
    },
    /// System cost table
    SystemCost {
        #[arg(long, value_enum, default_value = "raw")]
        mode: ModeArg,
        #[command(flatten)]
        annualize: AnnualizeArgs,
    },
    /// Annualized cost per MWh of load, national or by balancing region
    AverageCost {
        #[command(flatten)]
        annualize: AnnualizeArgs,
    },
    /// System costs next to CO2 emissions
    AbatementCost {
        #[arg(long, value_enum, default_value = "objective")]
        mode: AbatementArg,
        /// When annualized capital payments start
        #[arg(long, value_enum, default_value = "next-year")]
        timing: TimingArg,
    },
    /// Requirement prices (p x q) with totals and quantities
    RequirementPrices,
    /// Value factors and benchmark values per technology
    ValueFactors,
    /// National benchmark price per year
    BenchmarkPrice,
    /// LCOE, LVOE, NVOE and related metrics per technology
    Competitiveness,
    /// Bulk value streams per technology vintage, region and year
    ValueStreams {
        /// Drop investment variable streams
        #[arg(long)]
        remove_inv: bool,
        /// Use uncurtailed generation where the run reports it
        #[arg(long)]
        uncurt: bool,
        /// Keep investment years only, scaled to the investment
        #[arg(long)]
        investment_only: bool,
    },
    /// Every registered result and every engine output
    All,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Raw,
    Annualized,
    Objective,
}

#[derive(Clone, Copy, ValueEnum)]
enum AbatementArg {
    Objective,
    Annualized,
}

#[derive(Clone, Copy, ValueEnum)]
enum CrfArg {
    User,
    Model,
}

#[derive(Clone, Copy, ValueEnum)]
enum TimingArg {
    NextYear,
    SameYear,
}

#[derive(clap::Args, Clone, Copy)]
struct AnnualizeArgs {
    /// Keep the region column
    #[arg(long)]
    by_region: bool,

    /// Capital recovery factor source
    #[arg(long, value_enum, default_value = "model")]
    crf: CrfArg,

    /// When annualized capital payments start (national average-cost defaults to same-year)
    #[arg(long, value_enum)]
    timing: Option<TimingArg>,

    /// Drop costs before the present-value year
    #[arg(long)]
    remove_existing: bool,
}

impl AnnualizeArgs {
    fn options(&self, default_timing: CapitalTiming) -> AnnualizeOptions {
        AnnualizeOptions {
            by_region: self.by_region,
            crf_source: match self.crf {
                CrfArg::User => CrfSource::User,
                CrfArg::Model => CrfSource::Model,
            },
            capital_timing: match self.timing {
                Some(TimingArg::NextYear) => CapitalTiming::NextYear,
                Some(TimingArg::SameYear) => CapitalTiming::SameYear,
                None => default_timing,
            },
            remove_existing: self.remove_existing,
        }
    }
}

#[derive(Serialize)]
struct NamedPreset<'a> {
    name: &'a str,
    #[serde(flatten)]
    preset: &'a Preset,
}

fn run_config(cli: &Cli) -> Result<RunConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            serde_json::from_str(&text)
                .with_context(|| format!("parsing config {}", path.display()))?
        }
        None => RunConfig::default(),
    };
    if let Some(rate) = cli.discount_rate {
        config.discount_rate = rate;
    }
    if let Some(year) = cli.pv_year {
        config.pv_year = year;
    }
    if let Some(year) = cli.dollar_year {
        config.dollar_year = year;
    }
    Ok(config)
}

fn tasks_for(command: &Command, registry: &Registry) -> Result<Vec<Task>> {
    let tasks = match command {
        Command::Run { results, all } => {
            let names: Vec<String> = if *all || results.is_empty() {
                registry.names().into_iter().map(String::from).collect()
            } else {
                for name in results {
                    registry.get(name)?;
                }
                results.clone()
            };
            names.into_iter().map(Task::Result).collect()
        }
        Command::SystemCost { mode, annualize } => {
            let mode = match mode {
                ModeArg::Raw => CostMode::Raw,
                ModeArg::Objective => CostMode::Objective,
                ModeArg::Annualized => {
                    CostMode::Annualized(annualize.options(CapitalTiming::NextYear))
                }
            };
            vec![Task::Engine(EngineOutput::SystemCost(mode))]
        }
        Command::AverageCost { annualize } => {
            let engine = if annualize.by_region {
                EngineOutput::RegionalAverageCost(annualize.options(CapitalTiming::NextYear))
            } else {
                EngineOutput::AverageCost(annualize.options(CapitalTiming::SameYear))
            };
            vec![Task::Engine(engine)]
        }
        Command::AbatementCost { mode, timing } => {
            let timing = match timing {
                TimingArg::NextYear => CapitalTiming::NextYear,
                TimingArg::SameYear => CapitalTiming::SameYear,
            };
            let mode = match mode {
                AbatementArg::Objective => AbatementMode::Objective,
                AbatementArg::Annualized => AbatementMode::Annualized(timing),
            };
            vec![Task::Engine(EngineOutput::AbatementCost(mode))]
        }
        Command::RequirementPrices => vec![Task::Engine(EngineOutput::RequirementPrices)],
        Command::ValueFactors => vec![Task::Engine(EngineOutput::ValueFactors)],
        Command::BenchmarkPrice => vec![Task::Engine(EngineOutput::BenchmarkPrice)],
        Command::Competitiveness => vec![Task::Engine(EngineOutput::Competitiveness)],
        Command::ValueStreams {
            remove_inv,
            uncurt,
            investment_only,
        } => vec![Task::Engine(EngineOutput::ValueStreams(ValueStreamOptions {
            remove_inv: *remove_inv,
            uncurt: *uncurt,
            investment_only: *investment_only,
        }))],
        Command::All => {
            let mut tasks: Vec<Task> = registry
                .names()
                .into_iter()
                .map(|name| Task::Result(name.to_string()))
                .collect();
            let national = AnnualizeOptions::default();
            let regional = AnnualizeOptions {
                by_region: true,
                ..Default::default()
            };
            let average = AnnualizeOptions {
                capital_timing: CapitalTiming::SameYear,
                ..Default::default()
            };
            for engine in [
                EngineOutput::SystemCost(CostMode::Raw),
                EngineOutput::SystemCost(CostMode::Objective),
                EngineOutput::SystemCost(CostMode::Annualized(national)),
                EngineOutput::SystemCost(CostMode::Annualized(regional)),
                EngineOutput::AverageCost(average),
                EngineOutput::RegionalAverageCost(regional),
                EngineOutput::AbatementCost(AbatementMode::Objective),
                EngineOutput::AbatementCost(AbatementMode::Annualized(CapitalTiming::NextYear)),
                EngineOutput::RequirementPrices,
                EngineOutput::ValueFactors,
                EngineOutput::BenchmarkPrice,
                EngineOutput::Competitiveness,
                EngineOutput::ValueStreams(ValueStreamOptions::default()),
            ] {
                tasks.push(Task::Engine(engine));
            }
            tasks
        }
        Command::List | Command::Presets { .. } => Vec::new(),
    };
    Ok(tasks)
}

fn load_reference(dir: &Path) -> Result<ReferenceData> {
    if dir.is_dir() {
        ReferenceData::from_dir(dir)
            .with_context(|| format!("loading reference data from {}", dir.display()))
    } else {
        warn!(
            "Reference directory {} not found; deflators and cost types are empty",
            dir.display()
        );
        Ok(ReferenceData::new())
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let registry = Registry::builtin();

    match &cli.command {
        Command::List => {
            for name in registry.names() {
                println!("{}", name);
            }
            return Ok(());
        }
        Command::Presets { result } => {
            let presets: Vec<NamedPreset> = registry
                .presets(result)?
                .iter()
                .map(|(name, preset)| NamedPreset { name, preset })
                .collect();
            println!("{}", serde_json::to_string_pretty(&presets)?);
            return Ok(());
        }
        _ => {}
    }

    rayon::ThreadPoolBuilder::new()
        .num_threads(num_cpus::get())
        .build_global()
        .context("configuring rayon thread pool")?;

    let config = run_config(&cli)?;
    let tasks = tasks_for(&cli.command, &registry)?;

    println!("🚀 Capacity Expansion Results Processor");
    println!("Using {} CPU cores", rayon::current_num_threads());
    println!(
        "Discount rate {:.3}, PV year {}, {}$",
        config.discount_rate, config.pv_year, config.dollar_year
    );
    println!("{}", "=".repeat(60));

    let reference = load_reference(&cli.reference)?;
    let scenarios = discover_scenarios(&cli.runs)?;
    if scenarios.is_empty() {
        println!("❌ No scenario runs found under {}", cli.runs.display());
        return Ok(());
    }
    println!(
        "Found {} scenarios, {} outputs each",
        scenarios.len(),
        tasks.len()
    );
    info!("Writing results to {}", cli.output.display());

    let format = if cli.parquet {
        OutputFormat::Parquet
    } else {
        OutputFormat::Csv
    };
    let writer = OutputWriter::new(&cli.output, format);
    let processor = ScenarioProcessor::new(&registry, &reference, config, writer);

    let start = Instant::now();
    let outcomes = processor.process(&scenarios, &tasks);
    let failures = print_summary(&outcomes);
    println!("\n⏱️  Completed in {:?}", start.elapsed());

    if failures > 0 && failures == outcomes.len() {
        anyhow::bail!("every output failed");
    }
    Ok(())
}
