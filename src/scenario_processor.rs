use crate::output_writer::OutputWriter;
use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, warn};
use pivot_engine::benchmarks::QUANTITY_TABLE;
use pivot_engine::competitiveness::BENCHMARK_PRICE;
use pivot_engine::system_cost::load_emissions;
use pivot_engine::table::YEAR;
use pivot_engine::{
    AbatementMode, AnnualizeOptions, BenchmarkEngine, BulkValueStreamInputs,
    CompetitivenessEngine, CostMode, CostTables, CsvTableLoader, PipelineRunner, ReferenceData,
    RegionalCostEngine, RegionalCostInputs, Registry, RunConfig, SystemCostEngine, TableLoader,
    ValueStreamEngine, ValueStreamInputs, ValueStreamOptions,
};
use polars::prelude::*;
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// A model run folder holding an `outputs/` directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scenario {
    pub name: String,
    pub dir: PathBuf,
}

/// Find scenarios under `runs`. A `runs` directory that is itself a run is
/// returned as the only scenario.
pub fn discover_scenarios(runs: &Path) -> Result<Vec<Scenario>> {
    if !runs.is_dir() {
        anyhow::bail!("Runs directory not found: {}", runs.display());
    }
    if runs.join("outputs").is_dir() {
        return Ok(vec![Scenario {
            name: scenario_name(runs),
            dir: runs.to_path_buf(),
        }]);
    }

    let mut scenarios = Vec::new();
    for entry in WalkDir::new(runs)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
    {
        let entry = entry.with_context(|| format!("reading {}", runs.display()))?;
        let path = entry.path();
        if entry.file_type().is_dir() && path.join("outputs").is_dir() {
            scenarios.push(Scenario {
                name: scenario_name(path),
                dir: path.to_path_buf(),
            });
        } else {
            debug!("Skipping {}: no outputs folder", path.display());
        }
    }
    Ok(scenarios)
}

fn scenario_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Engine computations that run alongside the registry results.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EngineOutput {
    SystemCost(CostMode),
    AverageCost(AnnualizeOptions),
    RegionalAverageCost(AnnualizeOptions),
    AbatementCost(AbatementMode),
    RequirementPrices,
    ValueFactors,
    BenchmarkPrice,
    Competitiveness,
    ValueStreams(ValueStreamOptions),
}

impl EngineOutput {
    pub fn name(&self) -> String {
        match self {
            EngineOutput::SystemCost(CostMode::Raw) => "System Cost".to_string(),
            EngineOutput::SystemCost(CostMode::Objective) => "System Cost (Objective)".to_string(),
            EngineOutput::SystemCost(CostMode::Annualized(options)) => {
                if options.by_region {
                    "System Cost (Annualized, Regional)".to_string()
                } else {
                    "System Cost (Annualized)".to_string()
                }
            }
            EngineOutput::AverageCost(_) => "National Average Cost".to_string(),
            EngineOutput::RegionalAverageCost(_) => "Regional Average Cost".to_string(),
            EngineOutput::AbatementCost(AbatementMode::Objective) => {
                "Abatement Cost (Objective)".to_string()
            }
            EngineOutput::AbatementCost(AbatementMode::Annualized(_)) => {
                "Abatement Cost (Annualized)".to_string()
            }
            EngineOutput::RequirementPrices => "Requirement Prices".to_string(),
            EngineOutput::ValueFactors => "Value Factors".to_string(),
            EngineOutput::BenchmarkPrice => "National Benchmark Price".to_string(),
            EngineOutput::Competitiveness => "Competitiveness".to_string(),
            EngineOutput::ValueStreams(options) => {
                let mut flags = Vec::new();
                if options.remove_inv {
                    flags.push("no investment");
                }
                if options.uncurt {
                    flags.push("uncurtailed");
                }
                if options.investment_only {
                    flags.push("investment only");
                }
                if flags.is_empty() {
                    "Value Streams".to_string()
                } else {
                    format!("Value Streams ({})", flags.join(", "))
                }
            }
        }
    }

    fn compute(
        &self,
        config: RunConfig,
        reference: &ReferenceData,
        loader: &dyn TableLoader,
    ) -> Result<DataFrame> {
        match self {
            EngineOutput::SystemCost(mode) => {
                let tables = CostTables::load(loader)?;
                SystemCostEngine::new(config, reference).compute(&tables, *mode)
            }
            EngineOutput::AverageCost(options) => {
                let tables = CostTables::load(loader)?;
                let quantities = loader.load(QUANTITY_TABLE)?;
                SystemCostEngine::new(config, reference).national_average_cost(
                    &tables,
                    &quantities,
                    options,
                )
            }
            EngineOutput::RegionalAverageCost(options) => {
                let tables = CostTables::load(loader)?;
                let inputs = RegionalCostInputs::load(loader)?;
                RegionalCostEngine::new(config, reference).average_cost(&tables, &inputs, options)
            }
            EngineOutput::AbatementCost(mode) => {
                let tables = CostTables::load(loader)?;
                let emissions = load_emissions(loader)?;
                SystemCostEngine::new(config, reference).abatement_cost(&tables, &emissions, *mode)
            }
            EngineOutput::RequirementPrices => {
                let inputs = ValueStreamInputs::load(loader)?;
                BenchmarkEngine::new(config, reference).requirement_prices(&inputs)
            }
            EngineOutput::ValueFactors => {
                let inputs = ValueStreamInputs::load(loader)?;
                BenchmarkEngine::new(config, reference).value_factors(&inputs)
            }
            EngineOutput::BenchmarkPrice => {
                let inputs = ValueStreamInputs::load(loader)?;
                let prices =
                    BenchmarkEngine::new(config, reference).national_benchmark_price(&inputs)?;
                let years: Vec<i64> = prices.keys().map(|y| *y as i64).collect();
                let values: Vec<Option<f64>> = prices.values().copied().collect();
                Ok(DataFrame::new(vec![
                    Series::new(YEAR.into(), years),
                    Series::new(BENCHMARK_PRICE.into(), values),
                ])?)
            }
            EngineOutput::Competitiveness => {
                let inputs = ValueStreamInputs::load(loader)?;
                CompetitivenessEngine::new(config, reference).metrics(&inputs)
            }
            EngineOutput::ValueStreams(options) => {
                let inputs = BulkValueStreamInputs::load(loader)?;
                ValueStreamEngine::new(config, reference).bulk_value_streams(&inputs, options)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Task {
    Result(String),
    Engine(EngineOutput),
}

impl Task {
    pub fn name(&self) -> String {
        match self {
            Task::Result(name) => name.clone(),
            Task::Engine(engine) => engine.name(),
        }
    }
}

/// Outcome of one task on one scenario.
#[derive(Debug)]
pub struct TaskOutcome {
    pub scenario: String,
    pub task: String,
    pub rows: usize,
    pub written: Result<PathBuf, String>,
}

pub struct ScenarioProcessor<'a> {
    registry: &'a Registry,
    reference: &'a ReferenceData,
    config: RunConfig,
    writer: OutputWriter,
    show_progress: bool,
}

impl<'a> ScenarioProcessor<'a> {
    pub fn new(
        registry: &'a Registry,
        reference: &'a ReferenceData,
        config: RunConfig,
        writer: OutputWriter,
    ) -> Self {
        Self {
            registry,
            reference,
            config,
            writer,
            show_progress: true,
        }
    }

    pub fn quiet(mut self) -> Self {
        self.show_progress = false;
        self
    }

    /// Run every task on every scenario in parallel. Failures are collected
    /// into the outcomes instead of aborting the batch.
    pub fn process(&self, scenarios: &[Scenario], tasks: &[Task]) -> Vec<TaskOutcome> {
        let jobs: Vec<(&Scenario, &Task)> = scenarios
            .iter()
            .flat_map(|scenario| tasks.iter().map(move |task| (scenario, task)))
            .collect();

        let pb = if self.show_progress {
            let pb = ProgressBar::new(jobs.len() as u64);
            if let Ok(style) = ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
            {
                pb.set_style(style);
            }
            pb
        } else {
            ProgressBar::hidden()
        };

        let runner = PipelineRunner::new(self.registry, self.config, self.reference);
        let outcomes: Vec<TaskOutcome> = jobs
            .par_iter()
            .map(|(scenario, task)| {
                let loader = CsvTableLoader::for_run(&scenario.dir);
                let computed = match task {
                    Task::Result(name) => runner
                        .run(name, &loader)
                        .map(|table| table.data)
                        .map_err(anyhow::Error::from),
                    Task::Engine(engine) => engine.compute(self.config, self.reference, &loader),
                };
                let task_name = task.name();
                let (rows, written) = match computed.and_then(|df| {
                    let path = self.writer.write(&scenario.name, &task_name, &df)?;
                    Ok((df.height(), path))
                }) {
                    Ok((rows, path)) => (rows, Ok(path)),
                    Err(e) => {
                        warn!("{} / {}: {:#}", scenario.name, task_name, e);
                        (0, Err(format!("{:#}", e)))
                    }
                };
                pb.inc(1);
                TaskOutcome {
                    scenario: scenario.name.clone(),
                    task: task_name,
                    rows,
                    written,
                }
            })
            .collect();
        pb.finish_with_message("Scenarios processed");
        outcomes
    }
}

/// Print the per-scenario summary. Returns the number of failures.
pub fn print_summary(outcomes: &[TaskOutcome]) -> usize {
    println!("\n{}", "=".repeat(60));
    println!("📊 Batch Summary");
    println!("{}", "=".repeat(60));

    let mut current = None;
    let mut failures = 0;
    for outcome in outcomes {
        if current != Some(outcome.scenario.as_str()) {
            println!("\n📁 {}", outcome.scenario);
            current = Some(outcome.scenario.as_str());
        }
        match &outcome.written {
            Ok(path) => println!(
                "    ✅ {} ({} rows) → {}",
                outcome.task,
                outcome.rows,
                path.display()
            ),
            Err(e) => {
                failures += 1;
                println!("    ❌ {}: {}", outcome.task, e);
            }
        }
    }

    println!("\n{}", "=".repeat(60));
    if failures == 0 {
        println!("✅ All {} outputs written", outcomes.len());
    } else {
        println!(
            "⚠️  {} of {} outputs failed",
            failures,
            outcomes.len()
        );
    }
    failures
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output_writer::OutputFormat;
    use std::fs;
    use tempfile::TempDir;

    fn write_run(root: &Path, name: &str, with_cap: bool) -> PathBuf {
        let outputs = root.join(name).join("outputs");
        fs::create_dir_all(&outputs).unwrap();
        if with_cap {
            fs::write(
                outputs.join("cap.csv"),
                "tech,rb,year,month,day,hour,Capacity (GW)\n\
                 wind,p1,2030,1,1,0,1000000\n\
                 wind,p2,2030,1,1,0,2000000\n\
                 gas,p1,2030,1,1,0,4000000\n",
            )
            .unwrap();
        }
        root.join(name)
    }

    #[test]
    fn test_discover_scenarios() {
        let dir = TempDir::new().unwrap();
        write_run(dir.path(), "b_high", true);
        write_run(dir.path(), "a_ref", true);
        fs::create_dir_all(dir.path().join("notes")).unwrap();

        let scenarios = discover_scenarios(dir.path()).unwrap();
        let names: Vec<&str> = scenarios.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["a_ref", "b_high"]);
    }

    #[test]
    fn test_single_run_directory() {
        let dir = TempDir::new().unwrap();
        let run = write_run(dir.path(), "only", true);
        let scenarios = discover_scenarios(&run).unwrap();
        assert_eq!(scenarios.len(), 1);
        assert_eq!(scenarios[0].name, "only");
    }

    #[test]
    fn test_missing_runs_directory() {
        let dir = TempDir::new().unwrap();
        assert!(discover_scenarios(&dir.path().join("absent")).is_err());
    }

    #[test]
    fn test_failures_do_not_stop_batch() {
        let runs = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        write_run(runs.path(), "good", true);
        write_run(runs.path(), "empty", false);

        let registry = Registry::builtin();
        let reference = ReferenceData::new();
        let writer = OutputWriter::new(out.path(), OutputFormat::Csv);
        let processor =
            ScenarioProcessor::new(&registry, &reference, RunConfig::default(), writer).quiet();

        let scenarios = discover_scenarios(runs.path()).unwrap();
        let tasks = vec![
            Task::Result("Capacity National (Yearly)".to_string()),
            Task::Result("No Such Result".to_string()),
        ];
        let outcomes = processor.process(&scenarios, &tasks);
        assert_eq!(outcomes.len(), 4);

        let ok: Vec<&TaskOutcome> = outcomes.iter().filter(|o| o.written.is_ok()).collect();
        assert_eq!(ok.len(), 1);
        assert_eq!(ok[0].scenario, "good");
        assert_eq!(ok[0].rows, 2);
        assert!(out
            .path()
            .join("good")
            .join("Capacity National (Yearly).csv")
            .exists());
        assert_eq!(print_summary(&outcomes), 3);
    }

    #[test]
    fn test_engine_output_names() {
        assert_eq!(EngineOutput::SystemCost(CostMode::Raw).name(), "System Cost");
        let regional = AnnualizeOptions {
            by_region: true,
            ..Default::default()
        };
        assert_eq!(
            Task::Engine(EngineOutput::SystemCost(CostMode::Annualized(regional))).name(),
            "System Cost (Annualized, Regional)"
        );
        assert_eq!(Task::Result("x".to_string()).name(), "x");
        assert_eq!(
            EngineOutput::AbatementCost(AbatementMode::Annualized(Default::default())).name(),
            "Abatement Cost (Annualized)"
        );
        assert_eq!(
            EngineOutput::ValueStreams(ValueStreamOptions::default()).name(),
            "Value Streams"
        );
        let options = ValueStreamOptions {
            remove_inv: true,
            investment_only: true,
            ..Default::default()
        };
        assert_eq!(
            EngineOutput::ValueStreams(options).name(),
            "Value Streams (no investment, investment only)"
        );
    }

    #[test]
    fn test_engine_outputs_report_missing_tables() {
        let runs = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        write_run(runs.path(), "bare", true);

        let registry = Registry::builtin();
        let reference = ReferenceData::new();
        let writer = OutputWriter::new(out.path(), OutputFormat::Csv);
        let processor =
            ScenarioProcessor::new(&registry, &reference, RunConfig::default(), writer).quiet();
        let regional = AnnualizeOptions {
            by_region: true,
            ..Default::default()
        };
        let tasks = vec![
            Task::Engine(EngineOutput::RegionalAverageCost(regional)),
            Task::Engine(EngineOutput::AbatementCost(AbatementMode::Objective)),
            Task::Engine(EngineOutput::ValueStreams(ValueStreamOptions::default())),
        ];
        let outcomes = processor.process(&discover_scenarios(runs.path()).unwrap(), &tasks);
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes.iter().all(|o| o.written.is_err()));
        assert!(!out.path().join("bare").exists());
    }
}
