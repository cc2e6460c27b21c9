pub mod benchmarks;
pub mod capital_recovery;
pub mod competitiveness;
pub mod data_loader;
pub mod error;
pub mod models;
pub mod reference_data;
pub mod regional_cost;
pub mod registry;
pub mod runner;
pub mod system_cost;
pub mod table;
pub mod transforms;
pub mod value_streams;

pub use benchmarks::{BenchmarkEngine, ValueStreamInputs};
pub use capital_recovery::{CapitalTiming, CrfSchedule, CrfSource};
pub use competitiveness::{CompetitivenessEngine, Metrics};
pub use data_loader::{CsvTableLoader, InMemoryLoader, TableLoader};
pub use error::{PipelineError, TransformError};
pub use models::{ChartType, CostKind, NamedPresets, Preset, PresetFilter, RunConfig};
pub use reference_data::{CostClassification, ReferenceData};
pub use regional_cost::{RegionalCostEngine, RegionalCostInputs};
pub use registry::{Registry, ResultSpec, Step};
pub use runner::{PipelineRunner, ResultTable};
pub use system_cost::{AbatementMode, AnnualizeOptions, CostMode, CostTables, SystemCostEngine};
pub use transforms::{ColumnSelection, Resolution, SumArgs};
pub use value_streams::{BulkValueStreamInputs, ValueStreamEngine, ValueStreamOptions};
