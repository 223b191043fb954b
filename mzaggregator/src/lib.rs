mod args;
mod deconv;
mod driver;
mod progress;
mod read;
mod time_range;
mod types;
mod write;

pub use args::*;
pub use deconv::{EngineDeconvolver, EngineType};
pub use driver::{MZAggregator, MZAggregatorError};
pub use progress::ProgressRecord;
pub use read::{load_run, read_run, ReadParams};
pub use time_range::{TimeRange, TimeRangeParseError};
pub use write::{
    infer_output_format, open_output, write_output, FeatureFormat, FeatureRecord, FeatureWriter,
};
