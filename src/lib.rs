// Module declarations
pub mod model;
pub mod parse;
pub mod pca;
pub mod process;
pub mod progress;
pub mod session;
pub mod stats;

#[cfg(test)]
mod tests;

pub use crate::model::AdmixtureModel;
pub use crate::parse::{GenotypeEncoding, GenotypeSource, PopulationIndexMap, MISSING};
pub use crate::pca::PcaResult;
pub use crate::process::{CancellationToken, FrequencyMatrix, MixError};
pub use crate::progress::{ProgressEvent, ProgressSink};
pub use crate::session::{Session, SessionConfig};
pub use crate::stats::{BootstrapEstimate, StatisticResultSet, INVALID_FREQUENCY};
