mod logging;
mod memory_mode;
mod model_source;
mod precision;
mod progress;
mod tokens;

pub use logging::{init_logging, LogBuffer, LogWriter};
pub use memory_mode::{MemoryMode, UnknownMemoryMode};
pub use model_source::*;
pub use precision::{Precision, UnknownPrecision};
pub use progress::{
    FileStat, ProgressBarSink, ProgressEvent, ProgressSink, ProgressTracker,
    PROGRESS_UNITS_PER_MODEL,
};
pub use tokens::get_token;
pub use tokens::TokenSource;

pub use candle_core as core;
