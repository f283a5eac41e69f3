pub mod continuous;
pub mod correlate;
pub mod delay;
pub mod error;
pub mod graph;
pub mod hop;
pub mod model;
pub mod parser;
pub mod relay;
pub mod settings;
pub mod source;
pub mod span;
pub mod telemetry;

pub use error::{ConnectionKind, TraceError};
pub use model::{LogEntry, LogQuery, RelayResult};
