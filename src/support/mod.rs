//! Cross-cutting utilities: OCPP-J framing, error types, electric math,
//! request statistics, file cache, shutdown coordination.

pub mod cache;
pub mod electric;
pub mod errors;
pub mod frame;
pub mod shutdown;
pub mod statistics;

pub use cache::{CachedDocument, FileCache};
pub use electric::CurrentType;
pub use errors::{EngineError, OcppCallError, StationInitError};
pub use frame::{ErrorCode, Frame, FrameError};
pub use shutdown::ShutdownSignal;
pub use statistics::{StatisticsRegistry, TimeMeasurements};
