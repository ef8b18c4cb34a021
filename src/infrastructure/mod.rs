//! External concerns: the WebSocket channel to the central system,
//! template reconciliation and configuration-file persistence.

pub mod channel;
pub mod persistence;
pub mod reconciler;

pub use channel::{memory_channel, ChannelError, ChannelEvent, ChannelSink, WebSocketChannel};
pub use persistence::{ConfigurationFile, PersistedConfiguration};
pub use reconciler::{reconcile, ReconciledStation};
