pub mod bandwidth;
pub mod chunk;
pub mod classifier;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod network;
pub mod queue;
pub mod resume;
pub mod session;
pub mod transport;
pub mod types;

pub use config::Config;
pub use error::{Result, TransferCoreError};
pub use events::{CompletionOutcome, EventSink, TransferEvent};
pub use session::{SessionDeps, SessionSettings, TransferSession};
pub use types::{
    ChunkState, Direction, Priority, ResourceDemand, TransferId, TransferRequest, TransferStatus,
};
