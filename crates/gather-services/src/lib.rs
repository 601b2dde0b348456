//! gather-services — the sender and receiver roles and the state they own.

pub mod chunk_store;
pub mod net;
pub mod progress;
pub mod receiver;
pub mod sender;

pub use chunk_store::{AssemblyError, ChunkStore, InsertOutcome, StoreError};
pub use progress::{ConsoleProgress, NoProgress, ProgressReporter};
pub use receiver::{
    DispatchReport, ReceiverCoordinator, ReceiverSettings, TransferError, TransferOutcome,
};
pub use sender::{SenderAgent, SenderSettings, SenderTasks};
