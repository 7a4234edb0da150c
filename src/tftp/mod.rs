pub mod config;
pub mod endpoint;
pub mod error;
pub mod memory;
pub mod retriever;
pub mod sender;
pub mod shared;

pub use self::config::SessionConfig;
pub use self::endpoint::{receive_from, Endpoint, Received};
pub use self::error::{Awaiting, TransferError};
pub use self::memory::MemoryEndpoint;
pub use self::retriever::{ByteSink, RetrieverEvent, RetrieverSession, RetrieverState};
pub use self::sender::{SenderEvent, SenderSession, SenderState};

/// What a finished transfer moved, and with whom.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSummary<A> {
    pub peer: A,
    /// DATA blocks acknowledged, the final short one included.
    pub blocks: u32,
    pub bytes: usize,
}
