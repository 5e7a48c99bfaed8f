use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Failures surfaced through `Result`. Everything here is fatal to `init`:
/// a node that cannot open its log or make sense of its on-disk state must
/// not serve traffic. Runtime log-file write failures abort the process
/// instead (the on-disk length must always equal `current`).
#[derive(Debug, Error)]
pub enum Error {
    #[error("own address {own:?} not present in node list {nodes:?}")]
    NodeNotInList { own: String, nodes: Vec<String> },

    #[error("node list must contain exactly two addresses, got {0}")]
    BadNodeCount(usize),

    #[error("state machine callback not registered before init")]
    CallbackNotRegistered,

    #[error("init called twice")]
    AlreadyInitialized,

    #[error("log file corrupt: {0}")]
    CorruptLog(String),

    #[error("config: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}
