use std::{error::Error, fmt, io};

/// The crate's result type.
pub type Result<T> = std::result::Result<T, TrainErr>;

/// Failures surfaced to the training driver.
///
/// Contract violations (out of range shards, mismatched buffer lengths, sparse
/// capacity overflows) are not represented here, they abort the run by panicking.
#[derive(Debug)]
pub enum TrainErr {
    Io(io::Error),
    Parse(serde_json::Error),
    InvalidConfig(String),
    ReplicaCount {
        expected: usize,
        got: usize,
    },
    ReplicaSize {
        replica: usize,
        got: usize,
        expected: usize,
    },
    CheckpointSize {
        got: usize,
        expected: usize,
    },
    AlreadyStarted,
    PoolPoisoned,
    Finished,
}

impl fmt::Display for TrainErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainErr::Io(e) => write!(f, "io error: {e}"),
            TrainErr::Parse(e) => write!(f, "config parse error: {e}"),
            TrainErr::InvalidConfig(detail) => write!(f, "invalid config: {detail}"),
            TrainErr::ReplicaCount { expected, got } => {
                write!(f, "replica count mismatch: got {got}, expected {expected}")
            }
            TrainErr::ReplicaSize {
                replica,
                got,
                expected,
            } => write!(
                f,
                "replica {replica} holds {got} parameters, expected {expected}"
            ),
            TrainErr::CheckpointSize { got, expected } => write!(
                f,
                "checkpoint length mismatch: got {got}, expected {expected}"
            ),
            TrainErr::AlreadyStarted => f.write_str("training already started"),
            TrainErr::PoolPoisoned => {
                f.write_str("a worker failed, the pool no longer accepts batches")
            }
            TrainErr::Finished => f.write_str("the group already finished"),
        }
    }
}

impl Error for TrainErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            TrainErr::Io(e) => Some(e),
            TrainErr::Parse(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for TrainErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<serde_json::Error> for TrainErr {
    fn from(value: serde_json::Error) -> Self {
        Self::Parse(value)
    }
}

/// Boundary conversion for binaries / I/O APIs.
impl From<TrainErr> for io::Error {
    fn from(value: TrainErr) -> Self {
        match value {
            TrainErr::Io(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}
