use thiserror::Error;

#[derive(Debug, Error)]
/// Enum for various errors in Tsdb.
pub enum TsdbError {
  #[error("Bad request. {0}")]
  BadRequest(String),

  #[error("Not found. {0}")]
  NotFound(String),

  #[error("Out of memory. {0}")]
  OutOfMemory(String),

  #[error("Corrupted. {0}")]
  Corrupted(String),

  #[error("I/O error. {0}")]
  IoError(#[from] std::io::Error),

  #[error("Page at full capacity. Max capacity {0}.")]
  Full(usize),

  #[error("Already exists. {0}")]
  AlreadyExists(String),

  #[error("Cancelled")]
  Cancelled,

  #[error("Invalid configuration. {0}")]
  InvalidConfiguration(String),

  #[error("Encoding error. {0}")]
  EncodingError(String),

  #[error("Cannot decompress. {0}")]
  DecompressionFailed(String),

  #[error("Invalid compressor version. {0}")]
  InvalidCompression(String),

  #[error("Invalid timestamp. {0}")]
  InvalidTimestamp(String),

  #[error("Sample timestamp exceeds retention period")]
  SampleTooOld,

  #[error("Internal error. {0}")]
  Internal(String),
}

pub type TsdbResult<T> = Result<T, TsdbError>;

impl TsdbError {
  /// Whether startup should refuse to continue after seeing this error.
  pub fn is_fatal(&self) -> bool {
    matches!(self, TsdbError::Corrupted(_) | TsdbError::InvalidConfiguration(_))
  }
}
