use arrow_schema::ArrowError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parquet Error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),
    #[error("Arrow Error: {0}")]
    Arrow(#[from] ArrowError),
    #[error("Data Error: {0}")]
    Data(String),
    #[error("CSV Error: {0}")]
    Csv(#[from] csv::Error),
    #[error("JSON Error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Shape Mismatch: expected {expected}, found {found}")]
    ShapeMismatch { expected: String, found: String },
    #[error("Insufficient Data: {0}")]
    InsufficientData(String),
    #[error("Invalid Input: {0}")]
    InvalidInput(String),
    #[error("Thread Pool Error: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

pub type Result<T> = std::result::Result<T, EngineError>;
