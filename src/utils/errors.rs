use thiserror::Error;

#[derive(Error, Debug)]
pub enum MonitoringError {
    #[error("No such process: {0}")]
    NoSuchProcess(u32),
    #[error("Unexpected output: {0}")]
    Parse(String),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("XML error: {0}")]
    Xml(#[from] roxmltree::Error),
    #[error("Other error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, MonitoringError>;
