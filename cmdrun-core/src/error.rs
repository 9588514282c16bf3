use thiserror::Error;

#[derive(Error, Debug)]
pub enum CmdRunError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Runner for '{0}' has already been executed")]
    AlreadyExecuted(String),

    #[error("Execution error: {0}")]
    ExecutionError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}

pub type Result<T> = std::result::Result<T, CmdRunError>;
