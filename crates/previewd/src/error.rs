use thiserror::Error;

#[derive(Error, Debug)]
pub enum PreviewError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),
    #[error("required tool missing: {0}")]
    ToolchainMissing(String),
    #[error("simulator not found: {0}")]
    DeviceNotFound(String),
    #[error("companion not ready: {0}")]
    CompanionNotReady(String),
    #[error("headless boot failed: {0}")]
    BootFailed(String),
    #[error("application build failed: {0}")]
    BuildFailed(String),
    #[error("thunk compile failed")]
    CompileError { diagnostic: String },
    #[error("no preview titled {0:?} in source file")]
    SelectorNotFound(String),
    #[error("preview index {index} out of range (file has {count})")]
    SelectorOutOfRange { index: usize, count: usize },
    #[error("no preview declarations found in source file")]
    NoPreviewFound,
    #[error("frame transport closed: {0}")]
    TransportClosed(String),
    #[error("simctl failed: {0}")]
    Simctl(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl PreviewError {
    /// Wire-level reason string carried on `StreamStopped` events.
    pub fn reason(&self) -> &'static str {
        match self {
            PreviewError::ConfigInvalid(_) => "ConfigInvalid",
            PreviewError::ToolchainMissing(_) => "ToolchainMissing",
            PreviewError::DeviceNotFound(_) => "DeviceNotFound",
            PreviewError::CompanionNotReady(_) => "CompanionNotReady",
            PreviewError::BootFailed(_) => "BootFailed",
            PreviewError::BuildFailed(_) => "BuildFailed",
            PreviewError::CompileError { .. } => "CompileError",
            PreviewError::SelectorNotFound(_) => "SelectorNotFound",
            PreviewError::SelectorOutOfRange { .. } => "SelectorOutOfRange",
            PreviewError::NoPreviewFound => "NoPreviewFound",
            PreviewError::TransportClosed(_) => "TransportClosed",
            PreviewError::Simctl(_) => "SimctlFailed",
            PreviewError::Protocol(_) => "ProtocolError",
            PreviewError::Io(_) => "IoError",
            PreviewError::Json(_) => "ProtocolError",
        }
    }

    /// Diagnostic payload attached to events, where the variant carries one.
    pub fn diagnostic(&self) -> Option<&str> {
        match self {
            PreviewError::CompileError { diagnostic } => Some(diagnostic),
            PreviewError::TransportClosed(detail) => Some(detail),
            PreviewError::BuildFailed(detail) => Some(detail),
            PreviewError::BootFailed(detail) => Some(detail),
            _ => None,
        }
    }
}
