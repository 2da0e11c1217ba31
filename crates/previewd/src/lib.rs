pub mod analyzer;
pub mod build_cache;
pub mod companion;
pub mod config;
pub mod dirs;
pub mod error;
pub mod protocol;
pub mod serve;
pub mod simulator;
pub mod stream;
pub mod thunk;
pub mod transport;
pub mod watcher;

pub use error::PreviewError;

pub type Result<T> = std::result::Result<T, PreviewError>;
