use thiserror::Error;

use crate::config::ConfigError;
use crate::io::IoError;

/// `run()` 能冒到 main 的错误
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Io(#[from] IoError),
    #[error("cannot install handler for signal {signal}: {source}")]
    Signal {
        signal: i32,
        #[source]
        source: std::io::Error,
    },
}
