#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("worker spawn failed: {0}")]
    SpawnFailed(String),

    #[error("worker handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("worker exited unexpectedly")]
    WorkerExited,

    #[error("worker reported error: {0}")]
    Remote(String),

    #[error("strategy shut down")]
    ShutDown,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SandboxError>;
