use thiserror::Error;

/// Decode-side outcome for a single codec read.
///
/// Not a full [`ChatError`] variant on its own: a short read just means the
/// caller should wait for more bytes, it isn't a failure.
#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
#[error("not enough bytes buffered yet")]
pub struct ShortRead;

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("socket io error")]
    Io(#[from] std::io::Error),

    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    #[error("display name already in use")]
    NameTaken,

    #[error("display name invalid: must be 1-63 bytes, got {0}")]
    NameInvalid(usize),

    #[error("accept failed")]
    AcceptFailed(#[source] std::io::Error),
}

/// Unrecoverable startup failure. Each variant carries the process exit code
/// from the CLI contract so `main` can propagate it directly.
#[derive(Error, Debug)]
pub enum FatalError {
    #[error("missing port argument")]
    MissingPort,
    #[error("port is not an integer")]
    PortNotInteger,
    #[error("backlog is not an integer")]
    BacklogNotInteger,
    #[error("could not create listen socket")]
    SocketCreate(#[source] std::io::Error),
    #[error("could not bind listen socket")]
    Bind(#[source] std::io::Error),
    #[error("could not listen on socket")]
    Listen(#[source] std::io::Error),
    #[error("could not install signal handler")]
    SignalHandlerInstall,
}

impl FatalError {
    /// Exit code per the CLI contract.
    pub fn exit_code(&self) -> i32 {
        match self {
            FatalError::MissingPort => 1,
            FatalError::PortNotInteger => 2,
            FatalError::BacklogNotInteger => 3,
            FatalError::SocketCreate(_) => 4,
            FatalError::Bind(_) => 5,
            FatalError::Listen(_) => 6,
            FatalError::SignalHandlerInstall => 7,
        }
    }
}
