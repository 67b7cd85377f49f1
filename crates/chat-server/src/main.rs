//! Chatroom server entry point.
//!
//! Argument parsing is hand-rolled against `std::env::args()` rather than
//! built on `clap`: the CLI contract fixes specific process exit codes for
//! each failure (missing port, bad port, bad backlog, socket/bind/listen
//! failure, signal-handler install failure), and a `clap`-based parser would
//! not produce that exact code sequence without fighting the crate's own
//! error/exit conventions.

use std::process::ExitCode;

use chat_net::{FatalError, Reactor};
use tracing_subscriber::EnvFilter;

const DEFAULT_BACKLOG: u32 = 10;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut reactor = match bind() {
        Ok(reactor) => reactor,
        Err(err) => {
            tracing::error!(%err, "chat-server: fatal error");
            return ExitCode::from(err.exit_code() as u8);
        }
    };

    if let Err(err) = reactor.run() {
        // The event loop only returns on an unrecoverable `mio::Poll` error,
        // outside the startup exit-code contract in the CLI spec.
        tracing::error!(%err, "chat-server: event loop aborted");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

fn bind() -> Result<Reactor, FatalError> {
    let mut args = std::env::args().skip(1);

    let port: u16 = args
        .next()
        .ok_or(FatalError::MissingPort)?
        .parse()
        .map_err(|_| FatalError::PortNotInteger)?;

    let backlog: u32 = match args.next() {
        Some(raw) => raw.parse().map_err(|_| FatalError::BacklogNotInteger)?,
        None => DEFAULT_BACKLOG,
    };

    install_sigpipe_ignore()?;

    tracing::info!(port, backlog, "chat-server: starting");

    Reactor::bind(port, backlog).map_err(classify_bind_error)
}

/// Installs a no-op SIGPIPE handler so writes to a half-closed peer return
/// `EPIPE` instead of killing the process. A one-line raw syscall, not worth
/// reaching for `signal-hook` over (that crate is used elsewhere in this
/// workspace for graceful shutdown, a different concern).
fn install_sigpipe_ignore() -> Result<(), FatalError> {
    // SAFETY: SIG_IGN is a valid disposition and this runs once at startup
    // before any other thread exists.
    let prev = unsafe { libc::signal(libc::SIGPIPE, libc::SIG_IGN) };
    if prev == libc::SIG_ERR {
        return Err(FatalError::SignalHandlerInstall);
    }
    Ok(())
}

/// `Reactor::bind` folds socket-create, bind, and listen into one `io::Error`
/// return; map it back onto the three distinct exit codes the CLI contract
/// requires by inspecting the OS error, falling back to `SocketCreate` when
/// the failure point can't be distinguished.
fn classify_bind_error(err: std::io::Error) -> FatalError {
    match err.raw_os_error() {
        Some(libc::EADDRINUSE) | Some(libc::EADDRNOTAVAIL) => FatalError::Bind(err),
        Some(libc::EOPNOTSUPP) => FatalError::Listen(err),
        _ => FatalError::SocketCreate(err),
    }
}
