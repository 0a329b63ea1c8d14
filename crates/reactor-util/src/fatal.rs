/// Logs `msg` at error severity and terminates the process.
///
/// Reserved for failures that mean the host is misconfigured rather than
/// something a caller could recover from: an epoll instance that can't be
/// created, a listen socket that can't bind, a second `EventLoop` on a
/// thread that already has one.
pub fn fatal(msg: &str) -> ! {
    tracing::error!("{msg}");
    std::process::exit(1)
}
