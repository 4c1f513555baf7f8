//! Logging macros for use solely by `peer::PeerSession`.
//!
//! The first parameter has to be `self` of the `peer::PeerSession` instance,
//! followed by the format string and its arguments. Each message is prefixed
//! with the session's role and the peer's address, so the log of a single
//! session can be filtered out.

macro_rules! peer_warn {
    ($self:ident, $($arg:tt)*) => ({
        ::log::warn!("[{} {}] {}", $self.role, $self.addr, format_args!($($arg)*));
    })
}

macro_rules! peer_info {
    ($self:ident, $($arg:tt)*) => ({
        ::log::info!("[{} {}] {}", $self.role, $self.addr, format_args!($($arg)*));
    })
}

macro_rules! peer_debug {
    ($self:ident, $($arg:tt)*) => ({
        ::log::debug!("[{} {}] {}", $self.role, $self.addr, format_args!($($arg)*));
    })
}

macro_rules! peer_trace {
    ($self:ident, $($arg:tt)*) => ({
        ::log::trace!("[{} {}] {}", $self.role, $self.addr, format_args!($($arg)*));
    })
}
