use crate::net::UserId;
use crate::protocol::{CodecError, ResyncError};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unknown service provider: {0}")]
    UnknownService(String),
    #[error("transport not initialized")]
    NotInitialized,
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("no session listening at {0}")]
    NoListener(String),
    #[error("connection rejected: {0}")]
    Rejected(String),
    #[error("connection attempt timed out")]
    ConnectTimeout,
    #[error("peer {0} is not connected")]
    UnknownPeer(UserId),
    #[error("message of {0} bytes exceeds the transport limit")]
    TooLarge(usize),
    #[error("datagram encoding failed: {0}")]
    Encode(rkyv::rancor::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum JoinError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("invalid login credentials: {0}")]
    Credentials(#[from] CodecError),
    #[error("login rejected by host")]
    Rejected,
    #[error("no login reply within the join timeout")]
    Timeout,
}

#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    #[error("local peer has no valid id")]
    NotConnected,
    #[error("frame buffer holds {actual} byte frames, expected {expected}")]
    FrameSize { expected: usize, actual: usize },
    #[error(transparent)]
    Codec(#[from] CodecError),
}

#[derive(Debug, thiserror::Error)]
pub enum TimeSyncError {
    #[error("no time sync reply from host")]
    ReplyTimeout,
    #[error("no resume message from host")]
    ResumeTimeout,
    #[error("host connection lost during time sync")]
    Disconnected,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("network init failed: {0}")]
    Init(TransportError),
    #[error("hosting failed: {0}")]
    Host(TransportError),
    #[error("joining failed: {0}")]
    Join(#[from] JoinError),
    #[error("exchange failed: {0}")]
    Exchange(#[from] ExchangeError),
    #[error("resync failed: {0}")]
    Resync(#[from] ResyncError),
    #[error("time sync failed: {0}")]
    TimeSync(#[from] TimeSyncError),
    #[error("session is not running")]
    NotRunning,
}
