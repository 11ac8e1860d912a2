//! Central error types for the player (thiserror-based).

use thiserror::Error;

/// Top-level player error.
#[derive(Error, Debug)]
pub enum PlayerError {
    #[error("MP4 error: {0}")]
    Mp4(#[from] Mp4Error),

    #[error("H.264 error: {0}")]
    H264(#[from] H264Error),

    #[error("playback error: {0}")]
    Playback(#[from] PlaybackError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Container parsing and sample iteration errors.
#[derive(Error, Debug)]
pub enum Mp4Error {
    #[error("invalid box at offset {offset}: {reason}")]
    InvalidStructure { offset: u64, reason: String },

    #[error("no video track found")]
    NoVideoTrack,

    #[error("truncated data: expected {expected} bytes, got {got}")]
    TruncatedData { expected: usize, got: usize },

    /// The next sample is larger than the destination buffer. The read
    /// cursor is left in place so the caller can skip or retry.
    #[error("sample of {size} bytes exceeds buffer capacity {capacity}")]
    NoBuffer { size: usize, capacity: usize },

    #[error("end of stream")]
    EndOfStream,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// H.264 bitstream errors.
#[derive(Error, Debug)]
pub enum H264Error {
    /// A NAL length prefix points past the end of the access unit, or the
    /// bit reader ran off the end of a parameter set.
    #[error("malformed bitstream: {0}")]
    MalformedBitstream(String),

    #[error("invalid SPS: {0}")]
    InvalidSps(String),

    #[error("invalid SEI: {0}")]
    InvalidSei(String),
}

/// Playback engine errors.
#[derive(Error, Debug)]
pub enum PlaybackError {
    #[error("demuxer is not configured")]
    NotConfigured,

    #[error("demuxer is already configured")]
    AlreadyConfigured,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("decoder declares no supported input bitstream format")]
    UnsupportedBitstreamFormat,

    /// The buffer pool is empty and the acquire was non-blocking.
    /// Internal to the engine; the scheduler converts it to a retry.
    #[error("buffer pool exhausted")]
    WouldBlock,

    /// A buffer was pushed into a queue bound to a different pool.
    #[error("buffer does not belong to this queue's pool")]
    WrongPool,

    #[error("out of memory: {0}")]
    OutOfMemory(String),

    #[error("decoder error: {0}")]
    Decoder(String),
}

/// Convenience Result type for player operations.
pub type PlayerResult<T> = Result<T, PlayerError>;
