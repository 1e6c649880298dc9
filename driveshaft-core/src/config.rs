//! Compile-time tuning constants.

/// Number of commands a mailbox Y-pipe stores per chunk.
pub const COMMAND_PIPE_GRANULARITY: usize = 16;

/// Number of messages a data Y-pipe stores per chunk.
pub const MESSAGE_PIPE_GRANULARITY: usize = 256;

/// Maximum number of epoll events handled in one reactor iteration.
pub const MAX_IO_EVENTS: usize = 256;

/// Payloads up to this size are stored inline in the message itself
/// rather than in a shared heap buffer.
pub const MAX_VSM_SIZE: usize = 32;

/// How many bytes the stream engine reads from the network in one go.
pub const IN_BATCH_SIZE: usize = 8192;

/// Target size of the stream engine's outbound staging buffer.
pub const OUT_BATCH_SIZE: usize = 8192;
