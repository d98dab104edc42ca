//! Adapters moving all blocking calls to a dedicated worker thread.
//!
//! The worker is the only thread touching the handle. Requests and responses are exchanged over
//! rendezvous channels, racing against the caller's signal. When the signal fires first, the
//! caller returns right away while the worker finishes the native call; the result is kept in
//! the response channel until a later call picks it up. The handle itself is never
//! interrupted, so a canceled call may keep doing I/O in the background.
//!
//! Buffers are moved between the caller and the worker, never shared: a response which nobody
//! waits for still owns its buffer, and drained buffers travel back to the worker with the next
//! request so that two of them alternate.

mod reader;
pub use reader::ProxyReader;

mod writer;
pub use writer::{ProxyWriter, DEFAULT_CHUNK_SIZE};
