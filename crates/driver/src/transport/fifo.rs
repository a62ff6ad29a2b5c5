//! Fifo — opening the named pipe Docker hands to `StartLogging`.

use std::io;
use std::path::Path;
use tokio::net::unix::pipe;
use tracing::debug;

use super::LogStream;

/// Open the FIFO for reading without waiting for a writer.
///
/// Opening read-write keeps a writer reference alive on our side, so the
/// reader never sees EOF while Docker reattaches. Shutdown is driven by the
/// pipeline's cancellation instead.
pub fn open(path: impl AsRef<Path>) -> io::Result<LogStream> {
    let path = path.as_ref();
    let receiver = pipe::OpenOptions::new()
        .read_write(true)
        .open_receiver(path)?;
    debug!(path = %path.display(), "Opened log fifo");
    Ok(Box::new(receiver))
}
