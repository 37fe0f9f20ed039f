//! Stream handling for a single remote process
//!
//! Feeds the optional input into the process and drains standard output
//! and standard error into separate buffers, all concurrently.

use crate::error::ExecError;
use crate::models::ExecutionOutput;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Drain both output streams while writing `input` to `stdin`.
///
/// The input writer stays open until both outputs reach EOF. Closing it
/// earlier ends the whole session on the websocket channel protocol, and
/// any later output or exit status would be lost.
///
/// Returns on the first I/O error without looking at what was buffered
/// so far.
pub async fn drain_streams<O, E, W>(
    mut stdout: O,
    mut stderr: E,
    stdin: Option<(W, &[u8])>,
) -> io::Result<ExecutionOutput>
where
    O: AsyncRead + Unpin,
    E: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut out = Vec::new();
    let mut err = Vec::new();

    let (mut writer, input) = match stdin {
        Some((writer, input)) => (Some(writer), input),
        None => (None, &[][..]),
    };

    let feed = async {
        if let Some(writer) = writer.as_mut() {
            writer.write_all(input).await?;
            writer.flush().await?;
        }
        Ok::<_, io::Error>(())
    };

    tokio::try_join!(
        feed,
        stdout.read_to_end(&mut out),
        stderr.read_to_end(&mut err)
    )?;
    drop(writer);

    Ok(ExecutionOutput {
        stdout: out,
        stderr: err,
        exit_message: None,
    })
}

impl ExecutionOutput {
    /// Apply the result convention: any stderr output fails the call,
    /// otherwise a failed exit status does. Captured stdout is dropped on
    /// failure.
    pub fn into_result(self) -> Result<Vec<u8>, ExecError> {
        if !self.stderr.is_empty() {
            return Err(ExecError::Stderr(
                String::from_utf8_lossy(&self.stderr).into_owned(),
            ));
        }
        if let Some(message) = self.exit_message {
            return Err(ExecError::NonZeroExit(message));
        }
        Ok(self.stdout)
    }
}
