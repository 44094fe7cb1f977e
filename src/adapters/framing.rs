//! Terminator-delimited reply framing shared by the text connectors.
use anyhow::{anyhow, Context, Result};
use std::io::Read;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::trace;

const CHUNK: usize = 4096;

/// Append `terminator` to `command` and encode it.
pub fn encode_command(
    command: &str,
    terminator: &str,
    encoding: super::Encoding,
) -> Result<Vec<u8>> {
    encoding.encode(&format!("{}{}", command, terminator))
}

/// Strip one trailing `terminator` and surrounding whitespace from a reply.
pub fn strip_reply(reply: &str, terminator: &str) -> String {
    let body = if terminator.is_empty() {
        reply
    } else {
        reply.strip_suffix(terminator).unwrap_or(reply)
    };
    body.trim().to_string()
}

/// Read from `reader` until the accumulated bytes end with `terminator`.
///
/// An empty terminator returns after the first non-empty read.
pub async fn read_until_terminator<R>(
    reader: &mut R,
    terminator: &[u8],
    timeout: Duration,
) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut data = Vec::new();
    let mut chunk = [0u8; CHUNK];
    let read_loop = async {
        loop {
            let n = reader
                .read(&mut chunk)
                .await
                .context("Failed to read reply")?;
            if n == 0 {
                return Err(anyhow!(
                    "Connection closed after {} bytes without terminator",
                    data.len()
                ));
            }
            data.extend_from_slice(&chunk[..n]);
            trace!("read {} bytes ({} total)", n, data.len());
            if terminator.is_empty() || data.ends_with(terminator) {
                return Ok::<(), anyhow::Error>(());
            }
        }
    };
    tokio::time::timeout(timeout, read_loop)
        .await
        .map_err(|_| anyhow!("Read timed out after {:?}", timeout))??;
    Ok(data)
}

/// Blocking variant of [`read_until_terminator`] for serial ports.
///
/// Read timeouts reported by the port are retried until `timeout` elapses.
pub fn read_until_terminator_blocking<R>(
    reader: &mut R,
    terminator: &[u8],
    timeout: Duration,
) -> Result<Vec<u8>>
where
    R: Read + ?Sized,
{
    let mut data = Vec::new();
    let mut chunk = [0u8; CHUNK];
    let start = Instant::now();
    loop {
        if start.elapsed() > timeout {
            return Err(anyhow!("Serial read timeout after {:?}", timeout));
        }
        match reader.read(&mut chunk) {
            Ok(0) => return Err(anyhow!("Unexpected end of stream")),
            Ok(n) => {
                data.extend_from_slice(&chunk[..n]);
                if terminator.is_empty() || data.ends_with(terminator) {
                    return Ok(data);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
            Err(e) => return Err(anyhow!("Serial read error: {}", e)),
        }
    }
}
