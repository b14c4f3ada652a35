//! SCPI message framing shared by the stream transports.

use std::io;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use super::{ConnectionSettings, DriverError};

/// Encode `command` with the write terminator appended once.
pub fn frame(command: &str, terminator: &str) -> Vec<u8> {
    let mut bytes = command.as_bytes().to_vec();
    if !terminator.is_empty() && !command.ends_with(terminator) {
        bytes.extend_from_slice(terminator.as_bytes());
    }
    bytes
}

/// Decode a raw response: strip the read terminator and surrounding
/// whitespace, reject non UTF-8 payloads.
pub fn decode(resource: &str, raw: Vec<u8>, terminator: &str) -> Result<String, DriverError> {
    let text = String::from_utf8(raw).map_err(|e| DriverError::Parse {
        resource: resource.to_string(),
        message: format!("response is not UTF-8: {e}"),
    })?;
    let text = text.strip_suffix(terminator).unwrap_or(&text);
    Ok(text.trim().to_string())
}

/// Send one framed command and flush.
pub async fn send<W>(stream: &mut W, command: &str, settings: &ConnectionSettings) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    stream
        .write_all(&frame(command, &settings.write_terminator))
        .await?;
    stream.flush().await
}

/// Read up to and including the last byte of the read terminator.
pub async fn receive<R>(stream: &mut R, settings: &ConnectionSettings) -> io::Result<Vec<u8>>
where
    R: AsyncBufRead + Unpin,
{
    let delimiter = settings.read_terminator.as_bytes().last().copied().unwrap_or(b'\n');
    let mut buf = Vec::new();
    let n = stream.read_until(delimiter, &mut buf).await?;
    if n == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed by instrument",
        ));
    }
    Ok(buf)
}

/// Write, then optionally read one response, mapping I/O failures.
///
/// Any error leaves the stream in an unknown position; callers drop it and
/// reconnect rather than risk reading a stale response later.
pub async fn exchange<S>(
    resource: &str,
    stream: &mut S,
    command: &str,
    settings: &ConnectionSettings,
    timeout: Duration,
    read_response: bool,
) -> Result<Option<String>, DriverError>
where
    S: AsyncBufRead + AsyncWrite + Unpin,
{
    let io = async {
        send(stream, command, settings).await?;
        if read_response {
            receive(stream, settings).await.map(Some)
        } else {
            Ok(None)
        }
    };
    match tokio::time::timeout(timeout, io).await {
        Err(_) => Err(DriverError::timeout(resource, timeout)),
        Ok(Err(e)) => Err(DriverError::io(resource, e)),
        Ok(Ok(None)) => Ok(None),
        Ok(Ok(Some(raw))) => decode(resource, raw, &settings.read_terminator).map(Some),
    }
}
