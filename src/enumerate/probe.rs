//! Small socket helpers shared by the in-process service probes.

use std::io;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt};
use tokio::net::TcpStream;
use tokio::time;

use crate::error::EnumerationCause;
use crate::types::Target;

pub async fn connect(target: &Target, port: u16, limit: Duration) -> Result<TcpStream, EnumerationCause> {
    let addr = format!("{}:{}", target.host_for_url(), port);
    match time::timeout(limit, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(EnumerationCause::Connect(e)),
        Err(_) => Err(EnumerationCause::Timeout {
            secs: limit.as_secs(),
        }),
    }
}

/// Read whatever the peer sends first, up to `max` bytes.
pub async fn read_some<S>(stream: &mut S, max: usize, limit: Duration) -> Result<Vec<u8>, EnumerationCause>
where
    S: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; max];
    let n = with_timeout(limit, stream.read(&mut buf)).await?;
    buf.truncate(n);
    Ok(buf)
}

/// Read until EOF or `max` bytes, whichever comes first.
pub async fn read_to_limit<S>(stream: &mut S, max: usize, limit: Duration) -> Result<Vec<u8>, EnumerationCause>
where
    S: AsyncRead + Unpin,
{
    let mut out = Vec::new();
    let mut limited = stream.take(max as u64);
    with_timeout(limit, limited.read_to_end(&mut out)).await?;
    Ok(out)
}

/// Longest line [`read_line`] buffers; the rest of an unterminated line is
/// left for the next read.
pub const MAX_LINE: u64 = 4096;

/// Read one `\n`-terminated line. Bytes that are not UTF-8 are replaced rather
/// than rejected, since greetings are often Latin-1.
pub async fn read_line<R>(reader: &mut R, limit: Duration) -> Result<String, EnumerationCause>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let mut bounded = (&mut *reader).take(MAX_LINE);
    let n = with_timeout(limit, bounded.read_until(b'\n', &mut line)).await?;
    if n == 0 {
        return Err(EnumerationCause::Protocol("connection closed by peer".to_string()));
    }
    Ok(String::from_utf8_lossy(&line)
        .trim_end_matches(['\r', '\n'])
        .to_string())
}

async fn with_timeout<T>(
    limit: Duration,
    fut: impl std::future::Future<Output = io::Result<T>>,
) -> Result<T, EnumerationCause> {
    match time::timeout(limit, fut).await {
        Ok(Ok(v)) => Ok(v),
        Ok(Err(e)) => Err(EnumerationCause::Connect(e)),
        Err(_) => Err(EnumerationCause::Timeout {
            secs: limit.as_secs(),
        }),
    }
}

/// Lossy text form of raw bytes with line breaks escaped, for banners.
pub fn printable(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches('\0')
        .trim()
        .replace('\n', "\\n")
        .replace('\r', "\\r")
}
