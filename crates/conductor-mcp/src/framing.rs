//! Newline-delimited message framing.
//!
//! Each message occupies one line. Servers sometimes print banners or log
//! noise on stdout ahead of the JSON, so everything before the first `{` on a
//! line is discarded before decoding.

use conductor_core::config::MalformedLinePolicy;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, warn};

use crate::error::FramingError;
use crate::lifecycle::{Scope, ScopeEnd};
use crate::protocol::Message;
use crate::router::RouterHandle;

const PREVIEW_LEN: usize = 120;

/// Strip leading noise from a raw line.
///
/// Returns `None` for a blank line. A line without any `{` is returned
/// unchanged (trailing line terminator removed) so that decoding reports it.
pub fn clean_line(line: &[u8]) -> Option<&[u8]> {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    if line.iter().all(u8::is_ascii_whitespace) {
        return None;
    }
    match line.iter().position(|&b| b == b'{') {
        Some(start) => Some(&line[start..]),
        None => Some(line),
    }
}

/// Decode one raw line. `Ok(None)` means the line was blank.
pub fn decode_line(line: &[u8]) -> Result<Option<Message>, FramingError> {
    let Some(clean) = clean_line(line) else {
        return Ok(None);
    };
    serde_json::from_slice(clean)
        .map(Some)
        .map_err(|source| FramingError::Malformed {
            preview: preview(clean),
            source,
        })
}

fn preview(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    if text.chars().count() > PREVIEW_LEN {
        let cut: String = text.chars().take(PREVIEW_LEN).collect();
        format!("{}...", cut)
    } else {
        text.into_owned()
    }
}

/// Reads messages off a buffered byte stream.
pub struct FrameReader<R> {
    reader: R,
    buf: Vec<u8>,
}

impl<R: AsyncBufRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::with_capacity(1024),
        }
    }

    /// Read the next line that carries anything. Blank lines are skipped.
    ///
    /// Returns `Ok(None)` at end of stream.
    pub async fn next_message(&mut self) -> Result<Option<Message>, FramingError> {
        loop {
            self.buf.clear();
            let n = self.reader.read_until(b'\n', &mut self.buf).await?;
            if n == 0 {
                return Ok(None);
            }
            if let Some(message) = decode_line(&self.buf)? {
                return Ok(Some(message));
            }
        }
    }
}

/// Encode `message` as one line and flush it.
pub async fn write_message<W>(writer: &mut W, message: &Message) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await
}

/// Pump messages from `reader` into the router until the stream ends or
/// `scope` is cancelled.
///
/// The scope is ended with the reason the loop stopped: `Closed` on clean EOF,
/// `Failed` on a read error or, under [`MalformedLinePolicy::Fatal`], on a
/// malformed line.
pub async fn run_reader<R>(
    reader: R,
    router: RouterHandle,
    scope: Scope,
    policy: MalformedLinePolicy,
) where
    R: AsyncBufRead + Unpin,
{
    let mut frames = FrameReader::new(reader);

    loop {
        let next = tokio::select! {
            _ = scope.cancelled() => return,
            next = frames.next_message() => next,
        };

        match next {
            Ok(Some(message)) => {
                if !router.inbound(message) {
                    debug!("Router stopped, reader exiting");
                    return;
                }
            }
            Ok(None) => {
                debug!("Tool server stream reached EOF");
                scope.cancel_with(ScopeEnd::Closed);
                return;
            }
            Err(e @ FramingError::Malformed { .. }) => match policy {
                MalformedLinePolicy::Fatal => {
                    error!(error = %e, "Malformed line from tool server");
                    scope.cancel_with(ScopeEnd::failed(e));
                    return;
                }
                MalformedLinePolicy::Skip => {
                    warn!(error = %e, "Skipping malformed line from tool server");
                }
            },
            Err(e) => {
                error!(error = %e, "Failed reading from tool server");
                scope.cancel_with(ScopeEnd::failed(e));
                return;
            }
        }
    }
}
