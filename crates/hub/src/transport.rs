//! Event transport: connectors and the reconnecting driver that feeds the hub.

use std::pin::Pin;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use futures::stream::{BoxStream, Stream};
use futures::StreamExt;
use metrics::counter;
use shelf_core::RawEvent;
use tracing::{info, warn};

use crate::{EventHub, SourceMessage};

pub type FrameStream = BoxStream<'static, Result<RawEvent>>;

/// Longest NDJSON frame accepted before the connection is dropped.
pub const MAX_FRAME_BYTES: usize = 1 << 20;

/// Opens one connection to the event transport. An `Err` item or the end of the
/// stream both count as a disruption.
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<FrameStream>;
}

/// Exponential reconnect delay: `initial * 2^attempt`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self { Self { initial: Duration::from_millis(500), max: Duration::from_secs(30) } }
}

impl Backoff {
    /// Cap from `SHELF_WATCH_BACKOFF_MAX_SECS`.
    pub fn from_env() -> Self {
        let max_secs = std::env::var("SHELF_WATCH_BACKOFF_MAX_SECS").ok().and_then(|s| s.parse::<u64>().ok()).unwrap_or(30);
        Self { max: Duration::from_secs(max_secs.max(1)), ..Self::default() }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        self.initial.saturating_mul(1u32 << attempt.min(16)).min(self.max)
    }
}

/// Keep a connection open for the life of the task, publishing every frame to
/// the hub. Subscribers see `Reconnected` after each successful reconnection.
/// Runs until aborted.
pub async fn run_connection<C: Connector + ?Sized>(hub: EventHub, connector: &C, backoff: Backoff) {
    let mut attempt: u32 = 0;
    let mut connected_once = false;
    loop {
        match connector.connect().await {
            Ok(mut stream) => {
                if connected_once {
                    info!(attempt, "live events: reconnected");
                    counter!("shelf_hub_reconnects_total", 1);
                    hub.publish(SourceMessage::Reconnected);
                } else {
                    info!("live events: connected");
                }
                connected_once = true;
                attempt = 0;
                while let Some(item) = stream.next().await {
                    match item {
                        Ok(raw) => {
                            hub.publish(SourceMessage::Event(raw));
                        }
                        Err(e) => {
                            warn!(error = %e, "live events: stream error");
                            break;
                        }
                    }
                }
                warn!("live events: stream ended");
            }
            Err(e) => warn!(error = %e, attempt, "live events: connect failed"),
        }
        let delay = backoff.delay(attempt);
        attempt = attempt.saturating_add(1);
        tokio::time::sleep(delay).await;
    }
}

/// Newline-delimited JSON frames (`{"event": .., "data": ..}`) over a long-lived
/// HTTP response.
pub struct NdjsonConnector {
    client: reqwest::Client,
    url: String,
}

impl NdjsonConnector {
    pub fn new(url: impl Into<String>) -> Self { Self { client: reqwest::Client::new(), url: url.into() } }

    pub fn url(&self) -> &str { &self.url }
}

type ByteStream = Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>;

#[async_trait::async_trait]
impl Connector for NdjsonConnector {
    async fn connect(&self) -> Result<FrameStream> {
        let res = self
            .client
            .get(&self.url)
            .header(reqwest::header::ACCEPT, "application/x-ndjson")
            .send()
            .await
            .with_context(|| format!("connecting to {}", self.url))?
            .error_for_status()
            .with_context(|| format!("event stream {}", self.url))?;
        let bytes: ByteStream = Box::pin(res.bytes_stream());
        let frames = futures::stream::unfold((bytes, Vec::<u8>::new()), |(mut bytes, mut buf)| async move {
            loop {
                match take_line(&mut buf) {
                    Ok(Some(line)) => match parse_frame(&line) {
                        Some(raw) => return Some((Ok(raw), (bytes, buf))),
                        None => continue,
                    },
                    Ok(None) => {}
                    Err(e) => {
                        counter!("shelf_hub_oversized_frames_total", 1);
                        return Some((Err(e), (bytes, Vec::new())));
                    }
                }
                match bytes.next().await {
                    Some(Ok(chunk)) => buf.extend_from_slice(&chunk),
                    Some(Err(e)) => return Some((Err(anyhow::Error::from(e).context("reading event stream")), (bytes, buf))),
                    None => return None,
                }
            }
        });
        Ok(frames.boxed())
    }
}

/// Split the first complete line off `buf`, without its terminator. Fails once
/// more than [`MAX_FRAME_BYTES`] are buffered with no newline in sight.
fn take_line(buf: &mut Vec<u8>) -> Result<Option<Vec<u8>>> {
    let Some(pos) = buf.iter().position(|b| *b == b'\n') else {
        if buf.len() > MAX_FRAME_BYTES {
            bail!("event frame exceeds {} bytes without a newline", MAX_FRAME_BYTES);
        }
        return Ok(None);
    };
    let mut line: Vec<u8> = buf.drain(..=pos).collect();
    line.pop();
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    Ok(Some(line))
}

/// Blank lines are keep-alives; unparseable ones are logged and skipped.
fn parse_frame(line: &[u8]) -> Option<RawEvent> {
    if line.iter().all(|b| b.is_ascii_whitespace()) {
        return None;
    }
    match serde_json::from_slice::<RawEvent>(line) {
        Ok(raw) => Some(raw),
        Err(e) => {
            warn!(error = %e, len = line.len(), "live events: skipping unparseable frame");
            counter!("shelf_hub_bad_frames_total", 1);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_cap() {
        let b = Backoff { initial: Duration::from_millis(100), max: Duration::from_secs(1) };
        assert_eq!(b.delay(0), Duration::from_millis(100));
        assert_eq!(b.delay(1), Duration::from_millis(200));
        assert_eq!(b.delay(3), Duration::from_millis(800));
        assert_eq!(b.delay(4), Duration::from_secs(1));
        assert_eq!(b.delay(40), Duration::from_secs(1));
    }

    #[test]
    fn splits_lines_across_chunks() {
        let mut buf = b"{\"event\":\"object:deleted\",\"data\":\"a\"}\r\n{\"ev".to_vec();
        let line = take_line(&mut buf).unwrap().unwrap();
        let raw = parse_frame(&line).unwrap();
        assert_eq!(raw.event, "object:deleted");
        assert!(take_line(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"ent\":\"x\"}\n\n");
        assert_eq!(parse_frame(&take_line(&mut buf).unwrap().unwrap()).unwrap().event, "x");
        assert!(parse_frame(&take_line(&mut buf).unwrap().unwrap()).is_none());
    }

    #[test]
    fn unterminated_frame_past_cap_is_an_error() {
        let mut buf = vec![b'x'; MAX_FRAME_BYTES];
        assert!(take_line(&mut buf).unwrap().is_none());
        buf.push(b'x');
        assert!(take_line(&mut buf).is_err());

        // A long buffer is fine as long as a frame boundary is in it.
        let mut buf = b"{}\n".to_vec();
        buf.extend(std::iter::repeat(b'y').take(MAX_FRAME_BYTES));
        assert_eq!(take_line(&mut buf).unwrap().unwrap(), b"{}");
    }

    #[test]
    fn garbage_frames_are_skipped() {
        assert!(parse_frame(b"not json").is_none());
    }
}
