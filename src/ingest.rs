//! Ingest listeners and the line-dialect parser.
//!
//! Line dialect, one sample per frame: `name[:tags]|value|type[|@rate]`
//! with comma-separated `k:v` tags. The parser consumes the reserved tags
//! `scope:local`, `scope:global`, and `sinkonly:<name>` rather than
//! keeping them on the key. Binary dialect: a 4-byte big-endian length
//! prefix followed by a payload handed to a pluggable [`FrameDecoder`].
//!
//! Every malformed frame is counted and dropped; ingest never stops on bad
//! input.

use std::sync::Arc;

use prost::Message;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::net::{TcpListener, UdpSocket};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::ParseError;
use crate::metrics::{MetricKey, MetricKind, Sample, SampleValue, Scope};
use crate::rpc::{pb, sample_from_wire};
use crate::server::Server;

/// Upper bound on a single binary frame.
const MAX_FRAME_BYTES: usize = 1 << 22;

/// Parses one line-dialect frame.
///
/// # Errors
/// Returns [`ParseError`] describing the first malformed field.
pub fn parse_line(frame: &str) -> Result<Sample, ParseError> {
    let frame = frame.trim();
    if frame.is_empty() {
        return Err(ParseError::EmptyFrame);
    }
    let mut fields = frame.split('|');
    let head = fields.next().unwrap_or_default();
    let value_field = fields.next().ok_or(ParseError::MissingValue)?;
    let kind_field = fields.next().ok_or(ParseError::MissingType)?;
    let mut rate = 1.0f64;
    for extra in fields {
        let Some(raw) = extra.strip_prefix('@') else {
            return Err(ParseError::TrailingField(extra.to_string()));
        };
        rate = raw
            .parse()
            .map_err(|_| ParseError::InvalidRate(raw.to_string()))?;
        if !(rate > 0.0 && rate <= 1.0) {
            return Err(ParseError::InvalidRate(raw.to_string()));
        }
    }

    let (name, raw_tags) = match head.split_once(':') {
        Some((name, tags)) => (name, Some(tags)),
        None => (head, None),
    };
    if name.is_empty() {
        return Err(ParseError::MissingName);
    }
    let kind = MetricKind::from_statsd(kind_field)
        .ok_or_else(|| ParseError::UnknownType(kind_field.to_string()))?;

    let mut scope = Scope::Mixed;
    let mut sinks = Vec::new();
    let mut tags = Vec::new();
    if let Some(raw) = raw_tags {
        for tag in raw.split(',') {
            match tag {
                "" => {}
                "scope:local" => scope = Scope::LocalOnly,
                "scope:global" => scope = Scope::GlobalOnly,
                _ => {
                    if let Some(sink) = tag.strip_prefix("sinkonly:") {
                        sinks.push(sink.to_string());
                    } else {
                        tags.push(tag.to_string());
                    }
                }
            }
        }
    }

    let value = match kind {
        MetricKind::Set => SampleValue::Str(value_field.to_string()),
        _ => {
            let parsed: f64 = value_field
                .parse()
                .map_err(|_| ParseError::InvalidValue(value_field.to_string()))?;
            if !parsed.is_finite() {
                return Err(ParseError::InvalidValue(value_field.to_string()));
            }
            SampleValue::Float(parsed)
        }
    };

    let key = MetricKey::new(name, kind, tags);
    Ok(Sample::new(key, value, rate, scope).with_sinks(sinks))
}

/// Splits a datagram or line payload into frames and feeds the server.
fn dispatch_frames(payload: &[u8], server: &Server) {
    for line in payload.split(|byte| *byte == b'\n') {
        if line.is_empty() {
            continue;
        }
        let Ok(text) = std::str::from_utf8(line) else {
            server.stats().add_malformed(1);
            continue;
        };
        match parse_line(text) {
            Ok(sample) => server.ingest(sample),
            Err(err) if err.is_unknown_type() => {
                server.stats().add_unknown_kind(1);
                debug!("dropping frame: {err}");
            }
            Err(err) => {
                server.stats().add_malformed(1);
                debug!("dropping frame: {err}");
            }
        }
    }
}

/// Spawns `num_readers` tasks sharing one UDP socket.
#[must_use]
pub fn spawn_statsd_udp(
    socket: Arc<UdpSocket>,
    server: Arc<Server>,
    num_readers: usize,
    read_buffer_bytes: usize,
) -> Vec<JoinHandle<()>> {
    (0..num_readers.max(1))
        .map(|_| {
            let socket = socket.clone();
            let server = server.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; read_buffer_bytes];
                loop {
                    match socket.recv_from(&mut buf).await {
                        Ok((len, _peer)) => dispatch_frames(&buf[..len], &server),
                        Err(err) => warn!("udp receive error: {err}"),
                    }
                }
            })
        })
        .collect()
}

/// Spawns the line-dialect TCP accept loop; one task per connection.
#[must_use]
pub fn spawn_statsd_tcp(listener: TcpListener, server: Arc<Server>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, _peer)) => {
                    let server = server.clone();
                    tokio::spawn(async move {
                        let mut lines = BufReader::new(stream).lines();
                        loop {
                            match lines.next_line().await {
                                Ok(Some(line)) => dispatch_frames(line.as_bytes(), &server),
                                Ok(None) => break,
                                Err(err) => {
                                    debug!("statsd connection closed: {err}");
                                    break;
                                }
                            }
                        }
                    });
                }
                Err(err) => warn!("statsd accept error: {err}"),
            }
        }
    })
}

/// A decoded binary frame: the usable samples plus how many were dropped.
pub struct DecodedFrame {
    pub samples: Vec<Sample>,
    pub malformed: u64,
}

/// Pluggable payload parser for the binary dialect.
pub trait FrameDecoder: Send + Sync + 'static {
    /// Decodes one length-prefixed payload.
    ///
    /// # Errors
    /// Returns [`ParseError`] when the payload as a whole is undecodable;
    /// per-sample problems are reported through
    /// [`DecodedFrame::malformed`] instead.
    fn decode(&self, payload: &[u8]) -> Result<DecodedFrame, ParseError>;
}

/// The bundled decoder: a prost [`pb::SampleBundle`] payload.
pub struct BundleDecoder;

impl FrameDecoder for BundleDecoder {
    fn decode(&self, payload: &[u8]) -> Result<DecodedFrame, ParseError> {
        let bundle =
            pb::SampleBundle::decode(payload).map_err(|err| ParseError::Frame(err.to_string()))?;
        let mut samples = Vec::with_capacity(bundle.samples.len());
        let mut malformed = 0;
        for wire in bundle.samples {
            match sample_from_wire(wire) {
                Ok(sample) => samples.push(sample),
                Err(err) => {
                    malformed += 1;
                    debug!("dropping bundled sample: {err}");
                }
            }
        }
        Ok(DecodedFrame { samples, malformed })
    }
}

/// Spawns the binary-dialect TCP accept loop.
#[must_use]
pub fn spawn_binary_tcp(
    listener: TcpListener,
    server: Arc<Server>,
    decoder: Arc<dyn FrameDecoder>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut stream, _peer)) => {
                    let server = server.clone();
                    let decoder = decoder.clone();
                    tokio::spawn(async move {
                        let mut len_buf = [0u8; 4];
                        loop {
                            if stream.read_exact(&mut len_buf).await.is_err() {
                                break;
                            }
                            let len = u32::from_be_bytes(len_buf) as usize;
                            if len == 0 || len > MAX_FRAME_BYTES {
                                server.stats().add_malformed(1);
                                debug!("closing connection on oversized frame ({len} bytes)");
                                break;
                            }
                            let mut payload = vec![0u8; len];
                            if stream.read_exact(&mut payload).await.is_err() {
                                server.stats().add_malformed(1);
                                break;
                            }
                            match decoder.decode(&payload) {
                                Ok(frame) => {
                                    server.stats().add_malformed(frame.malformed);
                                    for sample in frame.samples {
                                        server.ingest(sample);
                                    }
                                }
                                Err(err) => {
                                    server.stats().add_malformed(1);
                                    debug!("dropping binary frame: {err}");
                                }
                            }
                        }
                    });
                }
                Err(err) => warn!("binary accept error: {err}"),
            }
        }
    })
}
