//! Multipart MJPEG decoding: HTTP body bytes -> encoded JPEG buffers

use bytes::{Buf, Bytes, BytesMut};
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use tracing::debug;

use crate::capture::http::{ByteStream, Connection};
use crate::error::{CameraError, DecodeError};

/// Lazy sequence of encoded images split out of one connection
pub type ImageStream = BoxStream<'static, Result<Bytes, CameraError>>;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;
const MAX_HEADER_BYTES: usize = 8 * 1024;

const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];
const JPEG_EOI: [u8; 2] = [0xFF, 0xD9];

/// Turns a connection's body into discrete image buffers
pub trait FrameDecoder: Send + Sync {
    fn decode(&self, connection: Connection) -> ImageStream;
}

/// Decoder for `multipart/x-mixed-replace` camera streams
#[derive(Debug, Clone)]
pub struct MultipartDecoder {
    max_frame_bytes: usize,
}

impl MultipartDecoder {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self { max_frame_bytes }
    }
}

impl Default for MultipartDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl FrameDecoder for MultipartDecoder {
    fn decode(&self, connection: Connection) -> ImageStream {
        let framer = Framer::new(connection.content_type.as_deref(), self.max_frame_bytes);
        stream::try_unfold((connection.body, framer), next_image).boxed()
    }
}

async fn next_image(
    (mut body, mut framer): (ByteStream, Framer),
) -> Result<Option<(Bytes, (ByteStream, Framer))>, CameraError> {
    loop {
        if let Some(image) = framer.next_image()? {
            return Ok(Some((image, (body, framer))));
        }
        match body.next().await {
            Some(chunk) => framer.push(&chunk?),
            None => {
                if !framer.buf.is_empty() {
                    debug!(bytes = framer.buf.len(), "Body ended inside a part");
                }
                return Ok(None);
            }
        }
    }
}

enum Framing {
    /// `--boundary` delimited parts
    Multipart { delimiter: Vec<u8> },
    /// No boundary advertised: cut on JPEG start/end markers
    Markers,
}

struct Framer {
    framing: Framing,
    buf: BytesMut,
    max_frame_bytes: usize,
    /// Offset in `buf` where the pending end-of-part search resumes
    scanned: usize,
    seen_part: bool,
    closed: bool,
}

impl Framer {
    fn new(content_type: Option<&str>, max_frame_bytes: usize) -> Self {
        let framing = match content_type.and_then(boundary_param) {
            Some(boundary) => {
                // Plenty of cameras advertise the boundary with its leading dashes already on
                let bare = match boundary.trim_start_matches('-') {
                    "" => boundary.as_str(),
                    bare => bare,
                };
                Framing::Multipart {
                    delimiter: format!("--{bare}").into_bytes(),
                }
            }
            None => Framing::Markers,
        };

        Self {
            framing,
            buf: BytesMut::with_capacity(64 * 1024),
            max_frame_bytes,
            scanned: 0,
            seen_part: false,
            closed: false,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        if !self.closed {
            self.buf.extend_from_slice(chunk);
        }
    }

    fn next_image(&mut self) -> Result<Option<Bytes>, DecodeError> {
        if self.closed {
            return Ok(None);
        }
        match &self.framing {
            Framing::Multipart { delimiter } => {
                let delimiter = delimiter.clone();
                self.next_part(&delimiter)
            }
            Framing::Markers => self.next_marked(),
        }
    }

    fn next_part(&mut self, delimiter: &[u8]) -> Result<Option<Bytes>, DecodeError> {
        loop {
            let Some(start) = find(&self.buf, delimiter) else {
                if self.buf.len() > self.max_frame_bytes + MAX_HEADER_BYTES {
                    return Err(DecodeError::FrameTooLarge {
                        limit: self.max_frame_bytes,
                    });
                }
                return Ok(None);
            };

            if self.seen_part
                && !self.buf[..start]
                    .iter()
                    .all(|b| matches!(b, b'\r' | b'\n' | b'-' | b' ' | b'\t'))
            {
                return Err(DecodeError::UnexpectedData { len: start });
            }

            let headers_start = start + delimiter.len();
            if self.buf.len() < headers_start + 2 {
                return Ok(None);
            }
            if self.buf[headers_start..].starts_with(b"--") {
                debug!("Closing multipart delimiter received");
                self.closed = true;
                self.buf.clear();
                self.scanned = 0;
                return Ok(None);
            }

            let Some(headers_len) = find(&self.buf[headers_start..], b"\r\n\r\n") else {
                if self.buf.len() - headers_start > MAX_HEADER_BYTES {
                    return Err(DecodeError::MalformedHeaders(
                        "header block exceeds 8 KiB".into(),
                    ));
                }
                return Ok(None);
            };
            let body_start = headers_start + headers_len + 4;
            let content_length =
                parse_content_length(&self.buf[headers_start..headers_start + headers_len])?;

            let body_end = match content_length {
                Some(len) if len > self.max_frame_bytes => {
                    return Err(DecodeError::FrameTooLarge {
                        limit: self.max_frame_bytes,
                    })
                }
                Some(len) if self.buf.len() < body_start + len => return Ok(None),
                Some(len) => body_start + len,
                None => {
                    let from = self.scanned.max(body_start);
                    match find(&self.buf[from..], delimiter) {
                        Some(offset) => from + offset,
                        None if self.buf.len() - body_start > self.max_frame_bytes => {
                            return Err(DecodeError::FrameTooLarge {
                                limit: self.max_frame_bytes,
                            })
                        }
                        None => {
                            self.scanned = resume_at(self.buf.len(), delimiter.len()).max(body_start);
                            return Ok(None);
                        }
                    }
                }
            };

            let mut part = self.buf.split_to(body_end);
            part.advance(body_start);
            self.scanned = 0;
            self.seen_part = true;

            // Only a delimiter-cut part carries the CRLF that precedes the delimiter
            let image = match content_length {
                Some(_) => part.freeze(),
                None => trim_line_ending(part.freeze()),
            };
            if !image.is_empty() {
                return Ok(Some(image));
            }
        }
    }

    fn next_marked(&mut self) -> Result<Option<Bytes>, DecodeError> {
        let Some(start) = find(&self.buf, &JPEG_SOI) else {
            // Keep the last byte in case it is the first half of a marker
            let drop = self.buf.len().saturating_sub(1);
            self.buf.advance(drop);
            self.scanned = 0;
            return Ok(None);
        };
        if start > 0 {
            self.buf.advance(start);
            self.scanned = 0;
        }

        let from = self.scanned.max(JPEG_SOI.len());
        let Some(offset) = find(&self.buf[from..], &JPEG_EOI) else {
            if self.buf.len() > self.max_frame_bytes {
                return Err(DecodeError::FrameTooLarge {
                    limit: self.max_frame_bytes,
                });
            }
            self.scanned = resume_at(self.buf.len(), JPEG_EOI.len()).max(JPEG_SOI.len());
            return Ok(None);
        };

        let end = from + offset + JPEG_EOI.len();
        let image = self.buf.split_to(end);
        self.scanned = 0;
        Ok(Some(image.freeze()))
    }
}

/// Extract the `boundary` parameter of a multipart content type
fn boundary_param(content_type: &str) -> Option<String> {
    let mut params = content_type.split(';');
    let mime = params.next()?.trim();
    if !mime.to_ascii_lowercase().starts_with("multipart/") {
        return None;
    }
    params
        .filter_map(|param| param.split_once('='))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("boundary"))
        .map(|(_, value)| value.trim().trim_matches('"').to_owned())
        .filter(|value| !value.is_empty())
}

fn parse_content_length(headers: &[u8]) -> Result<Option<usize>, DecodeError> {
    let text = std::str::from_utf8(headers)
        .map_err(|_| DecodeError::MalformedHeaders("part headers are not utf-8".into()))?;

    for line in text.split("\r\n").filter(|line| !line.is_empty()) {
        let Some((name, value)) = line.split_once(':') else {
            return Err(DecodeError::MalformedHeaders(format!("bad header line {line:?}")));
        };
        if name.trim().eq_ignore_ascii_case("content-length") {
            let len = value.trim().parse::<usize>().map_err(|_| {
                DecodeError::MalformedHeaders(format!("bad content-length {:?}", value.trim()))
            })?;
            return Ok(Some(len));
        }
    }
    Ok(None)
}

fn trim_line_ending(mut part: Bytes) -> Bytes {
    if part.ends_with(b"\r\n") {
        part.truncate(part.len() - 2);
    } else if part.ends_with(b"\n") {
        part.truncate(part.len() - 1);
    }
    part
}

/// First offset a needle could still start at once `len` bytes were searched
fn resume_at(len: usize, needle: usize) -> usize {
    (len + 1).saturating_sub(needle)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
