//! HTTP/1.1 request serialization and response framing.

use std::io::{self, BufRead, Read};

use bytes::{Bytes, BytesMut};
use http::header::{CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Version};

pub(crate) const MAX_HEAD_BYTES: usize = 64 * 1024;
const MAX_CHUNK_LINE_BYTES: usize = 4 * 1024;

/// Failures below the HTTP semantics layer. The executor attaches method and
/// URI when turning these into client errors.
#[derive(Debug)]
pub(crate) enum WireError {
    Io(io::Error),
    /// EOF where the peer owed us bytes.
    Closed,
    Malformed(String),
    TooLarge { actual_bytes: usize },
}

impl From<io::Error> for WireError {
    fn from(error: io::Error) -> Self {
        if error.kind() == io::ErrorKind::UnexpectedEof {
            return Self::Closed;
        }
        Self::Io(error)
    }
}

fn malformed(message: impl Into<String>) -> WireError {
    WireError::Malformed(message.into())
}

pub(crate) fn encode_request(
    method: &Method,
    target: &str,
    headers: &HeaderMap,
    body: Option<&[u8]>,
) -> Vec<u8> {
    let body_len = body.map_or(0, <[u8]>::len);
    let mut request = Vec::with_capacity(256 + body_len);
    request.extend_from_slice(method.as_str().as_bytes());
    request.push(b' ');
    request.extend_from_slice(target.as_bytes());
    request.extend_from_slice(b" HTTP/1.1\r\n");
    for (name, value) in headers {
        request.extend_from_slice(name.as_str().as_bytes());
        request.extend_from_slice(b": ");
        request.extend_from_slice(value.as_bytes());
        request.extend_from_slice(b"\r\n");
    }
    request.extend_from_slice(b"\r\n");
    if let Some(body) = body {
        request.extend_from_slice(body);
    }
    request
}

#[derive(Debug)]
pub(crate) struct ResponseHead {
    pub(crate) version: Version,
    pub(crate) status: StatusCode,
    pub(crate) headers: HeaderMap,
}

impl ResponseHead {
    /// Whether the server allows the connection to carry another request.
    /// After `101 Switching Protocols` the socket no longer speaks HTTP.
    pub(crate) fn keeps_connection_open(&self) -> bool {
        if self.status == StatusCode::SWITCHING_PROTOCOLS {
            return false;
        }
        let mut close = false;
        let mut keep_alive = false;
        for token in connection_tokens(&self.headers) {
            close |= token.eq_ignore_ascii_case("close");
            keep_alive |= token.eq_ignore_ascii_case("keep-alive");
        }
        if close {
            return false;
        }
        self.version == Version::HTTP_11 || keep_alive
    }
}

fn connection_tokens(headers: &HeaderMap) -> impl Iterator<Item = &str> {
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
}

/// Reads a response head, skipping interim `1xx` responses.
pub(crate) fn read_response_head<R: BufRead>(reader: &mut R) -> Result<ResponseHead, WireError> {
    let mut budget = MAX_HEAD_BYTES;
    loop {
        let head = read_single_head(reader, &mut budget)?;
        if head.status.is_informational() && head.status != StatusCode::SWITCHING_PROTOCOLS {
            continue;
        }
        return Ok(head);
    }
}

fn read_single_head<R: BufRead>(
    reader: &mut R,
    budget: &mut usize,
) -> Result<ResponseHead, WireError> {
    let mut line = Vec::with_capacity(64);
    if read_line(reader, &mut line, budget)? == 0 {
        return Err(WireError::Closed);
    }
    let (version, status) = parse_status_line(&line)?;

    let mut headers = HeaderMap::new();
    loop {
        line.clear();
        if read_line(reader, &mut line, budget)? == 0 {
            return Err(WireError::Closed);
        }
        let trimmed = trim_line_end(&line);
        if trimmed.is_empty() {
            break;
        }
        if trimmed[0] == b' ' || trimmed[0] == b'\t' {
            return Err(malformed("obsolete header line folding"));
        }
        let (name, value) = parse_header_line(trimmed)?;
        headers.append(name, value);
    }

    Ok(ResponseHead {
        version,
        status,
        headers,
    })
}

fn read_line<R: BufRead>(
    reader: &mut R,
    line: &mut Vec<u8>,
    budget: &mut usize,
) -> Result<usize, WireError> {
    let limit = (*budget as u64).saturating_add(1);
    let read = reader.by_ref().take(limit).read_until(b'\n', line)?;
    if read > *budget {
        return Err(malformed(format!(
            "response head exceeds {MAX_HEAD_BYTES} bytes"
        )));
    }
    *budget -= read;
    if read > 0 && !line.ends_with(b"\n") {
        return Err(WireError::Closed);
    }
    Ok(read)
}

fn trim_line_end(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn parse_status_line(line: &[u8]) -> Result<(Version, StatusCode), WireError> {
    let line = std::str::from_utf8(trim_line_end(line))
        .map_err(|_| malformed("status line is not valid utf-8"))?;
    let mut parts = line.splitn(3, ' ');
    let version = match parts.next() {
        Some("HTTP/1.1") => Version::HTTP_11,
        Some("HTTP/1.0") => Version::HTTP_10,
        _ => return Err(malformed(format!("unsupported status line: {line:?}"))),
    };
    let code = parts
        .next()
        .filter(|code| code.len() == 3)
        .and_then(|code| code.parse::<u16>().ok())
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or_else(|| malformed(format!("invalid status code in {line:?}")))?;
    Ok((version, code))
}

fn parse_header_line(line: &[u8]) -> Result<(HeaderName, HeaderValue), WireError> {
    let colon = line
        .iter()
        .position(|byte| *byte == b':')
        .ok_or_else(|| malformed("header line without ':'"))?;
    let name = HeaderName::from_bytes(&line[..colon]).map_err(|_| {
        malformed(format!(
            "invalid header name {:?}",
            String::from_utf8_lossy(&line[..colon])
        ))
    })?;
    let value = line[colon + 1..].trim_ascii();
    let value = HeaderValue::from_bytes(value)
        .map_err(|_| malformed(format!("invalid value for header {name}")))?;
    Ok((name, value))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BodyFraming {
    Empty,
    Length(u64),
    Chunked,
    UntilClose,
}

impl BodyFraming {
    pub(crate) fn for_response(method: &Method, head: &ResponseHead) -> Result<Self, WireError> {
        let status = head.status;
        if method == Method::HEAD
            || status.is_informational()
            || status == StatusCode::NO_CONTENT
            || status == StatusCode::NOT_MODIFIED
        {
            return Ok(Self::Empty);
        }

        if head.headers.contains_key(TRANSFER_ENCODING) {
            let last_coding = head
                .headers
                .get_all(TRANSFER_ENCODING)
                .iter()
                .filter_map(|value| value.to_str().ok())
                .flat_map(|value| value.split(','))
                .map(str::trim)
                .filter(|coding| !coding.is_empty())
                .last();
            return Ok(match last_coding {
                Some(coding) if coding.eq_ignore_ascii_case("chunked") => Self::Chunked,
                _ => Self::UntilClose,
            });
        }

        let mut length = None;
        for value in head.headers.get_all(CONTENT_LENGTH) {
            let parsed = value
                .to_str()
                .ok()
                .and_then(|value| value.trim().parse::<u64>().ok())
                .ok_or_else(|| malformed("invalid content-length"))?;
            if length.is_some_and(|length| length != parsed) {
                return Err(malformed("conflicting content-length values"));
            }
            length = Some(parsed);
        }
        Ok(match length {
            Some(0) => Self::Empty,
            Some(length) => Self::Length(length),
            None => Self::UntilClose,
        })
    }

    /// Bodies that end at connection close leave nothing to reuse.
    pub(crate) fn is_delimited(self) -> bool {
        !matches!(self, Self::UntilClose)
    }
}

/// Reads the whole body described by `framing`, failing once it grows past
/// `limit` bytes.
pub(crate) fn read_body<R: BufRead>(
    reader: &mut R,
    framing: BodyFraming,
    limit: usize,
) -> Result<Bytes, WireError> {
    let mut body = BytesMut::new();
    match framing {
        BodyFraming::Empty => {}
        BodyFraming::Length(length) => {
            if length > limit as u64 {
                return Err(WireError::TooLarge {
                    actual_bytes: usize::try_from(length).unwrap_or(usize::MAX),
                });
            }
            read_exact_into(reader, &mut body, length as usize)?;
        }
        BodyFraming::Chunked => read_chunked(reader, &mut body, limit)?,
        BodyFraming::UntilClose => {
            let mut buffer = Vec::new();
            let read = reader
                .by_ref()
                .take((limit as u64).saturating_add(1))
                .read_to_end(&mut buffer)?;
            if read > limit {
                return Err(WireError::TooLarge { actual_bytes: read });
            }
            body.extend_from_slice(&buffer);
        }
    }
    Ok(body.freeze())
}

fn read_exact_into<R: BufRead>(
    reader: &mut R,
    body: &mut BytesMut,
    mut remaining: usize,
) -> Result<(), WireError> {
    while remaining > 0 {
        let available = reader.fill_buf()?;
        if available.is_empty() {
            return Err(WireError::Closed);
        }
        let take = available.len().min(remaining);
        body.extend_from_slice(&available[..take]);
        reader.consume(take);
        remaining -= take;
    }
    Ok(())
}

fn read_chunked<R: BufRead>(
    reader: &mut R,
    body: &mut BytesMut,
    limit: usize,
) -> Result<(), WireError> {
    let mut line = Vec::with_capacity(16);
    loop {
        line.clear();
        let mut budget = MAX_CHUNK_LINE_BYTES;
        if read_line(reader, &mut line, &mut budget)? == 0 {
            return Err(WireError::Closed);
        }
        let size = parse_chunk_size(trim_line_end(&line))?;
        if size == 0 {
            break;
        }
        let total = body.len().saturating_add(size);
        if total > limit {
            return Err(WireError::TooLarge {
                actual_bytes: total,
            });
        }
        read_exact_into(reader, body, size)?;

        line.clear();
        let mut budget = 2;
        if read_line(reader, &mut line, &mut budget)? == 0 || !trim_line_end(&line).is_empty() {
            return Err(malformed("missing CRLF after chunk data"));
        }
    }

    // trailer section
    let mut budget = MAX_HEAD_BYTES;
    loop {
        line.clear();
        if read_line(reader, &mut line, &mut budget)? == 0 {
            return Err(WireError::Closed);
        }
        if trim_line_end(&line).is_empty() {
            return Ok(());
        }
    }
}

fn parse_chunk_size(line: &[u8]) -> Result<usize, WireError> {
    let size = line
        .split(|byte| *byte == b';')
        .next()
        .unwrap_or_default()
        .trim_ascii();
    std::str::from_utf8(size)
        .ok()
        .filter(|size| !size.is_empty())
        .and_then(|size| usize::from_str_radix(size, 16).ok())
        .ok_or_else(|| {
            malformed(format!(
                "invalid chunk size line {:?}",
                String::from_utf8_lossy(line)
            ))
        })
}
