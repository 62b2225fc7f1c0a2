//! Byte-range file delivery.
//!
//! Bodies are streamed from the open file in bounded chunks; when the client
//! goes away the body stream is dropped and the file handle with it.

use std::{io::SeekFrom, path::Path};

use axum::{
    body::Body,
    http::{HeaderValue, StatusCode, header},
    response::Response,
};
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt},
};
use tokio_util::io::ReaderStream;

use crate::error::{MediaError, MediaResult};

pub const VIDEO_CONTENT_TYPE: &str = "video/mp4";
/// Upper bound on the bytes read from disk per body chunk.
pub const STREAM_CHUNK: usize = 64 * 1024;

/// Inclusive byte interval of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    /// Number of bytes covered; never zero.
    pub fn length(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// Parses a single-range `Range` header against a file of `size` bytes.
///
/// Accepted forms are `bytes=a-b`, `bytes=a-` and `bytes=-n`. An `end` past
/// the file is clamped. Anything else, including multiple ranges, is
/// [`MediaError::InvalidRange`].
pub fn parse_range(value: &str, size: u64) -> MediaResult<ByteRange> {
    let invalid = || MediaError::InvalidRange { size };

    let (unit, ranges) = value.trim().split_once('=').ok_or_else(invalid)?;
    if !unit.trim().eq_ignore_ascii_case("bytes") || ranges.contains(',') {
        return Err(invalid());
    }
    let (start, end) = ranges.trim().split_once('-').ok_or_else(invalid)?;
    let (start, end) = (start.trim(), end.trim());
    if size == 0 {
        return Err(invalid());
    }
    let last = size - 1;

    if start.is_empty() {
        let suffix: u64 = end.parse().map_err(|_| invalid())?;
        if suffix == 0 {
            return Err(invalid());
        }
        return Ok(ByteRange {
            start: size.saturating_sub(suffix),
            end: last,
        });
    }

    let start: u64 = start.parse().map_err(|_| invalid())?;
    let end = if end.is_empty() {
        last
    } else {
        end.parse::<u64>().map_err(|_| invalid())?.min(last)
    };
    if start > end || start >= size {
        return Err(invalid());
    }
    Ok(ByteRange { start, end })
}

/// Streams `path` as `content_type`, honoring an optional `Range` header.
pub async fn serve_file(
    path: &Path,
    content_type: &str,
    range: Option<&HeaderValue>,
) -> MediaResult<Response> {
    let not_found = || MediaError::NotFound(path.display().to_string());

    let mut file = File::open(path).await.map_err(|err| match err.kind() {
        std::io::ErrorKind::NotFound => not_found(),
        _ => MediaError::Io(err),
    })?;
    let metadata = file.metadata().await?;
    if !metadata.is_file() {
        return Err(not_found());
    }
    let size = metadata.len();

    let range = match range {
        Some(value) => {
            let value = value
                .to_str()
                .map_err(|_| MediaError::InvalidRange { size })?;
            Some(parse_range(value, size)?)
        }
        None => None,
    };

    let builder = Response::builder()
        .header(header::CONTENT_TYPE, content_type)
        .header(header::ACCEPT_RANGES, "bytes");

    let response = match range {
        Some(range) => {
            file.seek(SeekFrom::Start(range.start)).await?;
            let stream = ReaderStream::with_capacity(file.take(range.length()), STREAM_CHUNK);
            builder
                .status(StatusCode::PARTIAL_CONTENT)
                .header(header::CONTENT_LENGTH, range.length())
                .header(
                    header::CONTENT_RANGE,
                    format!("bytes {}-{}/{}", range.start, range.end, size),
                )
                .body(Body::from_stream(stream))?
        }
        None => {
            let stream = ReaderStream::with_capacity(file, STREAM_CHUNK);
            builder
                .status(StatusCode::OK)
                .header(header::CONTENT_LENGTH, size)
                .body(Body::from_stream(stream))?
        }
    };
    Ok(response)
}
