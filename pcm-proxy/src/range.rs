use axum::http::StatusCode;
use thiserror::Error;

const FULL_RESOURCE_RANGE: &str = "bytes=0-";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RangeError {
    #[error("malformed range header: {0}")]
    Malformed(String),
    #[error("range start {start} is past the end of a {total} byte resource")]
    Unsatisfiable { start: u64, total: u64 },
}

impl RangeError {
    pub fn status(&self) -> StatusCode {
        match self {
            RangeError::Malformed(_) => StatusCode::BAD_REQUEST,
            RangeError::Unsatisfiable { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
        }
    }
}

/// Status, offsets and headers for answering one track request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeResponse {
    pub status: StatusCode,
    pub start: u64,
    pub end: u64,
    pub total_length: u64,
    pub content_length: u64,
    /// Set only for partial responses.
    pub content_range: Option<String>,
}

impl RangeResponse {
    pub fn is_full(&self) -> bool {
        self.status == StatusCode::OK
    }

    /// Bytes the body has to carry, i.e. the `range_len` for the session.
    pub fn body_len(&self) -> u64 {
        self.end - self.start
    }
}

/// Map an optional `Range` header onto the resource.
///
/// `end` follows the `Content-Range` convention used by the players this
/// serves: a missing or unparseable right bound means `total_length`, and the
/// body length is `end - start`.
pub fn translate(range_header: Option<&str>, total_length: u64) -> Result<RangeResponse, RangeError> {
    let header = match range_header.map(str::trim) {
        None | Some("") | Some(FULL_RESOURCE_RANGE) => {
            return Ok(RangeResponse {
                status: StatusCode::OK,
                start: 0,
                end: total_length,
                total_length,
                content_length: total_length,
                content_range: None,
            });
        }
        Some(h) => h,
    };

    let (start, end) = parse_range(header, total_length)?;
    Ok(RangeResponse {
        status: StatusCode::PARTIAL_CONTENT,
        start,
        end,
        total_length,
        content_length: end - start,
        content_range: Some(format!("bytes {}-{}/{}", start, end, total_length)),
    })
}

fn parse_range(header: &str, total_length: u64) -> Result<(u64, u64), RangeError> {
    let ranges = header
        .strip_prefix("bytes=")
        .ok_or_else(|| RangeError::Malformed(header.to_string()))?;
    let (start_str, end_str) = ranges.split_once('-').unwrap_or((ranges, ""));

    let start: u64 = start_str
        .trim()
        .parse()
        .map_err(|_| RangeError::Malformed(header.to_string()))?;
    let end = end_str
        .trim()
        .parse::<u64>()
        .map(|end| end.min(total_length))
        .unwrap_or(total_length);

    if start > end {
        return Err(RangeError::Unsatisfiable {
            start,
            total: total_length,
        });
    }
    Ok((start, end))
}
