use std::io;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

use crate::{ProxyError, Result};

/// Requests with bigger header blocks are rejected instead of buffered.
const MAX_REQUEST_HEADER_SIZE: usize = 64 * 1024;

static REQUEST_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^GET /(\S+) HTTP/\S+").expect("request line regex"));

// open-ended only, `bytes=<offset>-`; an end offset is never honored
static RANGE_HEADER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Range: bytes=(\d+)-").expect("range header regex"));

/// A parsed `GET` or range `GET` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetRequest {
    /// Decoded request target without the leading slash.
    pub path: String,
    /// Whether a `Range: bytes=<offset>-` header was present.
    pub partial: bool,
    /// Start of the requested range, zero for full requests.
    pub range_offset: u64,
}

impl GetRequest {
    /// Parses raw request text: the request line followed by optional header lines.
    pub fn parse(request: &str) -> Result<GetRequest> {
        let mut lines = request.lines().skip_while(|line| line.trim().is_empty());
        let request_line = lines
            .next()
            .ok_or_else(|| ProxyError::MalformedRequest("empty request".to_string()))?;

        let target = REQUEST_LINE
            .captures(request_line)
            .and_then(|captures| captures.get(1))
            .ok_or_else(|| ProxyError::MalformedRequest(format!("invalid request line: {request_line}")))?
            .as_str();

        let path = urlencoding::decode(target)
            .map_err(|e| ProxyError::MalformedRequest(format!("undecodable target {target}: {e}")))?
            .into_owned();

        let headers = lines.collect::<Vec<_>>().join("\n");
        let range_offset = match RANGE_HEADER.captures(&headers).and_then(|c| c.get(1)) {
            Some(offset) => Some(offset.as_str().parse::<u64>().map_err(|e| {
                ProxyError::MalformedRequest(format!("invalid range offset {}: {e}", offset.as_str()))
            })?),
            None => None,
        };

        Ok(GetRequest {
            path,
            partial: range_offset.is_some(),
            range_offset: range_offset.unwrap_or(0),
        })
    }

    /// Reads the header block from `stream` until a blank line or end of stream, then parses it.
    pub async fn read_from<R: AsyncRead + Unpin>(stream: R) -> Result<GetRequest> {
        let mut reader = BufReader::new(stream);
        let mut request = String::new();
        let mut line = String::new();
        loop {
            line.clear();
            let read = reader.read_line(&mut line).await.map_err(|e| match e.kind() {
                io::ErrorKind::InvalidData => ProxyError::MalformedRequest(format!("request is not valid UTF-8: {e}")),
                _ => ProxyError::Io(e),
            })?;
            if read == 0 {
                break;
            }
            if line.trim().is_empty() {
                if request.trim().is_empty() {
                    continue;
                }
                break;
            }
            request.push_str(&line);
            if request.len() > MAX_REQUEST_HEADER_SIZE {
                return Err(ProxyError::MalformedRequest(format!(
                    "request headers exceed {MAX_REQUEST_HEADER_SIZE} bytes"
                )));
            }
        }
        GetRequest::parse(&request)
    }
}

impl FromStr for GetRequest {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self> {
        GetRequest::parse(s)
    }
}
