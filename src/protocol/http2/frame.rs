//! Owned HTTP/2 frames as they travel between the two sides of a pair.

use bytes::{Bytes, BytesMut};
use http::header::CONTENT_TYPE;
use http::{HeaderMap, Method, Request, Response, StatusCode, Uri};

use crate::error::{Error, Result};

/// Pseudo headers plus regular header fields of a HEADERS frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Http2Headers {
    pub method: Option<Method>,
    pub scheme: Option<String>,
    pub authority: Option<String>,
    pub path: Option<String>,
    pub status: Option<StatusCode>,
    pub fields: HeaderMap,
}

impl Http2Headers {
    pub fn from_request_parts(parts: &http::request::Parts) -> Self {
        Self {
            method: Some(parts.method.clone()),
            scheme: parts.uri.scheme_str().map(str::to_owned),
            authority: parts.uri.authority().map(|a| a.as_str().to_owned()),
            path: parts.uri.path_and_query().map(|p| p.as_str().to_owned()),
            status: None,
            fields: parts.headers.clone(),
        }
    }

    pub fn from_response_parts(parts: &http::response::Parts) -> Self {
        Self {
            status: Some(parts.status),
            fields: parts.headers.clone(),
            ..Self::default()
        }
    }

    /// Trailer block: fields only.
    pub fn trailers(fields: HeaderMap) -> Self {
        Self {
            fields,
            ..Self::default()
        }
    }

    pub fn is_request(&self) -> bool {
        self.method.is_some()
    }

    pub fn is_response(&self) -> bool {
        self.status.is_some()
    }

    /// Rebuild the request head. Scheme defaults to https, authority to
    /// `fallback_authority`.
    pub fn into_request(self, fallback_authority: &str) -> Result<Request<()>> {
        let method = self
            .method
            .ok_or_else(|| Error::proxy("HTTP/2 request without :method"))?;
        let uri = Uri::builder()
            .scheme(self.scheme.as_deref().unwrap_or("https"))
            .authority(self.authority.as_deref().unwrap_or(fallback_authority))
            .path_and_query(self.path.as_deref().unwrap_or("/"))
            .build()
            .map_err(|e| Error::proxy(format!("Invalid HTTP/2 request target: {}", e)))?;

        let mut request = Request::builder()
            .method(method)
            .uri(uri)
            .version(http::Version::HTTP_2)
            .body(())
            .map_err(|e| Error::proxy(format!("Invalid HTTP/2 request: {}", e)))?;
        *request.headers_mut() = self.fields;
        Ok(request)
    }

    pub fn into_response(self) -> Result<Response<()>> {
        let status = self
            .status
            .ok_or_else(|| Error::proxy("HTTP/2 response without :status"))?;
        let mut response = Response::new(());
        *response.status_mut() = status;
        *response.version_mut() = http::Version::HTTP_2;
        *response.headers_mut() = self.fields;
        Ok(response)
    }

    pub fn content_type(&self) -> Option<String> {
        self.fields
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Http2Frame {
    Headers {
        stream_id: u32,
        headers: Http2Headers,
        end_stream: bool,
    },
    Data {
        stream_id: u32,
        data: Bytes,
        end_stream: bool,
    },
    Reset {
        stream_id: u32,
        /// HTTP/2 error code
        reason: u32,
    },
}

impl Http2Frame {
    pub fn stream_id(&self) -> u32 {
        match self {
            Http2Frame::Headers { stream_id, .. }
            | Http2Frame::Data { stream_id, .. }
            | Http2Frame::Reset { stream_id, .. } => *stream_id,
        }
    }

    /// True for the last frame a side sends on a stream. Resets end it too.
    pub fn is_end_stream(&self) -> bool {
        match self {
            Http2Frame::Headers { end_stream, .. } | Http2Frame::Data { end_stream, .. } => {
                *end_stream
            }
            Http2Frame::Reset { .. } => true,
        }
    }

    pub fn with_stream_id(mut self, id: u32) -> Self {
        match &mut self {
            Http2Frame::Headers { stream_id, .. }
            | Http2Frame::Data { stream_id, .. }
            | Http2Frame::Reset { stream_id, .. } => *stream_id = id,
        }
        self
    }

    pub fn data_len(&self) -> usize {
        match self {
            Http2Frame::Data { data, .. } => data.len(),
            _ => 0,
        }
    }
}

/// Ordered frames of one stream: an assembled request or a substitute response.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameBatch {
    stream_id: u32,
    frames: Vec<Http2Frame>,
}

impl FrameBatch {
    pub fn new(stream_id: u32, frames: Vec<Http2Frame>) -> Self {
        Self { stream_id, frames }
    }

    /// A complete response: HEADERS, then one DATA frame when `body` is not empty.
    pub fn response(status: StatusCode, fields: HeaderMap, body: Bytes) -> Self {
        let headers = Http2Headers {
            status: Some(status),
            fields,
            ..Http2Headers::default()
        };
        let mut frames = vec![Http2Frame::Headers {
            stream_id: 0,
            headers,
            end_stream: body.is_empty(),
        }];
        if !body.is_empty() {
            frames.push(Http2Frame::Data {
                stream_id: 0,
                data: body,
                end_stream: true,
            });
        }
        Self::new(0, frames)
    }

    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    pub fn frames(&self) -> &[Http2Frame] {
        &self.frames
    }

    /// The leading HEADERS block.
    pub fn headers(&self) -> Option<&Http2Headers> {
        self.frames.iter().find_map(|f| match f {
            Http2Frame::Headers { headers, .. } => Some(headers),
            _ => None,
        })
    }

    pub fn body_len(&self) -> usize {
        self.frames.iter().map(Http2Frame::data_len).sum()
    }

    pub fn body(&self) -> Bytes {
        let mut body = BytesMut::with_capacity(self.body_len());
        for frame in &self.frames {
            if let Http2Frame::Data { data, .. } = frame {
                body.extend_from_slice(data);
            }
        }
        body.freeze()
    }

    /// Restamp every frame onto `id`.
    pub fn with_stream_id(self, id: u32) -> Self {
        Self {
            stream_id: id,
            frames: self
                .frames
                .into_iter()
                .map(|f| f.with_stream_id(id))
                .collect(),
        }
    }

    pub fn into_frames(self) -> Vec<Http2Frame> {
        self.frames
    }
}
