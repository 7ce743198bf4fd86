//! The response side of the boundary protocol.
//!
//! A [`Response`] is the `(status, headers, body)` triple every stage
//! returns. Its [`Body`] is a sequence of byte chunks that may be produced
//! lazily: nothing is pulled from a streaming body until the transport
//! iterates it.

use std::collections::VecDeque;
use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use super::{Headers, StatusCode};

/// A response body: an iterator of byte chunks.
///
/// Bodies built from strings or byte buffers are held in memory; bodies built
/// with [`Body::stream`] are pulled on demand by whoever consumes the
/// response.
///
/// # Examples
///
/// ```
/// use bytes::Bytes;
/// use croon::http::Body;
///
/// let body = Body::from("hello");
/// assert_eq!(body.into_bytes(), Bytes::from_static(b"hello"));
///
/// let chunks = (1..=3).map(|n| Bytes::from(n.to_string()));
/// let streamed = Body::stream(chunks);
/// assert_eq!(streamed.into_bytes(), Bytes::from_static(b"123"));
/// ```
pub struct Body {
    kind: Kind,
}

enum Kind {
    Chunks(VecDeque<Bytes>),
    Stream(Box<dyn Iterator<Item = Bytes> + Send>),
}

impl Body {
    /// An empty body.
    pub fn empty() -> Self {
        Self {
            kind: Kind::Chunks(VecDeque::new()),
        }
    }

    /// A body whose chunks are produced lazily by `chunks`.
    pub fn stream<I>(chunks: I) -> Self
    where
        I: IntoIterator<Item = Bytes>,
        I::IntoIter: Send + 'static,
    {
        Self {
            kind: Kind::Stream(Box::new(chunks.into_iter())),
        }
    }

    /// Appends an in-memory chunk. Appending to a streaming body chains the
    /// chunk after the stream.
    pub fn push(&mut self, chunk: impl Into<Bytes>) {
        let chunk = chunk.into();
        if let Kind::Chunks(chunks) = &mut self.kind {
            chunks.push_back(chunk);
            return;
        }

        let previous = std::mem::replace(&mut self.kind, Kind::Chunks(VecDeque::new()));
        if let Kind::Stream(stream) = previous {
            self.kind = Kind::Stream(Box::new(stream.chain(std::iter::once(chunk))));
        }
    }

    /// Byte length when known without consuming a stream.
    pub fn len(&self) -> Option<usize> {
        match &self.kind {
            Kind::Chunks(chunks) => Some(chunks.iter().map(Bytes::len).sum()),
            Kind::Stream(_) => None,
        }
    }

    /// `true` only when the body is in memory and holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }

    /// `true` for bodies created with [`Body::stream`].
    pub fn is_streaming(&self) -> bool {
        matches!(self.kind, Kind::Stream(_))
    }

    /// A copy of an in-memory body; `None` for streams, which can only be
    /// consumed once.
    pub fn try_clone(&self) -> Option<Self> {
        match &self.kind {
            Kind::Chunks(chunks) => Some(Self {
                kind: Kind::Chunks(chunks.clone()),
            }),
            Kind::Stream(_) => None,
        }
    }

    /// Drains every chunk into one contiguous buffer.
    pub fn into_bytes(self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.len().unwrap_or(0));
        for chunk in self {
            buf.put(chunk);
        }
        buf.freeze()
    }
}

impl Default for Body {
    fn default() -> Self {
        Self::empty()
    }
}

impl Iterator for Body {
    type Item = Bytes;

    fn next(&mut self) -> Option<Bytes> {
        match &mut self.kind {
            Kind::Chunks(chunks) => chunks.pop_front(),
            Kind::Stream(stream) => stream.next(),
        }
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            Kind::Chunks(chunks) => f.debug_tuple("Body").field(chunks).finish(),
            Kind::Stream(_) => f.write_str("Body(<stream>)"),
        }
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Self {
        let mut chunks = VecDeque::with_capacity(1);
        if !bytes.is_empty() {
            chunks.push_back(bytes);
        }
        Self {
            kind: Kind::Chunks(chunks),
        }
    }
}

impl From<String> for Body {
    fn from(text: String) -> Self {
        Self::from(Bytes::from(text))
    }
}

impl From<&str> for Body {
    fn from(text: &str) -> Self {
        Self::from(Bytes::copy_from_slice(text.as_bytes()))
    }
}

impl From<Vec<u8>> for Body {
    fn from(bytes: Vec<u8>) -> Self {
        Self::from(Bytes::from(bytes))
    }
}

impl From<&[u8]> for Body {
    fn from(bytes: &[u8]) -> Self {
        Self::from(Bytes::copy_from_slice(bytes))
    }
}

/// An HTTP response as exchanged between stages.
///
/// # Examples
///
/// ```
/// use croon::http::{Response, StatusCode};
///
/// let response = Response::new(StatusCode::OK)
///     .header("Content-Type", "application/json")
///     .body(r#"{"status":"ok"}"#);
///
/// let (status, headers, body) = response.into_parts();
/// assert_eq!(status, StatusCode::OK);
/// assert_eq!(headers.get("content-type"), Some("application/json"));
/// assert_eq!(body.len(), Some(15));
/// ```
#[derive(Debug, Default)]
pub struct Response {
    status: StatusCode,
    headers: Headers,
    body: Body,
}

impl Response {
    /// Creates a new response with the given status and an empty body.
    pub fn new(status: impl Into<StatusCode>) -> Self {
        Self {
            status: status.into(),
            headers: Headers::new(),
            body: Body::empty(),
        }
    }

    /// Reassembles a response from its parts.
    pub fn from_parts(status: StatusCode, headers: Headers, body: Body) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    /// Appends a response header. Multiple calls with the same name are additive.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Sets the response body.
    #[must_use]
    pub fn body(mut self, body: impl Into<Body>) -> Self {
        self.body = body.into();
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Mutable header access for stages that decorate a downstream response.
    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    /// Splits the response into the boundary triple.
    pub fn into_parts(self) -> (StatusCode, Headers, Body) {
        (self.status, self.headers, self.body)
    }

    /// Consumes the response and returns its body.
    pub fn into_body(self) -> Body {
        self.body
    }

    /// Serializes the response into HTTP/1.1 wire format, draining the body.
    ///
    /// Automatically adds:
    /// - `Content-Type: text/plain; charset=utf-8` if the body is non-empty and no
    ///   `Content-Type` header was set.
    /// - `Content-Length: <n>` (always written).
    /// - `Connection: keep-alive` or `Connection: close`.
    pub fn into_bytes(self, keep_alive: bool) -> BytesMut {
        let Self {
            status,
            mut headers,
            body,
        } = self;
        let body = body.into_bytes();

        if !body.is_empty() && !headers.contains("content-type") {
            headers.insert("Content-Type", "text/plain; charset=utf-8");
        }
        headers.remove("content-length");
        headers.set("Connection", if keep_alive { "keep-alive" } else { "close" });

        let estimated_size = 128 + headers.len() * 64 + body.len();
        let mut buf = BytesMut::with_capacity(estimated_size);

        buf.put(
            format!(
                "HTTP/1.1 {} {}\r\n",
                status.as_u16(),
                status.canonical_reason()
            )
            .as_bytes(),
        );

        for (name, value) in headers.iter() {
            buf.put(format!("{name}: {value}\r\n").as_bytes());
        }

        // Content-Length is always the last header before the blank line
        buf.put(format!("Content-Length: {}\r\n", body.len()).as_bytes());
        buf.put(&b"\r\n"[..]);
        buf.put(body);

        buf
    }
}
