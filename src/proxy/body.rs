use http_body_util::Full;
use hyper::body::{Body, Bytes, Frame, Incoming, SizeHint};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Body carried through the proxy in both directions.
///
/// Inbound client bodies and upstream response bodies stream through as
/// `Incoming`; locally generated responses use `Fixed`.
pub enum ProxyBody {
    Empty,
    Fixed(Full<Bytes>),
    Incoming(Incoming),
}

impl ProxyBody {
    pub fn empty() -> Self {
        ProxyBody::Empty
    }

    pub fn fixed<T: Into<Bytes>>(data: T) -> Self {
        ProxyBody::Fixed(Full::new(data.into()))
    }
}

impl From<Incoming> for ProxyBody {
    fn from(body: Incoming) -> Self {
        ProxyBody::Incoming(body)
    }
}

impl Body for ProxyBody {
    type Data = Bytes;
    type Error = io::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        match self.get_mut() {
            ProxyBody::Empty => Poll::Ready(None),
            ProxyBody::Fixed(body) => Pin::new(body).poll_frame(cx).map_err(io::Error::other),
            ProxyBody::Incoming(body) => Pin::new(body).poll_frame(cx).map_err(io::Error::other),
        }
    }

    fn is_end_stream(&self) -> bool {
        match self {
            ProxyBody::Empty => true,
            ProxyBody::Fixed(body) => body.is_end_stream(),
            ProxyBody::Incoming(body) => body.is_end_stream(),
        }
    }

    fn size_hint(&self) -> SizeHint {
        match self {
            ProxyBody::Empty => SizeHint::with_exact(0),
            ProxyBody::Fixed(body) => body.size_hint(),
            ProxyBody::Incoming(body) => body.size_hint(),
        }
    }
}
