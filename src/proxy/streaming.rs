use crate::config::FlushInterval;
use crate::proxy::{BoxBody, BoxError};
use bytes::{Bytes, BytesMut};
use http::header;
use http_body_util::BodyExt;
use hyper::body::{Body, Frame};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::{sleep, Instant, Sleep};

/// Default chunk threshold for the buffered relay path.
const MAX_BUFFER: usize = 32 * 1024;

/// How a given response should be relayed downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushPolicy {
    /// Frames pass through as they arrive.
    Immediate,
    /// Frames accumulate up to the chunk threshold; `max_latency` bounds how
    /// long bytes may sit in the buffer.
    Buffered { max_latency: Option<Duration> },
}

/// Decide the flush policy for one response. Server-sent events, responses
/// without a known length, and HTTP/2 bidirectional streams (both legs h2,
/// streaming response, client accepted identity encoding) must not be
/// buffered.
pub fn flush_policy(
    configured: FlushInterval,
    req_version: http::Version,
    accept_encoding: Option<&str>,
    resp_version: http::Version,
    resp_headers: &http::HeaderMap,
) -> FlushPolicy {
    if configured == FlushInterval::Immediate {
        return FlushPolicy::Immediate;
    }

    let content_type = resp_headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let event_stream = content_type.starts_with("text/event-stream");

    let streaming = !resp_headers.contains_key(header::CONTENT_LENGTH);

    // TODO: generalize this heuristic — gRPC-style bidirectional streams
    // that negotiate a non-identity encoding still want immediate flushes.
    let identity = accept_encoding
        .map(|ae| ae.trim().is_empty() || ae.trim().eq_ignore_ascii_case("identity"))
        .unwrap_or(true);
    let bidirectional = req_version == http::Version::HTTP_2
        && resp_version == http::Version::HTTP_2
        && streaming
        && identity;

    if event_stream || streaming || bidirectional {
        return FlushPolicy::Immediate;
    }

    match configured {
        FlushInterval::Off => FlushPolicy::Buffered { max_latency: None },
        FlushInterval::Every(d) => FlushPolicy::Buffered {
            max_latency: Some(d),
        },
        FlushInterval::Immediate => FlushPolicy::Immediate,
    }
}

/// Apply the flush policy to an upstream body.
pub fn relay_body(body: BoxBody, policy: FlushPolicy) -> BoxBody {
    match policy {
        FlushPolicy::Immediate => body,
        FlushPolicy::Buffered { max_latency } => {
            FlushBody::new(body, MAX_BUFFER, max_latency).boxed()
        }
    }
}

/// Body adapter that accumulates data frames and emits them when the buffer
/// reaches the chunk threshold, the max-latency timer fires, or the stream
/// ends. Each arriving frame re-arms the timer. Trailer frames flush the
/// buffer first and then pass through verbatim.
pub struct FlushBody {
    inner: BoxBody,
    buf: BytesMut,
    max_buf: usize,
    max_latency: Option<Duration>,
    timer: Option<Pin<Box<Sleep>>>,
    pending_trailers: Option<http::HeaderMap>,
    done: bool,
}

impl FlushBody {
    pub fn new(inner: BoxBody, max_buf: usize, max_latency: Option<Duration>) -> Self {
        Self {
            inner,
            buf: BytesMut::new(),
            max_buf,
            max_latency,
            timer: None,
            pending_trailers: None,
            done: false,
        }
    }

    fn flush_frame(&mut self) -> Frame<Bytes> {
        self.timer = None;
        Frame::data(self.buf.split().freeze())
    }

    fn arm_timer(&mut self, latency: Duration) {
        let deadline = Instant::now() + latency;
        match &mut self.timer {
            Some(timer) => timer.as_mut().reset(deadline),
            None => self.timer = Some(Box::pin(sleep(latency))),
        }
    }
}

impl Body for FlushBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        loop {
            if let Some(trailers) = this.pending_trailers.take() {
                return Poll::Ready(Some(Ok(Frame::trailers(trailers))));
            }
            if this.done {
                return Poll::Ready(None);
            }

            match Pin::new(&mut this.inner).poll_frame(cx) {
                Poll::Ready(Some(Ok(frame))) => match frame.into_data() {
                    Ok(data) => {
                        this.buf.extend_from_slice(&data);
                        if this.buf.len() >= this.max_buf {
                            return Poll::Ready(Some(Ok(this.flush_frame())));
                        }
                        if let Some(latency) = this.max_latency {
                            this.arm_timer(latency);
                        }
                    }
                    Err(frame) => {
                        let trailers = frame.into_trailers().unwrap_or_default();
                        if this.buf.is_empty() {
                            return Poll::Ready(Some(Ok(Frame::trailers(trailers))));
                        }
                        this.pending_trailers = Some(trailers);
                        return Poll::Ready(Some(Ok(this.flush_frame())));
                    }
                },
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Some(Err(e))),
                Poll::Ready(None) => {
                    this.done = true;
                    if !this.buf.is_empty() {
                        return Poll::Ready(Some(Ok(this.flush_frame())));
                    }
                    return Poll::Ready(None);
                }
                Poll::Pending => {
                    if !this.buf.is_empty() {
                        if let Some(timer) = &mut this.timer {
                            if timer.as_mut().poll(cx).is_ready() {
                                return Poll::Ready(Some(Ok(this.flush_frame())));
                            }
                        }
                    }
                    return Poll::Pending;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    enum Step {
        Data(&'static str),
        Trailers(&'static str, &'static str),
        PendForever,
    }

    /// Deterministic body: plays scripted frames, then ends (or parks).
    struct ScriptedBody {
        steps: VecDeque<Step>,
    }

    impl ScriptedBody {
        fn new(steps: Vec<Step>) -> BoxBody {
            let body = Self {
                steps: steps.into(),
            };
            body.boxed()
        }
    }

    impl Body for ScriptedBody {
        type Data = Bytes;
        type Error = BoxError;

        fn poll_frame(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<Option<Result<Frame<Bytes>, BoxError>>> {
            match self.steps.pop_front() {
                Some(Step::Data(s)) => {
                    Poll::Ready(Some(Ok(Frame::data(Bytes::from_static(s.as_bytes())))))
                }
                Some(Step::Trailers(k, v)) => {
                    let mut map = http::HeaderMap::new();
                    map.insert(
                        http::HeaderName::from_static(k),
                        http::HeaderValue::from_static(v),
                    );
                    Poll::Ready(Some(Ok(Frame::trailers(map))))
                }
                Some(Step::PendForever) => {
                    self.steps.push_front(Step::PendForever);
                    Poll::Pending
                }
                None => Poll::Ready(None),
            }
        }
    }

    fn policy_headers(content_length: Option<&str>, content_type: Option<&str>) -> http::HeaderMap {
        let mut headers = http::HeaderMap::new();
        if let Some(cl) = content_length {
            headers.insert(header::CONTENT_LENGTH, cl.parse().unwrap());
        }
        if let Some(ct) = content_type {
            headers.insert(header::CONTENT_TYPE, ct.parse().unwrap());
        }
        headers
    }

    #[test]
    fn test_policy_event_stream_is_immediate() {
        let headers = policy_headers(Some("100"), Some("text/event-stream"));
        assert_eq!(
            flush_policy(
                FlushInterval::Off,
                http::Version::HTTP_11,
                None,
                http::Version::HTTP_11,
                &headers,
            ),
            FlushPolicy::Immediate
        );
    }

    #[test]
    fn test_policy_unknown_length_is_immediate() {
        let headers = policy_headers(None, Some("application/json"));
        assert_eq!(
            flush_policy(
                FlushInterval::Off,
                http::Version::HTTP_11,
                None,
                http::Version::HTTP_11,
                &headers,
            ),
            FlushPolicy::Immediate
        );
    }

    #[test]
    fn test_policy_sized_response_buffers() {
        let headers = policy_headers(Some("1024"), Some("application/json"));
        assert_eq!(
            flush_policy(
                FlushInterval::Every(Duration::from_millis(50)),
                http::Version::HTTP_11,
                Some("gzip"),
                http::Version::HTTP_11,
                &headers,
            ),
            FlushPolicy::Buffered {
                max_latency: Some(Duration::from_millis(50))
            }
        );
    }

    #[test]
    fn test_policy_configured_immediate_wins() {
        let headers = policy_headers(Some("1024"), None);
        assert_eq!(
            flush_policy(
                FlushInterval::Immediate,
                http::Version::HTTP_11,
                None,
                http::Version::HTTP_11,
                &headers,
            ),
            FlushPolicy::Immediate
        );
    }

    #[tokio::test]
    async fn test_buffered_body_coalesces_until_eof() {
        let inner = ScriptedBody::new(vec![Step::Data("hello, "), Step::Data("world")]);
        let mut body = FlushBody::new(inner, MAX_BUFFER, None);
        let frame = body.frame().await.unwrap().unwrap();
        assert_eq!(frame.into_data().unwrap(), Bytes::from("hello, world"));
        assert!(body.frame().await.is_none());
    }

    #[tokio::test]
    async fn test_full_buffer_emits_without_timer() {
        let inner = ScriptedBody::new(vec![
            Step::Data("abcd"),
            Step::Data("efgh"),
            Step::PendForever,
        ]);
        // Threshold of 6: the second frame crosses it.
        let mut body = FlushBody::new(inner, 6, None);
        let frame = body.frame().await.unwrap().unwrap();
        assert_eq!(frame.into_data().unwrap(), Bytes::from("abcdefgh"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_latency_flushes_stalled_stream() {
        let inner = ScriptedBody::new(vec![Step::Data("partial"), Step::PendForever]);
        let mut body = FlushBody::new(inner, MAX_BUFFER, Some(Duration::from_millis(100)));
        let frame = body.frame().await.unwrap().unwrap();
        assert_eq!(frame.into_data().unwrap(), Bytes::from("partial"));
    }

    #[tokio::test]
    async fn test_trailers_flush_buffer_first() {
        let inner = ScriptedBody::new(vec![
            Step::Data("tail"),
            Step::Trailers("x-checksum", "abc123"),
        ]);
        let mut body = FlushBody::new(inner, MAX_BUFFER, None);

        let frame = body.frame().await.unwrap().unwrap();
        assert_eq!(frame.into_data().unwrap(), Bytes::from("tail"));

        let frame = body.frame().await.unwrap().unwrap();
        let trailers = frame.into_trailers().unwrap();
        assert_eq!(trailers.get("x-checksum").unwrap(), "abc123");

        assert!(body.frame().await.is_none());
    }

    #[tokio::test]
    async fn test_trailers_without_data_pass_through() {
        let inner = ScriptedBody::new(vec![Step::Trailers("x-checksum", "abc123")]);
        let mut body = FlushBody::new(inner, MAX_BUFFER, None);
        let frame = body.frame().await.unwrap().unwrap();
        assert!(frame.is_trailers());
    }
}
