//! Outbound write serialization and fragmentation.
//!
//! The wire is a byte stream: interleaving fragments of two logical frames
//! would make reassembly ambiguous, so every logical send happens under the
//! connection's write mutex. Responses, signals, alives, and buffer-size
//! exchanges all contend for the same lock.
//!
//! A body larger than the negotiated buffer size is split into fragments.
//! Every fragment re-carries the full prefix (control bytes through
//! BODY_LEN, which always declares the *total* body length), and no single
//! write exceeds the buffer size.

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::error::{IotError, Result};
use crate::protocol::codec::EncodedFrame;

/// Write half of a connection's byte stream.
pub(crate) type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Write one logical frame, fragmenting its body to `buffer_size`.
///
/// Returns the number of writes used (`parts`). The mutex guard spans all
/// fragments and is released on every path, including write errors.
pub(crate) async fn write_frame(
    writer: &Mutex<BoxedWriter>,
    frame: &EncodedFrame,
    buffer_size: usize,
) -> Result<u32> {
    if frame.prefix.len() >= buffer_size {
        return Err(IotError::BufferTooSmall(buffer_size));
    }
    let capacity = buffer_size - frame.prefix.len();

    let mut guard = writer.lock().await;

    if frame.body.is_empty() {
        guard.write_all(&frame.prefix).await?;
        guard.flush().await?;
        return Ok(1);
    }

    let mut parts = 0u32;
    let mut offset = 0usize;
    let mut fragment = Vec::with_capacity(buffer_size);

    while offset < frame.body.len() {
        let end = (offset + capacity).min(frame.body.len());

        fragment.clear();
        fragment.extend_from_slice(&frame.prefix);
        fragment.extend_from_slice(&frame.body[offset..end]);

        guard.write_all(&fragment).await?;
        parts += 1;
        offset = end;
    }

    guard.flush().await?;
    Ok(parts)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::pin::Pin;
    use std::sync::{Arc, Mutex as StdMutex};
    use std::task::{Context, Poll};

    use crate::protocol::codec::encode;
    use crate::protocol::{Method, Request, DEFAULT_BUFFER_SIZE};

    /// Writer that records the size of every write call.
    #[derive(Clone)]
    struct RecordingWriter {
        writes: Arc<StdMutex<Vec<usize>>>,
    }

    impl RecordingWriter {
        fn new() -> Self {
            Self {
                writes: Arc::new(StdMutex::new(Vec::new())),
            }
        }

        fn writes(&self) -> Vec<usize> {
            self.writes.lock().unwrap().clone()
        }
    }

    impl AsyncWrite for RecordingWriter {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            self.writes.lock().unwrap().push(buf.len());
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    fn shared(writer: RecordingWriter) -> Mutex<BoxedWriter> {
        Mutex::new(Box::new(writer))
    }

    #[tokio::test]
    async fn test_single_fragment_when_body_fits() {
        let recorder = RecordingWriter::new();
        let writer = shared(recorder.clone());

        let req = Request::new(Method::Signal).with_body(vec![0x55; 100]);
        let frame = encode(&req, DEFAULT_BUFFER_SIZE).unwrap();

        let parts = write_frame(&writer, &frame, DEFAULT_BUFFER_SIZE)
            .await
            .unwrap();

        assert_eq!(parts, 1);
        assert_eq!(recorder.writes(), vec![frame.prefix.len() + 100]);
    }

    #[tokio::test]
    async fn test_1500_byte_streaming_fragments_into_two_writes() {
        let recorder = RecordingWriter::new();
        let writer = shared(recorder.clone());

        let req = Request::new(Method::Streaming)
            .with_id(1)
            .with_body(vec![0xAA; 1500]);
        let frame = encode(&req, DEFAULT_BUFFER_SIZE).unwrap();
        let prefix_len = frame.prefix.len();

        let parts = write_frame(&writer, &frame, DEFAULT_BUFFER_SIZE)
            .await
            .unwrap();

        assert_eq!(parts, 2);
        let writes = recorder.writes();
        assert_eq!(writes.len(), 2);
        // First write fills the buffer exactly.
        assert_eq!(writes[0], 1024);
        // Second carries the prefix again plus the leftover body bytes.
        assert_eq!(writes[1], prefix_len + (1500 - (1024 - prefix_len)));
        assert!(writes[1] <= 1024);
    }

    #[tokio::test]
    async fn test_no_write_exceeds_buffer_size() {
        let recorder = RecordingWriter::new();
        let writer = shared(recorder.clone());

        let req = Request::new(Method::Streaming)
            .with_id(2)
            .with_body(vec![0x11; 10_000]);
        let frame = encode(&req, 256).unwrap();

        let parts = write_frame(&writer, &frame, 256).await.unwrap();

        let writes = recorder.writes();
        assert_eq!(writes.len() as u32, parts);
        assert!(writes.iter().all(|&len| len <= 256));
        let prefix_len = frame.prefix.len();
        let body_total: usize = writes.iter().map(|len| len - prefix_len).sum();
        assert_eq!(body_total, 10_000);
    }

    #[tokio::test]
    async fn test_empty_body_is_one_prefix_write() {
        let recorder = RecordingWriter::new();
        let writer = shared(recorder.clone());

        let req = Request::new(Method::AliveRequest);
        let frame = encode(&req, DEFAULT_BUFFER_SIZE).unwrap();

        let parts = write_frame(&writer, &frame, DEFAULT_BUFFER_SIZE)
            .await
            .unwrap();

        assert_eq!(parts, 1);
        assert_eq!(recorder.writes(), vec![2]);
    }

    #[tokio::test]
    async fn test_buffer_smaller_than_prefix_is_rejected() {
        let recorder = RecordingWriter::new();
        let writer = shared(recorder.clone());

        let req = Request::new(Method::Signal)
            .with_path("/a/rather/long/path")
            .with_body(vec![1, 2, 3]);
        let frame = encode(&req, DEFAULT_BUFFER_SIZE).unwrap();

        let result = write_frame(&writer, &frame, 8).await;
        assert!(matches!(result, Err(IotError::BufferTooSmall(8))));
        assert!(recorder.writes().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_sends_never_interleave() {
        use crate::protocol::codec::{parse, Parse};

        // Byte-sink that accumulates everything written, in order.
        #[derive(Clone)]
        struct Sink(Arc<StdMutex<Vec<u8>>>);
        impl AsyncWrite for Sink {
            fn poll_write(
                self: Pin<&mut Self>,
                _cx: &mut Context<'_>,
                buf: &[u8],
            ) -> Poll<std::io::Result<usize>> {
                self.0.lock().unwrap().extend_from_slice(buf);
                Poll::Ready(Ok(buf.len()))
            }
            fn poll_flush(
                self: Pin<&mut Self>,
                _cx: &mut Context<'_>,
            ) -> Poll<std::io::Result<()>> {
                Poll::Ready(Ok(()))
            }
            fn poll_shutdown(
                self: Pin<&mut Self>,
                _cx: &mut Context<'_>,
            ) -> Poll<std::io::Result<()>> {
                Poll::Ready(Ok(()))
            }
        }

        let bytes = Arc::new(StdMutex::new(Vec::new()));
        let writer: Arc<Mutex<BoxedWriter>> =
            Arc::new(Mutex::new(Box::new(Sink(bytes.clone()))));

        // Two multipart streams racing for the lock.
        let mut tasks = Vec::new();
        for id in [10u16, 20u16] {
            let writer = writer.clone();
            tasks.push(tokio::spawn(async move {
                let req = Request::new(Method::Streaming)
                    .with_id(id)
                    .with_body(vec![id as u8; 3000]);
                let frame = encode(&req, DEFAULT_BUFFER_SIZE).unwrap();
                write_frame(&writer, &frame, DEFAULT_BUFFER_SIZE)
                    .await
                    .unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        // Walk the stream fragment by fragment: every head must parse, and
        // each message's fragments must be contiguous.
        let stream = bytes.lock().unwrap().clone();
        let mut pos = 0usize;
        let mut order = Vec::new();
        while pos < stream.len() {
            let head = match parse(&stream[pos..], DEFAULT_BUFFER_SIZE) {
                Parse::Head(head) => head,
                other => panic!("stream corrupt at {pos}: {other:?}"),
            };
            let capacity = DEFAULT_BUFFER_SIZE - head.head_len;
            let done: usize = order
                .iter()
                .filter(|&&id| id == head.id.unwrap())
                .count()
                * capacity;
            let fragment = (head.declared_len as usize - done).min(capacity);
            order.push(head.id.unwrap());
            pos += head.head_len + fragment;
        }
        assert_eq!(pos, stream.len());
        // Fragments of one message are adjacent: the sequence is a block of
        // one id followed by a block of the other.
        let first = order[0];
        let switch = order.iter().position(|&id| id != first).unwrap();
        assert!(order[switch..].iter().all(|&id| id != first));
    }
}
