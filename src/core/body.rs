use axum::body::Body as AxumBody;
use bytes::Bytes;
use http_body_util::BodyExt;

/// The inbound request body, read once and replayable for every attempt.
///
/// Replays share the same buffer; the bytes are never mutated after capture.
#[derive(Debug, Clone)]
pub struct BodySnapshot {
    bytes: Bytes,
}

impl BodySnapshot {
    /// Drain the inbound body into memory.
    pub async fn read(body: AxumBody) -> Result<Self, axum::Error> {
        let bytes = body.collect().await?.to_bytes();
        Ok(Self { bytes })
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    /// A fresh body over the captured bytes.
    pub fn replay(&self) -> AxumBody {
        AxumBody::from(self.bytes.clone())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use futures_util::{StreamExt, stream};

    use super::*;

    #[tokio::test]
    async fn test_replay_returns_identical_bytes() {
        let snapshot = BodySnapshot::read(AxumBody::from("hello world"))
            .await
            .unwrap();
        assert_eq!(snapshot.len(), 11);

        for _ in 0..3 {
            let replayed = snapshot.replay().collect().await.unwrap().to_bytes();
            assert_eq!(&replayed[..], b"hello world");
        }
    }

    #[tokio::test]
    async fn test_source_is_polled_once() {
        let pulls = Arc::new(AtomicUsize::new(0));
        let counter = pulls.clone();
        let chunks = stream::iter(vec!["a", "bc", "def"]).map(move |chunk| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, std::io::Error>(Bytes::from_static(chunk.as_bytes()))
        });

        let snapshot = BodySnapshot::read(AxumBody::from_stream(chunks))
            .await
            .unwrap();
        let _ = snapshot.replay();
        let _ = snapshot.replay();

        assert_eq!(pulls.load(Ordering::SeqCst), 3);
        assert_eq!(&snapshot.bytes()[..], b"abcdef");
    }

    #[tokio::test]
    async fn test_read_error_is_reported() {
        let chunks = stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(std::io::Error::other("connection reset")),
        ]);
        let result = BodySnapshot::read(AxumBody::from_stream(chunks)).await;
        assert!(result.is_err());
    }
}
