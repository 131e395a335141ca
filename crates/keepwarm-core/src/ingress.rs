use crate::{Error, Result};
use bytes::{Bytes, BytesMut};
use core::fmt::Display;
use futures::{Stream, StreamExt};

/// Reads a request body to completion.
///
/// The body is accumulated chunk by chunk regardless of whether the client
/// declared a `Content-Length`, so chunked uploads are fully buffered before
/// the caller makes any dispatch decision.
///
/// A `limit` of `0` disables the size check.
///
/// # Errors
///
/// - [`Error::BodyRead`] if the underlying stream yields an error.
/// - [`Error::BodyTooLarge`] as soon as the accumulated size would exceed
///   `limit`. The rest of the body is not read.
pub async fn drain<S, E>(stream: S, limit: usize) -> Result<Bytes>
where
    S: Stream<Item = core::result::Result<Bytes, E>>,
    E: Display,
{
    let mut stream = core::pin::pin!(stream);
    let mut body = BytesMut::new();
    let mut chunks = 0_usize;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| Error::BodyRead {
            context: e.to_string(),
        })?;

        if limit != 0 && body.len() + chunk.len() > limit {
            tracing::debug!(
                "Rejecting body after {} bytes (limit {limit})",
                body.len() + chunk.len()
            );
            return Err(Error::BodyTooLarge { limit });
        }

        chunks += 1;
        body.extend_from_slice(&chunk);
    }

    tracing::trace!("Drained {} bytes in {chunks} chunks", body.len());
    Ok(body.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    type Chunk = core::result::Result<Bytes, &'static str>;

    #[tokio::test]
    async fn empty_body_drains_to_empty_bytes() {
        let body = drain(stream::iter(Vec::<Chunk>::new()), 0).await.unwrap();
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn chunks_are_concatenated_in_order() {
        let chunks: Vec<Chunk> = vec![
            Ok(Bytes::from_static(b"he")),
            Ok(Bytes::new()),
            Ok(Bytes::from_static(b"llo")),
        ];
        let body = drain(stream::iter(chunks), 0).await.unwrap();
        assert_eq!(body, Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn multi_megabyte_body_is_read_fully() {
        let chunk = Bytes::from(vec![7_u8; 64 * 1024]);
        let chunks: Vec<Chunk> = (0..48).map(|_| Ok(chunk.clone())).collect();
        let body = drain(stream::iter(chunks), 0).await.unwrap();
        assert_eq!(body.len(), 48 * 64 * 1024);
        assert!(body.iter().all(|b| *b == 7));
    }

    #[tokio::test]
    async fn stream_error_aborts_the_read() {
        let chunks: Vec<Chunk> = vec![Ok(Bytes::from_static(b"partial")), Err("connection reset")];
        let err = drain(stream::iter(chunks), 0).await.unwrap_err();
        assert_eq!(
            err,
            Error::BodyRead {
                context: "connection reset".to_string()
            }
        );
    }

    #[tokio::test]
    async fn limit_is_inclusive() {
        let chunks: Vec<Chunk> = vec![
            Ok(Bytes::from_static(b"1234")),
            Ok(Bytes::from_static(b"5678")),
        ];
        let body = drain(stream::iter(chunks), 8).await.unwrap();
        assert_eq!(body.len(), 8);

        let chunks: Vec<Chunk> = vec![
            Ok(Bytes::from_static(b"1234")),
            Ok(Bytes::from_static(b"56789")),
        ];
        let err = drain(stream::iter(chunks), 8).await.unwrap_err();
        assert_eq!(err, Error::BodyTooLarge { limit: 8 });
    }
}
