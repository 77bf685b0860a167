// Weft - Peer-to-peer resource sharing fabric: CPU, memory and storage pooling over a minimal length-framed protocol
// Copyright (C) 2026  weft contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use bytes::Bytes;
use futures::sink::SinkExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_stream::StreamExt;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::error::{WeftError, WeftResult};

/// Frames larger than this are rejected outright. Sized for a
/// max-size file payload after base64 inflation plus envelope slack.
const MAX_FRAME_LENGTH: usize = 150 * 1024 * 1024;

/// One message per frame: a 4-byte big-endian length prefix followed by a
/// UTF-8 JSON body carrying a `type` field.
///
/// Wraps any byte stream so tests can drive it over in-memory pipes.
pub struct MessageStream<T> {
    frame: Framed<T, LengthDelimitedCodec>,
}

impl<T: AsyncRead + AsyncWrite + Unpin> MessageStream<T> {
    pub fn new(io: T) -> Self {
        let codec = LengthDelimitedCodec::builder()
            .length_field_length(4)
            .max_frame_length(MAX_FRAME_LENGTH)
            .new_codec();

        Self {
            frame: Framed::new(io, codec),
        }
    }

    /// Receive the next message. `Ok(None)` is a clean end of stream before
    /// any length byte; a frame cut short mid-body is a `Codec` error.
    pub async fn recv<M: DeserializeOwned>(&mut self) -> WeftResult<Option<M>> {
        let buf = match self.frame.next().await {
            Some(Ok(buf)) => buf,
            Some(Err(e)) => return Err(WeftError::Codec(e.to_string())),
            None => return Ok(None),
        };

        let body = std::str::from_utf8(&buf)
            .map_err(|e| WeftError::Codec(format!("invalid UTF-8 body: {}", e)))?;

        serde_json::from_str(body)
            .map(Some)
            .map_err(|e| WeftError::Codec(format!("malformed JSON body: {}", e)))
    }

    pub async fn send<M: Serialize>(&mut self, message: &M) -> WeftResult<()> {
        let body = serde_json::to_vec(message)?;

        self.frame
            .send(Bytes::from(body))
            .await
            .map_err(|e| WeftError::Codec(e.to_string()))
    }

    pub fn into_inner(self) -> T {
        self.frame.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::{duplex, AsyncWriteExt};

    use crate::proto::{Request, Response};
    use crate::value::Value;

    #[tokio::test]
    async fn frame_round_trip() {
        let (a, b) = duplex(64 * 1024);
        let mut tx = MessageStream::new(a);
        let mut rx = MessageStream::new(b);

        let req = Request::GetMem {
            key: "answer".to_string(),
        };
        tx.send(&req).await.unwrap();

        let got: Request = rx.recv().await.unwrap().unwrap();
        match got {
            Request::GetMem { key } => assert_eq!(key, "answer"),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn value_round_trip_is_lossless() {
        let (a, b) = duplex(64 * 1024);
        let mut tx = MessageStream::new(a);
        let mut rx = MessageStream::new(b);

        let v: Value =
            serde_json::from_str(r#"{"list":[1,2.5,null,true,"s"],"n":{"a":[]}}"#).unwrap();
        tx.send(&v).await.unwrap();

        let got: Value = rx.recv().await.unwrap().unwrap();
        assert_eq!(got, v);
    }

    #[tokio::test]
    async fn truncated_body_is_codec_error() {
        let (mut a, b) = duplex(64 * 1024);

        // Announce 10 body bytes, deliver 9, then hang up.
        a.write_all(&10u32.to_be_bytes()).await.unwrap();
        a.write_all(b"{\"type\":\"").await.unwrap();
        a.shutdown().await.unwrap();
        drop(a);

        let mut rx = MessageStream::new(b);
        let got = rx.recv::<Request>().await;
        match got {
            Err(WeftError::Codec(_)) => {}
            other => panic!("expected codec error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn invalid_json_is_codec_error() {
        let (mut a, b) = duplex(64 * 1024);

        let body = b"not json at all";
        a.write_all(&(body.len() as u32).to_be_bytes()).await.unwrap();
        a.write_all(body).await.unwrap();

        let mut rx = MessageStream::new(b);
        match rx.recv::<Response>().await {
            Err(WeftError::Codec(_)) => {}
            other => panic!("expected codec error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn clean_close_is_none() {
        let (a, b) = duplex(1024);
        drop(a);

        let mut rx = MessageStream::new(b);
        assert!(rx.recv::<Request>().await.unwrap().is_none());
    }
}
