//! Scripted HTTP/2 server half for the hermetic integration tests. Speaks
//! real frames over any byte stream (the in-memory pipe, or TCP for the
//! prior-knowledge tests).

#![allow(dead_code)]

use bytes::{Bytes, BytesMut};
use h2client::flags::*;
use h2client::frame::{Frame, PREFACE};
use h2client::hpack;
use h2client::types::*;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub struct TestServer<T> {
    io: T,
    buf: BytesMut,
    pub decoder: hpack::Decoder,
    pub encoder: hpack::Encoder,
}

/// One fully decoded request header block.
pub struct ReceivedRequest {
    pub stream: NonZeroStreamId,
    pub headers: Vec<(String, String)>,
    pub end_stream: bool,
    /// Raw HPACK bytes of the block, for wire-level assertions.
    pub fragment: Bytes,
}

impl<T: AsyncRead + AsyncWrite + Unpin> TestServer<T> {
    /// Accept the client preface and run the SETTINGS exchange.
    pub async fn handshake(io: T) -> Self {
        Self::handshake_with_settings(io, Vec::new()).await
    }

    pub async fn handshake_with_settings(
        mut io: T,
        params: Vec<(SettingsParameter, u32)>,
    ) -> Self {
        let mut preface = [0u8; 24];
        io.read_exact(&mut preface).await.unwrap();
        assert_eq!(&preface[..], PREFACE, "client must lead with the preface");

        let mut server = Self {
            io,
            buf: BytesMut::with_capacity(16 * 1024),
            decoder: hpack::Decoder::default(),
            encoder: hpack::Encoder::default(),
        };

        // client SETTINGS comes right behind the preface
        match server.recv().await {
            Frame::Settings { flags, .. } => {
                assert!(!flags.contains(SettingsFlags::ACK));
            }
            other => panic!("expected client SETTINGS, got {other:?}"),
        }

        server
            .send(Frame::Settings {
                flags: SettingsFlags::empty(),
                params,
            })
            .await;
        server
            .send(Frame::Settings {
                flags: SettingsFlags::ACK,
                params: Vec::new(),
            })
            .await;
        server
    }

    pub async fn send(&mut self, frame: Frame) {
        let mut wire = BytesMut::new();
        frame.encode(&mut wire);
        self.io.write_all(&wire).await.unwrap();
        self.io.flush().await.unwrap();
    }

    /// Next frame, raw.
    pub async fn recv(&mut self) -> Frame {
        loop {
            if let Some(frame) = Frame::parse(&mut self.buf, (1 << 24) - 1).unwrap() {
                return frame;
            }
            let n = self.io.read_buf(&mut self.buf).await.unwrap();
            assert!(n > 0, "client hung up mid-frame");
        }
    }

    /// Next frame the tests care about: settings ACKs are skipped.
    pub async fn recv_app(&mut self) -> Frame {
        loop {
            match self.recv().await {
                Frame::Settings { flags, .. } if flags.contains(SettingsFlags::ACK) => {}
                frame => return frame,
            }
        }
    }

    /// Read one request header block (HEADERS plus CONTINUATIONs) and decode
    /// it.
    pub async fn expect_request(&mut self) -> ReceivedRequest {
        let (stream, end_stream, mut fragment, mut done) = match self.recv_app().await {
            Frame::Headers {
                stream,
                flags,
                fragment,
                ..
            } => {
                let mut assembled = BytesMut::new();
                assembled.extend_from_slice(&fragment);
                (
                    stream,
                    flags.contains(HeadersFlags::END_STREAM),
                    assembled,
                    flags.contains(HeadersFlags::END_HEADERS),
                )
            }
            other => panic!("expected HEADERS, got {other:?}"),
        };
        while !done {
            match self.recv().await {
                Frame::Continuation {
                    stream: cont_stream,
                    flags,
                    fragment: piece,
                } => {
                    assert_eq!(cont_stream, stream, "continuation must stay on stream");
                    fragment.extend_from_slice(&piece);
                    done = flags.contains(ContinuationFlags::END_HEADERS);
                }
                other => panic!("expected CONTINUATION, got {other:?}"),
            }
        }
        let fragment = fragment.freeze();
        let headers = self
            .decoder
            .decode(&fragment)
            .unwrap()
            .into_iter()
            .map(|(name, value)| {
                (
                    String::from_utf8(name.to_vec()).unwrap(),
                    String::from_utf8(value.to_vec()).unwrap(),
                )
            })
            .collect();
        ReceivedRequest {
            stream,
            headers,
            end_stream,
            fragment,
        }
    }

    /// Read DATA frames for `stream` until END_STREAM, returning the body.
    pub async fn expect_body(&mut self, stream: NonZeroStreamId) -> Vec<u8> {
        let mut body = Vec::new();
        loop {
            match self.recv_app().await {
                Frame::Data {
                    stream: data_stream,
                    flags,
                    data,
                    ..
                } => {
                    assert_eq!(data_stream, stream);
                    body.extend_from_slice(&data);
                    if flags.contains(DataFlags::END_STREAM) {
                        return body;
                    }
                }
                Frame::WindowUpdate { .. } => {}
                other => panic!("expected DATA, got {other:?}"),
            }
        }
    }

    /// Send a complete response: HEADERS (+ DATA when a body is given).
    pub async fn respond(
        &mut self,
        stream: NonZeroStreamId,
        status: u16,
        headers: &[(&str, &str)],
        body: Option<&[u8]>,
    ) {
        let status = status.to_string();
        let mut list: Vec<(&[u8], &[u8])> = vec![(b":status", status.as_bytes())];
        for (name, value) in headers {
            list.push((name.as_bytes(), value.as_bytes()));
        }
        let fragment = self.encoder.encode(list).unwrap();
        let mut flags = HeadersFlags::END_HEADERS;
        if body.is_none() {
            flags |= HeadersFlags::END_STREAM;
        }
        self.send(Frame::Headers {
            stream,
            flags,
            priority: None,
            fragment,
        })
        .await;
        if let Some(body) = body {
            self.send(Frame::Data {
                stream,
                flags: DataFlags::END_STREAM,
                pad: 0,
                data: Bytes::copy_from_slice(body),
            })
            .await;
        }
    }
}

/// Header value by name from a decoded request list.
pub fn header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.as_str())
}
