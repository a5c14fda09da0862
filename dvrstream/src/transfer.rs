// DvrStream
// Copyright (c) 2025 The DvrStream Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `transfer` module defines the seam between the stream and the HTTP
//! engine that produces its bytes, and the engine implementation itself.
//!
//! A [`RemoteConnection`] is one logical HTTP GET that can be re-issued at a
//! new byte offset. The stream drives it one batch at a time and receives
//! headers and body bytes through a [`TransferSink`]. When the sink cannot
//! accept a chunk it answers [`ChunkAction::Pause`]; the connection then
//! holds the chunk and replays it on a later drive, so backpressure never
//! drops a byte.

use std::io::Read;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use log::{debug, trace};

use reqwest::blocking::{Client, Response};
use reqwest::header;
use reqwest::redirect;
use reqwest::Url;

use crate::errors::{Error, Result};

/// Maximum number of body bytes moved per drive iteration.
const MAX_CHUNK_LEN: usize = 16 * 1024;

/// Connect timeout for the TCP/TLS handshake.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum number of redirects followed per request.
const MAX_REDIRECTS: usize = 5;

/// Result of offering a chunk of response body to the stream's sink.
pub enum ChunkAction {
    /// The sink consumed the leading `n` bytes of the chunk.
    Written(usize),
    /// The sink cannot accept the chunk without dropping data; the
    /// connection must hold it and pause the transfer.
    Pause,
}

/// Receives transfer events from a [`RemoteConnection`].
pub trait TransferSink {
    /// Called once per response header.
    fn on_header(&mut self, name: &str, value: &str);

    /// Called when the response header block is complete.
    fn on_headers_done(&mut self);

    /// Called with received body bytes.
    fn on_body_chunk(&mut self, chunk: &[u8]) -> ChunkAction;
}

/// Progress of a transfer after a drive iteration.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DriveOutcome {
    /// The transfer may still produce data.
    Active,
    /// The transfer has ended; the response code tells whether it succeeded.
    Complete,
}

/// One logical HTTP GET against the remote resource, restartable at an
/// arbitrary byte offset.
pub trait RemoteConnection {
    /// Issues (or re-issues) the request with `Range: bytes=<range_start>-`
    /// and delivers the response header block to the sink.
    fn start(&mut self, range_start: u64, sink: &mut dyn TransferSink) -> Result<()>;

    /// Performs one batch of I/O, delivering at most one body chunk to the
    /// sink. A chunk held back by an earlier pause is re-offered before any
    /// new data is read.
    fn drive(&mut self, sink: &mut dyn TransferSink) -> Result<DriveOutcome>;

    /// Clears a pause by re-offering the held chunk. The sink may pause
    /// again immediately if it is still full.
    fn resume(&mut self, sink: &mut dyn TransferSink) -> Result<()>;

    /// HTTP status code of the current response; 0 when no response was
    /// received.
    fn response_code(&self) -> u32;

    /// Abandons the in-flight response and any held chunk.
    fn abort(&mut self);
}

/// Parses a `Content-Range` header value of the form
/// `bytes <start>-[<end>]/<len>` or `bytes */<len>`.
///
/// Returns the starting offset and the total resource length, or `None` when
/// the value does not describe a byte range at all. Fields that fail to
/// parse fall back to a start of 0 and the real-time length sentinel. The
/// size-only form is produced by a seek beyond the end of a fixed-length
/// resource, so the start is positioned at the end.
pub(crate) fn parse_content_range(value: &str) -> Option<(i64, i64)> {
    let rest = value.strip_prefix("bytes")?.trim_start();

    if let Some(size) = rest.strip_prefix("*/") {
        return match parse_decimal(size) {
            Some(len) => Some((len, len)),
            None => Some((0, i64::MAX)),
        };
    }

    let mut start = 0;
    let mut length = i64::MAX;

    match rest.split_once('-') {
        Some((first, tail)) => {
            if let Some(value) = parse_decimal(first) {
                start = value;
                if let Some((_end, size)) = tail.split_once('/') {
                    if let Some(value) = parse_decimal(size) {
                        length = value;
                    }
                }
            }
        }
        None => {
            if let Some(value) = parse_decimal(rest) {
                start = value;
            }
        }
    }

    Some((start, length))
}

/// Parses the leading run of decimal digits of `s`, ignoring anything that
/// follows it.
fn parse_decimal(s: &str) -> Option<i64> {
    let s = s.trim_start();
    let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());

    if end == 0 {
        return None;
    }

    s[..end].parse().ok()
}

/// A [`RemoteConnection`] over a blocking HTTP client.
///
/// The client is a pull-based engine, so the pause protocol is implemented
/// by holding the chunk the sink rejected and replaying it before any
/// further socket reads. Waiting for data happens inside the socket read
/// itself; each drive moves at most [`MAX_CHUNK_LEN`] bytes so the stream
/// re-evaluates its predicate at a bounded interval.
pub struct HttpConnection {
    client: Client,
    url: Url,
    user_agent: Option<String>,
    /// The in-flight response body, if any.
    response: Option<Response>,
    /// Status code of the most recent response; 0 before any response.
    response_code: u32,
    /// A body chunk the sink paused on, replayed on the next drive.
    pending: Vec<u8>,
    pending_pos: usize,
    /// Scratch space for socket reads.
    scratch: Box<[u8]>,
}

impl HttpConnection {
    /// Creates a connection for `url`. A shared `client` reuses an existing
    /// connection pool and DNS cache; when `None`, a private client is built.
    pub fn new(url: &str, user_agent: Option<String>, client: Option<Client>) -> Result<HttpConnection> {
        if url.is_empty() {
            return Err(Error::InvalidArgument("url"));
        }

        let url = Url::parse(url).map_err(|_| Error::InvalidArgument("url"))?;

        let client = match client {
            Some(client) => client,
            None => Self::default_client()?,
        };

        Ok(HttpConnection {
            client,
            url,
            user_agent,
            response: None,
            response_code: 0,
            pending: Vec::new(),
            pending_pos: 0,
            scratch: vec![0; MAX_CHUNK_LEN].into_boxed_slice(),
        })
    }

    fn default_client() -> Result<Client> {
        Client::builder()
            .http1_only()
            .connect_timeout(CONNECT_TIMEOUT)
            .redirect(redirect::Policy::limited(MAX_REDIRECTS))
            // Binding to the IPv4 wildcard keeps name resolution from ever
            // selecting an IPv6 address.
            .local_address(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
            .build()
            .map_err(|_| Error::Allocation("http client"))
    }

    /// Re-offers a held chunk to the sink. Returns `true` when no bytes
    /// remain held.
    fn flush_pending(&mut self, sink: &mut dyn TransferSink) -> bool {
        if self.pending_pos >= self.pending.len() {
            return true;
        }

        match sink.on_body_chunk(&self.pending[self.pending_pos..]) {
            ChunkAction::Written(written) => self.pending_pos += written,
            ChunkAction::Pause => (),
        }

        if self.pending_pos >= self.pending.len() {
            self.pending.clear();
            self.pending_pos = 0;
            true
        }
        else {
            false
        }
    }

    /// Offers freshly read bytes to the sink, holding back whatever it does
    /// not accept.
    fn offer(&mut self, len: usize, sink: &mut dyn TransferSink) {
        let held = match sink.on_body_chunk(&self.scratch[..len]) {
            ChunkAction::Written(written) => written..len,
            ChunkAction::Pause => 0..len,
        };

        if !held.is_empty() {
            trace!("sink full; holding {} bytes", held.len());
            self.pending.clear();
            self.pending.extend_from_slice(&self.scratch[held]);
            self.pending_pos = 0;
        }
    }
}

impl RemoteConnection for HttpConnection {
    fn start(&mut self, range_start: u64, sink: &mut dyn TransferSink) -> Result<()> {
        self.abort();

        let mut request = self
            .client
            .get(self.url.clone())
            .header(header::RANGE, format!("bytes={}-", range_start))
            .header(header::ACCEPT_ENCODING, "identity, gzip, deflate");

        if let Some(agent) = &self.user_agent {
            request = request.header(header::USER_AGENT, agent.as_str());
        }

        let response = request.send()?;

        self.response_code = u32::from(response.status().as_u16());
        debug!("transfer started at byte {} (status {})", range_start, self.response_code);

        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                sink.on_header(name.as_str(), value);
            }
        }
        sink.on_headers_done();

        // The body of an error response never reaches the buffer; the status
        // code surfaces when the transfer is seen to complete.
        if response.status().is_success() {
            self.response = Some(response);
        }

        Ok(())
    }

    fn drive(&mut self, sink: &mut dyn TransferSink) -> Result<DriveOutcome> {
        // A held chunk must drain before any more of the body is read.
        if !self.flush_pending(sink) {
            return Ok(DriveOutcome::Active);
        }

        let response = match self.response.as_mut() {
            Some(response) => response,
            None => return Ok(DriveOutcome::Complete),
        };

        let len = response.read(&mut self.scratch)?;

        if len == 0 {
            self.response = None;
            return Ok(DriveOutcome::Complete);
        }

        trace!("received {} bytes", len);
        self.offer(len, sink);

        Ok(DriveOutcome::Active)
    }

    fn resume(&mut self, sink: &mut dyn TransferSink) -> Result<()> {
        self.flush_pending(sink);
        Ok(())
    }

    fn response_code(&self) -> u32 {
        self.response_code
    }

    fn abort(&mut self) {
        self.response = None;
        self.response_code = 0;
        self.pending.clear();
        self.pending_pos = 0;
    }
}
