// DvrStream
// Copyright (c) 2025 The DvrStream Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `stream` module implements the stream controller, the public face of
//! the engine.

use std::cmp;
use std::io;
use std::time::{Duration, SystemTime};

use log::{debug, trace};

use crate::errors::{invalid_argument_error, protocol_error, transport_error, Error, Result};
use crate::mpegts::{PacketFilter, PACKET_LEN};
use crate::ring::RingBuffer;
use crate::transfer::{parse_content_range, ChunkAction, DriveOutcome};
use crate::transfer::{HttpConnection, RemoteConnection, TransferSink};

/// Sentinel length of a stream whose total size is unknown; such a stream is
/// considered real-time.
pub(crate) const MAX_STREAM_LENGTH: i64 = i64::MAX;

/// Default ring buffer capacity, in bytes.
const DEFAULT_BUFFER_LEN: usize = 1024 * 1024;

/// Default minimum amount of data to return from a read request.
const DEFAULT_READ_MIN_LEN: usize = 4 * 1024;

/// Ring buffer capacities are rounded up to a multiple of this.
const BUFFER_LEN_ALIGN: usize = 64 * 1024;

/// `DvrStreamOptions` specifies the buffering and transport behaviour of a
/// [`DvrStream`].
pub struct DvrStreamOptions {
    /// Ring buffer capacity in bytes. Rounded up to a 64 KiB multiple.
    pub buffer_len: usize,
    /// Minimum bytes a read attempts to accumulate before returning.
    /// Rounded down to a multiple of the 188-byte transport packet length,
    /// never below one packet. Must be smaller than the buffer capacity.
    pub read_min_len: usize,
    /// Optional `User-Agent` request header value.
    pub user_agent: Option<String>,
    /// Optional shared HTTP client, reusing the caller's connection pool,
    /// cookies, and DNS cache.
    pub client: Option<reqwest::blocking::Client>,
}

impl Default for DvrStreamOptions {
    fn default() -> Self {
        DvrStreamOptions {
            buffer_len: DEFAULT_BUFFER_LEN,
            read_min_len: DEFAULT_READ_MIN_LEN,
            user_agent: None,
            client: None,
        }
    }
}

/// Stream state shared between the consumer-facing operations and the
/// transfer callbacks.
struct StreamState {
    /// The backing ring buffer.
    ring: RingBuffer,
    /// Flag if the transfer was paused because the buffer is full.
    paused: bool,
    /// Flag if the response header block has been processed.
    headers_done: bool,
    /// Flag if the server advertised byte-range support.
    can_seek: bool,
    /// Total resource length, or [`MAX_STREAM_LENGTH`] for real-time.
    length: i64,
    /// The outbound packet filter.
    filter: PacketFilter,
}

impl TransferSink for StreamState {
    fn on_header(&mut self, name: &str, value: &str) {
        if name.eq_ignore_ascii_case("accept-ranges") {
            if value.trim() == "bytes" {
                self.can_seek = true;
            }
        }
        else if name.eq_ignore_ascii_case("content-range") {
            if let Some((start, length)) = parse_content_range(value) {
                // The reported start rebases every positional counter.
                self.ring.reset(start.max(0) as u64);
                self.length = length;
                debug!("content-range: start={} length={}", start, length);
            }
        }
    }

    fn on_headers_done(&mut self) {
        self.headers_done = true;
    }

    fn on_body_chunk(&mut self, chunk: &[u8]) -> ChunkAction {
        // The whole chunk must fit or none of it is taken; a partial write
        // would otherwise drop bytes when the transfer pauses.
        if chunk.len() > self.ring.writable_gap() {
            self.paused = true;
            return ChunkAction::Pause;
        }

        self.ring.write(chunk);
        ChunkAction::Written(chunk.len())
    }
}

/// A buffered, seekable HTTP MPEG-TS stream.
///
/// A `DvrStream` issues a single HTTP GET and buffers the response body in a
/// fixed-size ring. Reads drain the ring, pumping the transfer as needed and
/// filtering whole transport packets on the way out. Seeks are satisfied
/// from resident bytes when the target is still buffered, and by restarting
/// the transfer with a byte-range request when it is not; the transfer is
/// paused while the buffer is full so no byte is ever dropped.
///
/// All transfer work happens on the calling thread inside `read` and `seek`;
/// there is no background producer.
pub struct DvrStream {
    conn: Box<dyn RemoteConnection>,
    state: StreamState,
    /// Minimum read byte count.
    read_min_len: usize,
    /// Wall-clock time of the first successful read.
    start_time: Option<SystemTime>,
    closed: bool,
}

impl DvrStream {
    /// Opens a stream over `url` with default options.
    pub fn open(url: &str) -> Result<DvrStream> {
        Self::open_with_options(url, Default::default())
    }

    /// Opens a stream over `url`.
    pub fn open_with_options(url: &str, mut options: DvrStreamOptions) -> Result<DvrStream> {
        let conn = HttpConnection::new(url, options.user_agent.take(), options.client.take())?;
        Self::new(Box::new(conn), options)
    }

    /// Creates a stream over an already-constructed connection, issuing the
    /// initial transfer and processing its response header block before
    /// returning. Transport options carried by `options` are ignored; they
    /// apply when the connection is built by [`DvrStream::open_with_options`].
    pub fn new(mut conn: Box<dyn RemoteConnection>, options: DvrStreamOptions) -> Result<DvrStream> {
        let buffer_len = cmp::max(options.buffer_len, 1).next_multiple_of(BUFFER_LEN_ALIGN);

        let read_min_len = cmp::max((options.read_min_len / PACKET_LEN) * PACKET_LEN, PACKET_LEN);
        if read_min_len >= buffer_len {
            return invalid_argument_error("read_min_len");
        }

        let mut state = StreamState {
            ring: RingBuffer::new(buffer_len),
            paused: false,
            headers_done: false,
            can_seek: false,
            length: MAX_STREAM_LENGTH,
            filter: PacketFilter::new(),
        };

        conn.start(0, &mut state)?;

        let mut stream = DvrStream {
            conn,
            state,
            read_min_len,
            start_time: None,
            closed: false,
        };

        // Pump the transfer until the response header block is in; anything
        // less means the server never produced a usable response.
        if !stream.transfer_until(|state| state.headers_done)? {
            return protocol_error("no response headers received");
        }

        Ok(stream)
    }

    /// Flag indicating if the stream allows seek operations.
    #[inline]
    pub fn can_seek(&self) -> bool {
        self.state.can_seek
    }

    /// Flag indicating if the stream is real-time (its total length is
    /// unknown).
    #[inline]
    pub fn real_time(&self) -> bool {
        self.state.length == MAX_STREAM_LENGTH
    }

    /// Total length of the resource in bytes, or `None` for a real-time
    /// stream.
    #[inline]
    pub fn length(&self) -> Option<u64> {
        if self.state.length == MAX_STREAM_LENGTH {
            None
        }
        else {
            Some(self.state.length as u64)
        }
    }

    /// Absolute offset of the next byte a read will return.
    #[inline]
    pub fn position(&self) -> u64 {
        self.state.ring.read_pos()
    }

    /// The ring buffer capacity in bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.state.ring.capacity()
    }

    /// Minimum number of bytes a read attempts to accumulate.
    #[inline]
    pub fn read_min_len(&self) -> usize {
        self.read_min_len
    }

    /// Number of bytes currently buffered ahead of the read position.
    #[inline]
    pub fn buffered(&self) -> usize {
        self.state.ring.readable()
    }

    /// Wall-clock time of the first successful read, if one happened yet.
    #[inline]
    pub fn start_time(&self) -> Option<SystemTime> {
        self.start_time
    }

    /// The current playback time, derived from the clock references observed
    /// in the stream. `None` until references have been seen, or after clock
    /// tracking was disabled.
    pub fn current_time(&self) -> Option<SystemTime> {
        let start_pts = self.state.filter.start_pts();
        let current_pts = self.state.filter.current_pts();

        if start_pts == 0 || current_pts == 0 || current_pts < start_pts {
            return None;
        }

        // The delta between the reference values counts 90 kHz periods.
        let delta = (current_pts - start_pts) / 90_000;
        Some(self.start_time? + Duration::from_secs(delta))
    }

    /// Reads from the stream into `dst`, returning the number of bytes read.
    /// A return of 0 indicates the end of the stream.
    ///
    /// The read blocks until at least the configured minimum byte count is
    /// buffered or the transfer ends. When the read spans a whole transport
    /// packet, its trailing end is aligned to a packet boundary and the
    /// packet filter is applied to the returned packets.
    pub fn read(&mut self, dst: &mut [u8]) -> Result<usize> {
        let count = dst.len();
        self.read_impl(Some(dst), count)
    }

    /// Reads and discards up to `count` bytes, returning the number
    /// discarded. A return of 0 indicates the end of the stream.
    pub fn skip(&mut self, count: usize) -> Result<usize> {
        self.read_impl(None, count)
    }

    fn read_impl(&mut self, mut dst: Option<&mut [u8]>, count: usize) -> Result<usize> {
        if count >= self.state.ring.capacity() {
            return invalid_argument_error("count");
        }
        if count == 0 {
            return Ok(0);
        }

        // Transfer data into the ring buffer until the minimum amount of
        // data is available, the stream has completed, or an error occurs.
        let read_min_len = self.read_min_len;
        self.transfer_until(|state| state.ring.readable() >= read_min_len)?;

        let available = self.state.ring.readable();
        if available == 0 {
            return Ok(0);
        }

        // The start time for the stream is set at the first successful read.
        if self.start_time.is_none() {
            self.start_time = Some(SystemTime::now());
        }

        // Reads are not aligned to whole transport packets; determine the
        // distance from the read position to the next packet boundary.
        let read_pos = self.state.ring.read_pos();
        let packet_offset = (read_pos.next_multiple_of(PACKET_LEN as u64) - read_pos) as usize;

        // Starting from the lesser of the available and requested byte
        // counts, trim the end so everything past the boundary is a whole
        // number of packets.
        let mut take = cmp::min(available, count);
        if take >= packet_offset + PACKET_LEN {
            take = packet_offset + ((take - packet_offset) / PACKET_LEN) * PACKET_LEN;
        }

        self.state.ring.read_copy(take, dst.as_deref_mut());

        // Apply the packet filter to the complete packets that were read.
        if take >= packet_offset + PACKET_LEN {
            if let Some(dst) = dst {
                let filter_len = ((take - packet_offset) / PACKET_LEN) * PACKET_LEN;
                self.state.filter.filter(&mut dst[packet_offset..packet_offset + filter_len]);
            }
        }

        Ok(take)
    }

    /// Repositions the stream, returning the new absolute position.
    ///
    /// A target still resident in the buffer is reached by repositioning the
    /// ring tail; anything else restarts the transfer with a byte-range
    /// request. Fails with [`Error::Unseekable`] when the server did not
    /// advertise byte-range support.
    pub fn seek(&mut self, pos: io::SeekFrom) -> Result<u64> {
        if !self.state.can_seek {
            return Err(Error::Unseekable);
        }

        let (base, delta): (i64, i64) = match pos {
            io::SeekFrom::Start(offset) => (0, cmp::min(offset, i64::MAX as u64) as i64),
            io::SeekFrom::Current(delta) => (self.state.ring.read_pos() as i64, delta),
            io::SeekFrom::End(delta) => (self.state.length, delta),
        };

        // Underflow clamps to the stream start; forward overflow to the far
        // end.
        let mut target = base.wrapping_add(delta);
        if target < 0 {
            target = if delta >= 0 { i64::MAX } else { 0 };
        }
        let target = target as u64;

        if target == self.state.ring.read_pos() {
            return Ok(target);
        }

        // A target still represented in the ring buffer is reached by moving
        // the tail rather than restarting the transfer.
        if target >= self.state.ring.min_buffered() && target < self.state.ring.write_pos() {
            self.state.ring.seek_buffered(target);
            trace!("buffered seek to byte {}", target);
            return Ok(target);
        }

        self.restart(target)
    }

    /// Closes the stream, aborting the transfer. Further reads report the
    /// end of the stream once the buffer drains.
    pub fn close(&mut self) {
        if !self.closed {
            self.conn.abort();
            self.closed = true;
        }
    }

    /// Restarts the transfer at the given absolute position.
    fn restart(&mut self, pos: u64) -> Result<u64> {
        debug!("restarting transfer at byte {}", pos);

        self.conn.abort();

        // All positional state reverts to its defaults. The start time and
        // the starting clock reference keep their values so wall-clock
        // mapping survives the seek.
        self.state.paused = false;
        self.state.headers_done = false;
        self.state.can_seek = false;
        self.state.length = MAX_STREAM_LENGTH;
        self.state.ring.reset(0);
        self.state.filter.clear_current_pts();

        self.conn.start(pos, &mut self.state)?;

        if !self.transfer_until(|state| state.headers_done)? {
            return protocol_error("no response headers received");
        }

        Ok(self.state.ring.read_pos())
    }

    /// Executes the data transfer until the predicate has been satisfied,
    /// the transfer has ended, or the buffer pauses. Returns the final value
    /// of the predicate.
    fn transfer_until<P>(&mut self, pred: P) -> Result<bool>
    where
        P: Fn(&StreamState) -> bool,
    {
        // If the transfer was paused by a full buffer, attempt to resume it.
        // Resuming immediately replays the held chunk, so the paused flag
        // may be set right back if the buffer is still full.
        if self.state.paused {
            self.state.paused = false;
            self.conn.resume(&mut self.state)?;
        }

        // Still paused but the predicate can be satisfied: let the caller do
        // what it wants to do.
        if self.state.paused && pred(&self.state) {
            return Ok(true);
        }

        // One unconditional drive so a transfer that already ended is
        // noticed even when the predicate is immediately satisfied.
        let mut outcome = self.conn.drive(&mut self.state)?;

        while outcome == DriveOutcome::Active && !self.state.paused && !pred(&self.state) {
            outcome = self.conn.drive(&mut self.state)?;
        }

        // A completed transfer either ran out of resource or failed; the
        // response code tells which.
        if outcome == DriveOutcome::Complete {
            let code = self.conn.response_code();
            if code == 0 {
                return transport_error("no response from host");
            }
            if !(200..=299).contains(&code) {
                return Err(Error::HttpStatus(code));
            }
        }

        Ok(pred(&self.state))
    }
}

impl Drop for DvrStream {
    fn drop(&mut self) {
        self.close();
    }
}

impl io::Read for DvrStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        // io::Read permits short reads, so oversized requests are clamped
        // rather than refused.
        let count = cmp::min(buf.len(), self.state.ring.capacity() - 1);
        DvrStream::read(self, &mut buf[..count]).map_err(io::Error::from)
    }
}

impl io::Seek for DvrStream {
    fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
        DvrStream::seek(self, pos).map_err(io::Error::from)
    }
}
