// DvrStream
// Copyright (c) 2025 The DvrStream Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! DvrStream is a buffered HTTP-to-MPEG-TS streaming engine for DVR clients.
//!
//! A [`stream::DvrStream`] pulls a linear byte stream over HTTP(S) into a
//! fixed-size ring buffer and exposes a seekable read interface over it.
//! Seeks are satisfied from buffered bytes when the target is still
//! resident, and by restarting the transfer with a byte-range request when
//! it is not. On the way out, MPEG-TS packets are inspected to track program
//! clock references for wall-clock mapping and to re-aim program map tables
//! that trail SCTE information messages.

pub mod errors;
pub mod mpegts;
pub mod ring;
pub mod stream;
pub mod transfer;
