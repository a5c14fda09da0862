// DvrStream
// Copyright (c) 2025 The DvrStream Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `mpegts` module implements the transport stream packet filter applied
//! to data leaving the stream.
//!
//! The filter has three duties. It tracks Program Clock References so the
//! stream can map its position onto wall-clock time, it walks Program
//! Association Tables to learn which PIDs carry Program Map Tables, and it
//! splices out SCTE Program Information Message tables that some broadcast
//! feeds place ahead of the PMT inside the same payload unit, re-aiming the
//! payload pointer so decoders find the PMT directly.
//!
//! Transport stream anomalies are never surfaced as errors. Losing packet
//! sync or observing a clock that runs backwards permanently disables the
//! affected duty for the remainder of the stream while bytes continue to
//! flow untouched.

use std::collections::BTreeSet;

use log::{debug, warn};

/// Length of a single MPEG-TS transport packet.
pub const PACKET_LEN: usize = 188;

/// The sync byte that leads every transport packet.
const SYNC_BYTE: u8 = 0x47;

/// PID carrying the Program Association Table.
const PAT_PID: u16 = 0x0000;

/// Table id of a Program Map Table.
const TABLE_ID_PMT: u8 = 0x02;

/// Table id of an SCTE Program Information Message.
const TABLE_ID_PROGRAM_INFO: u8 = 0xC0;

/// Table id indicating the remainder of the section space is stuffing.
const TABLE_ID_STUFFING: u8 = 0xFF;

#[inline]
fn read_be16(buf: &[u8]) -> u16 {
    u16::from_be_bytes([buf[0], buf[1]])
}

/// Decodes a Program Clock Reference at the 90 kHz clock. The value is a
/// single 33-bit field at the start of the data; the 27 MHz extension that
/// follows it is not needed for wall-clock mapping.
#[inline]
fn decode_pcr_90khz(buf: &[u8]) -> u64 {
    (u64::from(buf[0]) << 25)
        | (u64::from(buf[1]) << 17)
        | (u64::from(buf[2]) << 9)
        | (u64::from(buf[3]) << 1)
        | u64::from(buf[4] >> 7)
}

/// The transport stream packet filter.
pub struct PacketFilter {
    /// Flag if packet filtering is enabled.
    filter_enabled: bool,
    /// Flag if clock reference tracking is enabled.
    pcrs_enabled: bool,
    /// PIDs discovered to carry Program Map Tables.
    pmt_pids: BTreeSet<u16>,
    /// The first PID observed to carry a clock reference; 0 until seen.
    pcr_pid: u16,
    /// The first accepted clock reference; 0 until seen.
    start_pts: u64,
    /// The most recently accepted clock reference; 0 until seen.
    current_pts: u64,
}

impl Default for PacketFilter {
    fn default() -> Self {
        PacketFilter::new()
    }
}

impl PacketFilter {
    pub fn new() -> PacketFilter {
        PacketFilter {
            filter_enabled: true,
            pcrs_enabled: true,
            pmt_pids: BTreeSet::new(),
            pcr_pid: 0,
            start_pts: 0,
            current_pts: 0,
        }
    }

    /// The first accepted 90 kHz clock reference, or 0 if none was seen.
    #[inline]
    pub fn start_pts(&self) -> u64 {
        self.start_pts
    }

    /// The most recent 90 kHz clock reference, or 0 if none was seen.
    #[inline]
    pub fn current_pts(&self) -> u64 {
        self.current_pts
    }

    /// Clears the current clock reference while preserving the starting one,
    /// so wall-clock mapping survives a transfer restart.
    pub fn clear_current_pts(&mut self) {
        self.current_pts = 0;
    }

    /// Runs the filter over a run of whole transport packets, rewriting them
    /// in place. `packets` must be a multiple of [`PACKET_LEN`] long.
    pub fn filter(&mut self, packets: &mut [u8]) {
        // Once the packets are known to be misaligned, leaving the filter
        // enabled might trash things.
        if !self.filter_enabled {
            return;
        }

        debug_assert!(packets.len() % PACKET_LEN == 0);

        for packet in packets.chunks_exact_mut(PACKET_LEN) {
            if !self.filter_packet(packet) {
                warn!("transport packet sync lost; packet filter disabled");

                self.filter_enabled = false;
                self.pcrs_enabled = false;
                self.start_pts = 0;
                self.current_pts = 0;

                return;
            }
        }
    }

    /// Processes a single packet. Returns `false` on loss of packet sync.
    fn filter_packet(&mut self, packet: &mut [u8]) -> bool {
        let header = u32::from_be_bytes([packet[0], packet[1], packet[2], packet[3]]);

        let sync = ((header & 0xFF00_0000) >> 24) as u8;
        let pusi = (header & 0x0040_0000) != 0;
        let pid = ((header & 0x001F_FF00) >> 8) as u16;
        let adaptation = (header & 0x0000_0020) != 0;
        let payload = (header & 0x0000_0010) != 0;

        if sync != SYNC_BYTE {
            return false;
        }

        let mut current = 4;

        if adaptation {
            // The adaptation field must be at least 7 bytes long to possibly
            // carry a clock reference.
            let adaptation_len = usize::from(packet[current]);

            if adaptation_len >= 7 && self.pcrs_enabled {
                // Multiple elementary streams may carry clock references;
                // only the first PID one was detected on is used.
                if self.pcr_pid == 0 || pid == self.pcr_pid {
                    let flags = packet[current + 1];
                    if (flags & 0x10) != 0 {
                        if self.pcr_pid == 0 {
                            self.pcr_pid = pid;
                        }

                        self.current_pts = decode_pcr_90khz(&packet[current + 2..current + 7]);
                        if self.start_pts == 0 {
                            self.start_pts = self.current_pts;
                        }

                        // A clock running backwards means the reference
                        // values can no longer be trusted at all.
                        if self.current_pts < self.start_pts {
                            warn!(
                                "clock reference on pid {:#06x} ran backwards; tracking disabled",
                                pid
                            );
                            self.pcrs_enabled = false;
                            self.start_pts = 0;
                            self.current_pts = 0;
                        }
                    }
                }
            }

            current += adaptation_len;
        }

        if pid == PAT_PID && payload {
            self.scan_pat(packet, current, pusi);
        }
        else if pusi && payload && self.pmt_pids.contains(&pid) {
            self.rewrite_pmt(packet, current, pid);
        }

        true
    }

    /// Walks the Program Association Table carried by `packet`, inserting
    /// every referenced Program Map Table PID into the PID set.
    fn scan_pat(&mut self, packet: &[u8], mut current: usize, pusi: bool) {
        // The pointer field aligns the table start when this packet begins a
        // new payload unit.
        if pusi {
            if current >= PACKET_LEN {
                return;
            }
            current += usize::from(packet[current]) + 1;
        }

        if current >= PACKET_LEN {
            return;
        }

        // A stuffed table id means the remainder of the packet is filler.
        if packet[current] == TABLE_ID_STUFFING {
            return;
        }

        if current + 8 > PACKET_LEN {
            return;
        }

        let first_section = packet[current + 6];
        let last_section = packet[current + 7];
        current += 8;

        for _ in first_section..=last_section {
            if current + 4 > PACKET_LEN {
                return;
            }

            let program = read_be16(&packet[current..]);
            if program != 0 {
                let pmt_pid = read_be16(&packet[current + 2..]) & 0x1FFF;
                if self.pmt_pids.insert(pmt_pid) {
                    debug!("discovered program map table on pid {:#06x}", pmt_pid);
                }
            }

            current += 4;
        }
    }

    /// Splices out an SCTE Program Information Message table immediately
    /// preceding a Program Map Table in the same payload unit, adjusting the
    /// payload pointer so the decoder sees the PMT directly and overwriting
    /// the message with stuffing.
    fn rewrite_pmt(&self, packet: &mut [u8], current: usize, pid: u16) {
        if current >= PACKET_LEN {
            return;
        }

        let payload_len = PACKET_LEN - current;

        let pointer_index = current;
        let current = current + usize::from(packet[pointer_index]) + 1;

        if current + 3 > PACKET_LEN {
            return;
        }

        if packet[current] != TABLE_ID_PROGRAM_INFO {
            return;
        }

        // The entry occupies the pointer (1), the table id (1), the length
        // field (2), and `length` bytes of body; give up rather than chase a
        // table that exceeds the payload.
        let length = usize::from(read_be16(&packet[current + 1..]) & 0x03FF);
        if length + 4 > payload_len || current + 3 + length >= PACKET_LEN {
            return;
        }

        if packet[current + 3 + length] == TABLE_ID_PMT {
            // Only the low byte of the length participates in the pointer
            // adjustment.
            packet[pointer_index] =
                packet[pointer_index].wrapping_add((3 + (length & 0xFF)) as u8);

            for byte in &mut packet[current..current + 3 + length] {
                *byte = TABLE_ID_STUFFING;
            }

            debug!("spliced program information message ahead of pmt on pid {:#06x}", pid);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::PacketFilter;

    #[test]
    fn verify_pcr_tracking() {
        let mut filter = PacketFilter::new();

        let adaptation = build_pcr_adaptation(1_000_000);
        let mut packet = build_packet(0x0100, false, Some(&adaptation), None);
        filter.filter(&mut packet);

        assert_eq!(filter.start_pts(), 1_000_000);
        assert_eq!(filter.current_pts(), 1_000_000);

        let adaptation = build_pcr_adaptation(1_000_000 + 90_000 * 5);
        let mut packet = build_packet(0x0100, false, Some(&adaptation), None);
        filter.filter(&mut packet);

        assert_eq!(filter.start_pts(), 1_000_000);
        assert_eq!(filter.current_pts(), 1_000_000 + 90_000 * 5);
    }

    #[test]
    fn verify_pcr_locks_to_first_pid() {
        let mut filter = PacketFilter::new();

        let adaptation = build_pcr_adaptation(500_000);
        let mut packet = build_packet(0x0100, false, Some(&adaptation), None);
        filter.filter(&mut packet);

        // A clock reference on a different PID must be ignored.
        let adaptation = build_pcr_adaptation(9_000_000);
        let mut packet = build_packet(0x0200, false, Some(&adaptation), None);
        filter.filter(&mut packet);

        assert_eq!(filter.current_pts(), 500_000);
    }

    #[test]
    fn verify_pcr_regression_disables_tracking() {
        let mut filter = PacketFilter::new();

        let adaptation = build_pcr_adaptation(1_000_000);
        let mut packet = build_packet(0x0100, false, Some(&adaptation), None);
        filter.filter(&mut packet);

        let adaptation = build_pcr_adaptation(999_999);
        let mut packet = build_packet(0x0100, false, Some(&adaptation), None);
        filter.filter(&mut packet);

        assert_eq!(filter.start_pts(), 0);
        assert_eq!(filter.current_pts(), 0);

        // Tracking stays off for the remainder of the stream.
        let adaptation = build_pcr_adaptation(2_000_000);
        let mut packet = build_packet(0x0100, false, Some(&adaptation), None);
        filter.filter(&mut packet);

        assert_eq!(filter.current_pts(), 0);
    }

    #[test]
    fn verify_sync_loss_disables_filter() {
        let mut filter = PacketFilter::new();

        let adaptation = build_pcr_adaptation(1_000_000);
        let mut packet = build_packet(0x0100, false, Some(&adaptation), None);
        filter.filter(&mut packet);

        let mut corrupt = build_packet(0x0100, false, None, None);
        corrupt[0] = 0x00;
        filter.filter(&mut corrupt);

        assert_eq!(filter.start_pts(), 0);
        assert_eq!(filter.current_pts(), 0);

        // Later well-formed packets must be left unprocessed.
        let adaptation = build_pcr_adaptation(2_000_000);
        let mut packet = build_packet(0x0100, false, Some(&adaptation), None);
        filter.filter(&mut packet);

        assert_eq!(filter.current_pts(), 0);
    }

    #[test]
    fn verify_pat_discovery() {
        let mut filter = PacketFilter::new();

        let payload = build_pat_payload(&[(0x0001, 0x0042), (0x0000, 0x0099)]);
        let mut packet = build_packet(0x0000, true, None, Some(&payload));

        // Widen the section range to cover both entries.
        // build_pat_payload emits section numbers 0..=0; patch last_section.
        packet[4 + 1 + 7] = 0x01;

        filter.filter(&mut packet);

        // Program number zero is the network PID and must not be collected.
        assert!(filter.pmt_pids.contains(&0x0042));
        assert!(!filter.pmt_pids.contains(&0x0099));
    }

    #[test]
    fn verify_pat_stuffing_skipped() {
        let mut filter = PacketFilter::new();

        let payload = vec![0x00, 0xFF, 0xFF, 0xFF];
        let mut packet = build_packet(0x0000, true, None, Some(&payload));
        filter.filter(&mut packet);

        assert!(filter.pmt_pids.is_empty());
    }

    #[test]
    fn verify_pmt_rewrite() {
        let mut filter = PacketFilter::new();

        let pat = build_pat_payload(&[(0x0001, 0x0042)]);
        let mut packet = build_packet(0x0000, true, None, Some(&pat));
        filter.filter(&mut packet);

        let body_len = 20;
        let payload = build_program_info_payload(body_len);
        let mut packet = build_packet(0x0042, true, None, Some(&payload));
        let pointer_before = packet[4];

        filter.filter(&mut packet);

        // The pointer field advances over the spliced-out entry and the
        // entry itself is overwritten with stuffing.
        assert_eq!(packet[4], pointer_before + 3 + body_len as u8);
        assert!(packet[5..5 + 3 + body_len].iter().all(|&b| b == 0xFF));

        // The adjusted pointer lands on the program map table id.
        let table = 4 + 1 + usize::from(packet[4]);
        assert_eq!(packet[table], 0x02);
    }

    #[test]
    fn verify_pmt_rewrite_skips_oversized_entry() {
        let mut filter = PacketFilter::new();

        let pat = build_pat_payload(&[(0x0001, 0x0042)]);
        let mut packet = build_packet(0x0000, true, None, Some(&pat));
        filter.filter(&mut packet);

        // A declared length larger than the payload must leave the packet
        // untouched.
        let mut payload = vec![0u8; 4];
        payload[0] = 0x00;
        payload[1] = 0xC0;
        payload[2] = 0x03;
        payload[3] = 0xFF;

        let mut packet = build_packet(0x0042, true, None, Some(&payload));
        let before = packet;

        filter.filter(&mut packet);

        assert_eq!(packet, before);
    }

    #[test]
    fn verify_foreign_table_untouched() {
        let mut filter = PacketFilter::new();

        let pat = build_pat_payload(&[(0x0001, 0x0042)]);
        let mut packet = build_packet(0x0000, true, None, Some(&pat));
        filter.filter(&mut packet);

        // A program information message not followed by a PMT stays put.
        let mut payload = build_program_info_payload(8);
        let last = payload.len() - 1;
        payload[last] = 0x40;

        let mut packet = build_packet(0x0042, true, None, Some(&payload));
        let before = packet;

        filter.filter(&mut packet);

        assert_eq!(packet, before);
    }
}
