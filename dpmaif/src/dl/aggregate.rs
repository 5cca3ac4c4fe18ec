//! Software receive aggregation.
//!
//! Folds consecutive in-order TCP segments of one flow into a single
//! larger IPv4 packet before handoff. Eligible segments:
//! - IPv4 without fragmentation, TCP, hardware-verified checksum
//! - only ACK (and PSH) flags set, non-empty payload
//! - same queue, channel, flow hash, addresses, ports, ack number and
//!   header lengths as the held packet
//! - sequence number continues the held packet exactly
//!
//! The merged packet gets a fresh IPv4 total length and header checksum.
//! The TCP checksum is not recomputed; the packet stays marked verified.

use smoltcp::wire::{IpProtocol, Ipv4Address, Ipv4Packet, TcpPacket};

use crate::types::RxPacket;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FlowKey {
    queue: u8,
    channel_id: u8,
    hash: u32,
    src: Ipv4Address,
    dst: Ipv4Address,
    src_port: u16,
    dst_port: u16,
}

#[derive(Debug, Clone, Copy)]
struct TcpSegment {
    key: FlowKey,
    ip_hlen: usize,
    tcp_hlen: usize,
    seq: u32,
    ack: u32,
    payload_len: usize,
    psh: bool,
}

impl TcpSegment {
    fn next_seq(&self) -> u32 {
        self.seq.wrapping_add(self.payload_len as u32)
    }

    fn header_len(&self) -> usize {
        self.ip_hlen + self.tcp_hlen
    }
}

/// Parse `pkt` as an aggregation candidate.
fn inspect(pkt: &RxPacket) -> Option<TcpSegment> {
    if !pkt.checksum_valid {
        return None;
    }
    let ip = Ipv4Packet::new_checked(&pkt.data[..]).ok()?;
    if ip.version() != 4
        || ip.more_frags()
        || ip.frag_offset() != 0
        || ip.next_header() != IpProtocol::Tcp
        || ip.total_len() as usize != pkt.data.len()
    {
        return None;
    }
    let ip_hlen = ip.header_len() as usize;
    let tcp = TcpPacket::new_checked(ip.payload()).ok()?;
    if tcp.syn() || tcp.fin() || tcp.rst() || tcp.urg() || tcp.ece() || tcp.cwr() || !tcp.ack() {
        return None;
    }
    let tcp_hlen = tcp.header_len() as usize;
    Some(TcpSegment {
        key: FlowKey {
            queue: pkt.queue,
            channel_id: pkt.channel_id,
            hash: pkt.hash,
            src: ip.src_addr(),
            dst: ip.dst_addr(),
            src_port: tcp.src_port(),
            dst_port: tcp.dst_port(),
        },
        ip_hlen,
        tcp_hlen,
        seq: tcp.seq_number().0 as u32,
        ack: tcp.ack_number().0 as u32,
        payload_len: pkt.data.len() - ip_hlen - tcp_hlen,
        psh: tcp.psh(),
    })
}

/// Aggregation state of one downlink queue.
#[derive(Debug)]
pub struct Aggregator {
    max_size: usize,
    held: Option<(RxPacket, TcpSegment)>,
}

impl Aggregator {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size: max_size.min(u16::MAX as usize),
            held: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_none()
    }

    /// Offer a completed packet.
    ///
    /// Packets ready for handoff are appended to `out` in arrival order.
    /// Returns whether `pkt` was merged into the held packet.
    pub fn push(&mut self, pkt: RxPacket, out: &mut Vec<RxPacket>) -> bool {
        let Some(seg) = inspect(&pkt) else {
            self.flush(out);
            out.push(pkt);
            return false;
        };

        if let Some((held, held_seg)) = self.held.as_mut() {
            if Self::can_merge(held, held_seg, &seg, self.max_size) {
                Self::merge(held, held_seg, &pkt, &seg);
                if seg.psh {
                    self.flush(out);
                }
                return true;
            }
        }

        self.flush(out);
        if seg.psh || seg.payload_len == 0 {
            out.push(pkt);
        } else {
            self.held = Some((pkt, seg));
        }
        false
    }

    /// Release the held packet, if any.
    pub fn flush(&mut self, out: &mut Vec<RxPacket>) {
        if let Some((pkt, _)) = self.held.take() {
            out.push(pkt);
        }
    }

    fn can_merge(held: &RxPacket, held_seg: &TcpSegment, seg: &TcpSegment, max: usize) -> bool {
        held_seg.key == seg.key
            && held_seg.ip_hlen == seg.ip_hlen
            && held_seg.tcp_hlen == seg.tcp_hlen
            && held_seg.ack == seg.ack
            && held_seg.next_seq() == seg.seq
            && seg.payload_len > 0
            && held.data.len() + seg.payload_len <= max
    }

    fn merge(held: &mut RxPacket, held_seg: &mut TcpSegment, pkt: &RxPacket, seg: &TcpSegment) {
        held.data.extend_from_slice(&pkt.data[seg.header_len()..]);
        let total = held.data.len() as u16;
        {
            let mut ip = Ipv4Packet::new_unchecked(&mut held.data[..]);
            ip.set_total_len(total);
            ip.fill_checksum();
        }
        if seg.psh {
            let mut tcp = TcpPacket::new_unchecked(&mut held.data[held_seg.ip_hlen..]);
            tcp.set_psh(true);
        }
        held.segments = held.segments.saturating_add(pkt.segments);
        held.coalesced = held.coalesced.saturating_add(1);
        held_seg.payload_len += seg.payload_len;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use smoltcp::wire::TcpSeqNumber;

    /// IPv4/TCP segment 10.0.0.1:5000 -> 10.0.0.2:80 with `payload`.
    pub(crate) fn tcp_segment(seq: u32, payload: &[u8], psh: bool) -> Vec<u8> {
        let total = 40 + payload.len();
        let mut buf = vec![0u8; total];
        {
            let mut ip = Ipv4Packet::new_unchecked(&mut buf[..]);
            ip.set_version(4);
            ip.set_header_len(20);
            ip.set_total_len(total as u16);
            ip.set_hop_limit(64);
            ip.set_next_header(IpProtocol::Tcp);
            ip.set_src_addr(Ipv4Address::new(10, 0, 0, 1));
            ip.set_dst_addr(Ipv4Address::new(10, 0, 0, 2));
            ip.fill_checksum();
        }
        {
            let mut tcp = TcpPacket::new_unchecked(&mut buf[20..]);
            tcp.set_src_port(5000);
            tcp.set_dst_port(80);
            tcp.set_seq_number(TcpSeqNumber(seq as i32));
            tcp.set_ack_number(TcpSeqNumber(7));
            tcp.set_header_len(20);
            tcp.clear_flags();
            tcp.set_ack(true);
            tcp.set_psh(psh);
            tcp.set_window_len(65535);
        }
        buf[40..].copy_from_slice(payload);
        buf
    }

    pub(crate) fn rx(data: Vec<u8>) -> RxPacket {
        RxPacket {
            queue: 0,
            channel_id: 1,
            data,
            segments: 1,
            checksum_valid: true,
            hash: 0x1234,
            coalesced: 0,
        }
    }

    #[test]
    fn test_in_order_segments_merge() {
        let mut agg = Aggregator::new(65535);
        let mut out = Vec::new();
        assert!(!agg.push(rx(tcp_segment(1000, &[1; 100], false)), &mut out));
        assert!(agg.push(rx(tcp_segment(1100, &[2; 100], false)), &mut out));
        assert!(agg.push(rx(tcp_segment(1200, &[3; 50], false)), &mut out));
        assert!(out.is_empty());
        agg.flush(&mut out);

        assert_eq!(out.len(), 1);
        let pkt = &out[0];
        assert_eq!(pkt.len(), 40 + 250);
        assert_eq!(pkt.coalesced, 2);
        assert_eq!(pkt.segments, 3);
        let ip = Ipv4Packet::new_checked(&pkt.data[..]).unwrap();
        assert_eq!(ip.total_len(), 290);
        assert!(ip.verify_checksum());
        assert_eq!(&pkt.data[40..140], &[1; 100][..]);
        assert_eq!(&pkt.data[240..], &[3; 50][..]);
    }

    #[test]
    fn test_gap_flushes_held_packet() {
        let mut agg = Aggregator::new(65535);
        let mut out = Vec::new();
        agg.push(rx(tcp_segment(1000, &[1; 100], false)), &mut out);
        assert!(!agg.push(rx(tcp_segment(5000, &[2; 100], false)), &mut out));
        assert_eq!(out.len(), 1);
        agg.flush(&mut out);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].coalesced, 0);
    }

    #[test]
    fn test_psh_ends_aggregate() {
        let mut agg = Aggregator::new(65535);
        let mut out = Vec::new();
        agg.push(rx(tcp_segment(0, &[1; 10], false)), &mut out);
        assert!(agg.push(rx(tcp_segment(10, &[2; 10], true)), &mut out));
        assert!(agg.is_empty());
        assert_eq!(out.len(), 1);
        let ip = Ipv4Packet::new_checked(&out[0].data[..]).unwrap();
        let tcp = TcpPacket::new_checked(ip.payload()).unwrap();
        assert!(tcp.psh());
    }

    #[test]
    fn test_size_limit() {
        let mut agg = Aggregator::new(40 + 150);
        let mut out = Vec::new();
        agg.push(rx(tcp_segment(0, &[1; 100], false)), &mut out);
        assert!(!agg.push(rx(tcp_segment(100, &[2; 100], false)), &mut out));
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_non_tcp_and_unverified_pass_through() {
        let mut agg = Aggregator::new(65535);
        let mut out = Vec::new();
        agg.push(rx(tcp_segment(0, &[1; 10], false)), &mut out);

        let mut unverified = rx(tcp_segment(10, &[2; 10], false));
        unverified.checksum_valid = false;
        assert!(!agg.push(unverified, &mut out));
        assert!(!agg.push(rx(vec![0x60; 48]), &mut out));
        // held packet flushed ahead of both, order kept
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].len(), 50);
        assert!(!out[1].checksum_valid);
    }

    #[test]
    fn test_different_flow_hash_not_merged() {
        let mut agg = Aggregator::new(65535);
        let mut out = Vec::new();
        agg.push(rx(tcp_segment(0, &[1; 10], false)), &mut out);
        let mut other = rx(tcp_segment(10, &[2; 10], false));
        other.hash = 0x9999;
        assert!(!agg.push(other, &mut out));
    }
}
