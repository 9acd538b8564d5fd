//! IPv4 routing: unicast lookup, ICMP unreachable synthesis and
//! fragmentation (RFC 791 / RFC 792).

use std::net::Ipv4Addr;
use std::time::Instant;

use tinc_routing::{Graph, NodeId};
use tracing::{info, warn};

use crate::packet::*;

use super::{Forwarder, PacketIo};

impl Forwarder {
    pub(super) fn route_ipv4(
        &mut self,
        graph: &mut Graph,
        io: &mut dyn PacketIo,
        source: NodeId,
        frame: &[u8],
        now: Instant,
    ) {
        if !self.check_length(graph, source, frame.len(), ETHER_LEN + IP4_LEN) {
            return;
        }
        self.route_ipv4_unicast(graph, io, source, frame, now);
    }

    fn route_ipv4_unicast(
        &mut self,
        graph: &mut Graph,
        io: &mut dyn PacketIo,
        source: NodeId,
        frame: &[u8],
        now: Instant,
    ) {
        let dst = Ipv4Addr::new(frame[30], frame[31], frame[32], frame[33]);

        let Some(subnet) = graph.lookup_ipv4(&dst) else {
            self.stats.unroutable += 1;
            warn!(
                source = %graph.node(source).name,
                "cannot route packet: unknown IPv4 destination address {dst}"
            );
            self.route_ipv4_unreachable(
                graph,
                io,
                source,
                frame,
                ICMP_DEST_UNREACH,
                ICMP_NET_UNKNOWN,
                0,
                now,
            );
            return;
        };
        let owner = graph.subnet(subnet).owner;

        if owner == source {
            self.stats.loops += 1;
            warn!(source = %graph.node(source).name, "packet looping back");
            return;
        }

        if !graph.node(owner).status.reachable {
            self.route_ipv4_unreachable(
                graph,
                io,
                source,
                frame,
                ICMP_DEST_UNREACH,
                ICMP_NET_UNREACH,
                0,
                now,
            );
            return;
        }

        let myself = graph.self_id();
        let via = if graph.node(owner).via == Some(myself) {
            graph.node(owner).nexthop.unwrap_or(owner)
        } else {
            graph.node(owner).via.unwrap_or(owner)
        };

        let mtu = io.node_mtu(via) as usize;
        if frame.len() > mtu && via != myself {
            info!(
                dest = %graph.node(owner).name,
                len = frame.len(),
                mtu,
                "packet larger than path MTU"
            );
            if frame[ETHER_LEN + 6] & 0x40 != 0 {
                // Don't-Fragment set.
                self.route_ipv4_unreachable(
                    graph,
                    io,
                    source,
                    frame,
                    ICMP_DEST_UNREACH,
                    ICMP_FRAG_NEEDED,
                    mtu as u16,
                    now,
                );
            } else {
                self.fragment_ipv4(graph, io, via, frame, mtu);
            }
            return;
        }

        let priority = self.priority(frame);
        self.send(graph, io, owner, frame, priority);
    }

    fn priority(&self, frame: &[u8]) -> Option<u8> {
        if self.priority_inheritance {
            Some(frame[ETHER_LEN + 1])
        } else {
            None
        }
    }

    /// Synthesise an ICMP error back to the source of `frame`. For
    /// Fragmentation-Needed, `next_mtu` carries the path MTU.
    #[allow(clippy::too_many_arguments)]
    pub(super) fn route_ipv4_unreachable(
        &mut self,
        graph: &mut Graph,
        io: &mut dyn PacketIo,
        source: NodeId,
        frame: &[u8],
        icmp_type: u8,
        code: u8,
        next_mtu: u16,
        now: Instant,
    ) {
        if !self.icmp_allowed(now) {
            return;
        }

        let quote = (frame.len() - ETHER_LEN).min(IP_MSS - IP4_LEN - ICMP4_LEN);
        let mut reply = vec![0u8; ETHER_LEN + IP4_LEN + ICMP4_LEN + quote];

        // Ethernet: back to where the frame came from.
        reply[..ETH_ALEN].copy_from_slice(&frame[ETH_ALEN..2 * ETH_ALEN]);
        reply[ETH_ALEN..2 * ETH_ALEN].copy_from_slice(&frame[..ETH_ALEN]);
        write_u16(&mut reply, 12, ETHERTYPE_IPV4);

        // IPv4 header: swapped addresses, fresh everything else.
        reply[14] = 0x45;
        write_u16(&mut reply, 16, (IP4_LEN + ICMP4_LEN + quote) as u16);
        reply[22] = 255;
        reply[23] = IPPROTO_ICMP;
        reply[26..30].copy_from_slice(&frame[30..34]);
        reply[30..34].copy_from_slice(&frame[26..30]);
        set_ipv4_checksum(&mut reply, ETHER_LEN);

        // ICMP header plus the quoted original.
        let icmp = ETHER_LEN + IP4_LEN;
        reply[icmp] = icmp_type;
        reply[icmp + 1] = code;
        if icmp_type == ICMP_DEST_UNREACH && code == ICMP_FRAG_NEEDED {
            write_u16(&mut reply, icmp + 6, next_mtu);
        }
        let quote_at = icmp + ICMP4_LEN;
        reply[quote_at..].copy_from_slice(&frame[ETHER_LEN..ETHER_LEN + quote]);

        let sum = inet_checksum(&[&reply[icmp..]]);
        write_u16(&mut reply, icmp + 2, sum);

        self.stats.icmp_sent += 1;
        self.send(graph, io, source, &reply, None);
    }

    /// Split an IPv4 frame into fragments that fit `mtu`, 8-byte aligned,
    /// and send them towards `dest`.
    pub(super) fn fragment_ipv4(
        &mut self,
        graph: &mut Graph,
        io: &mut dyn PacketIo,
        dest: NodeId,
        frame: &[u8],
        mtu: usize,
    ) {
        let ihl = (frame[ETHER_LEN] & 0x0f) as usize * 4;
        if ihl != IP4_LEN {
            return;
        }

        let total_len = read_u16(frame, 16) as usize;
        let Some(mut todo) = total_len.checked_sub(IP4_LEN) else {
            return;
        };
        if ETHER_LEN + IP4_LEN + todo != frame.len() {
            warn!(
                len = frame.len(),
                header_len = ETHER_LEN + IP4_LEN + todo,
                "frame length does not match length in IPv4 header"
            );
            return;
        }

        let Some(max_payload) = mtu.checked_sub(ETHER_LEN + IP4_LEN).map(|m| m & !0x7) else {
            return;
        };
        if max_payload == 0 {
            return;
        }

        info!(
            len = frame.len(),
            dest = %graph.node(dest).name,
            "fragmenting packet"
        );

        let raw_off = read_u16(frame, 20);
        let flags = raw_off & !IP_OFFMASK;
        let mut frag_off = raw_off & IP_OFFMASK;
        let mut offset = ETHER_LEN + IP4_LEN;

        while todo > 0 {
            let fraglen = todo.min(max_payload);
            todo -= fraglen;

            let mut fragment = Vec::with_capacity(ETHER_LEN + IP4_LEN + fraglen);
            fragment.extend_from_slice(&frame[..ETHER_LEN + IP4_LEN]);
            fragment.extend_from_slice(&frame[offset..offset + fraglen]);
            offset += fraglen;

            write_u16(&mut fragment, 16, (IP4_LEN + fraglen) as u16);
            let more = if todo > 0 { IP_MF } else { 0 };
            write_u16(&mut fragment, 20, frag_off | flags | more);
            set_ipv4_checksum(&mut fragment, ETHER_LEN);

            self.send(graph, io, dest, &fragment, None);
            frag_off += (fraglen / 8) as u16;
        }

        self.stats.fragmented += 1;
    }
}
