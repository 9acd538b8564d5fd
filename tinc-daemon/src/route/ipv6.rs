//! IPv6 routing: unicast lookup, ICMPv6 error synthesis (RFC 2463) and
//! neighbor-solicitation impersonation (RFC 2461).

use std::net::Ipv6Addr;
use std::time::Instant;

use tinc_routing::{Graph, NodeId};
use tracing::{info, warn};

use crate::packet::*;

use super::{Forwarder, PacketIo};

const IP6_SRC: usize = ETHER_LEN + 8;
const IP6_DST: usize = ETHER_LEN + 24;
const ICMP6: usize = ETHER_LEN + IP6_LEN;

impl Forwarder {
    pub(super) fn route_ipv6(
        &mut self,
        graph: &mut Graph,
        io: &mut dyn PacketIo,
        source: NodeId,
        frame: &[u8],
        now: Instant,
    ) {
        if !self.check_length(graph, source, frame.len(), ETHER_LEN + IP6_LEN) {
            return;
        }

        if frame[ETHER_LEN + 6] == IPPROTO_ICMPV6
            && self.check_length(graph, source, frame.len(), ICMP6 + ICMP6_LEN)
            && frame[ICMP6] == ND_NEIGHBOR_SOLICIT
        {
            self.route_neighborsol(graph, io, source, frame);
            return;
        }

        self.route_ipv6_unicast(graph, io, source, frame, now);
    }

    fn route_ipv6_unicast(
        &mut self,
        graph: &mut Graph,
        io: &mut dyn PacketIo,
        source: NodeId,
        frame: &[u8],
        now: Instant,
    ) {
        let mut dst_bytes = [0u8; 16];
        dst_bytes.copy_from_slice(&frame[IP6_DST..IP6_DST + 16]);
        let dst = Ipv6Addr::from(dst_bytes);

        let Some(subnet) = graph.lookup_ipv6(&dst) else {
            self.stats.unroutable += 1;
            warn!(
                source = %graph.node(source).name,
                "cannot route packet: unknown IPv6 destination address {dst}"
            );
            self.route_ipv6_unreachable(
                graph,
                io,
                source,
                frame,
                ICMP6_DST_UNREACH,
                ICMP6_DST_UNREACH_ADDR,
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
            self.route_ipv6_unreachable(
                graph,
                io,
                source,
                frame,
                ICMP6_DST_UNREACH,
                ICMP6_DST_UNREACH_NOROUTE,
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
            // No intermediary fragmentation in IPv6.
            info!(
                dest = %graph.node(owner).name,
                len = frame.len(),
                mtu,
                "packet larger than path MTU"
            );
            self.route_ipv6_unreachable(
                graph,
                io,
                source,
                frame,
                ICMP6_PACKET_TOO_BIG,
                0,
                mtu as u32,
                now,
            );
            return;
        }

        let priority = if self.priority_inheritance {
            // Traffic class: low 4 bits of byte 0, high 4 bits of byte 1.
            Some((frame[ETHER_LEN] << 4) | (frame[ETHER_LEN + 1] >> 4))
        } else {
            None
        };
        self.send(graph, io, owner, frame, priority);
    }

    /// Synthesise an ICMPv6 error back to the source. For Packet Too Big,
    /// `mtu` carries the path MTU.
    #[allow(clippy::too_many_arguments)]
    pub(super) fn route_ipv6_unreachable(
        &mut self,
        graph: &mut Graph,
        io: &mut dyn PacketIo,
        source: NodeId,
        frame: &[u8],
        icmp_type: u8,
        code: u8,
        mtu: u32,
        now: Instant,
    ) {
        if !self.icmp_allowed(now) {
            return;
        }

        let quote = (frame.len() - ETHER_LEN).min(IP_MSS - IP6_LEN - ICMP6_LEN);
        let mut reply = vec![0u8; ETHER_LEN + IP6_LEN + ICMP6_LEN + quote];

        reply[..ETH_ALEN].copy_from_slice(&frame[ETH_ALEN..2 * ETH_ALEN]);
        reply[ETH_ALEN..2 * ETH_ALEN].copy_from_slice(&frame[..ETH_ALEN]);
        write_u16(&mut reply, 12, ETHERTYPE_IPV6);

        // IPv6 header: version 6, everything else fresh, addresses swapped.
        write_u32(&mut reply, ETHER_LEN, 0x6000_0000);
        write_u16(&mut reply, ETHER_LEN + 4, (ICMP6_LEN + quote) as u16);
        reply[ETHER_LEN + 6] = IPPROTO_ICMPV6;
        reply[ETHER_LEN + 7] = 255;
        reply[IP6_SRC..IP6_SRC + 16].copy_from_slice(&frame[IP6_DST..IP6_DST + 16]);
        reply[IP6_DST..IP6_DST + 16].copy_from_slice(&frame[IP6_SRC..IP6_SRC + 16]);

        reply[ICMP6] = icmp_type;
        reply[ICMP6 + 1] = code;
        if icmp_type == ICMP6_PACKET_TOO_BIG {
            write_u32(&mut reply, ICMP6 + 4, mtu);
        }
        reply[ICMP6 + ICMP6_LEN..].copy_from_slice(&frame[ETHER_LEN..ETHER_LEN + quote]);

        let pseudo = icmp6_pseudo_header(
            &reply[IP6_SRC..IP6_SRC + 16],
            &reply[IP6_DST..IP6_DST + 16],
            (ICMP6_LEN + quote) as u32,
        );
        let sum = inet_checksum(&[&pseudo, &reply[ICMP6..]]);
        write_u16(&mut reply, ICMP6 + 2, sum);

        self.stats.icmp_sent += 1;
        self.send(graph, io, source, &reply, None);
    }

    /// Answer a neighbor solicitation for an address owned by a remote
    /// node with a locally fabricated neighbor advertisement.
    fn route_neighborsol(
        &mut self,
        graph: &mut Graph,
        io: &mut dyn PacketIo,
        source: NodeId,
        frame: &[u8],
    ) {
        let min_len = ICMP6 + NS_LEN + ND_OPT_LEN + ETH_ALEN;
        if !self.check_length(graph, source, frame.len(), min_len) {
            return;
        }

        if source != graph.self_id() {
            warn!(
                source = %graph.node(source).name,
                "got neighbor solicitation request from another node while in router mode"
            );
            return;
        }

        self.snatch_mac(frame);

        let opt = ICMP6 + NS_LEN;
        if frame[opt] != ND_OPT_SOURCE_LINKADDR {
            warn!("cannot route packet: received unknown type neighbor solicitation request");
            return;
        }

        // Verify the ICMPv6 checksum over the standard pseudo-header.
        let upper_len = (NS_LEN + ND_OPT_LEN + ETH_ALEN) as u32;
        let pseudo = icmp6_pseudo_header(
            &frame[IP6_SRC..IP6_SRC + 16],
            &frame[IP6_DST..IP6_DST + 16],
            upper_len,
        );
        if inet_checksum(&[&pseudo, &frame[ICMP6..ICMP6 + upper_len as usize]]) != 0 {
            warn!("cannot route packet: checksum error for neighbor solicitation request");
            return;
        }

        let target_at = ICMP6 + ICMP6_LEN;
        let mut target_bytes = [0u8; 16];
        target_bytes.copy_from_slice(&frame[target_at..target_at + 16]);
        let target = Ipv6Addr::from(target_bytes);

        let Some(subnet) = graph.lookup_ipv6(&target) else {
            warn!("cannot route packet: neighbor solicitation request for unknown address {target}");
            return;
        };
        if graph.subnet(subnet).owner == graph.self_id() {
            return; // the host can answer for itself
        }

        let mangled = self.mangled_mac();
        let mut reply = frame.to_vec();

        reply[..ETH_ALEN].copy_from_slice(&frame[ETH_ALEN..2 * ETH_ALEN]);
        reply[ETH_ALEN..2 * ETH_ALEN].copy_from_slice(&mangled);

        // Swap: reply travels from the solicited target back to the asker.
        reply[IP6_DST..IP6_DST + 16].copy_from_slice(&frame[IP6_SRC..IP6_SRC + 16]);
        reply[IP6_SRC..IP6_SRC + 16].copy_from_slice(&target_bytes);

        reply[ICMP6] = ND_NEIGHBOR_ADVERT;
        reply[ICMP6 + 1] = 0;
        // Solicited flag.
        write_u32(&mut reply, ICMP6 + 4, 0x4000_0000);
        reply[opt] = ND_OPT_TARGET_LINKADDR;
        reply[opt + ND_OPT_LEN..opt + ND_OPT_LEN + ETH_ALEN].copy_from_slice(&mangled);

        write_u16(&mut reply, ICMP6 + 2, 0);
        let pseudo = icmp6_pseudo_header(
            &reply[IP6_SRC..IP6_SRC + 16],
            &reply[IP6_DST..IP6_DST + 16],
            upper_len,
        );
        let sum = inet_checksum(&[&pseudo, &reply[ICMP6..ICMP6 + upper_len as usize]]);
        write_u16(&mut reply, ICMP6 + 2, sum);

        self.send(graph, io, source, &reply, None);
    }
}
