//! ARP impersonation (RFC 826): answer requests for addresses owned by
//! remote nodes so the host's neighbor table points at us.

use std::net::Ipv4Addr;

use tinc_routing::{Graph, NodeId};
use tracing::warn;

use crate::packet::*;

use super::{Forwarder, PacketIo};

// Offsets of the ARP fields inside the frame.
const ARP: usize = ETHER_LEN;
const ARP_SHA: usize = ARP + 8;
const ARP_SPA: usize = ARP + 14;
const ARP_THA: usize = ARP + 18;
const ARP_TPA: usize = ARP + 24;

impl Forwarder {
    pub(super) fn route_arp(
        &mut self,
        graph: &mut Graph,
        io: &mut dyn PacketIo,
        source: NodeId,
        frame: &[u8],
    ) {
        if !self.check_length(graph, source, frame.len(), ETHER_LEN + ARP_LEN) {
            return;
        }

        if source != graph.self_id() {
            warn!(
                source = %graph.node(source).name,
                "got ARP request from another node while in router mode"
            );
            return;
        }

        self.snatch_mac(frame);

        let hardware = read_u16(frame, ARP);
        let protocol = read_u16(frame, ARP + 2);
        let operation = read_u16(frame, ARP + 6);
        if hardware != ARPHRD_ETHER
            || protocol != ETHERTYPE_IPV4
            || frame[ARP + 4] as usize != ETH_ALEN
            || frame[ARP + 5] != 4
            || operation != ARPOP_REQUEST
        {
            warn!("cannot route packet: received unknown type ARP request");
            return;
        }

        let target = Ipv4Addr::new(
            frame[ARP_TPA],
            frame[ARP_TPA + 1],
            frame[ARP_TPA + 2],
            frame[ARP_TPA + 3],
        );

        let Some(subnet) = graph.lookup_ipv4(&target) else {
            warn!("cannot route packet: ARP request for unknown address {target}");
            return;
        };
        if graph.subnet(subnet).owner == graph.self_id() {
            return; // the host answers for its own addresses
        }

        let mangled = self.mangled_mac();
        let mut reply = frame.to_vec();

        // Ethernet: back to the asker, from our synthetic address.
        reply[..ETH_ALEN].copy_from_slice(&frame[ETH_ALEN..2 * ETH_ALEN]);
        reply[ETH_ALEN..2 * ETH_ALEN].copy_from_slice(&mangled);

        // ARP: swap source and target protocol addresses, claim the
        // target with our mangled hardware address.
        write_u16(&mut reply, ARP + 6, ARPOP_REPLY);
        reply[ARP_SHA..ARP_SHA + ETH_ALEN].copy_from_slice(&mangled);
        reply[ARP_SPA..ARP_SPA + 4].copy_from_slice(&frame[ARP_TPA..ARP_TPA + 4]);
        reply[ARP_THA..ARP_THA + ETH_ALEN].copy_from_slice(&frame[ARP_SHA..ARP_SHA + ETH_ALEN]);
        reply[ARP_TPA..ARP_TPA + 4].copy_from_slice(&frame[ARP_SPA..ARP_SPA + 4]);

        self.send(graph, io, source, &reply, None);
    }
}
