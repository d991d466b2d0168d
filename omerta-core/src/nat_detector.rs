//! NAT Detector: classifies this node's NAT via STUN-style probes. Advisory only — a
//! classification never blocks a hole-punch attempt (spec.md §4.4), it only biases the
//! Endpoint Manager's policy ordering.
//!
//! The STUN dialect spoken here is the minimal binding-request/response exchange
//! needed to learn a reflexive address and compare it against two servers; the exact
//! server list is left to configuration (SPEC_FULL.md Open Question #3).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;

use crate::log::Log;
use crate::peer::NatType;

/// A single STUN-style probe result: the address the server observed us sending from.
async fn probe(socket: &UdpSocket, server: &str, timeout: Duration) -> std::io::Result<SocketAddr> {
    // Minimal binding request: a fixed magic plus a random transaction id. Real STUN
    // servers speak RFC 5389; this keeps only the subset needed to learn a reflexive
    // address, since the full dialect is out of scope (SPEC_FULL.md §10 Q3).
    let mut request = [0u8; 20];
    request[0..4].copy_from_slice(b"BIND");
    omerta_crypto::random::fill_bytes_secure(&mut request[4..20]);

    socket.send_to(&request, server).await?;
    let mut buf = [0u8; 64];
    let (n, _) = tokio::time::timeout(timeout, socket.recv_from(&mut buf)).await??;
    if n < 6 {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "short stun-style response"));
    }
    let ip = std::net::Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]);
    let port = u16::from_be_bytes([buf[4], buf[5]]);
    Ok(SocketAddr::from((ip, port)))
}

pub async fn classify(socket: &UdpSocket, servers: &[String], local_addr: SocketAddr, timeout: Duration, log: &Arc<Log>) -> NatType {
    if servers.len() < 2 {
        crate::log_warn!(log, "nat_detector", "fewer than two stun servers configured, classification skipped");
        return NatType::Unknown;
    }

    let first = probe(socket, &servers[0], timeout).await;
    let second = probe(socket, &servers[1], timeout).await;

    match (first, second) {
        (Ok(a), Ok(b)) => {
            if a.ip() == local_addr.ip() && a.port() == local_addr.port() {
                NatType::Open
            } else if a == b {
                // Same reflexive mapping regardless of destination: a cone NAT.
                // Distinguishing full/restricted/port-restricted needs a filtering
                // probe against an unsolicited peer, which is handled opportunistically
                // by the Endpoint Manager rather than here.
                NatType::FullCone
            } else {
                NatType::Symmetric
            }
        }
        _ => {
            crate::log_warn!(log, "nat_detector", "stun probe(s) failed, nat type unknown");
            NatType::Unknown
        }
    }
}
