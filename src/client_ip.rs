use crate::tenant_config::{AdmissionPolicy, ClientIpMethod};
use axum::http::HeaderMap;
use std::net::IpAddr;

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_REAL_IP: &str = "x-real-ip";

/// Loopback, link-local and private ranges are always trusted proxies.
fn implicitly_trusted(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_link_local() || v4.is_private(),
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            v6.is_loopback()
                || (first & 0xffc0) == 0xfe80 // link-local
                || (first & 0xfe00) == 0xfc00 // unique local
                || v6.to_ipv4_mapped().map(|v4| implicitly_trusted(IpAddr::V4(v4))).unwrap_or(false)
        }
    }
}

fn is_trusted(policy: &AdmissionPolicy, ip: IpAddr) -> bool {
    implicitly_trusted(ip) || policy.trusts(ip)
}

/// Work out the visitor's address for a connection from `peer`.
pub fn extract(policy: &AdmissionPolicy, peer: IpAddr, headers: &HeaderMap) -> IpAddr {
    match policy.method() {
        ClientIpMethod::Direct => peer,
        ClientIpMethod::ForwardedFor => from_forwarded_for(policy, peer, headers),
        ClientIpMethod::RealIp => from_real_ip(policy, peer, headers),
    }
}

fn from_forwarded_for(policy: &AdmissionPolicy, peer: IpAddr, headers: &HeaderMap) -> IpAddr {
    if !is_trusted(policy, peer) {
        return peer;
    }

    let mut hops: Vec<IpAddr> = Vec::new();
    for value in headers.get_all(X_FORWARDED_FOR) {
        let Ok(value) = value.to_str() else {
            return peer;
        };
        for hop in value.split(',') {
            match hop.trim().parse::<IpAddr>() {
                Ok(ip) => hops.push(ip),
                Err(_) => return peer,
            }
        }
    }

    // Right to left: the first hop we do not trust is the client
    for ip in hops.iter().rev() {
        if !is_trusted(policy, *ip) {
            return *ip;
        }
    }

    hops.first().copied().unwrap_or(peer)
}

fn from_real_ip(policy: &AdmissionPolicy, peer: IpAddr, headers: &HeaderMap) -> IpAddr {
    if !is_trusted(policy, peer) {
        return peer;
    }

    headers
        .get(X_REAL_IP)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(peer)
}
