//! Private network classification of resolved target addresses.

use std::net::{IpAddr, Ipv4Addr};

// (network, mask)
const PRIVATE_RANGES: [(u32, u32); 4] = [
    (u32::from_be_bytes([10, 0, 0, 0]), u32::from_be_bytes([255, 0, 0, 0])),
    (u32::from_be_bytes([172, 16, 0, 0]), u32::from_be_bytes([255, 240, 0, 0])),
    (u32::from_be_bytes([192, 168, 0, 0]), u32::from_be_bytes([255, 255, 0, 0])),
    (u32::from_be_bytes([127, 0, 0, 1]), u32::from_be_bytes([255, 255, 255, 255])),
];

/// Returns true as soon as one address falls into a private range.
///
/// IPv4-mapped IPv6 addresses are checked against the IPv4 table and `::1` counts as
/// loopback. Other IPv6 addresses are not classified.
pub fn is_private<I>(addresses: I) -> bool
where
    I: IntoIterator<Item = IpAddr>,
{
    addresses.into_iter().any(|address| match address {
        IpAddr::V4(v4) => is_private_ipv4(v4),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => is_private_ipv4(v4),
            None => v6.is_loopback(),
        },
    })
}

pub fn is_private_ipv4(address: Ipv4Addr) -> bool {
    let address = u32::from(address);
    PRIVATE_RANGES
        .iter()
        .any(|&(network, mask)| address & mask == network)
}
