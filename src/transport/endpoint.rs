use std::net::{SocketAddr, ToSocketAddrs};

use crate::error::TransportError;

/// Parse `[proto+]tcp://host:port` (or a bare `host:port`) into a socket
/// address. Mercury-style prefixes such as `bmi+tcp` or `cci+tcp` are
/// accepted as long as the last protocol component is `tcp`.
pub fn parse_endpoint(spec: &str) -> Result<SocketAddr, TransportError> {
    let authority = match spec.split_once("://") {
        Some((scheme, rest)) => {
            let proto = scheme.rsplit('+').next().unwrap_or(scheme);
            if !proto.eq_ignore_ascii_case("tcp") {
                return Err(TransportError::BadEndpoint(spec.to_string()));
            }
            rest
        }
        None => spec,
    };
    let authority = authority.trim_end_matches('/');

    authority
        .to_socket_addrs()
        .map_err(|_| TransportError::BadEndpoint(spec.to_string()))?
        .next()
        .ok_or_else(|| TransportError::BadEndpoint(spec.to_string()))
}
