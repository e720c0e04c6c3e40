//! Request introspection helpers for service implementations.
//!
//! Peers are described with the gRPC peer notation
//! (`ipv4:192.0.2.1:5555`, `ipv6:%5B::1%5D:5555`).

use crate::error::Error;
use crate::telemetry::Logger;
use serde::Serialize;
use std::net::SocketAddr;
use tonic::{Request, Status};

/// Address of the client on the other end of a call.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Peer {
    pub ip: String,
    pub port: String,
}

/// Renders a remote address as a gRPC peer descriptor.
pub fn peer_descriptor(addr: Option<SocketAddr>) -> String {
    match addr {
        Some(SocketAddr::V4(addr)) => format!("ipv4:{}:{}", addr.ip(), addr.port()),
        Some(SocketAddr::V6(addr)) => format!("ipv6:%5B{}%5D:{}", addr.ip(), addr.port()),
        None => "unknown".to_string(),
    }
}

/// Splits a peer descriptor (`<scheme>:<ip>:<port>`) into ip and port.
///
/// The descriptor is percent-decoded first. The ip is everything between the
/// first and the last colon, the port everything after the last colon.
///
/// A descriptor without a colon (`unknown`, as produced for calls with no
/// remote address) yields a [`Peer`] with both fields empty. Empty fields
/// are never a valid address, so callers detect the missing peer with
/// `peer.ip.is_empty()` instead of matching placeholder text.
pub fn extract_peer(descriptor: &str) -> Peer {
    let decoded = urlencoding::decode(descriptor)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| descriptor.to_string());

    match (decoded.find(':'), decoded.rfind(':')) {
        (Some(first), Some(last)) => Peer {
            ip: decoded[first + 1..last.max(first + 1)].to_string(),
            port: decoded[last + 1..].to_string(),
        },
        _ => Peer::default(),
    }
}

/// Peer of an inbound call.
pub fn request_peer<M>(request: &Request<M>) -> Peer {
    extract_peer(&peer_descriptor(request.remote_addr()))
}

/// Logs an inbound call and returns its peer and a JSON form of its message.
///
/// # Errors
///
/// If the message cannot be converted, the failure is logged and a
/// `Status::unknown` carrying the formatted error is returned. Handlers
/// return it as-is, which aborts only that call.
pub fn describe<M: Serialize>(
    request: &Request<M>,
    logger: &Logger,
) -> Result<(Peer, serde_json::Value), Status> {
    let peer = request_peer(request);

    let payload = match serde_json::to_value(request.get_ref()) {
        Ok(payload) => payload,
        Err(e) => {
            let err = Error::RequestDecoding {
                reason: e.to_string(),
            };
            logger.scope(|| {
                tracing::error!(
                    ip = %peer.ip,
                    port = %peer.port,
                    "Failed to convert request from {}:{} for logging: {err}",
                    peer.ip,
                    peer.port
                );
            });
            return Err(err.into());
        }
    };

    logger.scope(|| {
        tracing::info!("Request received from {}:{}", peer.ip, peer.port);
        match serde_json::to_string_pretty(&payload) {
            Ok(pretty) => tracing::info!("Request payload:\n{pretty}"),
            Err(_) => tracing::info!("Request payload: {payload}"),
        }
    });

    Ok((peer, payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::LoggerOptions;
    use serde::Serializer;
    use std::collections::BTreeMap;
    use tonic::Code;

    fn quiet_logger() -> Logger {
        Logger::new(LoggerOptions {
            console_output: false,
            ..LoggerOptions::default()
        })
        .unwrap()
    }

    #[test]
    fn extracts_ipv4_peer() {
        assert_eq!(
            extract_peer("ipv4:192.0.2.1:5555"),
            Peer {
                ip: "192.0.2.1".to_string(),
                port: "5555".to_string()
            }
        );
    }

    #[test]
    fn extracts_percent_encoded_ipv6_peer() {
        let peer = extract_peer("ipv6:%5B::1%5D:5555");
        assert_eq!(peer.ip, "[::1]");
        assert_eq!(peer.port, "5555");
    }

    #[test]
    fn degenerate_descriptors() {
        assert_eq!(extract_peer("unknown"), Peer::default());
        let unix = extract_peer("unix:/tmp/grpc.sock");
        assert_eq!(unix.ip, "");
        assert_eq!(unix.port, "/tmp/grpc.sock");

        let missing = request_peer(&Request::new(()));
        assert!(missing.ip.is_empty() && missing.port.is_empty());
    }

    #[test]
    fn descriptor_round_trips_socket_addrs() {
        let v4: SocketAddr = "10.1.2.3:8080".parse().unwrap();
        assert_eq!(peer_descriptor(Some(v4)), "ipv4:10.1.2.3:8080");
        assert_eq!(extract_peer(&peer_descriptor(Some(v4))).ip, "10.1.2.3");

        let v6: SocketAddr = "[2001:db8::7]:443".parse().unwrap();
        let peer = extract_peer(&peer_descriptor(Some(v6)));
        assert_eq!(peer.ip, "[2001:db8::7]");
        assert_eq!(peer.port, "443");

        assert_eq!(peer_descriptor(None), "unknown");
    }

    #[derive(Serialize)]
    struct Predict {
        model: String,
        inputs: Vec<f32>,
    }

    #[test]
    fn describes_serializable_requests() {
        let request = Request::new(Predict {
            model: "resnet".to_string(),
            inputs: vec![0.5, 1.0],
        });

        let (peer, payload) = describe(&request, &quiet_logger()).unwrap();
        assert_eq!(peer, Peer::default());
        assert_eq!(payload["model"], "resnet");
        assert_eq!(payload["inputs"][1], 1.0);
    }

    struct Unconvertible;

    impl Serialize for Unconvertible {
        fn serialize<S: Serializer>(&self, _: S) -> Result<S::Ok, S::Error> {
            Err(serde::ser::Error::custom("field `blob` is not representable"))
        }
    }

    #[test]
    fn conversion_failure_aborts_with_unknown() {
        let status = describe(&Request::new(Unconvertible), &quiet_logger()).unwrap_err();
        assert_eq!(status.code(), Code::Unknown);
        assert!(status.message().contains("field `blob` is not representable"));
    }

    #[test]
    fn non_string_map_keys_fail_conversion() {
        let mut map = BTreeMap::new();
        map.insert(vec![1_u8], "value");
        let status = describe(&Request::new(map), &quiet_logger()).unwrap_err();
        assert_eq!(status.code(), Code::Unknown);
    }
}
