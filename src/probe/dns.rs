//! DNS probe implementation using raw UDP packets.

use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;

use super::ProbeError;

const DNS_PORT: u16 = 53;
const HEADER_LEN: usize = 12;

/// Resolve `domain` (A record) through the resolver at `resolver` and return the round-trip time.
///
/// `resolver` may be an IP, an `ip:port` pair or a hostname; port 53 is assumed when absent.
pub async fn run_dns_probe(
    resolver: &str,
    domain: &str,
    timeout: Duration,
) -> Result<Duration, ProbeError> {
    let server = resolver_address(resolver).await?;
    let tx_id: u16 = rand::random();
    let packet = build_dns_query(tx_id, domain)?;

    let bind_addr = if server.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let socket = UdpSocket::bind(bind_addr)
        .await
        .map_err(|e| ProbeError::Transport(format!("failed to bind socket: {}", e)))?;
    socket
        .connect(server)
        .await
        .map_err(|e| ProbeError::Transport(format!("failed to connect: {}", e)))?;

    let start = Instant::now();

    socket
        .send(&packet)
        .await
        .map_err(|e| ProbeError::Transport(format!("failed to send: {}", e)))?;

    // Stray datagrams with another transaction id are skipped until the deadline.
    let exchange = async {
        let mut response = [0u8; 512];
        loop {
            let n = socket
                .recv(&mut response)
                .await
                .map_err(|e| ProbeError::Transport(format!("failed to recv: {}", e)))?;
            let elapsed = start.elapsed();
            if n >= 2 && u16::from_be_bytes([response[0], response[1]]) != tx_id {
                continue;
            }
            check_dns_response(&response[..n], tx_id, domain)?;
            return Ok::<_, ProbeError>(elapsed);
        }
    };

    tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| ProbeError::Timeout(timeout))?
}

async fn resolver_address(resolver: &str) -> Result<SocketAddr, ProbeError> {
    if let Ok(addr) = resolver.parse::<SocketAddr>() {
        return Ok(addr);
    }
    if let Ok(ip) = resolver.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, DNS_PORT));
    }

    let host = if resolver.contains(':') {
        resolver.to_string()
    } else {
        format!("{}:{}", resolver, DNS_PORT)
    };
    tokio::net::lookup_host(host)
        .await
        .map_err(|e| ProbeError::Resolution(format!("cannot resolve resolver {}: {}", resolver, e)))?
        .next()
        .ok_or_else(|| ProbeError::Resolution(format!("no addresses for resolver {}", resolver)))
}

/// Check that `domain` can be encoded as a DNS query name.
pub fn validate_domain(domain: &str) -> Result<(), String> {
    let name = domain.trim_end_matches('.');
    if name.is_empty() || name.len() > 253 {
        return Err(format!("invalid domain length: {:?}", domain));
    }
    for label in name.split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err(format!("invalid label {:?} in domain {:?}", label, domain));
        }
    }
    Ok(())
}

/// Build a minimal DNS query packet for an A record of `domain`.
fn build_dns_query(tx_id: u16, domain: &str) -> Result<Vec<u8>, ProbeError> {
    validate_domain(domain).map_err(ProbeError::Resolution)?;

    let flags: u16 = 0x0100; // Standard query, recursion desired
    let qd_count: u16 = 1;

    let mut packet = Vec::with_capacity(HEADER_LEN + domain.len() + 6);
    packet.extend_from_slice(&tx_id.to_be_bytes());
    packet.extend_from_slice(&flags.to_be_bytes());
    packet.extend_from_slice(&qd_count.to_be_bytes());
    packet.extend_from_slice(&[0u8; 6]); // an/ns/ar counts

    // Length-prefixed labels
    for label in domain.trim_end_matches('.').split('.') {
        packet.push(label.len() as u8);
        packet.extend_from_slice(label.as_bytes());
    }
    packet.push(0);

    packet.extend_from_slice(&1u16.to_be_bytes()); // QTYPE A
    packet.extend_from_slice(&1u16.to_be_bytes()); // QCLASS IN

    Ok(packet)
}

/// Validate a response: matching id, a response flag, RCODE 0 and at least one answer.
fn check_dns_response(response: &[u8], tx_id: u16, domain: &str) -> Result<(), ProbeError> {
    if response.len() < HEADER_LEN {
        return Err(ProbeError::Transport(format!(
            "response too short: {} bytes",
            response.len()
        )));
    }

    let resp_tx_id = u16::from_be_bytes([response[0], response[1]]);
    if resp_tx_id != tx_id {
        return Err(ProbeError::Transport(format!(
            "transaction ID mismatch: got {}, expected {}",
            resp_tx_id, tx_id
        )));
    }

    if response[2] & 0x80 == 0 {
        return Err(ProbeError::Transport("reply is not a DNS response".to_string()));
    }

    // RCODE is the lower 4 bits of byte 3
    match response[3] & 0x0F {
        0 => {}
        3 => return Err(ProbeError::Resolution(format!("{}: NXDOMAIN", domain))),
        2 => return Err(ProbeError::Resolution(format!("{}: SERVFAIL", domain))),
        rcode => {
            return Err(ProbeError::Resolution(format!(
                "{}: DNS error RCODE {}",
                domain, rcode
            )))
        }
    }

    let an_count = u16::from_be_bytes([response[6], response[7]]);
    if an_count == 0 {
        return Err(ProbeError::Resolution(format!("{}: no answer records", domain)));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(tx_id: u16, rcode: u8, answers: u16) -> Vec<u8> {
        let mut r = Vec::new();
        r.extend_from_slice(&tx_id.to_be_bytes());
        r.push(0x81);
        r.push(0x80 | rcode);
        r.extend_from_slice(&1u16.to_be_bytes());
        r.extend_from_slice(&answers.to_be_bytes());
        r.extend_from_slice(&[0u8; 4]);
        r
    }

    #[test]
    fn test_build_dns_query() {
        let packet = build_dns_query(0xABCD, "example.com").unwrap();
        // 12 (header) + 13 (question name) + 4 (type/class)
        assert_eq!(packet.len(), 29);
        assert_eq!(packet[0..2], [0xAB, 0xCD]);
        assert_eq!(packet[12], 7);
        assert_eq!(&packet[13..20], b"example");
        assert_eq!(packet[20], 3);
        assert_eq!(packet[24], 0);
    }

    #[test]
    fn test_build_dns_query_trailing_dot() {
        let a = build_dns_query(1, "google.com").unwrap();
        let b = build_dns_query(1, "google.com.").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_validate_domain() {
        assert!(validate_domain("cloudflare.com").is_ok());
        assert!(validate_domain("").is_err());
        assert!(validate_domain("bad..name").is_err());
        assert!(validate_domain(&format!("{}.com", "a".repeat(64))).is_err());
    }

    #[test]
    fn test_check_dns_response() {
        assert!(check_dns_response(&response(7, 0, 1), 7, "google.com").is_ok());
        assert!(matches!(
            check_dns_response(&response(7, 3, 0), 7, "nosuch.invalid"),
            Err(ProbeError::Resolution(_))
        ));
        assert!(matches!(
            check_dns_response(&response(7, 2, 0), 7, "google.com"),
            Err(ProbeError::Resolution(_))
        ));
        assert!(matches!(
            check_dns_response(&response(7, 0, 0), 7, "google.com"),
            Err(ProbeError::Resolution(_))
        ));
        assert!(matches!(
            check_dns_response(&response(8, 0, 1), 7, "google.com"),
            Err(ProbeError::Transport(_))
        ));
        assert!(matches!(
            check_dns_response(&[0u8; 4], 7, "google.com"),
            Err(ProbeError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_dns_probe_against_local_responder() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (n, peer) = server.recv_from(&mut buf).await.unwrap();
            let mut reply = buf[..n].to_vec();
            reply[2] = 0x81;
            reply[3] = 0x80;
            reply[7] = 1; // one answer
            server.send_to(&reply, peer).await.unwrap();
        });

        let latency = run_dns_probe(&addr.to_string(), "example.com", Duration::from_secs(2)).await;
        tokio_test::assert_ok!(latency);
    }

    #[tokio::test]
    async fn test_dns_probe_times_out() {
        // Bound but silent responder
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();

        let result = run_dns_probe(&addr.to_string(), "example.com", Duration::from_millis(50)).await;
        assert!(matches!(result, Err(ProbeError::Timeout(_))));
        drop(server);
    }

    #[tokio::test]
    async fn test_resolver_address_forms() {
        assert_eq!(
            resolver_address("1.1.1.1").await.unwrap(),
            "1.1.1.1:53".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            resolver_address("127.0.0.1:5353").await.unwrap(),
            "127.0.0.1:5353".parse::<SocketAddr>().unwrap()
        );

        // Hostnames go through the system resolver and default to port 53.
        let addr = resolver_address("localhost").await.unwrap();
        assert!(addr.ip().is_loopback());
        assert_eq!(addr.port(), 53);
    }
}
