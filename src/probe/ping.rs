//! Ping probe implementation with native ICMP (high-precision) and command fallback.
//!
//! Uses blocking sockets in spawn_blocking for sub-millisecond timing precision.

use std::mem::MaybeUninit;
use std::net::{IpAddr, SocketAddr};
use std::process::Stdio;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use regex::Regex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::process::Command;

use super::ProbeError;

/// ICMP capability state
#[derive(Debug, Clone, Copy, PartialEq)]
enum IcmpCapability {
    /// Native ICMP sockets are available
    Native,
    /// Only command fallback is available
    CommandOnly,
}

static ICMP_CAPABILITY: OnceLock<IcmpCapability> = OnceLock::new();

/// Ping sequence counter for unique identification
static PING_SEQUENCE: AtomicU16 = AtomicU16::new(0);

/// Per-address-family ICMP constants.
struct IcmpFamily {
    domain: Domain,
    protocol: Protocol,
    echo_request: u8,
    echo_reply: u8,
    dest_unreachable: u8,
    /// ICMPv6 checksums are filled in by the kernel.
    userspace_checksum: bool,
}

const ICMP_V4: IcmpFamily = IcmpFamily {
    domain: Domain::IPV4,
    protocol: Protocol::ICMPV4,
    echo_request: 8,
    echo_reply: 0,
    dest_unreachable: 3,
    userspace_checksum: true,
};

const ICMP_V6: IcmpFamily = IcmpFamily {
    domain: Domain::IPV6,
    protocol: Protocol::ICMPV6,
    echo_request: 128,
    echo_reply: 129,
    dest_unreachable: 1,
    userspace_checksum: false,
};

/// Which socket type carried the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SocketKind {
    Raw,
    /// The kernel rewrites the echo identifier to the socket's own id and
    /// only delivers replies addressed to that socket.
    Dgram,
}

/// What a received ICMP message means for our echo request.
#[derive(Debug, PartialEq)]
enum Reply {
    Echo,
    Unreachable,
    Unrelated,
}

/// Generate a unique identifier for each ping request.
/// This ensures concurrent pings can be distinguished even to the same destination.
fn generate_ping_id() -> (u16, u16) {
    let identifier: u16 = rand::random();
    let sequence = PING_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    (identifier, sequence)
}

/// Detect ICMP capability by attempting to create a socket.
fn detect_icmp_capability() -> IcmpCapability {
    // RAW needs CAP_NET_RAW or root
    if Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("Ping probe: using native ICMP (RAW socket, privileged)");
        return IcmpCapability::Native;
    }

    // DGRAM works unprivileged on Linux with ping_group_range set, or macOS
    if Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("Ping probe: using native ICMP (DGRAM socket, unprivileged)");
        return IcmpCapability::Native;
    }

    tracing::info!("Ping probe: native ICMP unavailable, using command fallback");
    IcmpCapability::CommandOnly
}

/// Send one echo request to `address` and return the round-trip time.
pub async fn run_ping_probe(address: &str, timeout: Duration) -> Result<Duration, ProbeError> {
    let capability = *ICMP_CAPABILITY.get_or_init(detect_icmp_capability);

    if capability == IcmpCapability::CommandOnly {
        return run_ping_command(address, timeout).await;
    }

    let ip = resolve_address(address).await?;

    let result = tokio::task::spawn_blocking(move || run_blocking_ping(ip, timeout))
        .await
        .map_err(|e| ProbeError::Transport(format!("spawn_blocking failed: {}", e)))?;

    match result {
        Err(ProbeError::Transport(msg)) if is_permission_error(&msg) => {
            tracing::warn!(
                "Native ping not permitted for {}, falling back to command: {}",
                address,
                msg
            );
            run_ping_command(address, timeout).await
        }
        other => other,
    }
}

fn is_permission_error(msg: &str) -> bool {
    msg.contains("Permission") || msg.contains("Operation not permitted") || msg.contains("denied")
}

/// Resolve hostname to IP address.
async fn resolve_address(address: &str) -> Result<IpAddr, ProbeError> {
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok(ip);
    }

    tokio::net::lookup_host(format!("{}:0", address))
        .await
        .map_err(|e| ProbeError::Resolution(format!("cannot resolve {}: {}", address, e)))?
        .next()
        .map(|sa| sa.ip())
        .ok_or_else(|| ProbeError::Resolution(format!("no addresses found for {}", address)))
}

/// Blocking ICMP echo with precise timing. Runs in a dedicated thread via spawn_blocking.
fn run_blocking_ping(ip: IpAddr, timeout: Duration) -> Result<Duration, ProbeError> {
    let family = match ip {
        IpAddr::V4(_) => &ICMP_V4,
        IpAddr::V6(_) => &ICMP_V6,
    };

    // Try RAW first (privileged), then DGRAM (unprivileged)
    let (socket, kind) = match Socket::new(family.domain, Type::RAW, Some(family.protocol)) {
        Ok(socket) => (socket, SocketKind::Raw),
        Err(_) => Socket::new(family.domain, Type::DGRAM, Some(family.protocol))
            .map(|socket| (socket, SocketKind::Dgram))
            .map_err(|e| ProbeError::Transport(format!("failed to create ICMP socket: {}", e)))?,
    };

    socket
        .set_read_timeout(Some(timeout))
        .and_then(|_| socket.set_write_timeout(Some(timeout)))
        .map_err(|e| ProbeError::Transport(format!("failed to set timeout: {}", e)))?;

    socket
        .connect(&SocketAddr::new(ip, 0).into())
        .map_err(|e| ProbeError::Transport(format!("failed to connect: {}", e)))?;

    let (identifier, sequence) = generate_ping_id();
    let packet = build_echo_request(family, identifier, sequence);

    let start = Instant::now();

    socket.send(&packet).map_err(|e| match e.kind() {
        std::io::ErrorKind::PermissionDenied => {
            ProbeError::Transport(format!("Permission denied: {}", e))
        }
        std::io::ErrorKind::NetworkUnreachable | std::io::ErrorKind::HostUnreachable => {
            ProbeError::Unreachable(format!("{}: {}", ip, e))
        }
        _ => ProbeError::Transport(format!("failed to send: {}", e)),
    })?;

    // Loop until we get OUR reply or time out
    loop {
        let mut buf: [MaybeUninit<u8>; 1500] = unsafe { MaybeUninit::uninit().assume_init() };
        let len = socket.recv(&mut buf).map_err(|e| match e.kind() {
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => {
                ProbeError::Timeout(timeout)
            }
            std::io::ErrorKind::HostUnreachable | std::io::ErrorKind::NetworkUnreachable => {
                ProbeError::Unreachable(format!("{}: {}", ip, e))
            }
            _ => ProbeError::Transport(format!("failed to receive: {}", e)),
        })?;
        // SAFETY: recv initialized `len` bytes
        let buf: &[u8] = unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, len) };

        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Err(ProbeError::Timeout(timeout));
        }

        match classify_reply(family, kind, buf, identifier, sequence) {
            Reply::Echo => return Ok(elapsed),
            Reply::Unreachable => {
                return Err(ProbeError::Unreachable(format!(
                    "{}: destination unreachable",
                    ip
                )))
            }
            Reply::Unrelated => continue,
        }
    }
}

/// Work out whether a received datagram answers our echo request.
///
/// RAW IPv4 sockets deliver the IP header in front of the ICMP message;
/// DGRAM and IPv6 sockets deliver the ICMP message alone. On DGRAM sockets
/// the identifier is the kernel's, so only the sequence is compared.
fn classify_reply(
    family: &IcmpFamily,
    kind: SocketKind,
    buf: &[u8],
    identifier: u16,
    sequence: u16,
) -> Reply {
    let offset = if family.userspace_checksum && !buf.is_empty() && buf[0] >> 4 == 4 {
        ((buf[0] & 0x0F) as usize) * 4
    } else {
        0
    };
    let icmp = match buf.get(offset..) {
        Some(icmp) if icmp.len() >= 8 => icmp,
        _ => return Reply::Unrelated,
    };

    let matches_ours = |header: &[u8]| {
        (kind == SocketKind::Dgram || u16::from_be_bytes([header[4], header[5]]) == identifier)
            && u16::from_be_bytes([header[6], header[7]]) == sequence
    };

    if icmp[0] == family.echo_reply && matches_ours(icmp) {
        return Reply::Echo;
    }

    if icmp[0] == family.dest_unreachable {
        // The error quotes the original datagram; check it was ours when enough of it came back.
        let inner_offset = if family.userspace_checksum {
            8 + icmp.get(8).map(|b| ((b & 0x0F) as usize) * 4).unwrap_or(20)
        } else {
            8 + 40
        };
        return match icmp.get(inner_offset..inner_offset + 8) {
            Some(inner) if inner[0] == family.echo_request && !matches_ours(inner) => {
                Reply::Unrelated
            }
            _ => Reply::Unreachable,
        };
    }

    Reply::Unrelated
}

/// Build an ICMP Echo Request packet (code 0) for the given family.
fn build_echo_request(family: &IcmpFamily, identifier: u16, sequence: u16) -> Vec<u8> {
    let mut packet = vec![0u8; 64]; // 8 byte header + 56 byte payload

    packet[0] = family.echo_request;
    packet[1] = 0;
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());

    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    packet[8..16].copy_from_slice(&timestamp.to_be_bytes());

    if family.userspace_checksum {
        let checksum = icmp_checksum(&packet);
        packet[2..4].copy_from_slice(&checksum.to_be_bytes());
    }

    packet
}

/// Compute ICMP checksum (RFC 1071).
fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = data
        .chunks(2)
        .map(|pair| match pair {
            [hi, lo] => u16::from_be_bytes([*hi, *lo]) as u32,
            [hi] => (*hi as u32) << 8,
            _ => 0,
        })
        .sum();

    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !sum as u16
}

/// Run ping via command execution (fallback).
async fn run_ping_command(address: &str, timeout: Duration) -> Result<Duration, ProbeError> {
    let timeout_secs = timeout.as_secs().max(1);

    let output = Command::new("ping")
        .args(["-c", "1", "-W", &timeout_secs.to_string(), address])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| ProbeError::Transport(format!("failed to execute ping: {}", e)))?;

    let stdout = String::from_utf8_lossy(&output.stdout);

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(classify_ping_failure(&stdout, &stderr, timeout));
    }

    parse_ping_output(&stdout)
}

/// Map a failed ping command's output onto the probe error taxonomy.
fn classify_ping_failure(stdout: &str, stderr: &str, timeout: Duration) -> ProbeError {
    if stdout.contains("Unreachable") || stderr.contains("Unreachable") {
        ProbeError::Unreachable(stdout.trim().to_string())
    } else if stderr.contains("unknown host")
        || stderr.contains("Name or service not known")
        || stderr.contains("cannot resolve")
    {
        ProbeError::Resolution(stderr.trim().to_string())
    } else if stderr.contains("timeout")
        || stdout.contains("100% packet loss")
        || stdout.contains("100.0% packet loss")
    {
        ProbeError::Timeout(timeout)
    } else {
        ProbeError::Transport(format!("ping failed: {}", stdout.trim()))
    }
}

/// Parse ping command output for latency.
fn parse_ping_output(output: &str) -> Result<Duration, ProbeError> {
    static PATTERNS: OnceLock<Vec<(Regex, usize)>> = OnceLock::new();
    let patterns = PATTERNS.get_or_init(|| {
        [
            // Per-packet response "time=X.XXX ms" (Linux, some macOS)
            (r"time[=<]([0-9.]+)\s*ms", 1),
            // Summary "round-trip min/avg/max/stddev = X/X/X/X ms" (macOS), average
            (r"round-trip\s+min/avg/max/stddev\s*=\s*([0-9.]+)/([0-9.]+)/([0-9.]+)", 2),
            // Summary "rtt min/avg/max/mdev = X/X/X/X ms" (Linux), average
            (r"rtt\s+min/avg/max/mdev\s*=\s*([0-9.]+)/([0-9.]+)/([0-9.]+)", 2),
        ]
        .into_iter()
        .filter_map(|(pattern, group)| Regex::new(pattern).ok().map(|re| (re, group)))
        .collect()
    });

    patterns
        .iter()
        .filter_map(|(re, group)| re.captures(output)?.get(*group))
        .find_map(|m| m.as_str().parse::<f64>().ok())
        .map(|ms| Duration::from_secs_f64(ms / 1000.0))
        .ok_or_else(|| ProbeError::Transport(format!("failed to parse ping output: {}", output)))
}
