//! Target address wire codec and the UDP-over-TCP preface.
//!
//! `type(1) || body || port_be(2)` where the body is 4 bytes for IPv4,
//! `len(1) || name(len)` for a domain (1–255 bytes), or 16 bytes for
//! IPv6. The UoT preface is a 4-byte magic whose first byte collides
//! with no address type tag, so the server can distinguish the two with
//! a single read.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// Address type tag: IPv4.
pub const ADDR_TYPE_IPV4: u8 = 1;
/// Address type tag: domain name.
pub const ADDR_TYPE_DOMAIN: u8 = 2;
/// Address type tag: IPv6.
pub const ADDR_TYPE_IPV6: u8 = 3;

/// Preface magic announcing a UDP-over-TCP session in place of an
/// address.
pub const UOT_MAGIC: [u8; 4] = [0xf5, b'U', b'o', b'T'];

/// Parse `host:port` into its components, understanding bracketed IPv6.
fn split_host_port(addr: &str) -> Result<(&str, u16)> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| Error::address(format!("missing port in {addr:?}")))?;
    let port: u16 = port
        .parse()
        .map_err(|_| Error::address(format!("bad port in {addr:?}")))?;
    Ok((host, port))
}

/// Encode and write `host:port` as one buffer (a single write keeps the
/// address atomic with respect to the control multiplexer above).
pub async fn write_address<W: AsyncWrite + Unpin>(w: &mut W, addr: &str) -> Result<()> {
    let (host, port) = split_host_port(addr)?;

    let mut buf = Vec::with_capacity(1 + 1 + host.len() + 2);
    if let Some(stripped) = host.strip_prefix('[') {
        let inner = stripped
            .strip_suffix(']')
            .ok_or_else(|| Error::address(format!("unbalanced brackets in {addr:?}")))?;
        let ip: Ipv6Addr = inner
            .parse()
            .map_err(|_| Error::address(format!("bad ipv6 literal in {addr:?}")))?;
        buf.push(ADDR_TYPE_IPV6);
        buf.extend_from_slice(&ip.octets());
    } else if let Ok(ip) = host.parse::<Ipv4Addr>() {
        buf.push(ADDR_TYPE_IPV4);
        buf.extend_from_slice(&ip.octets());
    } else {
        if host.is_empty() || host.len() > 255 {
            return Err(Error::address(format!(
                "domain length {} outside [1, 255]",
                host.len()
            )));
        }
        buf.push(ADDR_TYPE_DOMAIN);
        buf.push(host.len() as u8);
        buf.extend_from_slice(host.as_bytes());
    }
    buf.extend_from_slice(&port.to_be_bytes());

    w.write_all(&buf).await?;
    Ok(())
}

/// Read an address whose type tag has already been consumed.
pub async fn read_address_tagged<R: AsyncRead + Unpin>(
    tag: u8,
    r: &mut R,
) -> Result<(String, u8, Option<IpAddr>)> {
    match tag {
        ADDR_TYPE_IPV4 => {
            let mut octets = [0u8; 4];
            r.read_exact(&mut octets).await?;
            let port = read_port(r).await?;
            let ip = Ipv4Addr::from(octets);
            Ok((format!("{ip}:{port}"), tag, Some(IpAddr::V4(ip))))
        }
        ADDR_TYPE_DOMAIN => {
            let len = r.read_u8().await? as usize;
            if len == 0 {
                return Err(Error::address("zero-length domain"));
            }
            let mut name = vec![0u8; len];
            r.read_exact(&mut name).await?;
            let name = String::from_utf8(name)
                .map_err(|_| Error::address("domain is not valid utf-8"))?;
            let port = read_port(r).await?;
            Ok((format!("{name}:{port}"), tag, None))
        }
        ADDR_TYPE_IPV6 => {
            let mut octets = [0u8; 16];
            r.read_exact(&mut octets).await?;
            let port = read_port(r).await?;
            let ip = Ipv6Addr::from(octets);
            Ok((format!("[{ip}]:{port}"), tag, Some(IpAddr::V6(ip))))
        }
        other => Err(Error::address(format!("unknown address type {other:#x}"))),
    }
}

/// Read a full address including its type tag.
pub async fn read_address<R: AsyncRead + Unpin>(
    r: &mut R,
) -> Result<(String, u8, Option<IpAddr>)> {
    let tag = r.read_u8().await?;
    read_address_tagged(tag, r).await
}

async fn read_port<R: AsyncRead + Unpin>(r: &mut R) -> Result<u16> {
    let mut port = [0u8; 2];
    r.read_exact(&mut port).await?;
    Ok(u16::from_be_bytes(port))
}

/// Announce a UDP-over-TCP session in place of a target address.
pub async fn write_uot_preface<W: AsyncWrite + Unpin>(w: &mut W) -> Result<()> {
    w.write_all(&UOT_MAGIC).await?;
    Ok(())
}
