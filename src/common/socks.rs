//! SOCKS5 wire types (RFC 1928 / RFC 1929)

use super::net::Address;
use crate::{Error, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const SOCKS5_VERSION: u8 = 0x05;

// Authentication methods
pub const AUTH_NO_AUTH: u8 = 0x00;
pub const AUTH_USERNAME_PASSWORD: u8 = 0x02;
pub const AUTH_NO_ACCEPTABLE: u8 = 0xFF;

// Sub-negotiation version for username/password
pub const USERPASS_VERSION: u8 = 0x01;

// Commands
pub const CMD_CONNECT: u8 = 0x01;
pub const CMD_BIND: u8 = 0x02;
pub const CMD_UDP_ASSOCIATE: u8 = 0x03;

// Reply codes
pub const REP_SUCCEEDED: u8 = 0x00;
pub const REP_GENERAL_FAILURE: u8 = 0x01;
pub const REP_CONNECTION_NOT_ALLOWED: u8 = 0x02;
pub const REP_NETWORK_UNREACHABLE: u8 = 0x03;
pub const REP_HOST_UNREACHABLE: u8 = 0x04;
pub const REP_CONNECTION_REFUSED: u8 = 0x05;
pub const REP_TTL_EXPIRED: u8 = 0x06;
pub const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;
pub const REP_ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;

/// SOCKS5 command. Only CONNECT is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Bind,
    UdpAssociate,
    Unknown(u8),
}

impl From<u8> for Command {
    fn from(value: u8) -> Self {
        match value {
            CMD_CONNECT => Command::Connect,
            CMD_BIND => Command::Bind,
            CMD_UDP_ASSOCIATE => Command::UdpAssociate,
            other => Command::Unknown(other),
        }
    }
}

/// Methods offered in the client greeting
#[derive(Debug, Clone, Copy)]
pub struct AuthMethodFlags {
    pub no_auth: bool,
    pub username_password: bool,
}

impl AuthMethodFlags {
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let mut head = [0u8; 2];
        reader.read_exact(&mut head).await?;

        if head[0] != SOCKS5_VERSION {
            return Err(Error::protocol(format!(
                "Unsupported SOCKS version: {}",
                head[0]
            )));
        }

        let n = head[1] as usize;
        let mut methods = [0u8; 255];
        reader.read_exact(&mut methods[..n]).await?;

        let mut flags = Self {
            no_auth: false,
            username_password: false,
        };
        for &m in &methods[..n] {
            match m {
                AUTH_NO_AUTH => flags.no_auth = true,
                AUTH_USERNAME_PASSWORD => flags.username_password = true,
                _ => {}
            }
        }
        Ok(flags)
    }
}

pub async fn write_method_selection<W: AsyncWrite + Unpin>(writer: &mut W, method: u8) -> Result<()> {
    writer.write_all(&[SOCKS5_VERSION, method]).await?;
    Ok(())
}

/// CONNECT/BIND/UDP request
#[derive(Debug)]
pub struct Request {
    pub command: Command,
    pub address: Address,
    pub port: u16,
}

impl Request {
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let mut header = [0u8; 3];
        reader.read_exact(&mut header).await?;

        if header[0] != SOCKS5_VERSION {
            return Err(Error::protocol(format!(
                "Unsupported SOCKS version: {}",
                header[0]
            )));
        }

        // header[2] is reserved
        let command = Command::from(header[1]);
        let (address, port) = Address::read_from(reader).await?;

        Ok(Request {
            command,
            address,
            port,
        })
    }
}

/// Reply to a request
pub struct Response {
    pub reply: u8,
    pub address: Address,
    pub port: u16,
}

impl Response {
    pub fn success(address: Address, port: u16) -> Self {
        Response {
            reply: REP_SUCCEEDED,
            address,
            port,
        }
    }

    pub fn failure(reply: u8) -> Self {
        Response {
            reply,
            address: Address::Ipv4(std::net::Ipv4Addr::UNSPECIFIED),
            port: 0,
        }
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        let mut buf = Vec::with_capacity(3 + self.address.len());
        buf.extend_from_slice(&[SOCKS5_VERSION, self.reply, 0x00]);
        buf.extend_from_slice(&self.address.to_bytes(self.port)?);
        writer.write_all(&buf).await?;
        writer.flush().await?;
        Ok(())
    }
}

/// Username/password sub-negotiation
pub struct UsernamePasswordAuth {
    pub username: String,
    pub password: String,
}

impl UsernamePasswordAuth {
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let mut version = [0u8; 1];
        reader.read_exact(&mut version).await?;

        if version[0] != USERPASS_VERSION {
            return Err(Error::protocol("Unsupported auth version"));
        }

        let mut ulen = [0u8; 1];
        reader.read_exact(&mut ulen).await?;
        let mut username = vec![0u8; ulen[0] as usize];
        reader.read_exact(&mut username).await?;

        let mut plen = [0u8; 1];
        reader.read_exact(&mut plen).await?;
        let mut password = vec![0u8; plen[0] as usize];
        reader.read_exact(&mut password).await?;

        Ok(UsernamePasswordAuth {
            username: String::from_utf8_lossy(&username).to_string(),
            password: String::from_utf8_lossy(&password).to_string(),
        })
    }

    pub async fn write_response<W: AsyncWrite + Unpin>(
        writer: &mut W,
        success: bool,
    ) -> Result<()> {
        let status = if success { 0x00 } else { 0x01 };
        writer.write_all(&[USERPASS_VERSION, status]).await?;
        Ok(())
    }
}

/// Reply code for an error that ended a SOCKS5 session before relaying
pub fn reply_code(err: &Error) -> u8 {
    match err {
        Error::AuthFailure(_) => REP_CONNECTION_NOT_ALLOWED,
        Error::QuotaExceeded(_) => REP_TTL_EXPIRED,
        Error::NoAvailableNode(_) => REP_GENERAL_FAILURE,
        Error::Target(msg) if msg.contains("refused") => REP_CONNECTION_REFUSED,
        Error::Target(msg) if msg.contains("network unreachable") => REP_NETWORK_UNREACHABLE,
        Error::Target(_) => REP_HOST_UNREACHABLE,
        Error::NodeUnreachable(_) | Error::Timeout(_) => REP_HOST_UNREACHABLE,
        _ => REP_GENERAL_FAILURE,
    }
}
