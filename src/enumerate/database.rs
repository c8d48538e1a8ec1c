//! Unauthenticated handshake probes for common database servers.

use serde_json::Value;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use super::probe;
use crate::error::EnumerationCause;
use crate::types::{EnumerationResult, Target};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Engine {
    Mssql,
    Mysql,
    Postgresql,
    Unknown,
}

impl Engine {
    pub fn for_port(port: u16) -> Self {
        match port {
            1433 => Self::Mssql,
            3306 => Self::Mysql,
            5432 => Self::Postgresql,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mssql => "mssql",
            Self::Mysql => "mysql",
            Self::Postgresql => "postgresql",
            Self::Unknown => "unknown",
        }
    }
}

/// Cap on how long an unknown service gets to volunteer a banner.
const BANNER_WINDOW: Duration = Duration::from_secs(3);

pub async fn enumerate(target: &Target, port: u16, limit: Duration) -> Result<EnumerationResult, EnumerationCause> {
    let engine = Engine::for_port(port);
    let mut stream = probe::connect(target, port, limit).await?;
    let result = EnumerationResult::new().with("engine", engine.as_str());

    let findings = match engine {
        Engine::Mysql => mysql(&mut stream, limit).await?,
        Engine::Postgresql => postgres(&mut stream, limit).await?,
        Engine::Mssql => mssql(&mut stream, limit).await?,
        Engine::Unknown => banner(&mut stream, limit.min(BANNER_WINDOW)).await?,
    };
    Ok(findings.into_iter().fold(result, |acc, (k, v)| acc.with(k, v)))
}

type Findings = Vec<(&'static str, Value)>;

async fn mysql<S>(stream: &mut S, limit: Duration) -> Result<Findings, EnumerationCause>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let greeting = probe::read_some(stream, 1024, limit).await?;
    Ok(match parse_mysql_greeting(&greeting)? {
        MysqlGreeting::Handshake { protocol, version } => {
            vec![("protocol_version", protocol.into()), ("version", version.into())]
        }
        MysqlGreeting::Error { code, message } => {
            vec![("error_code", code.into()), ("error", message.into())]
        }
    })
}

async fn postgres<S>(stream: &mut S, limit: Duration) -> Result<Findings, EnumerationCause>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream
        .write_all(&POSTGRES_SSL_REQUEST)
        .await
        .map_err(EnumerationCause::Connect)?;
    let reply = probe::read_some(stream, 1, limit).await?;
    let ssl = match reply.first() {
        Some(b'S') => true,
        Some(b'N') => false,
        other => {
            return Err(EnumerationCause::Protocol(format!(
                "unexpected SSLRequest reply: {other:?}"
            )))
        }
    };
    Ok(vec![("ssl_supported", ssl.into())])
}

async fn mssql<S>(stream: &mut S, limit: Duration) -> Result<Findings, EnumerationCause>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream
        .write_all(&mssql_prelogin())
        .await
        .map_err(EnumerationCause::Connect)?;
    let reply = probe::read_some(stream, 4096, limit).await?;
    let info = parse_mssql_prelogin(&reply)?;
    let mut out = vec![("encryption", info.encryption.unwrap_or("unknown").into())];
    if let Some(v) = info.version {
        out.push(("version", v.into()));
    }
    Ok(out)
}

/// Whatever an unrecognised service volunteers within `window`.
async fn banner<S>(stream: &mut S, window: Duration) -> Result<Findings, EnumerationCause>
where
    S: AsyncRead + Unpin,
{
    let banner = match probe::read_some(stream, 1024, window).await {
        Ok(bytes) if !bytes.is_empty() => Value::from(probe::printable(&bytes)),
        Ok(_) | Err(EnumerationCause::Timeout { .. }) => Value::Null,
        Err(e) => return Err(e),
    };
    Ok(vec![("banner", banner)])
}

#[derive(Debug, PartialEq, Eq)]
pub enum MysqlGreeting {
    Handshake { protocol: u8, version: String },
    Error { code: u16, message: String },
}

/// Decode the first server packet: a v10 handshake or an ERR packet
/// (for example "Host ... is not allowed to connect").
pub fn parse_mysql_greeting(packet: &[u8]) -> Result<MysqlGreeting, EnumerationCause> {
    if packet.len() < 5 {
        return Err(EnumerationCause::Protocol("short MySQL greeting".to_string()));
    }
    let payload = &packet[4..];
    match payload[0] {
        0xff => {
            let code = payload
                .get(1..3)
                .map(|b| u16::from_le_bytes([b[0], b[1]]))
                .unwrap_or(0);
            let mut msg = payload.get(3..).unwrap_or(&[]);
            if msg.first() == Some(&b'#') && msg.len() >= 6 {
                msg = &msg[6..];
            }
            Ok(MysqlGreeting::Error {
                code,
                message: String::from_utf8_lossy(msg).trim().to_string(),
            })
        }
        protocol @ (9 | 10) => {
            let rest = &payload[1..];
            let end = rest.iter().position(|b| *b == 0).unwrap_or(rest.len());
            Ok(MysqlGreeting::Handshake {
                protocol,
                version: String::from_utf8_lossy(&rest[..end]).to_string(),
            })
        }
        other => Err(EnumerationCause::Protocol(format!(
            "unknown MySQL protocol version {other}"
        ))),
    }
}

/// Length 8, code 80877103.
pub const POSTGRES_SSL_REQUEST: [u8; 8] = [0x00, 0x00, 0x00, 0x08, 0x04, 0xd2, 0x16, 0x2f];

const TDS_PRELOGIN: u8 = 0x12;
const TDS_RESPONSE: u8 = 0x04;
const PL_VERSION: u8 = 0x00;
const PL_ENCRYPTION: u8 = 0x01;
const PL_TERMINATOR: u8 = 0xff;

/// PRELOGIN packet carrying VERSION and ENCRYPTION (not supported) options.
pub fn mssql_prelogin() -> Vec<u8> {
    // two 5-byte option tokens plus the terminator
    let data_start: u16 = 11;
    let mut payload = vec![
        PL_VERSION,
        (data_start >> 8) as u8,
        data_start as u8,
        0x00,
        0x06,
        PL_ENCRYPTION,
        ((data_start + 6) >> 8) as u8,
        (data_start + 6) as u8,
        0x00,
        0x01,
        PL_TERMINATOR,
    ];
    payload.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
    payload.push(0x02);

    let len = (payload.len() + 8) as u16;
    let mut packet = vec![TDS_PRELOGIN, 0x01, (len >> 8) as u8, len as u8, 0, 0, 0x01, 0x00];
    packet.extend_from_slice(&payload);
    packet
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct MssqlInfo {
    pub version: Option<String>,
    pub encryption: Option<&'static str>,
}

pub fn parse_mssql_prelogin(packet: &[u8]) -> Result<MssqlInfo, EnumerationCause> {
    if packet.len() < 9 || packet[0] != TDS_RESPONSE {
        return Err(EnumerationCause::Protocol("not a TDS response".to_string()));
    }
    let payload = &packet[8..];
    let mut info = MssqlInfo::default();
    let mut idx = 0;
    while let Some(&token) = payload.get(idx) {
        if token == PL_TERMINATOR {
            break;
        }
        let Some(hdr) = payload.get(idx + 1..idx + 5) else {
            break;
        };
        let offset = u16::from_be_bytes([hdr[0], hdr[1]]) as usize;
        let len = u16::from_be_bytes([hdr[2], hdr[3]]) as usize;
        let data = payload.get(offset..offset + len);
        match (token, data) {
            (PL_VERSION, Some(v)) if v.len() >= 4 => {
                let build = u16::from_be_bytes([v[2], v[3]]);
                info.version = Some(format!("{}.{}.{}", v[0], v[1], build));
            }
            (PL_ENCRYPTION, Some(v)) if !v.is_empty() => {
                info.encryption = Some(match v[0] {
                    0x00 => "off",
                    0x01 => "on",
                    0x02 => "not_supported",
                    0x03 => "required",
                    _ => "unknown",
                });
            }
            _ => {}
        }
        idx += 5;
    }
    Ok(info)
}
