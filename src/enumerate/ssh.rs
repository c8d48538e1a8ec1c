use std::time::Duration;
use tokio::io::BufReader;

use super::probe;
use crate::error::EnumerationCause;
use crate::types::{EnumerationResult, Target};

/// Servers may send other lines before the identification string (RFC 4253 4.2).
const MAX_PRELUDE_LINES: usize = 10;

pub async fn enumerate(target: &Target, port: u16, limit: Duration) -> Result<EnumerationResult, EnumerationCause> {
    let stream = probe::connect(target, port, limit).await?;
    let mut reader = BufReader::new(stream);

    for _ in 0..MAX_PRELUDE_LINES {
        let line = probe::read_line(&mut reader, limit).await?;
        if let Some(id) = parse_identification(&line) {
            return Ok(id.into_result(&line));
        }
    }
    Err(EnumerationCause::Protocol(
        "no SSH identification string received".to_string(),
    ))
}

#[derive(Debug, PartialEq, Eq)]
pub struct Identification<'a> {
    pub protocol_version: &'a str,
    pub software: &'a str,
    pub comments: Option<&'a str>,
}

impl Identification<'_> {
    /// SSH-1.x, or 1.99 which still accepts protocol 1 clients.
    pub fn legacy_protocol(&self) -> bool {
        self.protocol_version.starts_with("1.")
    }

    fn into_result(self, banner: &str) -> EnumerationResult {
        let mut result = EnumerationResult::new()
            .with("banner", banner)
            .with("protocol_version", self.protocol_version)
            .with("software", self.software)
            .with("legacy_protocol", self.legacy_protocol());
        if let Some(c) = self.comments {
            result.insert("comments", c);
        }
        result
    }
}

/// Parse `SSH-protoversion-softwareversion SP comments`.
pub fn parse_identification(line: &str) -> Option<Identification<'_>> {
    let rest = line.strip_prefix("SSH-")?;
    let (protocol_version, rest) = rest.split_once('-')?;
    let (software, comments) = match rest.split_once(' ') {
        Some((s, c)) => (s, Some(c.trim()).filter(|c| !c.is_empty())),
        None => (rest.trim(), None),
    };
    Some(Identification {
        protocol_version,
        software,
        comments,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    #[test]
    fn parses_openssh_banner() {
        let id = parse_identification("SSH-2.0-OpenSSH_8.2p1 Ubuntu-4ubuntu0.5").unwrap();
        assert_eq!(id.protocol_version, "2.0");
        assert_eq!(id.software, "OpenSSH_8.2p1");
        assert_eq!(id.comments, Some("Ubuntu-4ubuntu0.5"));
        assert!(!id.legacy_protocol());
    }

    #[test]
    fn legacy_and_invalid_banners() {
        assert!(parse_identification("SSH-1.99-Cisco-1.25").unwrap().legacy_protocol());
        assert!(parse_identification("220 ftp ready").is_none());
        assert!(parse_identification("SSH-2.0").is_none());
    }

    #[tokio::test]
    async fn reads_banner_after_prelude() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream
                .write_all(b"Authorized use only\r\nSSH-2.0-dropbear_2022.83\r\n")
                .await
                .unwrap();
        });

        let target = Target::parse("127.0.0.1").unwrap();
        let result = enumerate(&target, port, Duration::from_secs(2)).await.unwrap();
        assert_eq!(result.get("software").unwrap(), "dropbear_2022.83");
        assert_eq!(result.get("banner").unwrap(), "SSH-2.0-dropbear_2022.83");
        assert!(result.get("comments").is_none());
    }

    #[tokio::test]
    async fn latin1_prelude_is_skipped() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream
                .write_all(b"Acc\xe8s r\xe9serv\xe9\r\nSSH-2.0-OpenSSH_9.6\r\n")
                .await
                .unwrap();
        });

        let target = Target::parse("127.0.0.1").unwrap();
        let result = enumerate(&target, port, Duration::from_secs(2)).await.unwrap();
        assert_eq!(result.get("software").unwrap(), "OpenSSH_9.6");
    }
}
