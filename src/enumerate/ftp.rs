use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::debug;

use super::probe;
use crate::error::EnumerationCause;
use crate::types::{EnumerationResult, Target};

/// Grab the greeting and test anonymous login.
pub async fn enumerate(target: &Target, port: u16, limit: Duration) -> Result<EnumerationResult, EnumerationCause> {
    let stream = probe::connect(target, port, limit).await?;
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let (code, banner) = read_reply(&mut reader, limit).await?;
    if code != 220 {
        return Err(EnumerationCause::Protocol(format!("expected 220 greeting, got {code} {banner}")));
    }
    let mut result = EnumerationResult::new().with("banner", banner);

    let (code, _) = command(&mut reader, &mut write_half, "USER anonymous", limit).await?;
    let logged_in = match code {
        230 => true,
        331 | 332 => {
            let (code, _) = command(&mut reader, &mut write_half, "PASS anonymous@", limit).await?;
            code == 230
        }
        _ => false,
    };
    result.insert("anonymous_login", logged_in);

    if logged_in {
        let (code, text) = command(&mut reader, &mut write_half, "SYST", limit).await?;
        if code == 215 {
            result.insert("system", text);
        }
        let (code, text) = command(&mut reader, &mut write_half, "PWD", limit).await?;
        if code == 257 {
            result.insert("working_directory", text);
        }
    }

    // Best effort; some servers drop the connection first.
    if let Err(e) = command(&mut reader, &mut write_half, "QUIT", limit).await {
        debug!(error = %e, "ftp quit failed");
    }
    Ok(result)
}

async fn command<R, W>(reader: &mut R, writer: &mut W, line: &str, limit: Duration) -> Result<(u16, String), EnumerationCause>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    writer
        .write_all(format!("{line}\r\n").as_bytes())
        .await
        .map_err(EnumerationCause::Connect)?;
    read_reply(reader, limit).await
}

/// Read one reply, following `123-` continuation lines to the closing `123 `.
pub async fn read_reply<R>(reader: &mut R, limit: Duration) -> Result<(u16, String), EnumerationCause>
where
    R: AsyncBufRead + Unpin,
{
    let first = probe::read_line(reader, limit).await?;
    let code = reply_code(&first)
        .ok_or_else(|| EnumerationCause::Protocol(format!("not an FTP reply: {first}")))?;
    let mut text = vec![first[3..].trim_start_matches(['-', ' ']).to_string()];

    if first.as_bytes().get(3) == Some(&b'-') {
        let closing = format!("{code} ");
        loop {
            let line = probe::read_line(reader, limit).await?;
            if line.starts_with(&closing) || line == code.to_string() {
                text.push(line[3..].trim().to_string());
                break;
            }
            text.push(line.trim().to_string());
        }
    }

    text.retain(|t| !t.is_empty());
    Ok((code, text.join(" | ")))
}

fn reply_code(line: &str) -> Option<u16> {
    let digits = line.get(..3)?;
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncBufReadExt;
    use tokio::net::TcpListener;

    async fn serve(script: Vec<(&'static str, &'static str)>, greeting: &'static [u8]) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (r, mut w) = stream.into_split();
            let mut r = BufReader::new(r);
            w.write_all(greeting).await.unwrap();
            for (expect, reply) in script {
                let mut line = String::new();
                if r.read_line(&mut line).await.unwrap() == 0 {
                    return;
                }
                assert!(line.starts_with(expect), "got {line:?}, expected {expect}");
                w.write_all(reply.as_bytes()).await.unwrap();
            }
        });
        port
    }

    #[tokio::test]
    async fn anonymous_login_accepted() {
        let port = serve(
            vec![
                ("USER anonymous", "331 Please specify the password.\r\n"),
                ("PASS", "230 Login successful.\r\n"),
                ("SYST", "215 UNIX Type: L8\r\n"),
                ("PWD", "257 \"/\" is the current directory\r\n"),
                ("QUIT", "221 Goodbye.\r\n"),
            ],
            b"220-Welcome\r\n220 (vsFTPd 3.0.3)\r\n",
        )
        .await;
        let target = Target::parse("127.0.0.1").unwrap();
        let result = enumerate(&target, port, Duration::from_secs(2)).await.unwrap();
        assert_eq!(result.get("banner").unwrap(), "Welcome | (vsFTPd 3.0.3)");
        assert_eq!(result.get("anonymous_login").unwrap(), true);
        assert_eq!(result.get("system").unwrap(), "UNIX Type: L8");
    }

    #[tokio::test]
    async fn anonymous_login_refused() {
        let port = serve(
            vec![
                ("USER anonymous", "331 Password required\r\n"),
                ("PASS", "530 Login incorrect.\r\n"),
                ("QUIT", "221 Bye\r\n"),
            ],
            b"220 ProFTPD Server ready.\r\n",
        )
        .await;
        let target = Target::parse("127.0.0.1").unwrap();
        let result = enumerate(&target, port, Duration::from_secs(2)).await.unwrap();
        assert_eq!(result.get("anonymous_login").unwrap(), false);
        assert!(result.get("system").is_none());
    }

    #[tokio::test]
    async fn non_ftp_greeting_is_rejected() {
        let port = serve(vec![], b"SSH-2.0-OpenSSH_9.0\r\n").await;
        let target = Target::parse("127.0.0.1").unwrap();
        let err = enumerate(&target, port, Duration::from_secs(2)).await.unwrap_err();
        assert!(matches!(err, EnumerationCause::Protocol(_)));
    }

    #[tokio::test]
    async fn latin1_greeting_is_kept() {
        let port = serve(
            vec![
                ("USER anonymous", "530 Non autoris\u{e9}\r\n"),
                ("QUIT", "221 Au revoir\r\n"),
            ],
            b"220 Bienvenue sur le serveur \xe9t\xe9\r\n",
        )
        .await;
        let target = Target::parse("127.0.0.1").unwrap();
        let result = enumerate(&target, port, Duration::from_secs(2)).await.unwrap();
        assert_eq!(
            result.get("banner").unwrap(),
            "Bienvenue sur le serveur \u{fffd}t\u{fffd}"
        );
        assert_eq!(result.get("anonymous_login").unwrap(), false);
    }
}
