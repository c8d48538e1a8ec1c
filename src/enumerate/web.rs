//! HTTP(S) fingerprinting plus the optional directory and subdomain sweeps.

use serde_json::{json, Value};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};
use x509_parser::extensions::GeneralName;

use super::probe;
use crate::config::{TimeoutSettings, WebSettings};
use crate::error::EnumerationCause;
use crate::tools::{self, ToolCatalog, ToolInvocation, FEROXBUSTER, SUBLIST3R};
use crate::types::{EnumerationResult, Target};

const MAX_RESPONSE: usize = 64 * 1024;

pub fn scheme_for_port(port: u16) -> &'static str {
    match port {
        443 | 8443 => "https",
        _ => "http",
    }
}

pub struct WebProbe<'a> {
    pub catalog: &'a ToolCatalog,
    pub settings: &'a WebSettings,
    pub timeouts: &'a TimeoutSettings,
}

impl WebProbe<'_> {
    pub async fn enumerate(
        &self,
        target: &Target,
        port: u16,
        deep: bool,
    ) -> Result<EnumerationResult, EnumerationCause> {
        let limit = Duration::from_secs(self.timeouts.web.max(1));
        let scheme = scheme_for_port(port);
        let url = format!("{scheme}://{}:{port}/", target.host_for_url());
        let host_header = format!("{}:{port}", target.host_for_url());

        let mut stream = probe::connect(target, port, limit).await?;
        let (raw, tls) = if scheme == "https" {
            let mut tls = tls_connect(target, stream).await?;
            let cert = certificate_details(&tls);
            (http_get(&mut tls, &host_header, limit).await?, cert)
        } else {
            (http_get(&mut stream, &host_header, limit).await?, Value::Null)
        };
        let response = parse_response(&raw)?;

        let mut result = EnumerationResult::new()
            .with("url", url.as_str())
            .with("status", response.status)
            .with("server", response.header("server"))
            .with("powered_by", response.header("x-powered-by"))
            .with("content_type", response.header("content-type"))
            .with("title", response.title.clone())
            .with("tls", tls);

        if deep {
            let mut notes = Vec::new();
            match self.feroxbuster(&url).await {
                Ok(paths) => result.insert("discovered_paths", paths),
                Err(e) => {
                    warn!(port, error = %e, "directory brute-force failed");
                    notes.push(format!("{FEROXBUSTER}: {e}"));
                }
            }
            if target.is_hostname() {
                match self.sublist3r(target).await {
                    Ok(subs) => result.insert("subdomains", subs),
                    Err(e) => {
                        warn!(port, error = %e, "subdomain enumeration failed");
                        notes.push(format!("{SUBLIST3R}: {e}"));
                    }
                }
            } else {
                debug!(target = %target, "skipping subdomain enumeration for an address");
            }
            if !notes.is_empty() {
                result.insert("notes", notes);
            }
        }
        Ok(result)
    }

    async fn feroxbuster(&self, url: &str) -> Result<Vec<String>, EnumerationCause> {
        let program = self.catalog.require(FEROXBUSTER)?;
        let mut inv = ToolInvocation::new(FEROXBUSTER, program)
            .arg("-u")
            .arg(url)
            .arg("-t")
            .arg(self.settings.threads.max(1).to_string())
            .arg("--silent");
        if let Some(w) = &self.settings.wordlist {
            inv = inv.arg("-w").arg(w.display().to_string());
        }
        let out = tools::run(&inv, Duration::from_secs(self.timeouts.feroxbuster.max(1)))
            .await?
            .require_success(FEROXBUSTER)?;
        Ok(parse_feroxbuster(&out.stdout))
    }

    async fn sublist3r(&self, target: &Target) -> Result<Vec<String>, EnumerationCause> {
        let program = self.catalog.require(SUBLIST3R)?;
        let inv = ToolInvocation::new(SUBLIST3R, program)
            .arg("-d")
            .arg(target.as_str())
            .arg("-n");
        let out = tools::run(&inv, Duration::from_secs(self.timeouts.sublist3r.max(1)))
            .await?
            .require_success(SUBLIST3R)?;
        Ok(parse_sublist3r(&out.stdout, target.as_str()))
    }
}

async fn tls_connect<S>(
    target: &Target,
    stream: S,
) -> Result<tokio_native_tls::TlsStream<S>, EnumerationCause>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Scanning: accept whatever the server presents.
    let connector = native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(true)
        .danger_accept_invalid_hostnames(true)
        .use_sni(target.is_hostname())
        .build()
        .map_err(|e| EnumerationCause::Protocol(format!("tls setup failed: {e}")))?;
    let domain = target.as_str().trim_matches(['[', ']']);
    tokio_native_tls::TlsConnector::from(connector)
        .connect(domain, stream)
        .await
        .map_err(|e| EnumerationCause::Protocol(format!("tls handshake failed: {e}")))
}

fn certificate_details<S>(stream: &tokio_native_tls::TlsStream<S>) -> Value
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let der = match stream.get_ref().peer_certificate() {
        Ok(Some(cert)) => cert.to_der(),
        Ok(None) => return json!({ "certificate": null }),
        Err(e) => Err(e),
    };
    match der {
        Ok(der) => describe_certificate(&der),
        Err(e) => {
            debug!(error = %e, "peer certificate unavailable");
            json!({ "certificate": null })
        }
    }
}

/// Subject, issuer, validity window and DNS names of a DER certificate.
pub fn describe_certificate(der: &[u8]) -> Value {
    let cert = match x509_parser::parse_x509_certificate(der) {
        Ok((_, cert)) => cert,
        Err(e) => {
            debug!(error = %e, "unparseable peer certificate");
            return json!({ "certificate": null });
        }
    };
    let dns_names: Vec<String> = match cert.subject_alternative_name() {
        Ok(Some(san)) => san
            .value
            .general_names
            .iter()
            .filter_map(|n| match n {
                GeneralName::DNSName(d) => Some(d.to_string()),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    };
    let validity = cert.validity();
    json!({
        "subject": cert.subject().to_string(),
        "issuer": cert.issuer().to_string(),
        "not_before": validity.not_before.to_string(),
        "not_after": validity.not_after.to_string(),
        "dns_names": dns_names,
    })
}

async fn http_get<S>(stream: &mut S, host: &str, limit: Duration) -> Result<Vec<u8>, EnumerationCause>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = format!(
        "GET / HTTP/1.0\r\nHost: {host}\r\nUser-Agent: recon-rs\r\nConnection: close\r\n\r\n"
    );
    stream
        .write_all(request.as_bytes())
        .await
        .map_err(EnumerationCause::Connect)?;
    probe::read_to_limit(stream, MAX_RESPONSE, limit).await
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct HttpSummary {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub title: Option<String>,
}

impl HttpSummary {
    /// First value of a header, case-insensitively.
    pub fn header(&self, name: &str) -> Option<String> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.clone())
    }
}

pub fn parse_response(raw: &[u8]) -> Result<HttpSummary, EnumerationCause> {
    let text = String::from_utf8_lossy(raw);
    let text: &str = &text;
    let (head, body) = text
        .split_once("\r\n\r\n")
        .or_else(|| text.split_once("\n\n"))
        .unwrap_or((text, ""));
    let mut lines = head.lines();
    let status_line = lines.next().unwrap_or_default();
    let status = status_line
        .strip_prefix("HTTP/")
        .and_then(|rest| rest.split_whitespace().nth(1))
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| {
            EnumerationCause::Protocol(format!("not an HTTP response: {}", probe::printable(status_line.as_bytes())))
        })?;
    let headers = lines
        .filter_map(|l| l.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect();
    Ok(HttpSummary {
        status,
        headers,
        title: extract_title(body),
    })
}

fn extract_title(body: &str) -> Option<String> {
    let lower = body.to_ascii_lowercase();
    let open = lower.find("<title")?;
    let start = open + lower[open..].find('>')? + 1;
    let end = start + lower[start..].find("</title")?;
    let title = body[start..end].split_whitespace().collect::<Vec<_>>().join(" ");
    (!title.is_empty()).then_some(title)
}

/// URLs from `feroxbuster --silent`, one hit per line.
pub fn parse_feroxbuster(out: &str) -> Vec<String> {
    let mut paths: Vec<String> = Vec::new();
    for line in out.lines() {
        let hit = line
            .split_whitespace()
            .rev()
            .find(|tok| tok.starts_with("http://") || tok.starts_with("https://"));
        if let Some(url) = hit {
            if !paths.iter().any(|p| p == url) {
                paths.push(url.to_string());
            }
        }
    }
    paths
}

/// Names under `domain` from sublist3r's listing, in first-seen order.
pub fn parse_sublist3r(out: &str, domain: &str) -> Vec<String> {
    let suffix = format!(".{}", domain.to_ascii_lowercase());
    let mut subs: Vec<String> = Vec::new();
    for line in out.lines() {
        let name = line.trim().to_ascii_lowercase();
        if name.contains(char::is_whitespace) || !name.ends_with(&suffix) {
            continue;
        }
        if !subs.contains(&name) {
            subs.push(name);
        }
    }
    subs
}
