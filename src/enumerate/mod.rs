//! Enumeration dispatch: one handler per [`EnumerationCategory`].

use async_trait::async_trait;
use tokio::time;
use tracing::debug;

use crate::config::{Settings, TimeoutSettings, WebSettings};
use crate::error::{EnumerationCause, EnumerationFailed};
use crate::tools::ToolCatalog;
use crate::types::{EnumerationCategory, EnumerationResult, Target};

pub mod database;
pub mod dns;
pub mod ftp;
pub mod probe;
pub mod smb;
pub mod ssh;
pub mod web;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumerationRequest {
    pub category: EnumerationCategory,
    pub target: Target,
    pub port: u16,
    /// Web only: also run the directory and subdomain sweeps.
    pub run_deep_tools: bool,
}

#[async_trait]
pub trait Enumerator: Send + Sync {
    async fn enumerate(&self, request: EnumerationRequest) -> Result<EnumerationResult, EnumerationFailed>;
}

/// Production dispatcher over the built-in handlers.
#[derive(Debug, Clone)]
pub struct ServiceEnumerator {
    catalog: ToolCatalog,
    timeouts: TimeoutSettings,
    web: WebSettings,
}

impl ServiceEnumerator {
    pub fn new(catalog: ToolCatalog, settings: &Settings) -> Self {
        Self {
            catalog,
            timeouts: settings.timeouts.clone(),
            web: settings.web.clone(),
        }
    }

    async fn dispatch(&self, req: &EnumerationRequest) -> Result<EnumerationResult, EnumerationCause> {
        let limit = self.timeouts.for_category(req.category, false);
        match req.category {
            EnumerationCategory::Web => {
                let probe = web::WebProbe {
                    catalog: &self.catalog,
                    settings: &self.web,
                    timeouts: &self.timeouts,
                };
                probe.enumerate(&req.target, req.port, req.run_deep_tools).await
            }
            EnumerationCategory::Ftp => ftp::enumerate(&req.target, req.port, limit).await,
            EnumerationCategory::Ssh => ssh::enumerate(&req.target, req.port, limit).await,
            EnumerationCategory::Smb => smb::enumerate(&self.catalog, &req.target, req.port, limit).await,
            EnumerationCategory::Dns => dns::enumerate(&self.catalog, &req.target, req.port, limit).await,
            EnumerationCategory::Database => database::enumerate(&req.target, req.port, limit).await,
        }
    }
}

#[async_trait]
impl Enumerator for ServiceEnumerator {
    async fn enumerate(&self, request: EnumerationRequest) -> Result<EnumerationResult, EnumerationFailed> {
        let ceiling = self
            .timeouts
            .for_category(request.category, request.run_deep_tools);
        debug!(
            category = %request.category,
            port = request.port,
            ceiling_secs = ceiling.as_secs(),
            "dispatching enumeration"
        );
        let outcome = match time::timeout(ceiling, self.dispatch(&request)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(EnumerationCause::Timeout {
                secs: ceiling.as_secs(),
            }),
        };
        match outcome {
            Ok(result) if result.is_empty() => Err(EnumerationFailed::new(
                request.category,
                request.port,
                EnumerationCause::Protocol("handler returned no findings".to_string()),
            )),
            Ok(result) => Ok(result),
            Err(cause) => Err(EnumerationFailed::new(request.category, request.port, cause)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn ssh_dispatch_through_trait() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut s, _) = listener.accept().await.unwrap();
            s.write_all(b"SSH-2.0-OpenSSH_9.6\r\n").await.unwrap();
        });

        let enumerator = ServiceEnumerator::new(ToolCatalog::default(), &Settings::default());
        let result = enumerator
            .enumerate(EnumerationRequest {
                category: EnumerationCategory::Ssh,
                target: Target::parse("127.0.0.1").unwrap(),
                port,
                run_deep_tools: false,
            })
            .await
            .unwrap();
        assert_eq!(result.get("software").unwrap(), "OpenSSH_9.6");
    }

    #[tokio::test]
    async fn missing_tool_is_an_enumeration_failure() {
        let enumerator = ServiceEnumerator::new(ToolCatalog::default(), &Settings::default());
        let err = enumerator
            .enumerate(EnumerationRequest {
                category: EnumerationCategory::Smb,
                target: Target::parse("10.0.0.5").unwrap(),
                port: 445,
                run_deep_tools: false,
            })
            .await
            .unwrap_err();
        assert_eq!(err.category, EnumerationCategory::Smb);
        assert_eq!(err.port, 445);
        assert!(!err.is_unexpected());
    }

    #[tokio::test]
    async fn silent_service_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (_s, _) = listener.accept().await.unwrap();
            time::sleep(std::time::Duration::from_secs(5)).await;
        });

        let mut settings = Settings::default();
        settings.timeouts.ssh = 1;
        let enumerator = ServiceEnumerator::new(ToolCatalog::default(), &settings);
        let err = enumerator
            .enumerate(EnumerationRequest {
                category: EnumerationCategory::Ssh,
                target: Target::parse("127.0.0.1").unwrap(),
                port,
                run_deep_tools: false,
            })
            .await
            .unwrap_err();
        assert!(matches!(err.cause, EnumerationCause::Timeout { secs: 1 }));
    }
}
