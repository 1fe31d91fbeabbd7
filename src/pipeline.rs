//! Per-request admission: config, client address, rate limit, reputation
//! gate, form binding, mailbox probe, delivery.

use crate::client_ip;
use crate::error::ContactError;
use crate::form;
use crate::rate_limit::SubmissionLimiter;
use crate::reputation::{ReputationGate, ReputationOutcome};
use crate::smtp::{ContactMessage, MailDelivery, MailboxProbe};
use crate::templates::TemplateData;
use crate::tenant_config::ConfigCache;
use axum::body::Bytes;
use axum::http::{header, HeaderMap};
use std::net::IpAddr;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub enum RequestKind {
    /// Render the empty form.
    Show,
    /// A posted form body.
    Submit(Bytes),
}

#[derive(Debug, Clone)]
pub struct ContactRequest {
    pub domain: String,
    pub peer: IpAddr,
    pub headers: HeaderMap,
    pub kind: RequestKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderStatus {
    Ok,
    TooManyRequests,
    InternalError,
}

/// What the page should show, and with which status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    pub status: RenderStatus,
    pub data: TemplateData,
}

enum Admitted {
    ShowForm,
    Delivered,
}

pub struct AdmissionPipeline {
    configs: Arc<ConfigCache>,
    reputation: Arc<ReputationGate>,
    limiter: Arc<SubmissionLimiter>,
    probe: Arc<dyn MailboxProbe>,
    delivery: Arc<dyn MailDelivery>,
}

impl AdmissionPipeline {
    pub fn new(
        configs: Arc<ConfigCache>,
        reputation: Arc<ReputationGate>,
        limiter: Arc<SubmissionLimiter>,
        probe: Arc<dyn MailboxProbe>,
        delivery: Arc<dyn MailDelivery>,
    ) -> Self {
        Self {
            configs,
            reputation,
            limiter,
            probe,
            delivery,
        }
    }

    pub fn configs(&self) -> &Arc<ConfigCache> {
        &self.configs
    }

    pub async fn handle(&self, request: ContactRequest) -> Rendered {
        let domain = request.domain.clone();
        match self.admit(request).await {
            Ok(Admitted::ShowForm) => Rendered {
                status: RenderStatus::Ok,
                data: TemplateData::form(),
            },
            Ok(Admitted::Delivered) => Rendered {
                status: RenderStatus::Ok,
                data: TemplateData::success(),
            },
            Err(e) => {
                let status = match e {
                    ContactError::ConfigResolution(ref source) => {
                        log::error!("{domain}: {e}: {source}");
                        RenderStatus::InternalError
                    }
                    ContactError::RateLimited => RenderStatus::TooManyRequests,
                    ContactError::Validation(ref reason) => {
                        log::info!("{domain}: {e}: {reason}");
                        RenderStatus::Ok
                    }
                    _ => {
                        log::warn!("{domain}: {e}");
                        RenderStatus::Ok
                    }
                };
                Rendered {
                    status,
                    data: TemplateData::error(e.to_string()),
                }
            }
        }
    }

    async fn admit(&self, request: ContactRequest) -> Result<Admitted, ContactError> {
        let config = self
            .configs
            .resolve(&request.domain)
            .await
            .map_err(ContactError::ConfigResolution)?;

        let client = client_ip::extract(&config.admission, request.peer, &request.headers);

        if matches!(request.kind, RequestKind::Submit(_)) && !self.limiter.check(client).await {
            return Err(ContactError::RateLimited);
        }

        if config.reputation.enabled {
            let address = client.to_string();
            match self.reputation.check(&config.reputation, &address).await {
                ReputationOutcome::Allow => {}
                ReputationOutcome::Block(score) => {
                    return Err(ContactError::ReputationBlocked { address, score })
                }
                ReputationOutcome::ProviderError(e) => {
                    return Err(ContactError::ReputationProvider(e))
                }
            }
        }

        let body = match request.kind {
            RequestKind::Show => return Ok(Admitted::ShowForm),
            RequestKind::Submit(body) => body,
        };

        let details = form::bind(&body).map_err(ContactError::Validation)?;

        if config.mailbox_probe.enabled {
            self.probe
                .probe(&details.email, &config.mailbox_probe)
                .await
                .map_err(ContactError::MailboxProbe)?;
        }

        let user_agent = request
            .headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let message = ContactMessage {
            details,
            remote_ip: client,
            user_agent,
        };

        self.delivery
            .deliver(&message, &config.delivery)
            .await
            .map_err(ContactError::Delivery)?;

        log::info!("{}: accepted contact message from {client}", request.domain);
        Ok(Admitted::Delivered)
    }
}
