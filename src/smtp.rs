//! Outbound SMTP: mailbox existence probing and contact message delivery.

use crate::error::{DeliveryError, ProbeError};
use crate::form::ContactDetails;
use crate::tenant_config::{MailboxProbeConfig, SmtpDelivery};
use crate::BoxFuture;
use hickory_resolver::TokioAsyncResolver;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::{Address, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MxRecord {
    pub preference: u16,
    pub exchange: String,
}

pub trait MxResolver: Send + Sync {
    fn lookup_mx<'a>(&'a self, domain: &'a str) -> BoxFuture<'a, Result<Vec<MxRecord>, String>>;
}

/// MX lookups through the system resolver configuration.
pub struct SystemResolver {
    resolver: TokioAsyncResolver,
}

impl SystemResolver {
    pub fn from_system_conf() -> anyhow::Result<Self> {
        Ok(Self {
            resolver: TokioAsyncResolver::tokio_from_system_conf()?,
        })
    }
}

impl MxResolver for SystemResolver {
    fn lookup_mx<'a>(&'a self, domain: &'a str) -> BoxFuture<'a, Result<Vec<MxRecord>, String>> {
        Box::pin(async move {
            let lookup = self
                .resolver
                .mx_lookup(domain)
                .await
                .map_err(|e| e.to_string())?;

            Ok(lookup
                .iter()
                .map(|mx| MxRecord {
                    preference: mx.preference(),
                    exchange: mx.exchange().to_utf8().trim_end_matches('.').to_string(),
                })
                .collect())
        })
    }
}

/// Checks that a mailbox exists before a message claiming it is accepted.
pub trait MailboxProbe: Send + Sync {
    fn probe<'a>(
        &'a self,
        email: &'a str,
        config: &'a MailboxProbeConfig,
    ) -> BoxFuture<'a, Result<(), ProbeError>>;
}

pub struct SmtpMailboxProbe {
    resolver: Arc<dyn MxResolver>,
    port: u16,
    timeout: Duration,
}

impl SmtpMailboxProbe {
    pub fn new(resolver: Arc<dyn MxResolver>, port: u16, timeout: Duration) -> Self {
        Self {
            resolver,
            port,
            timeout,
        }
    }

    async fn exchange_for(&self, domain: &str) -> Result<String, ProbeError> {
        let mut records = self
            .resolver
            .lookup_mx(domain)
            .await
            .map_err(|reason| ProbeError::MxLookup {
                domain: domain.to_string(),
                reason,
            })?;

        records.sort_by_key(|r| r.preference);
        records
            .into_iter()
            .next()
            .map(|r| r.exchange)
            .ok_or_else(|| ProbeError::MxLookup {
                domain: domain.to_string(),
                reason: "no MX records found".to_string(),
            })
    }
}

impl MailboxProbe for SmtpMailboxProbe {
    fn probe<'a>(
        &'a self,
        email: &'a str,
        config: &'a MailboxProbeConfig,
    ) -> BoxFuture<'a, Result<(), ProbeError>> {
        Box::pin(async move {
            let domain = email_domain(email).ok_or(ProbeError::InvalidAddress)?;
            let exchange = self.exchange_for(domain).await?;
            let addr = format!("{exchange}:{}", self.port);
            log::debug!("Probing mailbox {email} via {addr}");

            let stream = timeout(self.timeout, TcpStream::connect(&addr))
                .await
                .map_err(|_| ProbeError::Timeout { stage: "connect" })?
                .map_err(|e| ProbeError::Connect {
                    addr: addr.clone(),
                    reason: e.to_string(),
                })?;

            timeout(
                self.timeout,
                handshake(stream, &config.helo, &config.from, email),
            )
            .await
            .map_err(|_| ProbeError::Timeout { stage: "handshake" })?
        })
    }
}

fn email_domain(email: &str) -> Option<&str> {
    let mut parts = email.split('@');
    let (_, domain) = (parts.next()?, parts.next()?);
    if parts.next().is_some() || domain.is_empty() {
        return None;
    }
    Some(domain)
}

/// Run greeting, HELO, MAIL FROM, RCPT TO and QUIT over `stream`.
pub async fn handshake<S>(stream: S, helo: &str, from: &str, rcpt: &str) -> Result<(), ProbeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut conn = BufReader::new(stream);

    let (code, reply) = read_reply(&mut conn, "greeting").await?;
    if code != 220 {
        return Err(ProbeError::Rejected {
            stage: "greeting",
            reply,
        });
    }

    command(&mut conn, "HELO", &format!("HELO {helo}"), &[250]).await?;
    command(&mut conn, "MAIL FROM", &format!("MAIL FROM:<{from}>"), &[250]).await?;
    command(&mut conn, "RCPT TO", &format!("RCPT TO:<{rcpt}>"), &[250, 251]).await?;
    command(&mut conn, "QUIT", "QUIT", &[221]).await?;
    Ok(())
}

async fn command<S>(
    conn: &mut BufReader<S>,
    stage: &'static str,
    line: &str,
    accept: &[u16],
) -> Result<(), ProbeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    conn.write_all(format!("{line}\r\n").as_bytes())
        .await
        .map_err(|source| ProbeError::Io { stage, source })?;
    conn.flush()
        .await
        .map_err(|source| ProbeError::Io { stage, source })?;

    let (code, reply) = read_reply(conn, stage).await?;
    if accept.contains(&code) {
        Ok(())
    } else {
        Err(ProbeError::Rejected { stage, reply })
    }
}

/// Read one reply, following `250-` continuation lines.
async fn read_reply<S>(conn: &mut BufReader<S>, stage: &'static str) -> Result<(u16, String), ProbeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut lines = Vec::new();
    loop {
        let mut line = String::new();
        let read = conn
            .read_line(&mut line)
            .await
            .map_err(|source| ProbeError::Io { stage, source })?;
        if read == 0 {
            return Err(ProbeError::Io {
                stage,
                source: std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed by server",
                ),
            });
        }

        let line = line.trim_end().to_string();
        let code = line
            .get(..3)
            .and_then(|c| c.parse::<u16>().ok())
            .ok_or_else(|| ProbeError::Rejected {
                stage,
                reply: line.clone(),
            })?;
        let more = line.as_bytes().get(3) == Some(&b'-');
        lines.push(line);

        if !more {
            return Ok((code, lines.join("\n")));
        }
    }
}

/// A bound, validated submission plus where it came from.
#[derive(Debug, Clone)]
pub struct ContactMessage {
    pub details: ContactDetails,
    pub remote_ip: IpAddr,
    pub user_agent: String,
}

impl ContactMessage {
    pub fn body(&self) -> String {
        format!(
            "{}\n\n\n---\n{}\n{}\n",
            self.details.message, self.remote_ip, self.user_agent
        )
    }
}

pub trait MailDelivery: Send + Sync {
    fn deliver<'a>(
        &'a self,
        message: &'a ContactMessage,
        relay: &'a SmtpDelivery,
    ) -> BoxFuture<'a, Result<(), DeliveryError>>;
}

/// Hands messages to the tenant's relay over plain SMTP.
#[derive(Debug, Default)]
pub struct RelayDelivery;

pub fn build_message(message: &ContactMessage, recipient: &str) -> Result<Message, DeliveryError> {
    let details = &message.details;
    let from_address: Address = details.email.parse().map_err(|e: lettre::address::AddressError| {
        DeliveryError::Address {
            address: details.email.clone(),
            reason: e.to_string(),
        }
    })?;
    let name = (!details.name.is_empty()).then(|| details.name.clone());
    let to: Mailbox = recipient.parse().map_err(|e: lettre::address::AddressError| {
        DeliveryError::Address {
            address: recipient.to_string(),
            reason: e.to_string(),
        }
    })?;

    Message::builder()
        .from(Mailbox::new(name, from_address))
        .to(to)
        .subject(details.subject.clone())
        .date_now()
        .header(ContentType::TEXT_PLAIN)
        .body(message.body())
        .map_err(|e| DeliveryError::Message(e.to_string()))
}

impl MailDelivery for RelayDelivery {
    fn deliver<'a>(
        &'a self,
        message: &'a ContactMessage,
        relay: &'a SmtpDelivery,
    ) -> BoxFuture<'a, Result<(), DeliveryError>> {
        Box::pin(async move {
            let email = build_message(message, &relay.recipient)?;

            let transport = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(relay.host.as_str())
                .port(relay.port)
                .build();

            transport
                .send(email)
                .await
                .map_err(|e| DeliveryError::Relay(e.to_string()))?;

            log::info!(
                "Delivered contact message from {} to {} via {}:{}",
                message.details.email,
                relay.recipient,
                relay.host,
                relay.port
            );
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, DuplexStream};
    use tokio::net::TcpListener;

    async fn expect_line(conn: &mut BufReader<DuplexStream>, prefix: &str) {
        let mut line = String::new();
        conn.read_line(&mut line).await.unwrap();
        assert!(line.starts_with(prefix), "expected {prefix:?}, got {line:?}");
    }

    async fn send(conn: &mut BufReader<DuplexStream>, reply: &str) {
        conn.write_all(reply.as_bytes()).await.unwrap();
        conn.flush().await.unwrap();
    }

    #[tokio::test]
    async fn test_handshake_accepts_mailbox() {
        let (client, server) = duplex(4096);
        let server = tokio::spawn(async move {
            let mut conn = BufReader::new(server);
            send(&mut conn, "220 mx.example.com ESMTP\r\n").await;
            expect_line(&mut conn, "HELO probe.example.org").await;
            send(&mut conn, "250-mx.example.com\r\n250 SIZE 1000\r\n").await;
            expect_line(&mut conn, "MAIL FROM:<check@example.org>").await;
            send(&mut conn, "250 ok\r\n").await;
            expect_line(&mut conn, "RCPT TO:<jane@example.com>").await;
            send(&mut conn, "251 will forward\r\n").await;
            expect_line(&mut conn, "QUIT").await;
            send(&mut conn, "221 bye\r\n").await;
        });

        handshake(client, "probe.example.org", "check@example.org", "jane@example.com")
            .await
            .unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_handshake_rejected_recipient() {
        let (client, server) = duplex(4096);
        tokio::spawn(async move {
            let mut conn = BufReader::new(server);
            send(&mut conn, "220 ready\r\n").await;
            expect_line(&mut conn, "HELO").await;
            send(&mut conn, "250 hi\r\n").await;
            expect_line(&mut conn, "MAIL FROM").await;
            send(&mut conn, "250 ok\r\n").await;
            expect_line(&mut conn, "RCPT TO").await;
            send(&mut conn, "550 5.1.1 no such user\r\n").await;
        });

        let err = handshake(client, "h", "f@example.org", "nobody@example.com")
            .await
            .unwrap_err();
        match err {
            ProbeError::Rejected { stage, reply } => {
                assert_eq!(stage, "RCPT TO");
                assert!(reply.contains("no such user"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_handshake_bad_greeting_and_hangup() {
        let (client, server) = duplex(1024);
        tokio::spawn(async move {
            let mut conn = BufReader::new(server);
            send(&mut conn, "554 go away\r\n").await;
        });
        assert!(matches!(
            handshake(client, "h", "f@x.org", "r@y.org").await,
            Err(ProbeError::Rejected { stage: "greeting", .. })
        ));

        let (client, server) = duplex(1024);
        drop(server);
        assert!(matches!(
            handshake(client, "h", "f@x.org", "r@y.org").await,
            Err(ProbeError::Io { stage: "greeting", .. })
        ));
    }

    struct StaticMx(Vec<MxRecord>);

    impl MxResolver for StaticMx {
        fn lookup_mx<'a>(&'a self, _domain: &'a str) -> BoxFuture<'a, Result<Vec<MxRecord>, String>> {
            let records = self.0.clone();
            Box::pin(async move { Ok(records) })
        }
    }

    fn probe_config() -> MailboxProbeConfig {
        MailboxProbeConfig {
            enabled: true,
            helo: "probe.example.org".to_string(),
            from: "check@example.org".to_string(),
        }
    }

    #[tokio::test]
    async fn test_probe_without_mx_records() {
        let probe = SmtpMailboxProbe::new(Arc::new(StaticMx(vec![])), 25, Duration::from_secs(1));
        let err = probe.probe("jane@example.com", &probe_config()).await.unwrap_err();
        assert!(matches!(err, ProbeError::MxLookup { .. }));

        let err = probe.probe("not-an-email", &probe_config()).await.unwrap_err();
        assert!(matches!(err, ProbeError::InvalidAddress));
    }

    #[tokio::test]
    async fn test_probe_uses_preferred_exchange() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut conn = BufReader::new(socket);
            for reply in ["220 ready\r\n", "250 hi\r\n", "250 ok\r\n", "250 ok\r\n", "221 bye\r\n"] {
                conn.write_all(reply.as_bytes()).await.unwrap();
                conn.flush().await.unwrap();
                if reply.starts_with("221") {
                    break;
                }
                let mut line = String::new();
                conn.read_line(&mut line).await.unwrap();
            }
        });

        let resolver = StaticMx(vec![
            MxRecord {
                preference: 20,
                exchange: "unreachable.invalid".to_string(),
            },
            MxRecord {
                preference: 10,
                exchange: "127.0.0.1".to_string(),
            },
        ]);
        let probe = SmtpMailboxProbe::new(Arc::new(resolver), port, Duration::from_secs(5));
        probe.probe("jane@example.com", &probe_config()).await.unwrap();
        server.await.unwrap();
    }

    fn contact_message() -> ContactMessage {
        ContactMessage {
            details: ContactDetails {
                name: "Jane Doe".to_string(),
                email: "jane@example.com".to_string(),
                subject: "Hello".to_string(),
                message: "Is this thing on?".to_string(),
            },
            remote_ip: "203.0.113.9".parse().unwrap(),
            user_agent: "TestAgent/1.0".to_string(),
        }
    }

    #[test]
    fn test_build_message() {
        let email = build_message(&contact_message(), "owner@example.org").unwrap();
        let formatted = String::from_utf8(email.formatted()).unwrap();

        assert!(formatted.contains("Subject: Hello"));
        assert!(formatted.contains("To: owner@example.org"));
        assert!(formatted.contains("Jane Doe"));
        assert!(formatted.contains("Date: "));
        assert!(formatted.contains("203.0.113.9"));
        assert!(formatted.contains("TestAgent/1.0"));

        let envelope = email.envelope();
        assert_eq!(envelope.from().unwrap().to_string(), "jane@example.com");
        assert_eq!(envelope.to()[0].to_string(), "owner@example.org");
    }

    #[test]
    fn test_message_body_footer() {
        assert_eq!(
            contact_message().body(),
            "Is this thing on?\n\n\n---\n203.0.113.9\nTestAgent/1.0\n"
        );
    }

    #[test]
    fn test_build_message_bad_recipient() {
        assert!(matches!(
            build_message(&contact_message(), "not a mailbox"),
            Err(DeliveryError::Address { .. })
        ));
    }

    #[tokio::test]
    async fn test_delivery_to_relay() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let relay = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut conn = BufReader::new(socket);
            let mut data = String::new();
            let mut in_data = false;

            conn.write_all(b"220 relay ready\r\n").await.unwrap();
            loop {
                let mut line = String::new();
                if conn.read_line(&mut line).await.unwrap() == 0 {
                    break;
                }
                if in_data {
                    if line == ".\r\n" {
                        in_data = false;
                        conn.write_all(b"250 queued\r\n").await.unwrap();
                    } else {
                        data.push_str(&line);
                    }
                    continue;
                }

                let verb = line.get(..4).unwrap_or("").to_ascii_uppercase();
                let reply: &[u8] = match verb.as_str() {
                    "DATA" => {
                        in_data = true;
                        b"354 go ahead\r\n"
                    }
                    "QUIT" => b"221 bye\r\n",
                    _ => b"250 ok\r\n",
                };
                conn.write_all(reply).await.unwrap();
                if verb == "QUIT" {
                    break;
                }
            }
            data
        });

        let config = SmtpDelivery {
            host: "127.0.0.1".to_string(),
            port,
            recipient: "owner@example.org".to_string(),
        };
        RelayDelivery.deliver(&contact_message(), &config).await.unwrap();

        let data = relay.await.unwrap();
        assert!(data.contains("Subject: Hello"));
        assert!(data.contains("Is this thing on?"));
    }
}
