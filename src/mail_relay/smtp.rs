use std::time::Duration;

use async_trait::async_trait;
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use log::{debug, warn};

use crate::error::RelayError;
use crate::settings::{SmtpConfig, SmtpSecurity};

/// Something that can hand a finished message to the outbound relay.
#[async_trait]
pub trait Outbound: Send + Sync {
    async fn send(&self, message: Message) -> Result<(), RelayError>;
}

pub struct SmtpOutbound {
    server: String,
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpOutbound {
    /// Builds the transport. `timeout` bounds every network operation of a send.
    pub fn from_config(config: &SmtpConfig, timeout: Duration) -> Result<Self, RelayError> {
        let security = config.security_mode().ok_or_else(|| {
            RelayError::Transport(format!("unknown smtp security mode {:?}", config.security))
        })?;
        let transport_error = |e: lettre::transport::smtp::Error| RelayError::Transport(e.to_string());

        let builder = match security {
            SmtpSecurity::Ssl => {
                AsyncSmtpTransport::<Tokio1Executor>::relay(&config.server).map_err(transport_error)?
            }
            SmtpSecurity::StartTls => {
                warn!(
                    "SMTP STARTTLS to {} accepts invalid certificates; prefer security: ssl",
                    config.server
                );
                let parameters = TlsParameters::builder(config.server.clone())
                    .dangerous_accept_invalid_certs(true)
                    .build()
                    .map_err(transport_error)?;
                AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.server)
                    .tls(Tls::Opportunistic(parameters))
            }
            SmtpSecurity::None => {
                warn!("SMTP to {} is unencrypted", config.server);
                AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.server)
            }
        };

        let transport = builder
            .port(config.port)
            .credentials(Credentials::new(
                config.username.clone(),
                config.password.clone(),
            ))
            .timeout(Some(timeout))
            .build();

        Ok(SmtpOutbound {
            server: format!("{}:{}", config.server, config.port),
            transport,
        })
    }
}

#[async_trait]
impl Outbound for SmtpOutbound {
    async fn send(&self, message: Message) -> Result<(), RelayError> {
        let response = self
            .transport
            .send(message)
            .await
            .map_err(|e| RelayError::Send(format!("{}: {}", self.server, e)))?;

        debug!(
            "-- {} accepted message: {}",
            self.server,
            response.message().collect::<Vec<_>>().join(" ")
        );
        Ok(())
    }
}
