use async_trait::async_trait;
use certkeeper_common::views::{EmailAction, SmtpConfig};
use lettre::{
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
    message::{Mailbox, header::ContentType},
    transport::smtp::authentication::Credentials,
};

use super::{DeployContext, DeployTarget, Deployer};
use crate::error::{EngineError, EngineResult};

const KIND: &str = "email";

const DEFAULT_SUBJECT: &str = "Certificate {{commonName}} deployed";
const DEFAULT_BODY: &str = "The certificate for {{commonName}} was deployed.\n\n\
Fingerprint: {{fingerprint}}\n\
Valid until: {{validTo}}\n\
Certificate: {{cert}}\n";

fn mailbox(address: &str) -> EngineResult<Mailbox> {
    address
        .parse()
        .map_err(|e| EngineError::invalid(format!("{address:?} is not an email address: {e}")))
}

/// Port 465 speaks TLS from the first byte; any other secure port upgrades
/// with STARTTLS.
fn transport(smtp: &SmtpConfig) -> EngineResult<AsyncSmtpTransport<Tokio1Executor>> {
    let builder = if smtp.secure {
        let builder = if smtp.port == 465 {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&smtp.host)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&smtp.host)
        };
        builder.map_err(|e| EngineError::deploy(KIND, format!("TLS setup for {}: {e}", smtp.host)))?
    } else {
        AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&smtp.host)
    };

    let builder = builder.port(smtp.port);
    let builder = match (&smtp.user, &smtp.password) {
        (Some(user), Some(password)) => {
            builder.credentials(Credentials::new(user.clone(), password.clone()))
        }
        _ => builder,
    };
    Ok(builder.build())
}

fn message(action: &EmailAction, ctx: &DeployContext) -> EngineResult<Message> {
    if action.recipients.is_empty() {
        return Err(EngineError::invalid("email action has no recipients"));
    }

    let subject = ctx.expand(action.subject.as_deref().unwrap_or(DEFAULT_SUBJECT));
    let body = ctx.expand(action.body.as_deref().unwrap_or(DEFAULT_BODY));

    let mut builder = Message::builder()
        .from(mailbox(&action.smtp.from)?)
        .subject(subject)
        .header(ContentType::TEXT_PLAIN);
    for recipient in &action.recipients {
        builder = builder.to(mailbox(recipient)?);
    }

    builder
        .body(body)
        .map_err(|e| EngineError::deploy(KIND, e.to_string()))
}

#[async_trait]
impl DeployTarget for EmailAction {
    async fn deploy(&self, ctx: &DeployContext, _: &Deployer) -> EngineResult<String> {
        let message = message(self, ctx)?;
        transport(&self.smtp)?
            .send(message)
            .await
            .map_err(|e| EngineError::deploy(KIND, format!("SMTP {}: {e}", self.smtp.host)))?;

        Ok(format!(
            "Sent notification to {} recipient(s)",
            self.recipients.len()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::path::PathBuf;

    fn action(recipients: Vec<String>) -> EmailAction {
        EmailAction {
            smtp: SmtpConfig {
                host: "127.0.0.1".into(),
                port: 2525,
                secure: false,
                user: None,
                password: None,
                from: "certkeeper@example.com".into(),
            },
            recipients,
            subject: None,
            body: None,
        }
    }

    fn context() -> DeployContext {
        DeployContext {
            fingerprint: "ABCD".into(),
            common_name: "web.example.com".into(),
            valid_to: Utc::now(),
            cert: PathBuf::from("/certs/web.crt"),
            key: None,
            chain: None,
            fullchain: None,
            p12: None,
            scratch: None,
        }
    }

    #[test]
    fn test_message_expands_default_templates() {
        let message = message(&action(vec!["ops@example.com".into()]), &context()).unwrap();
        let raw = String::from_utf8(message.formatted()).unwrap();

        assert!(raw.contains("Subject: Certificate web.example.com deployed"));
        assert!(raw.contains("Fingerprint: ABCD"));
        assert!(raw.contains("To: ops@example.com"));
    }

    #[test]
    fn test_message_rejects_bad_input() {
        assert!(message(&action(Vec::new()), &context()).is_err());
        assert!(message(&action(vec!["not an address".into()]), &context()).is_err());
    }
}
