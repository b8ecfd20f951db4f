//! Email notifications.

use lettre::{
    AsyncSmtpTransport, AsyncTransport as _, Message, Tokio1Executor,
    message::{Attachment, Mailbox, MultiPart, SinglePart, header::ContentType},
};

use crate::prelude::*;

/// An email to one recipient.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Email {
    pub to: String,
    pub subject: String,
    pub body: String,
    /// File name and contents of a plain-text attachment.
    pub attachment: Option<(String, String)>,
}

impl Email {
    /// Build a MIME message for this email.
    pub fn to_message(&self, from: &Mailbox) -> Result<Message> {
        let to: Mailbox = self
            .to
            .parse()
            .with_context(|| format!("invalid email address {:?}", self.to))?;
        let builder = Message::builder()
            .from(from.clone())
            .to(to)
            .subject(self.subject.clone());
        let message = match &self.attachment {
            Some((filename, contents)) => builder.multipart(
                MultiPart::mixed()
                    .singlepart(SinglePart::plain(self.body.clone()))
                    .singlepart(
                        Attachment::new(filename.clone())
                            .body(contents.clone(), ContentType::TEXT_PLAIN),
                    ),
            ),
            None => builder.body(self.body.clone()),
        };
        message.context("could not build email")
    }
}

/// Something that can send email.
#[async_trait]
pub trait Mailer: Send + Sync + 'static {
    async fn send(&self, email: &Email) -> Result<()>;
}

/// Sends email through a plain SMTP relay.
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpMailer {
    /// Create a mailer for an unauthenticated relay without TLS.
    pub fn new(host: &str, port: u16, sender: &str) -> Result<Self> {
        let from = sender
            .parse()
            .with_context(|| format!("invalid sender address {sender:?}"))?;
        let transport = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host)
            .port(port)
            .build();
        Ok(Self { transport, from })
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    #[instrument(level = "debug", skip_all, fields(to = %email.to))]
    async fn send(&self, email: &Email) -> Result<()> {
        let message = email.to_message(&self.from)?;
        self.transport
            .send(message)
            .await
            .with_context(|| format!("could not send email to {}", email.to))?;
        debug!("Sent email");
        Ok(())
    }
}
