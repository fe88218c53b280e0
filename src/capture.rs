//! SMTP handler storing every received message.

use crate::mail::decode;
use crate::smtp_server::{Envelope, SmtpHandler};
use crate::store::MailStore;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;

/// Decodes accepted messages into the shared [`MailStore`].
#[derive(Debug)]
pub struct CaptureHandler {
    store: Arc<MailStore>,
}

impl CaptureHandler {
    pub fn new(store: Arc<MailStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl SmtpHandler for CaptureHandler {
    async fn handle_data(&self, envelope: &Envelope) -> Result<String, String> {
        let mail = decode(
            envelope.peer,
            &envelope.mail_from,
            &envelope.rcpt_to,
            &envelope.data,
            Utc::now(),
        );
        let subject = mail.subject.clone();
        let id = self.store.add(mail);
        log::info!(
            "Captured mail {id} from <{}> ({}): {subject}",
            envelope.mail_from,
            envelope.peer
        );
        log::debug!("{} mails stored", self.store.len());
        Ok(format!("250 OK: queued as {id}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::{FileSet, Resources};
    use crate::smtp_client;
    use crate::smtp_server::{bind, run_smtp_server};
    use crate::views::MailView;
    use testresult::TestResult;

    #[tokio::test]
    async fn test_captured_mail_is_shown() -> TestResult {
        let store = Arc::new(MailStore::new());
        let listener = bind("127.0.0.1:0", None).await?;
        let addr = listener.local_addr()?;
        tokio::spawn(run_smtp_server(
            listener,
            Arc::new(CaptureHandler::new(store.clone())),
            1 << 20,
        ));

        for subject in ["one", "=?UTF-8?Q?tw=C3=B6?="] {
            let envelope = Envelope {
                peer: addr,
                mail_from: "app@example.org".to_string(),
                rcpt_to: vec!["user@example.org".to_string()],
                data: format!("Subject: {subject}\r\n\r\nHello <user>\r\n").into_bytes(),
            };
            smtp_client::send(addr, &envelope).await?;
        }

        let mails = store.snapshot();
        assert_eq!(mails.len(), 2);
        assert_eq!(mails[1].id, 1);
        assert_eq!(mails[1].mail.subject, "twö");
        assert_eq!(mails[1].mail.from, "app@example.org");
        assert_eq!(mails[1].mail.simple_to, "user@example.org");
        assert_eq!(mails[1].mail.peer_ip, "127.0.0.1");

        let view = MailView::new(
            store,
            Resources {
                templates: FileSet::from_memory([("mail", "{{subject}}:{{#bodies}}{{{html}}}{{/bodies}}")]),
                statics: FileSet::from_memory::<_, String, Vec<u8>>([]),
            },
            0,
        );
        let response = view.respond("/mails/1");
        assert_eq!(response.status, 200);
        assert_eq!(
            String::from_utf8(response.body)?.trim_end(),
            "twö:Hello &lt;user&gt;"
        );
        Ok(())
    }
}
