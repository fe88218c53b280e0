//! Decoding of received messages into displayable records.

use crate::utils::{escape_html, format_time, linkify, local_zone};
use base64::Engine;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use chrono::{DateTime, Utc};
use encoding_rs::Encoding;
use mailparse::{MailHeaderMap, ParsedMail};
use regex::Regex;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::LazyLock;

/// Shown instead of the content of parts that are not decodable text.
pub const ATTACHMENT_PLACEHOLDER: &str = "[attachment]";

/// Shown as recipient when the envelope named none.
pub const NO_RECIPIENT: &str = "<nobody>";

// Encoded words in the wild are not always padded.
const LENIENT_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

static ENCODED_WORD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"=\?([^?\s]+)\?([bBqQ])\?([^?\s]*)\?=").expect("valid regex")
});

/// A received message, as shown in the web interface.
#[derive(Debug, Clone, Serialize)]
pub struct Mail {
    pub peer_ip: String,
    pub peer_port: u16,
    pub from: String,
    /// First envelope recipient, or [`NO_RECIPIENT`].
    pub simple_to: String,
    pub recipients: Vec<Recipient>,
    pub subject: String,
    pub raw_header: String,
    pub raw_body: String,
    /// Local time of reception, `YYYY-MM-DD HH:MM:SS ZONE`.
    pub received_at: String,
    pub bodies: Vec<BodyPart>,
    #[serde(skip)]
    pub received: DateTime<Utc>,
    #[serde(skip)]
    pub raw: Vec<u8>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Recipient {
    pub address: String,
}

/// A leaf MIME part.
#[derive(Debug, Clone, Serialize)]
pub struct BodyPart {
    pub content_type: String,
    /// Decoded text of `text/*` parts.
    pub text: Option<String>,
    /// Escaped and linkified text, or [`ATTACHMENT_PLACEHOLDER`].
    pub html: String,
}

impl BodyPart {
    fn attachment(content_type: String) -> Self {
        Self {
            content_type,
            text: None,
            html: ATTACHMENT_PLACEHOLDER.to_string(),
        }
    }

    fn text(content_type: String, text: String) -> Self {
        let html = linkify(&escape_html(&text)).into_owned();
        Self {
            content_type,
            text: Some(text),
            html,
        }
    }
}

/// Builds a [`Mail`] from an accepted SMTP transaction.
///
/// Never fails: parts that cannot be decoded are replaced by a placeholder.
pub fn decode(
    peer: SocketAddr,
    mail_from: &str,
    rcpt_to: &[String],
    raw: &[u8],
    now: DateTime<Utc>,
) -> Mail {
    let (raw_header, raw_body) = split_message(raw);

    let (subject, bodies) = match mailparse::parse_mail(raw) {
        Ok(parsed) => {
            let subject = parsed
                .headers
                .get_first_header("Subject")
                .map(|header| decode_header_value(header.get_value_raw()))
                .unwrap_or_default();
            let mut bodies = Vec::new();
            collect_parts(&parsed, &mut bodies);
            (subject, bodies)
        }
        Err(e) => {
            log::warn!("Failed to parse message from {peer}: {e}");
            (
                String::new(),
                vec![BodyPart::attachment("application/octet-stream".to_string())],
            )
        }
    };

    Mail {
        peer_ip: peer.ip().to_string(),
        peer_port: peer.port(),
        from: mail_from.to_string(),
        simple_to: rcpt_to
            .first()
            .cloned()
            .unwrap_or_else(|| NO_RECIPIENT.to_string()),
        recipients: rcpt_to
            .iter()
            .map(|address| Recipient {
                address: address.clone(),
            })
            .collect(),
        subject,
        raw_header: String::from_utf8_lossy(raw_header).into_owned(),
        raw_body: String::from_utf8_lossy(raw_body).into_owned(),
        received_at: format_time(now, local_zone()),
        bodies,
        received: now,
        raw: raw.to_vec(),
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Splits a message at the first empty line into header and body.
fn split_message(raw: &[u8]) -> (&[u8], &[u8]) {
    for separator in [&b"\r\n\r\n"[..], &b"\n\n"[..]] {
        if let Some(pos) = find(raw, separator)
            && let Some((header, rest)) = raw.split_at_checked(pos)
        {
            return (header, rest.get(separator.len()..).unwrap_or_default());
        }
    }
    (raw, &[])
}

fn collect_parts(part: &ParsedMail<'_>, out: &mut Vec<BodyPart>) {
    if part.subparts.is_empty() {
        out.push(decode_part(part));
    } else {
        for subpart in &part.subparts {
            collect_parts(subpart, out);
        }
    }
}

fn decode_part(part: &ParsedMail<'_>) -> BodyPart {
    let content_type = part.ctype.mimetype.to_ascii_lowercase();
    if !content_type.starts_with("text/") {
        return BodyPart::attachment(content_type);
    }

    let raw = match part.get_body_raw() {
        Ok(raw) => raw,
        Err(e) => {
            log::debug!("Failed to decode {content_type} part: {e}");
            return BodyPart::attachment(content_type);
        }
    };
    let Some(encoding) = Encoding::for_label(part.ctype.charset.trim().as_bytes()) else {
        log::debug!("Unknown charset {:?}", part.ctype.charset);
        return BodyPart::attachment(content_type);
    };
    let (text, _, _) = encoding.decode(&raw);
    BodyPart::text(content_type, text.into_owned())
}

fn decode_header_value(raw: &[u8]) -> String {
    let unfolded: String = String::from_utf8_lossy(raw)
        .chars()
        .filter(|c| *c != '\r' && *c != '\n')
        .collect();
    decode_encoded_words(unfolded.trim())
}

/// Decodes RFC 2047 encoded words in a header value.
///
/// Text between encoded words is kept as-is, except for whitespace separating
/// two encoded words. Encoded words that cannot be decoded are kept verbatim.
pub fn decode_encoded_words(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut last = 0;
    let mut after_encoded = false;

    for caps in ENCODED_WORD.captures_iter(value) {
        let Some(word) = caps.get(0) else {
            continue;
        };
        let gap = value.get(last..word.start()).unwrap_or_default();
        last = word.end();

        let decoded = match (caps.get(1), caps.get(2), caps.get(3)) {
            (Some(charset), Some(encoding), Some(data)) => {
                decode_word(charset.as_str(), encoding.as_str(), data.as_str())
            }
            _ => None,
        };

        match decoded {
            Some(text) => {
                if !(after_encoded && gap.trim().is_empty()) {
                    out.push_str(gap);
                }
                out.push_str(&text);
                after_encoded = true;
            }
            None => {
                out.push_str(gap);
                out.push_str(word.as_str());
                after_encoded = false;
            }
        }
    }

    out.push_str(value.get(last..).unwrap_or_default());
    out
}

fn decode_word(charset: &str, encoding: &str, data: &str) -> Option<String> {
    // RFC 2231 allows a language suffix: `=?UTF-8*en?Q?...?=`.
    let charset = charset.split('*').next().unwrap_or(charset);
    let charset = Encoding::for_label(charset.as_bytes())?;
    let bytes = if encoding.eq_ignore_ascii_case("b") {
        LENIENT_BASE64.decode(data).ok()?
    } else {
        decode_q(data)?
    };
    let (text, _) = charset.decode_without_bom_handling(&bytes);
    Some(text.into_owned())
}

fn decode_q(data: &str) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len());
    let mut bytes = data.bytes();
    while let Some(b) = bytes.next() {
        match b {
            b'_' => out.push(b' '),
            b'=' => {
                let hex = [bytes.next()?, bytes.next()?];
                let hex = std::str::from_utf8(&hex).ok()?;
                out.push(u8::from_str_radix(hex, 16).ok()?);
            }
            other => out.push(other),
        }
    }
    Some(out)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::*;

    fn peer() -> SocketAddr {
        "[::1]:4242".parse().unwrap()
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 8, 15, 0).unwrap()
    }

    pub(crate) fn sample_mail(subject: &str) -> Mail {
        let raw = format!("Subject: {subject}\r\n\r\nbody of {subject}\r\n");
        decode(
            peer(),
            "from@example.org",
            &["to@example.org".to_string()],
            raw.as_bytes(),
            now(),
        )
    }

    #[test]
    fn test_decode() {
        let data = "To: Philipp Hagemeister <otherto@phihag.de>\n\
Subject: =?UTF-8?B?w5xtbMOkdXRlIDI=?=moar\n\
Content-Type: text/plain; charset=UTF-8\n\
Content-Transfer-Encoding: base64\n\
\n\
w5xtbMOkdTx0ZQ==";
        let mail = decode(
            peer(),
            "from@phihag.de",
            &["to@phihag.de".to_string()],
            data.as_bytes(),
            now(),
        );

        assert_eq!(mail.peer_ip, "::1");
        assert_eq!(mail.peer_port, 4242);
        assert_eq!(mail.from, "from@phihag.de");
        assert_eq!(mail.simple_to, "to@phihag.de");
        assert_eq!(mail.subject, "Ümläute 2moar");
        assert_eq!(mail.bodies.len(), 1);
        assert_eq!(mail.bodies[0].content_type, "text/plain");
        assert_eq!(mail.bodies[0].text.as_deref(), Some("Ümläu<te"));
        assert_eq!(mail.bodies[0].html, "Ümläu&lt;te");
        assert_eq!(mail.raw_body, "w5xtbMOkdTx0ZQ==");
        assert!(mail.raw_header.ends_with("Content-Transfer-Encoding: base64"));
        assert_eq!(mail.received, now());
        assert_eq!(mail.raw, data.as_bytes());
    }

    #[test]
    fn test_decode_without_recipients() {
        let mail = decode(peer(), "from@example.org", &[], b"Subject: x\r\n\r\ny", now());
        assert_eq!(mail.simple_to, NO_RECIPIENT);
        assert!(mail.recipients.is_empty());
    }

    #[test]
    fn test_decode_multipart() {
        let data = "Subject: parts\r\n\
MIME-Version: 1.0\r\n\
Content-Type: multipart/mixed; boundary=\"XYZ\"\r\n\
\r\n\
--XYZ\r\n\
Content-Type: text/plain; charset=ISO-8859-1\r\n\
Content-Transfer-Encoding: quoted-printable\r\n\
\r\n\
Caf=E9 at https://example.org/menu?x&y\r\n\
--XYZ\r\n\
Content-Type: application/pdf\r\n\
Content-Transfer-Encoding: base64\r\n\
\r\n\
JVBERi0xLjQK\r\n\
--XYZ\r\n\
Content-Type: text/plain; charset=x-no-such-charset\r\n\
\r\n\
unreadable\r\n\
--XYZ--\r\n";
        let mail = decode(
            peer(),
            "from@example.org",
            &["a@example.org".to_string(), "b@example.org".to_string()],
            data.as_bytes(),
            now(),
        );

        assert_eq!(mail.recipients.len(), 2);
        assert_eq!(mail.simple_to, "a@example.org");
        assert_eq!(mail.bodies.len(), 3);

        let text = &mail.bodies[0];
        assert_eq!(
            text.text.as_deref().map(str::trim_end),
            Some("Café at https://example.org/menu?x&y"));
        assert_eq!(
            text.html.trim_end(),
            r#"Café at <a href="https://example.org/menu?x&amp;y">https://example.org/menu?x&amp;y</a>"#
        );

        assert_eq!(mail.bodies[1].content_type, "application/pdf");
        assert_eq!(mail.bodies[1].text, None);
        assert_eq!(mail.bodies[1].html, ATTACHMENT_PLACEHOLDER);

        assert_eq!(mail.bodies[2].html, ATTACHMENT_PLACEHOLDER);
    }

    #[test]
    fn test_decode_corrupt_transfer_encoding() {
        let data = "Subject: broken\r\n\
MIME-Version: 1.0\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
Content-Transfer-Encoding: base64\r\n\
\r\n\
@@@@ this is not base64 @@@@\r\n";
        let mail = decode(peer(), "from@example.org", &[], data.as_bytes(), now());

        assert_eq!(mail.subject, "broken");
        assert_eq!(mail.bodies.len(), 1);
        assert_eq!(mail.bodies[0].content_type, "text/plain");
        assert_eq!(mail.bodies[0].text, None);
        assert_eq!(mail.bodies[0].html, ATTACHMENT_PLACEHOLDER);
        assert_eq!(mail.raw_body, "@@@@ this is not base64 @@@@\r\n");
    }

    #[test]
    fn test_decode_default_charset() {
        let mail = decode(peer(), "", &[], b"Subject: plain\n\nhello \"world\"", now());
        assert_eq!(mail.subject, "plain");
        assert_eq!(mail.bodies[0].text.as_deref(), Some("hello \"world\""));
        assert_eq!(mail.bodies[0].html, "hello &quot;world&quot;");
    }

    #[rstest]
    #[case::crlf(b"A: b\r\nC: d\r\n\r\nbody\n\nmore", "A: b\r\nC: d", "body\n\nmore")]
    #[case::lf(b"A: b\n\nbody", "A: b", "body")]
    #[case::header_only(b"A: b\r\n", "A: b\r\n", "")]
    fn test_split_message(#[case] raw: &[u8], #[case] header: &str, #[case] body: &str) {
        let (h, b) = split_message(raw);
        assert_eq!(h, header.as_bytes());
        assert_eq!(b, body.as_bytes());
    }

    #[rstest]
    #[case::base64("=?UTF-8?B?w5xtbMOkdXRlIDI=?=", "Ümläute 2")]
    #[case::trailing_text("=?UTF-8?B?w5xtbMOkdXRlIDI=?=moar", "Ümläute 2moar")]
    #[case::unpadded("=?UTF-8?B?w5xtbMOkdXRlIDI?=", "Ümläute 2")]
    #[case::quoted_printable("=?ISO-8859-1?Q?caf=E9_au_lait?=", "café au lait")]
    #[case::lowercase_encoding("=?utf-8?q?=C3=BC?=", "ü")]
    #[case::adjacent_words("=?UTF-8?Q?a?= =?UTF-8?Q?b?=", "ab")]
    #[case::mixed("Re: =?UTF-8?Q?=C3=A4?= and more", "Re: ä and more")]
    #[case::language_suffix("=?UTF-8*en?Q?hi?=", "hi")]
    #[case::unknown_charset("x =?x-unknown?Q?a?= y", "x =?x-unknown?Q?a?= y")]
    #[case::plain("just text", "just text")]
    fn test_decode_encoded_words(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(decode_encoded_words(input), expected);
    }

    #[test]
    fn test_folded_subject() {
        let data = b"Subject: =?UTF-8?Q?first?=\r\n =?UTF-8?Q?_second?=\r\n\r\nbody";
        let mail = decode(peer(), "", &[], data, now());
        assert_eq!(mail.subject, "first second");
    }
}
