use chrono::{DateTime, Local, Utc};
use chrono_tz::Tz;
use mailparse::MailAddr;
use regex::Regex;
use std::borrow::Cow;
use std::sync::{LazyLock, OnceLock};

static URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"https?://(?:[a-zA-Z.0-9/\-_?;=]|&amp;)+").expect("valid regex")
});

static LOCAL_ZONE: OnceLock<Option<Tz>> = OnceLock::new();

/// Extracts the first email address found in SMTP command or email header.
///
/// Return `None` if parsing fails.
///
/// Returns the first address if multiple are present.
pub fn extract_address(input: &str) -> Option<String> {
    let trimmed = input.trim();
    let mut trimmed = strip_prefix_ignore_case(trimmed, "mail from:")
        .or_else(|| strip_prefix_ignore_case(trimmed, "rcpt to:"))
        .unwrap_or(trimmed)
        .trim_start();

    // The null reverse-path of bounces.
    if trimmed.starts_with("<>") {
        return Some(String::new());
    }

    let addr_end = trimmed.find('>').unwrap_or(trimmed.len().saturating_sub(1));
    trimmed = trimmed
        .split_at_checked(addr_end + 1)
        .map(|(address_raw, _)| address_raw)
        .unwrap_or(trimmed);

    mailparse::addrparse(trimmed)
        .ok()
        .and_then(|addr| match addr.first() {
            Some(MailAddr::Single(single)) => Some(single.addr.clone()),
            Some(MailAddr::Group(group)) => group.addrs.first().map(|single| single.addr.clone()),
            None => None,
        })
}

fn strip_prefix_ignore_case<'a>(input: &'a str, prefix: &str) -> Option<&'a str> {
    let (head, tail) = input.split_at_checked(prefix.len())?;
    head.eq_ignore_ascii_case(prefix).then_some(tail)
}

/// Escapes `&`, `<`, `>`, `"` and `'` for use in HTML text and attributes.
pub fn escape_html(input: &str) -> Cow<'_, str> {
    if !input.contains(['&', '<', '>', '"', '\'']) {
        return Cow::Borrowed(input);
    }
    let mut out = String::with_capacity(input.len() + 16);
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            c => out.push(c),
        }
    }
    Cow::Owned(out)
}

/// Wraps `http://` and `https://` URLs of already escaped text in anchors.
pub fn linkify(escaped: &str) -> Cow<'_, str> {
    URL.replace_all(escaped, r#"<a href="$0">$0</a>"#)
}

/// Resolves the host time zone once.
///
/// Must run before a chroot hides the zone database.
pub fn local_zone() -> Option<Tz> {
    *LOCAL_ZONE.get_or_init(|| {
        let name = std::env::var("TZ")
            .ok()
            .map(|tz| tz.trim_start_matches(':').to_string())
            .filter(|tz| !tz.is_empty())
            .or_else(|| iana_time_zone::get_timezone().ok())?;
        match name.parse::<Tz>() {
            Ok(tz) => Some(tz),
            Err(_) => {
                log::debug!("Unknown time zone {name}, falling back to UTC offsets");
                None
            }
        }
    })
}

/// Formats `at` as `YYYY-MM-DD HH:MM:SS ZONE`.
///
/// Without a known zone the local UTC offset stands in for the abbreviation.
pub fn format_time(at: DateTime<Utc>, zone: Option<Tz>) -> String {
    match zone {
        Some(tz) => at.with_timezone(&tz).format("%Y-%m-%d %H:%M:%S %Z").to_string(),
        None => at
            .with_timezone(&Local)
            .format("%Y-%m-%d %H:%M:%S %:z")
            .to_string(),
    }
}
