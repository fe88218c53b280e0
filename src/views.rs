//! Routes of the web interface.

use crate::error::Error;
use crate::resources::{FileSet, Resources, content_type};
use crate::store::MailStore;
use crate::template::Renderer;
use chrono::{TimeDelta, Utc};
use serde_json::{Value, json};
use std::sync::Arc;

const TITLE: &str = "mockmail";

/// An HTTP response, before serialization.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<(&'static str, String)>,
    pub body: Vec<u8>,
}

impl Response {
    fn ok(content_type: &str, body: Vec<u8>) -> Self {
        Self {
            status: 200,
            headers: vec![("Content-Type", content_type.to_string())],
            body,
        }
    }

    pub fn error(status: u16) -> Self {
        let body = format!("<html><body><h1>{status} {}</h1></body></html>\n", reason(status));
        Self {
            status,
            headers: vec![("Content-Type", "text/html; charset=utf-8".to_string())],
            body: body.into_bytes(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

pub fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        _ => "Unknown",
    }
}

/// Serves captured mail from a [`MailStore`].
#[derive(Debug)]
pub struct MailView {
    store: Arc<MailStore>,
    renderer: Renderer<FileSet>,
    statics: FileSet,
    static_cache_secs: u64,
}

impl MailView {
    pub fn new(store: Arc<MailStore>, resources: Resources, static_cache_secs: u64) -> Self {
        Self {
            store,
            renderer: Renderer::new(resources.templates),
            statics: resources.statics,
            static_cache_secs,
        }
    }

    /// Answers a `GET` of `path`.
    pub fn respond(&self, path: &str) -> Response {
        let path = path.split_once('?').map_or(path, |(path, _)| path);

        if path == "/" {
            self.index()
        } else if let Some(id) = path.strip_prefix("/mails/") {
            match id.strip_suffix("/raw") {
                Some(id) => self.raw_mail(id),
                None => self.mail(id),
            }
        } else if let Some(name) = path.strip_prefix("/static/") {
            self.static_file(name)
        } else {
            Response::error(404)
        }
    }

    fn index(&self) -> Response {
        let mut mails = self.store.snapshot();
        mails.sort_by(|a, b| b.mail.received.cmp(&a.mail.received));
        let context = serde_json::to_value(&mails).map(|emails| {
            json!({
                "emails": emails,
                "title": TITLE,
            })
        });
        self.serve_template("index", context)
    }

    fn mail(&self, id: &str) -> Response {
        let mail = match self.store.get_by_id(id) {
            Ok(mail) => mail,
            Err(e) => {
                log::debug!("{e}");
                return Response::error(404);
            }
        };
        let context = serde_json::to_value(&*mail).map(|mut context| {
            if let Value::Object(map) = &mut context {
                map.insert(
                    "title".to_string(),
                    Value::String(format!("{TITLE} - {}", mail.mail.subject)),
                );
            }
            context
        });
        self.serve_template("mail", context)
    }

    fn raw_mail(&self, id: &str) -> Response {
        match self.store.get_by_id(id) {
            // The message may use any charset, so none is claimed.
            Ok(mail) => Response::ok("text/plain", mail.mail.raw.clone()),
            Err(e) => {
                log::debug!("{e}");
                Response::error(404)
            }
        }
    }

    fn serve_template(&self, name: &str, context: Result<Value, serde_json::Error>) -> Response {
        let page = context
            .map_err(Error::from)
            .and_then(|context| self.renderer.render_named(name, &context));
        match page {
            Ok(page) => Response::ok("text/html; charset=utf-8", page.into_bytes()),
            Err(e) => {
                log::error!("Failed to render {name}: {e}");
                Response::error(500)
            }
        }
    }

    fn static_file(&self, name: &str) -> Response {
        let content = match self.statics.get(name) {
            Ok(Some(content)) => content.into_owned(),
            Ok(None) => return Response::error(404),
            Err(e) => {
                log::error!("Failed to load static file {name}: {e}");
                return Response::error(500);
            }
        };

        let mut response = Response::ok(content_type(name), content);
        response
            .headers
            .push(("Content-Length", response.body.len().to_string()));
        if self.static_cache_secs > 0 {
            let expires = i64::try_from(self.static_cache_secs)
                .ok()
                .and_then(TimeDelta::try_seconds)
                .and_then(|ttl| Utc::now().checked_add_signed(ttl));
            if let Some(expires) = expires {
                response.headers.push((
                    "Expires",
                    expires.format("%a, %d %b %Y %H:%M:%S GMT").to_string(),
                ));
            }
            response.headers.push((
                "Cache-Control",
                format!("public, max-age={}", self.static_cache_secs),
            ));
        }
        response
    }
}
