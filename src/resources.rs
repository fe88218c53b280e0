//! Templates and static files of the web interface.

use crate::error::Error;
use crate::template::TemplateSource;
use std::borrow::Cow;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Templates rendered by the web interface.
pub const TEMPLATES: &[&str] = &["header", "footer", "index", "mail"];

/// Files served below `/static/`.
pub const STATIC_FILES: &[&str] = &["mockmail.css", "mockmail.js"];

/// A fixed set of named files, read once or on every access.
#[derive(Debug)]
pub struct FileSet {
    dir: PathBuf,
    suffix: &'static str,
    names: &'static [&'static str],
    loaded: Option<HashMap<String, Vec<u8>>>,
}

impl FileSet {
    /// Creates a set of `<dir>/<name><suffix>` files.
    ///
    /// Unless `on_demand` is set all files are read immediately.
    pub fn open(
        dir: PathBuf,
        suffix: &'static str,
        names: &'static [&'static str],
        on_demand: bool,
    ) -> Result<Self, Error> {
        let mut set = Self {
            dir,
            suffix,
            names,
            loaded: None,
        };
        if !on_demand {
            let mut loaded = HashMap::with_capacity(names.len());
            for name in names {
                loaded.insert(name.to_string(), set.read(name)?);
            }
            set.loaded = Some(loaded);
        }
        Ok(set)
    }

    /// Creates a set from in-memory contents.
    #[cfg(test)]
    pub fn from_memory<I, K, V>(files: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Vec<u8>>,
    {
        Self {
            dir: PathBuf::new(),
            suffix: "",
            names: &[],
            loaded: Some(
                files
                    .into_iter()
                    .map(|(name, content)| (name.into(), content.into()))
                    .collect(),
            ),
        }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}{}", self.suffix))
    }

    fn read(&self, name: &str) -> Result<Vec<u8>, Error> {
        let path = self.path(name);
        std::fs::read(&path).map_err(|e| {
            log::error!("Failed to read {}: {e}", path.display());
            Error::Io(e)
        })
    }

    /// Returns the contents of `name`, or `None` if it is not part of the set.
    pub fn get(&self, name: &str) -> Result<Option<Cow<'_, [u8]>>, Error> {
        match &self.loaded {
            Some(loaded) => Ok(loaded.get(name).map(|content| Cow::Borrowed(content.as_slice()))),
            None if self.names.contains(&name) => self.read(name).map(|content| Some(Cow::Owned(content))),
            None => Ok(None),
        }
    }
}

impl TemplateSource for FileSet {
    fn template_source(&self, name: &str) -> Result<Cow<'_, str>, Error> {
        match self.get(name)? {
            Some(Cow::Borrowed(bytes)) => Ok(String::from_utf8_lossy(bytes)),
            Some(Cow::Owned(bytes)) => Ok(Cow::Owned(String::from_utf8_lossy(&bytes).into_owned())),
            None => Err(Error::UnknownTemplate(name.to_string())),
        }
    }
}

/// Everything the web interface loads from the resource directory.
#[derive(Debug)]
pub struct Resources {
    pub templates: FileSet,
    pub statics: FileSet,
}

impl Resources {
    /// Opens `<dir>/templates/*.mustache` and `<dir>/static/*`.
    pub fn open(dir: &Path, on_demand: bool) -> Result<Self, Error> {
        Ok(Self {
            templates: FileSet::open(dir.join("templates"), ".mustache", TEMPLATES, on_demand)?,
            statics: FileSet::open(dir.join("static"), "", STATIC_FILES, on_demand)?,
        })
    }
}

/// Directory shipped next to the installed binary, `<exe>/../share/mockmail`,
/// falling back to the one in the source tree.
pub fn default_dir() -> PathBuf {
    let installed = std::env::current_exe().ok().and_then(|exe| {
        let dir = exe.parent()?.parent()?.join("share").join("mockmail");
        dir.is_dir().then_some(dir)
    });
    installed.unwrap_or_else(|| Path::new(env!("CARGO_MANIFEST_DIR")).join("share/mockmail"))
}

/// Guesses the `Content-Type` of a static file from its extension.
pub fn content_type(name: &str) -> &'static str {
    let extension = Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);
    match extension.as_deref() {
        Some("css") => "text/css",
        Some("js") => "text/javascript",
        Some("html" | "htm") => "text/html",
        Some("txt") => "text/plain",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("svg") => "image/svg+xml",
        Some("ico") => "image/vnd.microsoft.icon",
        _ => "application/octet-stream",
    }
}
