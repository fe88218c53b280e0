//! Thread-safe in-memory storage of captured mail.

use crate::error::Error;
use crate::mail::Mail;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// A captured mail together with its store identifier.
#[derive(Debug, Serialize)]
pub struct StoredMail {
    pub id: u64,
    #[serde(flatten)]
    pub mail: Mail,
}

#[derive(Debug, Default)]
struct Inner {
    next_id: u64,
    mails: Vec<Arc<StoredMail>>,
}

/// Append-only, ordered collection of captured mail.
///
/// Identifiers increase with insertion order and are never reused, even after
/// [`MailStore::retain`] removed records.
#[derive(Debug, Default)]
pub struct MailStore {
    inner: Mutex<Inner>,
}

impl MailStore {
    pub fn new() -> Self {
        Self::default()
    }

    // The store only ever appends or filters, so a panic in another holder
    // cannot leave it half-updated.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores `mail` and returns its identifier.
    pub fn add(&self, mail: Mail) -> u64 {
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.mails.push(Arc::new(StoredMail { id, mail }));
        id
    }

    /// Point-in-time copy of all stored mail in insertion order.
    pub fn snapshot(&self) -> Vec<Arc<StoredMail>> {
        self.lock().mails.clone()
    }

    pub fn get(&self, id: u64) -> Option<Arc<StoredMail>> {
        let inner = self.lock();
        inner
            .mails
            .binary_search_by_key(&id, |mail| mail.id)
            .ok()
            .and_then(|idx| inner.mails.get(idx))
            .cloned()
    }

    /// Looks up a mail by its textual identifier.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if `id` is not an integer or no mail has it.
    pub fn get_by_id(&self, id: &str) -> Result<Arc<StoredMail>, Error> {
        id.parse::<u64>()
            .ok()
            .and_then(|id| self.get(id))
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    /// Keeps only the mail matching `keep`. Returns the number of removed records.
    #[cfg_attr(not(test), allow(dead_code))]
    pub fn retain<F>(&self, mut keep: F) -> usize
    where
        F: FnMut(&StoredMail) -> bool,
    {
        let mut inner = self.lock();
        let before = inner.mails.len();
        inner.mails.retain(|mail| keep(mail));
        before - inner.mails.len()
    }

    pub fn len(&self) -> usize {
        self.lock().mails.len()
    }

    #[cfg_attr(not(test), allow(dead_code))]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
