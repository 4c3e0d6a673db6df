//! Bidirectional username ↔ service-identifier cache with batched lookups.
//!
//! Branch processing learns reviewer names one at a time while parsing commit
//! messages; resolving each immediately would cost a service round trip per
//! name. Instead names are *hinted* into a pending set and resolved together
//! on the first lookup after any hint.
//!
//! Batch policy on failure: the service rejects a whole batch when any one
//! name is unknown. When that happens the cache re-issues the query for just
//! the name the caller asked about and drops the rest of the hint set,
//! trading batching efficiency for forward progress.

use std::collections::{BTreeSet, HashMap};

use error_stack::{report, Result, ResultExt};
use tracing::debug;

use crate::api::review::{self, UserDirectory, UserId, UserRecord};
use crate::ext::result::WrapErr;

/// Errors surfaced by the identity cache.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The username is unknown to the review service.
    #[error("unknown username: {0}")]
    UnknownUsername(String),

    /// The email address is unknown to the review service.
    #[error("unknown email: {0}")]
    UnknownEmail(String),

    /// The identifier is unknown to the review service.
    #[error("unknown user id: {0}")]
    UnknownUserId(UserId),

    /// The underlying directory query failed.
    #[error("query user directory")]
    Query,
}

/// See the module docs.
pub struct UserCache {
    directory: Box<dyn UserDirectory>,
    id_by_username: HashMap<String, UserId>,
    username_by_id: HashMap<UserId, String>,
    id_by_email: HashMap<String, (String, UserId)>,
    hinted: BTreeSet<String>,
}

impl UserCache {
    /// Create an empty cache over the provided directory.
    pub fn new(directory: Box<dyn UserDirectory>) -> Self {
        Self {
            directory,
            id_by_username: HashMap::new(),
            username_by_id: HashMap::new(),
            id_by_email: HashMap::new(),
            hinted: BTreeSet::new(),
        }
    }

    /// Queue a username for the next batched resolution. Cheap; call freely.
    pub fn hint(&mut self, username: &str) {
        if !self.id_by_username.contains_key(username) {
            self.hinted.insert(username.to_owned());
        }
    }

    /// The identifier for `username`, resolving the whole hint set on the
    /// first call after any hint.
    pub fn id_for_username(&mut self, username: &str) -> Result<UserId, Error> {
        self.hint(username);
        if !self.hinted.is_empty() {
            self.resolve_hinted(username)?;
        }
        self.id_by_username
            .get(username)
            .cloned()
            .ok_or_else(|| report!(Error::UnknownUsername(username.to_owned())))
    }

    /// The username for `id`, querying on miss.
    pub fn username_for_id(&mut self, id: &UserId) -> Result<String, Error> {
        if let Some(username) = self.username_by_id.get(id) {
            return Ok(username.clone());
        }
        let records = self
            .directory
            .query_users_by_id(std::slice::from_ref(id))
            .change_context(Error::Query)?;
        self.store(records);
        self.username_by_id
            .get(id)
            .cloned()
            .ok_or_else(|| report!(Error::UnknownUserId(id.clone())))
    }

    /// The (username, id) pair for `email`, querying on miss.
    pub fn user_for_email(&mut self, email: &str) -> Result<(String, UserId), Error> {
        if let Some(found) = self.id_by_email.get(email) {
            return Ok(found.clone());
        }
        let records = self
            .directory
            .query_users_by_email(std::slice::from_ref(&email.to_owned()))
            .change_context(Error::Query)?;
        for record in &records {
            if let Some(record_email) = &record.email {
                self.id_by_email
                    .insert(record_email.clone(), (record.username.clone(), record.id.clone()));
            }
        }
        self.store(records);
        self.id_by_email
            .get(email)
            .cloned()
            .ok_or_else(|| report!(Error::UnknownEmail(email.to_owned())))
    }

    fn resolve_hinted(&mut self, requested: &str) -> Result<(), Error> {
        let batch: Vec<String> = self.hinted.iter().cloned().collect();
        match self.directory.query_users_by_name(&batch) {
            Ok(records) => {
                self.store(records);
                self.hinted.clear();
                Ok(())
            }
            Err(err) => {
                if !matches!(
                    err.current_context(),
                    review::Error::UnknownUsernames(_)
                ) {
                    return Err(err).change_context(Error::Query);
                }
                // One bad name poisons the whole batch. Isolate the name the
                // caller actually needs and give up on batching the rest;
                // they will be re-hinted next time they matter.
                debug!("batched user lookup rejected, isolating '{requested}'");
                self.hinted.clear();
                let single = [requested.to_owned()];
                match self.directory.query_users_by_name(&single) {
                    Ok(records) => {
                        self.store(records);
                        Ok(())
                    }
                    Err(err)
                        if matches!(
                            err.current_context(),
                            review::Error::UnknownUsernames(_)
                        ) =>
                    {
                        report!(Error::UnknownUsername(requested.to_owned())).wrap_err()
                    }
                    Err(err) => Err(err).change_context(Error::Query),
                }
            }
        }
    }

    /// Populate both directions from resolved records.
    fn store(&mut self, records: Vec<UserRecord>) {
        for record in records {
            self.hinted.remove(&record.username);
            self.username_by_id
                .insert(record.id.clone(), record.username.clone());
            self.id_by_username.insert(record.username, record.id);
        }
    }

    /// The names hinted but not yet resolved.
    pub fn hinted_usernames(&self) -> Vec<String> {
        self.hinted.iter().cloned().collect()
    }
}

impl std::fmt::Debug for UserCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserCache")
            .field("known_users", &self.id_by_username.len())
            .field("hinted", &self.hinted)
            .finish_non_exhaustive()
    }
}
