//! Object-key conventions for hot storage.
//!
//! Keys look like `<prefix>/<user_id>/<uuid>~<original_filename>`. The tilde
//! separates the generated unique part from the human-readable name, and the
//! display name is always the substring after the *last* tilde.

use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::id::{JobId, UserId};

const NAME_SEPARATOR: char = '~';

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ObjectKey(String);

impl ObjectKey {
    pub fn new(value: impl Into<String>) -> Result<Self, DomainError> {
        let value = value.into();
        if value.is_empty() {
            return Err(DomainError::validation("object key is empty"));
        }
        if value.starts_with('/') || value.ends_with('/') {
            return Err(DomainError::validation(format!(
                "object key must not start or end with '/': {value}"
            )));
        }
        if value.split('/').any(str::is_empty) {
            return Err(DomainError::validation(format!(
                "object key has an empty segment: {value}"
            )));
        }
        Ok(Self(value))
    }

    /// Key of an input upload: `<prefix>/<user_id>/<job_id>~<file_name>`.
    pub fn input(
        prefix: &str,
        user_id: &UserId,
        job_id: JobId,
        file_name: &str,
    ) -> Result<Self, DomainError> {
        check_file_name(file_name)?;
        Self::new(format!("{prefix}/{user_id}/{job_id}{NAME_SEPARATOR}{file_name}"))
    }

    /// Key of a file owned by `user_id`, keeping the (already unique) file name.
    pub fn for_user(prefix: &str, user_id: &UserId, file_name: &str) -> Result<Self, DomainError> {
        check_file_name(file_name)?;
        Self::new(format!("{prefix}/{user_id}/{file_name}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Last path component (`<uuid>~<original_filename>`).
    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    /// Human-readable name: everything after the last `~`.
    pub fn display_name(&self) -> &str {
        let file_name = self.file_name();
        match file_name.rfind(NAME_SEPARATOR) {
            Some(idx) => &file_name[idx + NAME_SEPARATOR.len_utf8()..],
            None => file_name,
        }
    }

    /// Job id embedded in the unique part of the file name, if any.
    pub fn job_id(&self) -> Option<JobId> {
        let file_name = self.file_name();
        let (unique, _) = file_name.split_once(NAME_SEPARATOR)?;
        unique.parse().ok()
    }
}

impl core::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ObjectKey {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for ObjectKey {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ObjectKey> for String {
    fn from(value: ObjectKey) -> Self {
        value.0
    }
}

/// A file name must stay a single key segment.
fn check_file_name(file_name: &str) -> Result<(), DomainError> {
    if file_name.is_empty() || file_name.contains('/') {
        return Err(DomainError::validation(format!(
            "file name must be a non-empty single segment: {file_name:?}"
        )));
    }
    Ok(())
}
