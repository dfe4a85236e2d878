//! Bucket definitions.

use serde::{Deserialize, Serialize};

/// A named collection of objects served by one runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketDef {
    /// Bucket name (unique within the catalog).
    pub name: String,
    /// Name of the identity field.
    #[serde(default = "default_identity_field")]
    pub identity_field: String,
    /// Declared top-level fields. Empty means any field is accepted.
    #[serde(default)]
    pub fields: Vec<String>,
}

fn default_identity_field() -> String {
    "id".to_string()
}

impl BucketDef {
    /// Create a new bucket definition with `id` as the identity field.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            identity_field: default_identity_field(),
            fields: Vec::new(),
        }
    }

    /// Set the identity field.
    pub fn with_identity_field(mut self, field: impl Into<String>) -> Self {
        self.identity_field = field.into();
        self
    }

    /// Declare a field.
    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.fields.push(field.into());
        self
    }

    /// Declare multiple fields.
    pub fn with_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields.extend(fields.into_iter().map(Into::into));
        self
    }

    /// Check whether a field path is addressable on this bucket.
    ///
    /// Only the first path segment is checked against the declared fields;
    /// nested segments are free-form.
    pub fn has_field(&self, path: &str) -> bool {
        if self.fields.is_empty() {
            return true;
        }
        let head = path.split('.').next().unwrap_or(path);
        head == self.identity_field || self.fields.iter().any(|f| f == head)
    }
}
