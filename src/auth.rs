//! Capability checks supplied by the caller.
//!
//! The engine never decides who may do what. Before any mutating or
//! sensitive read it asks the acting [`Subject`], and aborts before
//! touching storage if the subject refuses.

use serde::{Deserialize, Serialize};

/// A subject refused a permission.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("access denied: {permission}{}", resource_suffix(.resource))]
pub struct AccessDenied {
    /// Permission that was checked.
    pub permission: String,
    /// `(resource_name, resource_id)` for resource-scoped checks.
    pub resource: Option<(String, String)>,
}

impl AccessDenied {
    /// Refusal of a plain permission.
    pub fn new(permission: impl Into<String>) -> Self {
        Self {
            permission: permission.into(),
            resource: None,
        }
    }

    /// Refusal of a permission on a specific resource.
    pub fn for_resource(
        permission: impl Into<String>,
        resource_name: impl Into<String>,
        resource_id: impl Into<String>,
    ) -> Self {
        Self {
            permission: permission.into(),
            resource: Some((resource_name.into(), resource_id.into())),
        }
    }
}

fn resource_suffix(resource: &Option<(String, String)>) -> String {
    match resource {
        Some((name, id)) => format!(" on {name}/{id}"),
        None => String::new(),
    }
}

/// The acting party of an operation.
///
/// Implementations typically wrap a session or token issued by an outer
/// layer. [`id`](Subject::id) becomes the `created_by` of stored events
/// unless the caller overrides it.
pub trait Subject: Send + Sync {
    /// Stable identifier of the actor.
    fn id(&self) -> &str;

    /// Check a plain permission.
    ///
    /// # Errors
    ///
    /// Returns [`AccessDenied`] if the subject lacks `permission`.
    fn audit(&self, permission: &str) -> Result<(), AccessDenied>;

    /// Check a permission on one resource.
    ///
    /// Defaults to [`audit`](Subject::audit), ignoring the resource.
    ///
    /// # Errors
    ///
    /// Returns [`AccessDenied`] if the subject lacks `permission` on the
    /// resource.
    fn audit_resource(
        &self,
        resource_name: &str,
        resource_id: &str,
        permission: &str,
    ) -> Result<(), AccessDenied> {
        let _ = (resource_name, resource_id);
        self.audit(permission)
    }
}

/// A subject that is allowed everything.
///
/// Used for bootstrap work, maintenance tooling and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemSubject {
    id: String,
}

impl SystemSubject {
    /// A system subject with the given identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

impl Default for SystemSubject {
    fn default() -> Self {
        Self::new("system")
    }
}

impl Subject for SystemSubject {
    fn id(&self) -> &str {
        &self.id
    }

    fn audit(&self, _permission: &str) -> Result<(), AccessDenied> {
        Ok(())
    }
}

/// Names of the permissions the event store audits.
///
/// Passed to the store at construction time so applications can map the
/// engine onto their own permission vocabulary.
///
/// # Examples
///
/// ```
/// use blobfold_es::Permissions;
///
/// let perms = Permissions::default().with_delete("admin.events.purge");
/// assert_eq!(perms.store, "events.store");
/// assert_eq!(perms.delete, "admin.events.purge");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Permissions {
    /// Appending events.
    pub store: String,
    /// Loading events and replaying streams or aggregates.
    pub read: String,
    /// Physically deleting events.
    pub delete: String,
    /// Exporting streams as JSON documents.
    pub export: String,
    /// Importing JSON documents into the log.
    pub import: String,
}

impl Default for Permissions {
    fn default() -> Self {
        Self {
            store: "events.store".into(),
            read: "events.read".into(),
            delete: "events.delete".into(),
            export: "events.export".into(),
            import: "events.import".into(),
        }
    }
}

impl Permissions {
    /// Override the store permission.
    pub fn with_store(mut self, name: impl Into<String>) -> Self {
        self.store = name.into();
        self
    }

    /// Override the read permission.
    pub fn with_read(mut self, name: impl Into<String>) -> Self {
        self.read = name.into();
        self
    }

    /// Override the delete permission.
    pub fn with_delete(mut self, name: impl Into<String>) -> Self {
        self.delete = name.into();
        self
    }

    /// Override the export permission.
    pub fn with_export(mut self, name: impl Into<String>) -> Self {
        self.export = name.into();
        self
    }

    /// Override the import permission.
    pub fn with_import(mut self, name: impl Into<String>) -> Self {
        self.import = name.into();
        self
    }
}


#[cfg(test)]
mod tests {
    use super::test_subjects::ListSubject;
    use super::*;

    #[test]
    fn system_subject_allows_everything() {
        let subject = SystemSubject::default();
        assert_eq!(subject.id(), "system");
        assert!(subject.audit("anything").is_ok());
        assert!(subject.audit_resource("person", "1", "anything").is_ok());
    }

    #[test]
    fn access_denied_display() {
        assert_eq!(
            AccessDenied::new("events.delete").to_string(),
            "access denied: events.delete"
        );
        assert_eq!(
            AccessDenied::for_resource("events.read", "person", "42").to_string(),
            "access denied: events.read on person/42"
        );
    }

    #[test]
    fn list_subject_audits() {
        let subject = ListSubject::new("alice", &["events.read"]);
        assert!(subject.audit("events.read").is_ok());
        let err = subject
            .audit_resource("person", "7", "events.store")
            .expect_err("store should be denied");
        assert_eq!(err.resource, Some(("person".into(), "7".into())));
    }

    #[test]
    fn permissions_deserialize_with_defaults() {
        let perms: Permissions =
            serde_json::from_str(r#"{"delete": "admin.purge"}"#).expect("valid config");
        assert_eq!(perms.delete, "admin.purge");
        assert_eq!(perms.read, "events.read");
    }
}
