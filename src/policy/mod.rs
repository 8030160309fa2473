//! Generic subject/object/action policy engine with role membership.
//!
//! [`PolicyStore`] is the contract the access controller is written against;
//! [`FilePolicyStore`] is the bundled implementation, an in-memory rule table
//! written through to a human-editable rule file on every change.

mod file;

pub use file::FilePolicyStore;

use crate::Result;

/// A `(object, action)` pair held by some subject.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Permission {
    /// Object (mapping path)
    pub object: String,
    /// Action: `scrape`, `window:<ts>`, `frequency:<dur>`, or a metric name
    pub action: String,
}

impl Permission {
    /// Build a permission.
    pub fn new(object: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            object: object.into(),
            action: action.into(),
        }
    }
}

/// Role/permission engine.
///
/// Implementations must be safe for concurrent reads and serialize their own
/// writes. Every mutating call is durable before it returns.
pub trait PolicyStore: Send + Sync {
    /// `true` if `subject`, directly or through any chain of role
    /// memberships, holds `action` on `object`.
    fn enforce(&self, subject: &str, object: &str, action: &str) -> bool;

    /// Permissions held directly by `subject` (not inherited).
    fn permissions_for(&self, subject: &str) -> Vec<Permission>;

    /// Grant `action` on `object`. Returns `false` if already present.
    fn add_permission(&self, subject: &str, object: &str, action: &str) -> Result<bool>;

    /// Revoke `action` on `object`. Returns `false` if it was not present.
    fn delete_permission(&self, subject: &str, object: &str, action: &str) -> Result<bool>;

    /// Make `member` a member of `role`. Returns `false` if already a member.
    fn add_role_member(&self, member: &str, role: &str) -> Result<bool>;

    /// Remove `member` from `role`. Returns `false` if it was not a member.
    fn remove_role_member(&self, member: &str, role: &str) -> Result<bool>;

    /// Roles `member` belongs to directly.
    fn roles_for(&self, member: &str) -> Vec<String>;

    /// Remove `role`: its own permissions and every membership naming it.
    fn delete_role(&self, role: &str) -> Result<()>;

    /// Remove every permission held by `subject` and every role it belongs to.
    fn delete_subject(&self, subject: &str) -> Result<()>;

    /// Remove every permission on `object`, whoever holds it. Returns the
    /// number of rules removed.
    fn remove_object(&self, object: &str) -> Result<usize>;

    /// Subjects that hold at least one permission, in first-seen order.
    fn all_subjects(&self) -> Vec<String>;

    /// Force the current rule set to durable storage.
    fn persist(&self) -> Result<()>;
}
