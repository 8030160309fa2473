//! Scrape authorization with temporal permissions and reserved roles.
//!
//! Permissions live in a [`PolicyStore`] as `(subject, object, action)`
//! rules. On top of the plain `scrape` capability the controller understands
//! two timing actions, at most one of each per `(subject, object)`:
//!
//! - `window:<RFC3339>`: the grant lapses at that instant and is revoked on
//!   the first check after it
//! - `frequency:<duration>`: minimum spacing between successful scrapes
//!
//! Any other action names a metric family the subject may see.
//!
//! Roles are synthetic subjects named `<name>_role`. Roles whose name
//! contains `core` or `neighbor` are reserved for identities in the matching
//! [`TopologySet`].

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::RwLock;
use tracing::{debug, error, info, warn};
use trust_types::Role;

use super::clock::{Clock, SystemClock};
use super::topology::TopologySet;
use crate::audit::{self, AuditEvent};
use crate::policy::PolicyStore;
use crate::{Error, Result};

/// Capability to access an object at all.
pub const SCRAPE_PERMISSION: &str = "scrape";
/// Reserved role for core identities.
pub const CORE_ROLE: &str = "core";
/// Reserved role for neighbor identities.
pub const NEIGHBOR_ROLE: &str = "neighbor";
/// Per-object owner role, removed with the object.
pub const OWNER_ROLE: &str = "owner";

const ROLE_SUFFIX: &str = "_role";

/// Left in place of an expired window when `scrape` is still inherited
/// through a role. Setting or deleting the window, or
/// [`AccessController::allow_source`], clears it.
pub const REVOKED_WINDOW: &str = "window:revoked";

/// Kind of timing permission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimingKind {
    /// Expiring access window
    Window,
    /// Minimum spacing between scrapes
    Frequency,
}

impl TimingKind {
    /// Action prefix, including the trailing colon.
    #[must_use]
    pub fn prefix(self) -> &'static str {
        match self {
            Self::Window => "window:",
            Self::Frequency => "frequency:",
        }
    }
}

impl fmt::Display for TimingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix().trim_end_matches(':'))
    }
}

impl FromStr for TimingKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "window" => Ok(Self::Window),
            "frequency" => Ok(Self::Frequency),
            other => Err(Error::Policy(format!(
                "unknown timing permission '{other}', expected 'window' or 'frequency'"
            ))),
        }
    }
}

/// Something with a metric family name.
pub trait MetricFamily {
    /// Family name as matched against permissions.
    fn family_name(&self) -> &str;
}

impl MetricFamily for String {
    fn family_name(&self) -> &str {
        self
    }
}

impl MetricFamily for &str {
    fn family_name(&self) -> &str {
        self
    }
}

/// Internal subject name for role `name`.
#[must_use]
pub fn role_subject(name: &str) -> String {
    format!("{name}{ROLE_SUFFIX}")
}

/// Role name scoped to `object`: `/node` + `ops` gives `node_ops`.
#[must_use]
pub fn object_role(object: &str, role: &str) -> String {
    format!("{}_{role}", object.trim_start_matches('/'))
}

type AccessKey = (String, String);

/// Authorization decisions for inbound scrapes.
pub struct AccessController {
    store: Arc<dyn PolicyStore>,
    active: AtomicBool,
    last_access: RwLock<HashMap<AccessKey, DateTime<Utc>>>,
    core: TopologySet,
    neighbors: TopologySet,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for AccessController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessController")
            .field("active", &self.is_active())
            .field("core", &self.core)
            .field("neighbors", &self.neighbors)
            .finish_non_exhaustive()
    }
}

impl AccessController {
    /// Controller over `store` using the system clock.
    pub fn new(
        store: Arc<dyn PolicyStore>,
        active: bool,
        core: TopologySet,
        neighbors: TopologySet,
    ) -> Self {
        Self {
            store,
            active: AtomicBool::new(active),
            last_access: RwLock::new(HashMap::new()),
            core,
            neighbors,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Underlying policy store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn PolicyStore> {
        &self.store
    }

    // ── Kill switch ──────────────────────────────────────────────────────────

    /// Enforce permissions.
    pub fn enable(&self) {
        if !self.active.swap(true, Ordering::AcqRel) {
            info!("Access control enabled");
        }
    }

    /// Authorize everything.
    pub fn disable(&self) {
        if self.active.swap(false, Ordering::AcqRel) {
            warn!("Access control disabled, all scrapes authorized");
        }
    }

    /// `true` while permissions are enforced.
    #[must_use]
    #[inline]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    // ── Decisions ────────────────────────────────────────────────────────────

    /// Decide whether `subject` may scrape `object` now.
    ///
    /// An expired window revokes the grant, so later calls fail with
    /// [`Error::NotAuthorized`]. A successful check under a frequency
    /// permission records the access time.
    pub fn authorized(&self, subject: &str, object: &str) -> Result<()> {
        if !self.is_active() {
            return Ok(());
        }

        if !self.store.enforce(subject, object, SCRAPE_PERMISSION) {
            debug!(subject = %subject, object = %object, "Scrape not authorized");
            audit::emit(&AuditEvent::access_denied(subject, object));
            return Err(not_authorized(subject, object));
        }

        let actions: Vec<String> = self
            .store
            .permissions_for(subject)
            .into_iter()
            .filter(|p| p.object == object)
            .map(|p| p.action)
            .collect();

        if actions.iter().any(|a| a == REVOKED_WINDOW) {
            debug!(subject = %subject, object = %object, "Window grant was revoked");
            audit::emit(&AuditEvent::access_denied(subject, object));
            return Err(not_authorized(subject, object));
        }

        let now = self.clock.now();

        let windows: Vec<&String> = actions
            .iter()
            .filter(|a| a.starts_with(TimingKind::Window.prefix()))
            .collect();
        let expired = windows.iter().any(|action| match parse_window(action) {
            Some(expiry) => now > expiry,
            None => {
                warn!(subject = %subject, object = %object, action = %action, "Unparsable window permission, treating as expired");
                true
            }
        });
        if expired {
            self.revoke_expired(subject, object, &windows);
            return Err(Error::TimeExpired {
                subject: subject.to_string(),
                object: object.to_string(),
            });
        }

        let mut spacing: Option<Duration> = None;
        for action in actions
            .iter()
            .filter(|a| a.starts_with(TimingKind::Frequency.prefix()))
        {
            let Some(d) = parse_frequency(action) else {
                warn!(subject = %subject, object = %object, action = %action, "Unparsable frequency permission, denying");
                audit::emit(&AuditEvent::access_denied(subject, object));
                return Err(not_authorized(subject, object));
            };
            spacing = Some(spacing.map_or(d, |s| s.max(d)));
        }

        if let Some(spacing) = spacing {
            self.check_frequency(subject, object, spacing, now)?;
        }

        Ok(())
    }

    fn check_frequency(
        &self,
        subject: &str,
        object: &str,
        spacing: Duration,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let spacing_chrono = chrono::Duration::from_std(spacing)
            .map_err(|e| Error::Policy(format!("frequency out of range: {e}")))?;
        let key = (subject.to_string(), object.to_string());

        // Check and update under one write section.
        let mut table = self.last_access.write();
        if let Some(last) = table.get(&key).copied() {
            let next_allowed = last + spacing_chrono;
            if now < next_allowed {
                let retry_after = (next_allowed - now).to_std().unwrap_or(Duration::ZERO);
                drop(table);
                debug!(subject = %subject, object = %object, retry_after = ?retry_after, "Scrape rate limited");
                audit::emit(&AuditEvent::access_rate_limited(subject, object, retry_after));
                return Err(Error::RateLimited {
                    subject: subject.to_string(),
                    object: object.to_string(),
                    retry_after,
                });
            }
        }
        table.insert(key, now);
        Ok(())
    }

    fn revoke_expired(&self, subject: &str, object: &str, windows: &[&String]) {
        info!(subject = %subject, object = %object, "Access window expired, revoking scrape");
        audit::emit(&AuditEvent::access_expired(subject, object));

        if let Err(e) = self.store.delete_permission(subject, object, SCRAPE_PERMISSION) {
            error!(subject = %subject, object = %object, error = %e, "Failed to revoke expired grant");
        }
        self.last_access
            .write()
            .remove(&(subject.to_string(), object.to_string()));

        // Scrape may still be inherited through a role: pin the revocation
        // for this pair. Without the marker the expired window stays, so the
        // pair keeps failing either way.
        if self.store.enforce(subject, object, SCRAPE_PERMISSION) {
            warn!(subject = %subject, object = %object, "Scrape still inherited through a role, keeping window revoked");
            if let Err(e) = self.store.add_permission(subject, object, REVOKED_WINDOW) {
                error!(subject = %subject, object = %object, error = %e, "Failed to record window revocation");
                return;
            }
        }
        for window in windows {
            if let Err(e) = self.store.delete_permission(subject, object, window) {
                error!(subject = %subject, object = %object, action = %window, error = %e, "Failed to remove expired window");
            }
        }
    }

    /// Keep the families `subject` may see on `object`, in order.
    pub fn filter_metrics<F: MetricFamily>(
        &self,
        subject: &str,
        object: &str,
        families: Vec<F>,
    ) -> Vec<F> {
        families
            .into_iter()
            .filter(|f| self.store.enforce(subject, object, f.family_name()))
            .collect()
    }

    /// [`authorized`](Self::authorized) followed by
    /// [`filter_metrics`](Self::filter_metrics): what a scrape handler serves.
    /// Nothing is returned on any error.
    pub fn serve_scrape<F: MetricFamily>(
        &self,
        subject: &str,
        object: &str,
        families: Vec<F>,
    ) -> Result<Vec<F>> {
        self.authorized(subject, object)?;
        Ok(self.filter_metrics(subject, object, families))
    }

    // ── Roles ────────────────────────────────────────────────────────────────

    /// Define a role with its permissions.
    pub fn create_role(&self, role: &Role) -> Result<()> {
        let subject = role_subject(&role.name);
        for (object, actions) in &role.permissions {
            for action in actions {
                self.store.add_permission(&subject, object, action)?;
            }
        }
        info!(role = %role.name, "Role created");
        Ok(())
    }

    /// Remove a role, its permissions and its memberships.
    pub fn delete_role(&self, name: &str) -> Result<()> {
        self.store.delete_role(&role_subject(name))?;
        info!(role = %name, "Role deleted");
        Ok(())
    }

    /// Every defined role name.
    #[must_use]
    pub fn all_roles(&self) -> Vec<String> {
        self.store
            .all_subjects()
            .into_iter()
            .filter_map(|s| s.strip_suffix(ROLE_SUFFIX).map(str::to_string))
            .collect()
    }

    /// Roles `subject` holds directly.
    #[must_use]
    pub fn roles_for(&self, subject: &str) -> Vec<String> {
        self.store
            .roles_for(subject)
            .into_iter()
            .map(|r| r.strip_suffix(ROLE_SUFFIX).map_or(r.clone(), str::to_string))
            .collect()
    }

    /// Definition of role `name`, if it carries any permission.
    #[must_use]
    pub fn role_info(&self, name: &str) -> Option<Role> {
        let permissions = self.subject_permissions(&role_subject(name));
        (!permissions.is_empty()).then(|| Role {
            name: name.to_string(),
            permissions,
        })
    }

    /// Give `subject` role `name`.
    ///
    /// Names containing `core` or `neighbor` are only granted to identities
    /// in the corresponding topology set.
    pub fn add_role(&self, subject: &str, name: &str) -> Result<()> {
        let core_violation = name.contains(CORE_ROLE) && !self.core.contains(subject);
        let neighbor_violation = name.contains(NEIGHBOR_ROLE) && !self.neighbors.contains(subject);
        if core_violation || neighbor_violation {
            warn!(subject = %subject, role = %name, "Reserved role refused");
            audit::emit(&AuditEvent::reserved_role_violation(subject, name));
            return Err(Error::ReservedRole {
                subject: subject.to_string(),
                role: name.to_string(),
            });
        }
        self.store.add_role_member(subject, &role_subject(name))?;
        info!(subject = %subject, role = %name, "Role granted");
        Ok(())
    }

    /// Take role `name` from `subject`.
    pub fn remove_role(&self, subject: &str, name: &str) -> Result<()> {
        self.store.remove_role_member(subject, &role_subject(name))?;
        info!(subject = %subject, role = %name, "Role removed");
        Ok(())
    }

    /// Grant `actions` on `object` to the object-scoped role
    /// `<object>_<role>` (see [`object_role`]).
    pub fn add_role_permissions(&self, role: &str, object: &str, actions: &[String]) -> Result<()> {
        let subject = role_subject(&object_role(object, role));
        for action in actions {
            self.store.add_permission(&subject, object, action)?;
        }
        Ok(())
    }

    /// Revoke `actions` on `object` from the object-scoped role.
    pub fn remove_role_permissions(
        &self,
        role: &str,
        object: &str,
        actions: &[String],
    ) -> Result<()> {
        let subject = role_subject(&object_role(object, role));
        for action in actions {
            self.store.delete_permission(&subject, object, action)?;
        }
        Ok(())
    }

    /// Load role definitions from a JSON list of `{name, permissions}`.
    ///
    /// Unusable entries are logged and skipped. Returns how many entries
    /// were applied.
    pub fn load_roles_from_file(&self, path: &Path) -> Result<usize> {
        let data = std::fs::read(path)?;
        let entries: Vec<serde_json::Value> = serde_json::from_slice(&data)?;

        let mut applied = 0;
        for (idx, entry) in entries.into_iter().enumerate() {
            let role: Role = match serde_json::from_value(entry) {
                Ok(role) => role,
                Err(e) => {
                    warn!(path = %path.display(), index = idx, error = %e, "Skipping malformed role entry");
                    continue;
                }
            };
            if role.name.trim().is_empty() {
                warn!(path = %path.display(), index = idx, "Skipping role entry without a name");
                continue;
            }
            if let Some(bad) = role.permissions.keys().find(|o| !o.starts_with('/')) {
                warn!(path = %path.display(), role = %role.name, object = %bad, "Skipping role entry, objects must start with '/'");
                continue;
            }
            for (object, actions) in &role.permissions {
                self.add_role_permissions(&role.name, object, actions)?;
            }
            applied += 1;
        }

        info!(path = %path.display(), roles = applied, "Role definitions loaded");
        Ok(applied)
    }

    // ── Subject permissions ──────────────────────────────────────────────────

    /// Grant `scrape` on `object`, lifting an earlier window revocation.
    pub fn allow_source(&self, subject: &str, object: &str) -> Result<()> {
        self.store.delete_permission(subject, object, REVOKED_WINDOW)?;
        self.store.add_permission(subject, object, SCRAPE_PERMISSION)?;
        info!(subject = %subject, object = %object, "Scrape allowed");
        Ok(())
    }

    /// Revoke `scrape` on `object`.
    pub fn block_source(&self, subject: &str, object: &str) -> Result<()> {
        self.store
            .delete_permission(subject, object, SCRAPE_PERMISSION)?;
        info!(subject = %subject, object = %object, "Scrape blocked");
        Ok(())
    }

    /// Direct permissions of `subject`, grouped by object.
    #[must_use]
    pub fn subject_permissions(&self, subject: &str) -> BTreeMap<String, Vec<String>> {
        let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for p in self.store.permissions_for(subject) {
            map.entry(p.object).or_default().push(p.action);
        }
        map
    }

    /// Direct plus role-inherited permissions of `subject`.
    #[must_use]
    pub fn all_permissions(&self, subject: &str) -> BTreeMap<String, Vec<String>> {
        let mut map = self.subject_permissions(subject);
        for role in self.store.roles_for(subject) {
            for p in self.store.permissions_for(&role) {
                let actions = map.entry(p.object).or_default();
                if !actions.contains(&p.action) {
                    actions.push(p.action);
                }
            }
        }
        map
    }

    /// Direct actions of `subject` on `object`.
    #[must_use]
    pub fn permissions_for_object(&self, subject: &str, object: &str) -> Vec<String> {
        self.store
            .permissions_for(subject)
            .into_iter()
            .filter(|p| p.object == object)
            .map(|p| p.action)
            .collect()
    }

    /// Every non-role subject holding a permission.
    #[must_use]
    pub fn all_sources(&self) -> Vec<String> {
        self.store
            .all_subjects()
            .into_iter()
            .filter(|s| !s.ends_with(ROLE_SUFFIX))
            .collect()
    }

    /// Set the `kind` timing permission of `subject` on `object`, replacing
    /// any existing one.
    ///
    /// A window accepts an RFC3339 expiry or a duration from now; a
    /// frequency accepts a duration.
    pub fn add_timing_permission(
        &self,
        subject: &str,
        object: &str,
        kind: TimingKind,
        value: &str,
    ) -> Result<()> {
        let value = value.trim();
        let action = match kind {
            TimingKind::Window => {
                let expiry = match DateTime::parse_from_rfc3339(value) {
                    Ok(ts) => ts.with_timezone(&Utc),
                    Err(_) => {
                        let d = humantime::parse_duration(value).map_err(|e| {
                            Error::Policy(format!(
                                "window '{value}' is neither RFC3339 nor a duration: {e}"
                            ))
                        })?;
                        let d = chrono::Duration::from_std(d)
                            .map_err(|e| Error::Policy(format!("window out of range: {e}")))?;
                        self.clock.now() + d
                    }
                };
                format!(
                    "{}{}",
                    kind.prefix(),
                    expiry.to_rfc3339_opts(SecondsFormat::Secs, true)
                )
            }
            TimingKind::Frequency => {
                humantime::parse_duration(value).map_err(|e| {
                    Error::Policy(format!("frequency '{value}' is not a duration: {e}"))
                })?;
                format!("{}{value}", kind.prefix())
            }
        };

        self.delete_timing_permission(subject, object, kind)?;
        self.store.add_permission(subject, object, &action)?;
        info!(subject = %subject, object = %object, permission = %action, "Timing permission set");
        Ok(())
    }

    /// Remove the `kind` timing permission of `subject` on `object`.
    /// Returns `false` if there was none.
    pub fn delete_timing_permission(
        &self,
        subject: &str,
        object: &str,
        kind: TimingKind,
    ) -> Result<bool> {
        let mut removed = false;
        for action in self.permissions_for_object(subject, object) {
            if action.starts_with(kind.prefix()) {
                removed |= self.store.delete_permission(subject, object, &action)?;
            }
        }
        if removed && kind == TimingKind::Frequency {
            self.last_access
                .write()
                .remove(&(subject.to_string(), object.to_string()));
        }
        Ok(removed)
    }

    /// Revoke everything `subject` holds: permissions and role memberships.
    pub fn delete_all_permissions(&self, subject: &str) -> Result<()> {
        self.store.delete_subject(subject)?;
        self.last_access.write().retain(|(s, _), _| s != subject);
        info!(subject = %subject, "All permissions revoked");
        Ok(())
    }

    /// Revoke everything tied to `object`: its owner role and every grant on it.
    pub fn delete_all_object_permissions(&self, object: &str) -> Result<()> {
        self.store
            .delete_role(&role_subject(&object_role(object, OWNER_ROLE)))?;
        let removed = self.store.remove_object(object)?;
        self.last_access.write().retain(|(_, o), _| o != object);
        info!(object = %object, rules = removed, "All object permissions revoked");
        Ok(())
    }
}

fn not_authorized(subject: &str, object: &str) -> Error {
    Error::NotAuthorized {
        subject: subject.to_string(),
        object: object.to_string(),
    }
}

fn parse_window(action: &str) -> Option<DateTime<Utc>> {
    let ts = action.strip_prefix(TimingKind::Window.prefix())?;
    DateTime::parse_from_rfc3339(ts)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn parse_frequency(action: &str) -> Option<Duration> {
    let value = action.strip_prefix(TimingKind::Frequency.prefix())?;
    humantime::parse_duration(value).ok()
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
