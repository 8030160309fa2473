//! Scrape access control.
//!
//! [`AccessController`] makes the per-request decision (coarse `scrape`
//! capability plus window and frequency limits) and filters metric families
//! at fine grain. Reserved roles are checked against [`TopologySet`]s
//! computed elsewhere.

pub mod clock;
pub mod controller;
pub mod topology;

pub use clock::{Clock, ManualClock, SystemClock};
pub use controller::{
    AccessController, CORE_ROLE, MetricFamily, NEIGHBOR_ROLE, OWNER_ROLE, REVOKED_WINDOW,
    SCRAPE_PERMISSION, TimingKind, object_role, role_subject,
};
pub use topology::TopologySet;

use std::sync::Arc;

use crate::Result;
use crate::config::AccessConfig;
use crate::policy::FilePolicyStore;

/// Build a controller from configuration: open the policy file, load the
/// optional roles file, and install the topology sets.
pub fn from_config(config: &AccessConfig) -> Result<AccessController> {
    let store = Arc::new(FilePolicyStore::open(&config.policy_file)?);
    let controller = AccessController::new(
        store,
        config.active,
        TopologySet::new(config.core_identities.iter().cloned()),
        TopologySet::new(config.neighbor_identities.iter().cloned()),
    );
    if let Some(roles) = &config.roles_file {
        controller.load_roles_from_file(roles)?;
    }
    Ok(controller)
}
