//! Claimed vs. granted privilege.
//!
//! An entry's `author_rights` is only ever a claim. The [`RightsRegistry`]
//! records what each identity is actually allowed to assert, and the
//! [`RightsGuard`] checks the claim against it before anything reaches the
//! ledger.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SpineError};

/// Privilege class a memory is written under, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RightsClass {
    /// Model-generated or ephemeral material. Implicitly granted to everyone.
    Agent,
    /// Co-authored between user and model.
    SymbioticFluid,
    /// User-owned ground truth.
    UserSovereign,
    /// Operator material.
    System,
}

impl RightsClass {
    pub const ALL: [RightsClass; 4] = [
        RightsClass::Agent,
        RightsClass::SymbioticFluid,
        RightsClass::UserSovereign,
        RightsClass::System,
    ];

    pub const LOWEST: RightsClass = RightsClass::Agent;

    pub fn as_str(self) -> &'static str {
        match self {
            RightsClass::Agent => "agent",
            RightsClass::SymbioticFluid => "symbiotic_fluid",
            RightsClass::UserSovereign => "user_sovereign",
            RightsClass::System => "system",
        }
    }
}

impl fmt::Display for RightsClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RightsClass {
    type Err = SpineError;

    fn from_str(s: &str) -> Result<Self> {
        RightsClass::ALL
            .into_iter()
            .find(|class| class.as_str() == s)
            .ok_or_else(|| SpineError::validation(format!("unknown rights class '{s}'")))
    }
}

/// Identity → granted rights classes. Only changed by an administrative reload.
///
/// Identities without an entry hold the lowest class and nothing else.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RightsRegistry {
    pub identities: HashMap<String, BTreeSet<RightsClass>>,
}

impl RightsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style grant, mostly for tests and bootstrapping.
    pub fn grant(mut self, identity: &str, classes: &[RightsClass]) -> Self {
        self.identities
            .entry(identity.to_string())
            .or_default()
            .extend(classes.iter().copied());
        self
    }

    /// Everything `identity` may assert. The lowest class is always included,
    /// and it is all an unknown identity gets.
    pub fn granted(&self, identity: &str) -> BTreeSet<RightsClass> {
        let mut granted = self.identities.get(identity).cloned().unwrap_or_default();
        granted.insert(RightsClass::LOWEST);
        granted
    }

    pub fn is_known(&self, identity: &str) -> bool {
        self.identities.contains_key(identity)
    }

    /// Rights an exchange record is written under for `identity`: co-authored
    /// when the identity holds that class, otherwise the lowest class.
    /// Never derived from request content.
    pub fn exchange_rights(&self, identity: &str) -> RightsClass {
        if self.granted(identity).contains(&RightsClass::SymbioticFluid) {
            RightsClass::SymbioticFluid
        } else {
            RightsClass::LOWEST
        }
    }
}

/// Write-authorization gate in front of the ledger.
pub struct RightsGuard {
    registry: RwLock<Arc<RightsRegistry>>,
}

impl RightsGuard {
    pub fn new(registry: RightsRegistry) -> Self {
        Self {
            registry: RwLock::new(Arc::new(registry)),
        }
    }

    /// Pure check: succeeds only when `identity`'s granted set contains `claimed`.
    pub fn authorize(&self, claimed: RightsClass, identity: &str) -> Result<()> {
        let registry = self.registry();
        if registry.granted(identity).contains(&claimed) {
            return Ok(());
        }
        tracing::warn!(
            identity,
            claimed = %claimed,
            known = registry.is_known(identity),
            "rights violation: write rejected"
        );
        Err(SpineError::RightsViolation {
            identity: identity.to_string(),
            claimed,
        })
    }

    /// Current registry snapshot.
    pub fn registry(&self) -> Arc<RightsRegistry> {
        self.registry.read().clone()
    }

    /// Administrative path: replace the registry wholesale.
    pub fn reload(&self, registry: RightsRegistry) {
        let identities = registry.identities.len();
        *self.registry.write() = Arc::new(registry);
        tracing::info!(identities, "rights registry reloaded");
    }
}
