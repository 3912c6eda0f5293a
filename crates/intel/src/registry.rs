//! Explicit entity-type → intel mapping, validated when built.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::{AwsEks, Intel};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("duplicate intel for entity type {0}")]
    Duplicate(String),
    #[error("no intel registered for entity type {0}")]
    Unknown(String),
}

#[derive(Clone, Default)]
pub struct IntelRegistry {
    by_type: BTreeMap<&'static str, Arc<dyn Intel>>,
}

impl IntelRegistry {
    /// Rejects two intels claiming the same entity type.
    pub fn new(intels: Vec<Arc<dyn Intel>>) -> Result<Self, RegistryError> {
        let mut by_type = BTreeMap::new();
        for intel in intels {
            let key = intel.entity_type();
            if by_type.insert(key, intel).is_some() {
                return Err(RegistryError::Duplicate(key.to_string()));
            }
        }
        Ok(Self { by_type })
    }

    /// Every intel shipped with vigil.
    pub fn builtin() -> Result<Self, RegistryError> { Self::new(vec![Arc::new(AwsEks)]) }

    pub fn get(&self, entity_type: &str) -> Result<Arc<dyn Intel>, RegistryError> {
        self.by_type
            .get(entity_type)
            .cloned()
            .ok_or_else(|| RegistryError::Unknown(entity_type.to_string()))
    }

    pub fn entity_types(&self) -> impl Iterator<Item = &'static str> + '_ { self.by_type.keys().copied() }
}

impl std::fmt::Debug for IntelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntelRegistry").field("entity_types", &self.by_type.keys().collect::<Vec<_>>()).finish()
    }
}
