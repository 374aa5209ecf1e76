//! Process-global provider registry.
//!
//! Maps provider id → factory behind a synchronized map. Mutation happens
//! only through this API; tests rely on `register` / `unregister` / `clear`.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use chorus_domain::capability::CapabilityKind;
use chorus_domain::config::LlmConfig;
use chorus_domain::error::{LlmError, Result};

use crate::factory::ProviderFactory;
use crate::traits::Provider;

static FACTORIES: RwLock<BTreeMap<String, Arc<dyn ProviderFactory>>> =
    RwLock::new(BTreeMap::new());

/// Register a factory. Fails with `InvalidRequest` when the id is taken.
pub fn register(factory: Arc<dyn ProviderFactory>) -> Result<()> {
    let id = factory.provider_id().to_string();
    let mut factories = FACTORIES.write();
    if factories.contains_key(&id) {
        return Err(LlmError::InvalidRequest(format!(
            "provider '{id}' is already registered"
        )));
    }
    tracing::debug!(provider_id = %id, "registered provider factory");
    factories.insert(id, factory);
    Ok(())
}

/// Register a factory, replacing any existing registration for the same id.
pub fn register_or_replace(factory: Arc<dyn ProviderFactory>) {
    let id = factory.provider_id().to_string();
    FACTORIES.write().insert(id, factory);
}

/// Remove a registration. Returns true when something was removed.
pub fn unregister(provider_id: &str) -> bool {
    FACTORIES.write().remove(provider_id).is_some()
}

/// Look up a factory by id.
pub fn lookup(provider_id: &str) -> Option<Arc<dyn ProviderFactory>> {
    FACTORIES.read().get(provider_id).cloned()
}

pub fn is_registered(provider_id: &str) -> bool {
    FACTORIES.read().contains_key(provider_id)
}

/// All registered provider ids, sorted.
pub fn list() -> Vec<String> {
    FACTORIES.read().keys().cloned().collect()
}

/// Ids of all providers advertising the given capability, sorted.
pub fn providers_with(kind: CapabilityKind) -> Vec<String> {
    FACTORIES
        .read()
        .iter()
        .filter(|(_, f)| f.supports(kind))
        .map(|(id, _)| id.clone())
        .collect()
}

/// Drop every registration. Intended for tests.
pub fn clear() {
    FACTORIES.write().clear();
}

/// Resolve a factory and build a provider: lookup → validate → create.
pub fn create(provider_id: &str, config: &LlmConfig) -> Result<Arc<dyn Provider>> {
    let factory = lookup(provider_id).ok_or_else(|| {
        LlmError::InvalidRequest(format!(
            "unknown provider '{provider_id}' (registered: {})",
            list().join(", ")
        ))
    })?;
    factory.validate(config)?;
    factory.create(config)
}
