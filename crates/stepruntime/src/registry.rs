use std::collections::BTreeMap;
use std::sync::Arc;
use stepcore::{ModuleDescriptor, ProcessingUnit, RegistryError};

/// Constructor for a processing unit implementation
pub type UnitConstructor = Arc<dyn Fn() -> Box<dyn ProcessingUnit> + Send + Sync>;

struct RegisteredUnit {
    constructor: UnitConstructor,
    descriptor: ModuleDescriptor,
}

/// Collects unit constructors at startup.
///
/// Each constructor is called once to obtain a disposable instance whose
/// module type becomes the registration key. Registering a second
/// implementation under a taken module type fails.
#[derive(Default)]
pub struct UnitRegistryBuilder {
    units: BTreeMap<String, RegisteredUnit>,
}

impl UnitRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a unit constructor
    pub fn register<F>(&mut self, constructor: F) -> Result<&mut Self, RegistryError>
    where
        F: Fn() -> Box<dyn ProcessingUnit> + Send + Sync + 'static,
    {
        let sample = constructor();
        let descriptor = ModuleDescriptor::of(sample.as_ref());
        let module_type = descriptor.module_type.clone();

        if self.units.contains_key(&module_type) {
            tracing::error!("Rejecting duplicate registration of module type: {}", module_type);
            return Err(RegistryError::DuplicateModuleType(module_type));
        }

        tracing::info!("Registering module type: {}", module_type);
        self.units.insert(
            module_type,
            RegisteredUnit {
                constructor: Arc::new(constructor),
                descriptor,
            },
        );
        Ok(self)
    }

    pub fn build(self) -> UnitRegistry {
        UnitRegistry { units: self.units }
    }
}

/// Immutable registry of available unit implementations
pub struct UnitRegistry {
    units: BTreeMap<String, RegisteredUnit>,
}

impl UnitRegistry {
    pub fn builder() -> UnitRegistryBuilder {
        UnitRegistryBuilder::new()
    }

    /// An empty registry
    pub fn empty() -> Self {
        UnitRegistryBuilder::new().build()
    }

    /// Create a fresh unit instance for a module type
    pub fn get(&self, module_type: &str) -> Result<Box<dyn ProcessingUnit>, RegistryError> {
        self.units
            .get(module_type)
            .map(|unit| (unit.constructor)())
            .ok_or_else(|| RegistryError::UnknownModuleType(module_type.to_string()))
    }

    pub fn contains(&self, module_type: &str) -> bool {
        self.units.contains_key(module_type)
    }

    /// Get all registered module types, sorted
    pub fn module_types(&self) -> Vec<String> {
        self.units.keys().cloned().collect()
    }

    pub fn descriptor(&self, module_type: &str) -> Option<&ModuleDescriptor> {
        self.units.get(module_type).map(|unit| &unit.descriptor)
    }

    /// Catalog of every registered unit, sorted by module type
    pub fn list_modules(&self) -> Vec<ModuleDescriptor> {
        self.units.values().map(|unit| unit.descriptor.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

impl Default for UnitRegistry {
    fn default() -> Self {
        Self::empty()
    }
}
