//! Standard unit library
//!
//! Built-in processing units for loading, typing and summarising tabular
//! data, plus a couple of utility units.

mod convert;
mod debug;
mod load;
mod stats;
pub mod table;
mod time;

pub use convert::TableConvertUnit;
pub use debug::DebugLogUnit;
pub use load::LoadCsvUnit;
pub use stats::{ColumnStats, StatsDescribeUnit};
pub use time::DelayUnit;

use stepcore::RegistryError;
use stepruntime::{UnitRegistry, UnitRegistryBuilder};

/// Register all standard units with a registry builder
pub fn register_all(builder: &mut UnitRegistryBuilder) -> Result<(), RegistryError> {
    builder
        .register(|| Box::new(LoadCsvUnit))?
        .register(|| Box::new(TableConvertUnit))?
        .register(|| Box::new(StatsDescribeUnit))?
        .register(|| Box::new(DebugLogUnit))?
        .register(|| Box::new(DelayUnit))?;
    Ok(())
}

/// Registry holding only the standard units
pub fn standard_registry() -> Result<UnitRegistry, RegistryError> {
    let mut builder = UnitRegistry::builder();
    register_all(&mut builder)?;
    Ok(builder.build())
}
