pub mod anomaly;
pub mod baseline;
pub mod signature;

pub use anomaly::{AnomalyEngine, COUNTRY_FIELD};
pub use baseline::{BaselineArena, BaselineKey, BaselineState};
pub use signature::{evaluate, CatalogSnapshot, SignatureCatalog};
