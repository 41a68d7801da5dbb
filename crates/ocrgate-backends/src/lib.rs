//! Built-in recognition backends and the catalog the dispatcher registers
//! them from.

#[cfg(feature = "mock")]
pub mod mock;
#[cfg(feature = "tesseract")]
pub mod tesseract;

use serde::{Deserialize, Serialize};

use ocrgate_pipeline::CatalogEntry;

#[cfg(feature = "mock")]
pub use mock::{MockBackend, MockConfig, MockLoader};
#[cfg(feature = "tesseract")]
pub use tesseract::{TesseractBackend, TesseractConfig, TesseractLoader};

/// Settings for every built-in backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendsConfig {
    #[cfg(feature = "mock")]
    pub mock: MockConfig,
    /// Tesseract is only offered when configured.
    #[cfg(feature = "tesseract")]
    pub tesseract: Option<TesseractConfig>,
}

/// All backends compiled into this build, keyed by the names
/// `enabled_backends` refers to.
pub fn builtin_catalog(config: &BackendsConfig) -> Vec<CatalogEntry> {
    let mut catalog = Vec::new();

    #[cfg(feature = "mock")]
    catalog.push(CatalogEntry::new(
        mock::NAME,
        MockLoader::new(config.mock.clone()),
    ));

    #[cfg(feature = "tesseract")]
    if let Some(tess) = &config.tesseract {
        catalog.push(CatalogEntry::new(
            tesseract::NAME,
            TesseractLoader::new(tess.clone()),
        ));
    }

    #[cfg(not(any(feature = "mock", feature = "tesseract")))]
    let _ = config;

    catalog
}
