use std::path::Path;

use super::decoder::{Architecture, DecodeError, Decoder, ImageLoader, LoadedImage};
use super::listing::{ListingDecoder, ListingLoader};
use crate::analysis::update::{default_update_registry, UpdateFunctionRegistry};

/// Registry of loaders, decoders and update functions.
///
/// Loaders are tried in registration order; the first decoder supporting an
/// architecture wins. An architecture counts as supported when it has both a
/// decoder and a default update function.
#[derive(Default)]
pub struct AnalysisRegistry {
    loaders: Vec<Box<dyn ImageLoader>>,
    decoders: Vec<Box<dyn Decoder>>,
    updates: UpdateFunctionRegistry,
}

impl AnalysisRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_loader<L: ImageLoader + 'static>(&mut self, loader: L) -> &mut Self {
        self.loaders.push(Box::new(loader));
        self
    }

    pub fn register_decoder<D: Decoder + 'static>(&mut self, decoder: D) -> &mut Self {
        self.decoders.push(Box::new(decoder));
        self
    }

    pub fn set_update_functions(&mut self, updates: UpdateFunctionRegistry) -> &mut Self {
        self.updates = updates;
        self
    }

    pub fn update_functions(&self) -> &UpdateFunctionRegistry {
        &self.updates
    }

    pub fn decoder_for(&self, arch: &Architecture) -> Option<&dyn Decoder> {
        self.decoders.iter().find(|d| d.supports(arch)).map(|d| &**d)
    }

    pub fn supports(&self, arch: &Architecture) -> bool {
        self.decoder_for(arch).is_some() && self.updates.default_for_arch(arch.as_str()).is_some()
    }

    /// Read `path` and hand it to the first loader that accepts it.
    pub fn load(&self, path: &Path) -> Result<LoadedImage, DecodeError> {
        let bytes = std::fs::read(path)
            .map_err(|source| DecodeError::Io { path: path.to_path_buf(), source })?;
        let loader = self
            .loaders
            .iter()
            .find(|l| l.accepts(path, &bytes))
            .ok_or_else(|| DecodeError::UnrecognizedFormat(path.to_path_buf()))?;
        log::debug!("loading {} with {}", path.display(), loader.name());
        loader.load(path, &bytes)
    }

    /// Sorted loader and decoder names for help output.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .loaders
            .iter()
            .map(|l| format!("loader:{}", l.name()))
            .chain(self.decoders.iter().map(|d| format!("decoder:{}", d.name())))
            .collect();
        names.sort();
        names
    }
}

/// Registry populated with the listing pair, plus goblin/capstone when enabled.
pub fn default_registry() -> AnalysisRegistry {
    let mut registry = AnalysisRegistry::new();
    #[cfg(feature = "capstone-backend")]
    {
        registry
            .register_loader(crate::services::backends::GoblinLoader)
            .register_decoder(crate::services::backends::CapstoneDecoder);
    }
    registry.register_loader(ListingLoader).register_decoder(ListingDecoder);
    registry.set_update_functions(default_update_registry());
    registry
}
