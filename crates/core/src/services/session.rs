//! One loaded binary: image, annotations, block graph, functions and state tables.
//!
//! The session is constructed explicitly per opened file and borrows the
//! registry that supplies loaders, decoders and update functions. Every pass
//! (`disassemble`, `calculate_states`) runs to completion on the calling
//! thread; callers serialize annotation edits with running passes.

use std::collections::BTreeSet;
use std::path::Path;

use thiserror::Error;

use super::decoder::{Architecture, DecodeError, DecodeOptions, LoadedImage};
use super::registry::AnalysisRegistry;
use crate::analysis::{
    CalculationOptions, FunctionBoundaries, PropagationInput, ReconstructOptions, StateCalculator,
    StateError, StateFixup, StateValue,
};
use crate::annotations::{
    Annotation, AnnotationError, AnnotationHandle, AnnotationPersistence, AnnotationStore,
};
use crate::model::{format_address, Address, BlockGraph, EntryPoint, Function, Instruction};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("No image is loaded")]
    NothingLoaded,

    #[error("No decoder/update function registered for architecture '{0}'")]
    UnsupportedArchitecture(String),

    #[error("Decoding aborted after {decoded} instructions: {fault}")]
    DecodeAborted { fault: String, decoded: usize },

    #[error("State preparation failed: {0}")]
    StatePreparationFailed(String),

    #[error("Invalid annotation kind '{0}'. Allowed: comment, entrypoint, inst_type, load_ref")]
    InvalidAnnotationKind(String),

    #[error("Load reference at {0:#010x} is missing its data operand address")]
    MissingReference(Address),

    #[error("Nothing has been disassembled yet")]
    NothingDisassembled,

    #[error(transparent)]
    Load(#[from] DecodeError),

    #[error(transparent)]
    Annotation(AnnotationError),

    #[error(transparent)]
    State(StateError),
}

impl From<AnnotationError> for SessionError {
    fn from(err: AnnotationError) -> Self {
        match err {
            AnnotationError::InvalidAnnotationKind(kind) => SessionError::InvalidAnnotationKind(kind),
            other => SessionError::Annotation(other),
        }
    }
}

impl From<StateError> for SessionError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::MissingReference { address } => SessionError::MissingReference(address),
            other => SessionError::State(other),
        }
    }
}

pub type SessionResult<T> = Result<T, SessionError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Update function name; the architecture default is used when absent.
    pub update_function: Option<String>,
    pub calculation: CalculationOptions,
    pub reconstruct: ReconstructOptions,
    /// Seed value; zero of `seed_width` bytes when absent.
    pub seed: Option<StateValue>,
    pub seed_width: usize,
    /// Seed addresses; the image entry (or every entry point) when empty.
    pub seed_addresses: Vec<Address>,
    pub max_instructions: Option<usize>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            update_function: None,
            calculation: CalculationOptions::default(),
            reconstruct: ReconstructOptions::default(),
            seed: None,
            seed_width: 4,
            seed_addresses: Vec::new(),
            max_instructions: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeEvent {
    AnnotationsChanged,
    StatesChanged,
}

type Listener = Box<dyn FnMut(ChangeEvent)>;

pub struct LoadedBinary<'r> {
    registry: &'r AnalysisRegistry,
    config: SessionConfig,
    image: Option<LoadedImage>,
    annotations: AnnotationStore,
    decoded: Vec<Instruction>,
    graph: BlockGraph,
    boundaries: FunctionBoundaries,
    states: Option<StateCalculator>,
    fixups: Vec<StateFixup>,
    skipped_bytes: usize,
    listeners: Vec<Listener>,
}

impl<'r> LoadedBinary<'r> {
    pub fn new(registry: &'r AnalysisRegistry, config: SessionConfig) -> Self {
        Self {
            registry,
            config,
            image: None,
            annotations: AnnotationStore::new(),
            decoded: Vec::new(),
            graph: BlockGraph::default(),
            boundaries: FunctionBoundaries::default(),
            states: None,
            fixups: Vec::new(),
            skipped_bytes: 0,
            listeners: Vec::new(),
        }
    }

    pub fn open(
        registry: &'r AnalysisRegistry,
        path: &Path,
        config: SessionConfig,
    ) -> SessionResult<Self> {
        let mut session = Self::new(registry, config);
        session.load(path)?;
        Ok(session)
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut SessionConfig {
        &mut self.config
    }

    pub fn subscribe(&mut self, listener: impl FnMut(ChangeEvent) + 'static) {
        self.listeners.push(Box::new(listener));
    }

    fn notify(&mut self, event: ChangeEvent) {
        for listener in self.listeners.iter_mut() {
            listener(event);
        }
    }

    /// Replace the loaded file. Annotations carry over; everything derived is torn down.
    pub fn load(&mut self, path: &Path) -> SessionResult<()> {
        let image = self.registry.load(path)?;

        let carried = self.annotations.annotations();
        let mut store = AnnotationStore::from_annotations(carried);
        for symbol in &image.symbols {
            if !store.has_entry_point_at(symbol.address) {
                store.insert(Annotation::entry_point(symbol.address, symbol.name.clone()));
            }
        }
        if let Some(entry) = image.entry {
            if !store.has_entry_point_at(entry) {
                store.insert(Annotation::entry_point(entry, "entry"));
            }
        }
        store.reindex();

        log::info!(
            "loaded {} ({}), {} annotations",
            path.display(),
            image.arch,
            store.len()
        );
        if !self.registry.supports(&image.arch) {
            log::warn!("architecture '{}' is not supported; image stays inert", image.arch);
        }

        self.annotations = store;
        self.image = Some(image);
        self.decoded.clear();
        self.skipped_bytes = 0;
        self.graph = BlockGraph::default();
        self.boundaries = FunctionBoundaries::default();
        self.states = None;
        self.fixups.clear();
        self.notify(ChangeEvent::AnnotationsChanged);
        self.notify(ChangeEvent::StatesChanged);
        Ok(())
    }

    /// Bytes the last disassembly pass stepped over without decoding.
    pub fn skipped_bytes(&self) -> usize {
        self.skipped_bytes
    }

    pub fn image(&self) -> Option<&LoadedImage> {
        self.image.as_ref()
    }

    pub fn arch(&self) -> Option<&Architecture> {
        self.image.as_ref().map(|image| &image.arch)
    }

    fn supported_image(&self) -> SessionResult<&LoadedImage> {
        let image = self.image.as_ref().ok_or(SessionError::NothingLoaded)?;
        if !self.registry.supports(&image.arch) {
            return Err(SessionError::UnsupportedArchitecture(image.arch.to_string()));
        }
        Ok(image)
    }

    /// Decode the image, then rebuild the block graph and function boundaries.
    ///
    /// A decoder fault still installs the partial graph before reporting
    /// [`SessionError::DecodeAborted`].
    pub fn disassemble(&mut self) -> SessionResult<()> {
        let image = self.supported_image()?;
        let decoder = self
            .registry
            .decoder_for(&image.arch)
            .ok_or_else(|| SessionError::UnsupportedArchitecture(image.arch.to_string()))?;
        let options = DecodeOptions { max_instructions: self.config.max_instructions };
        let output = decoder.decode(image, &options)?;

        let decoded = output.instructions.len();
        if output.skipped_bytes > 0 {
            log::warn!("decoder skipped {} undecodable bytes", output.skipped_bytes);
        }
        self.skipped_bytes = output.skipped_bytes;
        self.decoded = output.instructions;
        self.rebuild();

        match output.fault {
            Some(fault) => {
                log::warn!("decode aborted after {decoded} instructions: {fault}");
                Err(SessionError::DecodeAborted { fault, decoded })
            }
            None => Ok(()),
        }
    }

    fn seed_addresses(&self) -> Vec<Address> {
        if !self.config.seed_addresses.is_empty() {
            return self.config.seed_addresses.clone();
        }
        match self.image.as_ref().and_then(|image| image.entry) {
            Some(entry) => vec![entry],
            None => self.annotations.entry_points().iter().map(|ep| ep.address).collect(),
        }
    }

    /// Recompute graph and boundaries from the decoded stream and current annotations.
    fn rebuild(&mut self) {
        if self.annotations.is_dirty() {
            self.annotations.reindex();
        }
        let entry_points = self.annotations.entry_points();
        let mut leaders: BTreeSet<Address> = entry_points.iter().map(|ep| ep.address).collect();
        leaders.extend(self.seed_addresses());

        self.graph = BlockGraph::build(
            self.decoded.clone(),
            &self.annotations.instruction_overrides(),
            &leaders,
        );
        self.boundaries =
            FunctionBoundaries::reconstruct(&self.graph, &entry_points, self.config.reconstruct);
        log::debug!(
            "rebuilt {} blocks and {} functions",
            self.graph.blocks().len(),
            self.boundaries.functions().len()
        );
    }

    pub fn calculate_states(&mut self) -> SessionResult<Vec<StateFixup>> {
        self.calculate_states_with(&mut || false)
    }

    /// Run a full state pass; `cancelled` is polled once per visited block.
    ///
    /// Tables from the previous successful pass stay in place when this pass fails.
    pub fn calculate_states_with(
        &mut self,
        cancelled: &mut dyn FnMut() -> bool,
    ) -> SessionResult<Vec<StateFixup>> {
        let image = self.supported_image()?;
        if self.graph.is_empty() {
            return Err(SessionError::NothingDisassembled);
        }
        let updates = self.registry.update_functions();
        let name = match &self.config.update_function {
            Some(name) => name.clone(),
            None => updates
                .default_for_arch(image.arch.as_str())
                .ok_or_else(|| SessionError::UnsupportedArchitecture(image.arch.to_string()))?
                .to_string(),
        };

        let mut calculator =
            StateCalculator::new(updates.create(&name)?).with_options(self.config.calculation);
        let seed = self
            .config
            .seed
            .clone()
            .unwrap_or_else(|| StateValue::zero(self.config.seed_width));
        for address in self.seed_addresses() {
            calculator.define_pre_state(address, seed.clone());
        }
        if let Err(err) = calculator.prepare() {
            log::warn!("update function '{name}' could not be prepared: {err}");
            return Err(SessionError::StatePreparationFailed(err.to_string()));
        }

        let entry_points: BTreeSet<Address> =
            self.annotations.entry_points().iter().map(|ep| ep.address).collect();
        let input = PropagationInput {
            graph: &self.graph,
            annotations: &self.annotations,
            memory: image,
            entry_points: &entry_points,
        };
        let result = calculator.calculate_with(&input, cancelled);
        calculator.cleanup_state();
        let fixups = result?;

        log::info!(
            "calculated states with '{name}': {} addresses, {} fixups",
            calculator.post_states().len(),
            fixups.len()
        );
        self.states = Some(calculator);
        self.fixups = fixups.clone();
        self.notify(ChangeEvent::StatesChanged);
        Ok(fixups)
    }

    pub fn graph(&self) -> &BlockGraph {
        &self.graph
    }

    pub fn boundaries(&self) -> &FunctionBoundaries {
        &self.boundaries
    }

    pub fn functions(&self) -> &[Function] {
        self.boundaries.functions()
    }

    pub fn fixups(&self) -> &[StateFixup] {
        &self.fixups
    }

    pub fn update_function_name(&self) -> Option<&'static str> {
        self.states.as_ref().map(StateCalculator::update_function_name)
    }

    pub fn function_at(&self, address: Address) -> Option<&Function> {
        self.boundaries.function_at(address)
    }

    pub fn entrypoint_at(&self, address: Address) -> Option<&EntryPoint> {
        self.boundaries.entrypoint_at(address)
    }

    pub fn function_start(&self, address: Address) -> Option<Address> {
        let function = self.function_at(address)?;
        function
            .start_address(&self.graph)
            .or_else(|| function.entry_points.iter().map(|ep| ep.address).min())
    }

    pub fn function_end(&self, address: Address) -> Option<Address> {
        let function = self.function_at(address)?;
        function
            .end_address(&self.graph)
            .or_else(|| function.entry_points.iter().map(|ep| ep.address).max())
    }

    pub fn states_at(&self, address: Address) -> (Option<&StateValue>, Option<&StateValue>) {
        match &self.states {
            Some(states) => states.states_at(address),
            None => (None, None),
        }
    }

    /// `"pre -> post"`, with an absent side rendered as blanks.
    pub fn states_display(&self, address: Address) -> String {
        let side = |value: Option<&StateValue>| match value {
            Some(value) => value.to_string(),
            None => " ".repeat(11),
        };
        let (pre, post) = self.states_at(address);
        format!("{} -> {}", side(pre), side(post))
    }

    pub fn annotations(&self) -> &AnnotationStore {
        &self.annotations
    }

    pub fn annotation(&self, handle: AnnotationHandle) -> Option<&Annotation> {
        self.annotations.get(handle)
    }

    pub fn annotations_at(&self, address: Address) -> BTreeSet<AnnotationHandle> {
        self.annotations.annotations_at(address)
    }

    pub fn associated_addresses(&self, address: Address) -> BTreeSet<Address> {
        self.annotations.associated_addresses(address)
    }

    fn annotations_changed(&mut self) {
        self.annotations.reindex();
        if !self.decoded.is_empty() {
            self.rebuild();
        }
        self.notify(ChangeEvent::AnnotationsChanged);
    }

    /// Add an annotation with the default payload for `kind`.
    pub fn create_annotation(&mut self, kind: &str, address: Address) -> SessionResult<AnnotationHandle> {
        let handle = self.annotations.create(kind, address)?;
        self.annotations_changed();
        Ok(handle)
    }

    pub fn add_annotation(
        &mut self,
        kind: &str,
        address: Address,
        fields: serde_json::Value,
    ) -> SessionResult<AnnotationHandle> {
        let handle = self.annotations.add_annotation(kind, address, fields)?;
        self.annotations_changed();
        Ok(handle)
    }

    pub fn insert_annotation(&mut self, annotation: Annotation) -> AnnotationHandle {
        let handle = self.annotations.insert(annotation);
        self.annotations_changed();
        handle
    }

    /// Removing an absent handle is a no-op and sends no notification.
    pub fn remove_annotation(&mut self, handle: AnnotationHandle) -> Option<Annotation> {
        let removed = self.annotations.remove_annotation(handle)?;
        self.annotations_changed();
        Some(removed)
    }

    /// Apply a bulk edit, then reindex and notify once.
    pub fn edit_annotations<T>(&mut self, edit: impl FnOnce(&mut AnnotationStore) -> T) -> T {
        let out = edit(&mut self.annotations);
        self.annotations_changed();
        out
    }

    /// Replace the annotation set with what `source` holds.
    pub fn load_annotations(&mut self, source: &dyn AnnotationPersistence) -> SessionResult<usize> {
        let annotations = source.load_annotations()?;
        let count = annotations.len();
        self.annotations = AnnotationStore::from_annotations(annotations);
        self.annotations_changed();
        log::debug!("replaced annotations with {count} loaded records");
        Ok(count)
    }

    pub fn save_annotations(&self, sink: &dyn AnnotationPersistence) -> SessionResult<()> {
        sink.save_annotations(&self.annotations.annotations())?;
        Ok(())
    }

    /// One line per function: name, derived range and entry points.
    pub fn describe_functions(&self) -> Vec<String> {
        self.functions()
            .iter()
            .map(|function| {
                let start = function.start_address(&self.graph);
                let end = function.end_address(&self.graph);
                let entries: Vec<String> =
                    function.entry_points.iter().map(|ep| format_address(ep.address)).collect();
                format!(
                    "{} [{} - {}] entries: {}",
                    function.name,
                    start.map(format_address).unwrap_or_else(|| "?".into()),
                    end.map(format_address).unwrap_or_else(|| "?".into()),
                    entries.join(", ")
                )
            })
            .collect()
    }
}
