//! Analyst and loader annotations anchored to addresses.
//!
//! Annotations live in a flat, ordered collection. The per-address index is a
//! derived view that is only rebuilt by an explicit [`AnnotationStore::reindex`],
//! so bulk edits stay cheap.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{format_address, Address, EntryPoint, InstructionType};

pub mod persist;

pub use persist::{AnnotationFile, AnnotationPersistence, AnnotationRecord};

#[derive(Debug, Error)]
pub enum AnnotationError {
    #[error("Invalid annotation kind '{0}'. Allowed: comment, entrypoint, inst_type, load_ref")]
    InvalidAnnotationKind(String),

    #[error("Invalid fields for {kind} annotation: {source}")]
    InvalidFields {
        kind: AnnotationKind,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to access annotation file {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Annotation JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Annotation YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Unsupported annotation file format: {0} (expected .json, .yaml or .yml)")]
    UnsupportedFormat(std::path::PathBuf),

    #[error("Annotation storage error: {0}")]
    Storage(String),
}

pub type AnnotationResult<T> = Result<T, AnnotationError>;

/// Closed set of annotation variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AnnotationKind {
    #[serde(rename = "comment")]
    Comment,
    #[serde(rename = "entrypoint")]
    EntryPoint,
    #[serde(rename = "inst_type")]
    InstructionType,
    #[serde(rename = "load_ref")]
    LoadReference,
}

impl AnnotationKind {
    pub const ALL: [AnnotationKind; 4] = [
        AnnotationKind::Comment,
        AnnotationKind::EntryPoint,
        AnnotationKind::InstructionType,
        AnnotationKind::LoadReference,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AnnotationKind::Comment => "comment",
            AnnotationKind::EntryPoint => "entrypoint",
            AnnotationKind::InstructionType => "inst_type",
            AnnotationKind::LoadReference => "load_ref",
        }
    }
}

impl fmt::Display for AnnotationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AnnotationKind {
    type Err = AnnotationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| AnnotationError::InvalidAnnotationKind(s.to_string()))
    }
}

/// How the value referenced by a [`LoadReference`] relates to the propagated state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpdateType {
    /// The referenced word is the expected post-state of the anchor.
    #[default]
    ConstantLoad,
    /// The referenced word is the expected pre-state of the anchor.
    SignatureLoad,
    /// The referenced word replaces the post-state of the anchor.
    ConstInjection,
}

impl UpdateType {
    pub fn as_str(self) -> &'static str {
        match self {
            UpdateType::ConstantLoad => "CONSTANT_LOAD",
            UpdateType::SignatureLoad => "SIGNATURE_LOAD",
            UpdateType::ConstInjection => "CONST_INJECTION",
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "CONSTANT_LOAD" => Some(UpdateType::ConstantLoad),
            "SIGNATURE_LOAD" => Some(UpdateType::SignatureLoad),
            "CONST_INJECTION" => Some(UpdateType::ConstInjection),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CommentAnnotation {
    pub comment: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EntryPointAnnotation {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InstructionTypeAnnotation {
    pub instruction_type: InstructionType,
}

/// A load whose operand addresses tie the anchor to a constant in the image.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadReference {
    pub update_type: UpdateType,
    /// Instruction that materializes the data address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub addr_load: Option<Address>,
    /// Address of the referenced data word.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_load: Option<Address>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AnnotationPayload {
    Comment(CommentAnnotation),
    EntryPoint(EntryPointAnnotation),
    InstructionType(InstructionTypeAnnotation),
    LoadReference(LoadReference),
}

impl AnnotationPayload {
    pub fn kind(&self) -> AnnotationKind {
        match self {
            AnnotationPayload::Comment(_) => AnnotationKind::Comment,
            AnnotationPayload::EntryPoint(_) => AnnotationKind::EntryPoint,
            AnnotationPayload::InstructionType(_) => AnnotationKind::InstructionType,
            AnnotationPayload::LoadReference(_) => AnnotationKind::LoadReference,
        }
    }

    /// Default payload for a freshly created annotation at `anchor`.
    pub fn default_for(kind: AnnotationKind, anchor: Address) -> Self {
        match kind {
            AnnotationKind::Comment => AnnotationPayload::Comment(CommentAnnotation::default()),
            AnnotationKind::EntryPoint => AnnotationPayload::EntryPoint(EntryPointAnnotation {
                name: format!("sub_{anchor:X}"),
            }),
            AnnotationKind::InstructionType => {
                AnnotationPayload::InstructionType(InstructionTypeAnnotation::default())
            }
            AnnotationKind::LoadReference => {
                AnnotationPayload::LoadReference(LoadReference::default())
            }
        }
    }

    /// Decode variant-specific fields as stored in persisted records.
    pub fn from_fields(kind: AnnotationKind, fields: serde_json::Value) -> AnnotationResult<Self> {
        let fields = if fields.is_null() { serde_json::json!({}) } else { fields };
        let invalid = |source| AnnotationError::InvalidFields { kind, source };
        Ok(match kind {
            AnnotationKind::Comment => {
                AnnotationPayload::Comment(serde_json::from_value(fields).map_err(invalid)?)
            }
            AnnotationKind::EntryPoint => {
                AnnotationPayload::EntryPoint(serde_json::from_value(fields).map_err(invalid)?)
            }
            AnnotationKind::InstructionType => {
                AnnotationPayload::InstructionType(serde_json::from_value(fields).map_err(invalid)?)
            }
            AnnotationKind::LoadReference => {
                AnnotationPayload::LoadReference(serde_json::from_value(fields).map_err(invalid)?)
            }
        })
    }

    pub fn to_fields(&self) -> AnnotationResult<serde_json::Value> {
        Ok(match self {
            AnnotationPayload::Comment(a) => serde_json::to_value(a)?,
            AnnotationPayload::EntryPoint(a) => serde_json::to_value(a)?,
            AnnotationPayload::InstructionType(a) => serde_json::to_value(a)?,
            AnnotationPayload::LoadReference(a) => serde_json::to_value(a)?,
        })
    }
}

/// One annotation anchored to exactly one address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Annotation {
    pub address: Address,
    pub payload: AnnotationPayload,
}

impl Annotation {
    pub fn new(address: Address, payload: AnnotationPayload) -> Self {
        Self { address, payload }
    }

    pub fn comment(address: Address, comment: impl Into<String>) -> Self {
        Self::new(address, AnnotationPayload::Comment(CommentAnnotation { comment: comment.into() }))
    }

    pub fn entry_point(address: Address, name: impl Into<String>) -> Self {
        Self::new(address, AnnotationPayload::EntryPoint(EntryPointAnnotation { name: name.into() }))
    }

    pub fn instruction_type(address: Address, instruction_type: InstructionType) -> Self {
        Self::new(
            address,
            AnnotationPayload::InstructionType(InstructionTypeAnnotation { instruction_type }),
        )
    }

    pub fn load_reference(address: Address, reference: LoadReference) -> Self {
        Self::new(address, AnnotationPayload::LoadReference(reference))
    }

    pub fn kind(&self) -> AnnotationKind {
        self.payload.kind()
    }

    /// Human-readable payload summary for listings.
    pub fn describe(&self) -> String {
        match &self.payload {
            AnnotationPayload::Comment(a) => a.comment.clone(),
            AnnotationPayload::EntryPoint(a) => a.name.clone(),
            AnnotationPayload::InstructionType(a) => a.instruction_type.display_name().to_string(),
            AnnotationPayload::LoadReference(a) => format!(
                "updateType={}, addrLoad={}, dataLoad={}",
                a.update_type.as_str(),
                format_address(a.addr_load.unwrap_or(0)),
                format_address(a.data_load.unwrap_or(0))
            ),
        }
    }
}

/// Stable identity of an annotation inside one store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AnnotationHandle(u64);

impl AnnotationHandle {
    pub fn id(self) -> u64 {
        self.0
    }
}

/// Flat, ordered annotation collection with a rebuildable address index.
#[derive(Debug, Clone, Default)]
pub struct AnnotationStore {
    entries: Vec<(AnnotationHandle, Annotation)>,
    next_id: u64,
    by_address: BTreeMap<Address, BTreeSet<AnnotationHandle>>,
    dirty: bool,
}

impl AnnotationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an indexed store from annotations in the given order.
    pub fn from_annotations(annotations: impl IntoIterator<Item = Annotation>) -> Self {
        let mut store = Self::new();
        for annotation in annotations {
            store.insert(annotation);
        }
        store.reindex();
        store
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True when mutations happened since the last [`reindex`](Self::reindex).
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Append an annotation given its kind string and persisted fields.
    pub fn add_annotation(
        &mut self,
        kind: &str,
        anchor: Address,
        fields: serde_json::Value,
    ) -> AnnotationResult<AnnotationHandle> {
        let kind = AnnotationKind::from_str(kind)?;
        let payload = AnnotationPayload::from_fields(kind, fields)?;
        Ok(self.insert(Annotation::new(anchor, payload)))
    }

    /// Append an annotation of `kind` with its default payload.
    pub fn create(&mut self, kind: &str, anchor: Address) -> AnnotationResult<AnnotationHandle> {
        let kind = AnnotationKind::from_str(kind)?;
        Ok(self.insert(Annotation::new(anchor, AnnotationPayload::default_for(kind, anchor))))
    }

    pub fn insert(&mut self, annotation: Annotation) -> AnnotationHandle {
        let handle = AnnotationHandle(self.next_id);
        self.next_id += 1;
        self.entries.push((handle, annotation));
        self.dirty = true;
        handle
    }

    /// Remove by identity. Removing an absent handle is a no-op.
    pub fn remove_annotation(&mut self, handle: AnnotationHandle) -> Option<Annotation> {
        let pos = self.entries.iter().position(|(h, _)| *h == handle)?;
        self.dirty = true;
        Some(self.entries.remove(pos).1)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.by_address.clear();
        self.dirty = false;
    }

    pub fn get(&self, handle: AnnotationHandle) -> Option<&Annotation> {
        self.entries.iter().find(|(h, _)| *h == handle).map(|(_, a)| a)
    }

    pub fn get_mut(&mut self, handle: AnnotationHandle) -> Option<&mut Annotation> {
        let entry = self.entries.iter_mut().find(|(h, _)| *h == handle)?;
        self.dirty = true;
        Some(&mut entry.1)
    }

    /// Handle of the `index`-th annotation in collection order.
    pub fn handle_at(&self, index: usize) -> Option<AnnotationHandle> {
        self.entries.get(index).map(|(h, _)| *h)
    }

    pub fn iter(&self) -> impl Iterator<Item = (AnnotationHandle, &Annotation)> {
        self.entries.iter().map(|(h, a)| (*h, a))
    }

    pub fn annotations(&self) -> Vec<Annotation> {
        self.entries.iter().map(|(_, a)| a.clone()).collect()
    }

    /// Rebuild the per-address index after mutations.
    pub fn reindex(&mut self) {
        self.by_address.clear();
        for (handle, annotation) in &self.entries {
            self.by_address.entry(annotation.address).or_default().insert(*handle);
        }
        self.dirty = false;
    }

    /// Handles anchored at `address`, as of the last reindex.
    pub fn annotations_at(&self, address: Address) -> BTreeSet<AnnotationHandle> {
        if self.dirty {
            log::trace!("annotations_at({}) on a dirty index", format_address(address));
        }
        self.by_address.get(&address).cloned().unwrap_or_default()
    }

    fn indexed_at(&self, address: Address) -> impl Iterator<Item = &Annotation> {
        self.by_address
            .get(&address)
            .into_iter()
            .flat_map(|handles| handles.iter())
            .filter_map(|handle| self.get(*handle))
    }

    /// Addresses tied together by load-reference annotations anchored at `address`.
    pub fn associated_addresses(&self, address: Address) -> BTreeSet<Address> {
        let mut out = BTreeSet::new();
        for annotation in self.indexed_at(address) {
            if let AnnotationPayload::LoadReference(lr) = &annotation.payload {
                out.insert(annotation.address);
                out.extend(lr.addr_load);
                out.extend(lr.data_load);
            }
        }
        out
    }

    /// First load reference anchored at `address` (indexed view).
    pub fn load_reference_at(&self, address: Address) -> Option<&LoadReference> {
        self.indexed_at(address).find_map(|annotation| match &annotation.payload {
            AnnotationPayload::LoadReference(lr) => Some(lr),
            _ => None,
        })
    }

    /// Entry points in collection order, duplicates removed.
    pub fn entry_points(&self) -> Vec<EntryPoint> {
        let mut out: Vec<EntryPoint> = Vec::new();
        for (_, annotation) in &self.entries {
            if let AnnotationPayload::EntryPoint(ep) = &annotation.payload {
                let entry = EntryPoint::new(annotation.address, ep.name.clone());
                if !out.contains(&entry) {
                    out.push(entry);
                }
            }
        }
        out
    }

    pub fn has_entry_point_at(&self, address: Address) -> bool {
        self.entries.iter().any(|(_, a)| {
            a.address == address && matches!(a.payload, AnnotationPayload::EntryPoint(_))
        })
    }

    /// Classification overrides; a later annotation at the same address wins.
    pub fn instruction_overrides(&self) -> BTreeMap<Address, InstructionType> {
        let mut out = BTreeMap::new();
        for (_, annotation) in &self.entries {
            if let AnnotationPayload::InstructionType(it) = &annotation.payload {
                out.insert(annotation.address, it.instruction_type);
            }
        }
        out
    }

    /// Order-insensitive equality by (kind, address, payload).
    pub fn same_contents(&self, other: &AnnotationStore) -> bool {
        if self.len() != other.len() {
            return false;
        }
        let mut counts: std::collections::HashMap<&Annotation, i64> =
            std::collections::HashMap::new();
        for (_, a) in &self.entries {
            *counts.entry(a).or_default() += 1;
        }
        for (_, a) in &other.entries {
            *counts.entry(a).or_default() -= 1;
        }
        counts.values().all(|c| *c == 0)
    }
}
