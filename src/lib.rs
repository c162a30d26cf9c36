use thiserror::Error;

/// Descriptor sets and the distance metric used to compare them.
pub mod desc;
pub use desc::{DescKind, DescRef, DescriptorMetric, Descriptors, Matrix};

/// Sparse bag-of-words vectors and direct-index feature vectors.
pub mod bow;
pub use bow::{BoW, BoWTrait, FeatureVector};

/// Similarity functions between bow vectors.
pub mod scoring;
pub use scoring::ScoringType;

/// Implementation of a visual bag-of-words vocabulary tree,
/// which turns descriptors into bow vectors.
pub mod vocab;
pub use vocab::{VocabParams, Vocabulary, WeightingType};

/// Inverted-index image database built on top of a vocabulary.
pub mod database;
pub use database::{Database, QueryResult};

/// Id of a visual word (leaf of the vocabulary tree). Dense in `0..size()`.
pub type WordId = u32;

/// Id of any node of the vocabulary tree. The root is always 0.
pub type NodeId = u32;

/// Id of an image entry in a [`Database`]. Assigned sequentially from 0.
pub type EntryId = u32;

pub type BowResult<T> = std::result::Result<T, BowErr>;

#[derive(Error, Debug)]
pub enum BowErr {
    #[error("Descriptor mismatch: vocabulary expects {expected}, got {found}")]
    IncompatibleDescriptor { expected: DescKind, found: DescKind },
    #[error("Malformed descriptors: {0}")]
    MalformedDescriptors(String),
    #[error("Malformed bow vector: {0}")]
    MalformedBow(String),
    #[error("Vocabulary has not been built or loaded")]
    VocabularyNotBuilt,
    #[error("Database has no vocabulary")]
    NoVocabulary,
    #[error("Cannot build a vocabulary from an empty training set")]
    EmptyTrainingSet,
    #[error("Invalid vocabulary parameters: {0}")]
    InvalidParams(String),
    #[error("Corrupt or incompatible vocabulary: {0}")]
    CorruptOrIncompatibleVocabulary(String),
    #[error("Corrupt database artifact: {0}")]
    CorruptDatabaseArtifact(String),
    #[error("Io Error")]
    Io(#[from] std::io::Error),
    #[cfg(feature = "bincode")]
    #[error("Serialization Error")]
    Bincode(#[from] bincode::Error),
}
