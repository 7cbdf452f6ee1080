use crate::model::EntityKind;

/// A malformed resource list. Any of these aborts the whole run.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("malformed XML at byte {position}: {message}")]
    Xml { position: usize, message: String },

    #[error("resource list has no <urlset> root element")]
    MissingRoot,

    #[error("url #{index}: missing <{element}>")]
    MissingElement { index: usize, element: &'static str },

    #[error("url #{index}: cannot derive a permId from <loc>{loc}</loc>")]
    InvalidLoc { index: usize, loc: String },

    #[error("url #{index} ({loc}): missing attribute `{attribute}` on x:xd")]
    MissingAttribute {
        index: usize,
        loc: String,
        attribute: &'static str,
    },

    #[error("url #{index} ({loc}): invalid timestamp `{value}`: {message}")]
    InvalidTimestamp {
        index: usize,
        loc: String,
        value: String,
        message: String,
    },

    #[error("url #{index} ({loc}): unknown entity kind `{kind}`")]
    UnknownKind {
        index: usize,
        loc: String,
        kind: String,
    },

    #[error("url #{index} ({loc}): unknown data set kind `{value}`")]
    UnknownDataSetKind {
        index: usize,
        loc: String,
        value: String,
    },

    #[error("url #{index} ({loc}): unknown connection type `{kind}`")]
    UnknownConnectionType {
        index: usize,
        loc: String,
        kind: String,
    },

    #[error("url #{index} ({loc}): connection without a `to` attribute")]
    DanglingConnection { index: usize, loc: String },

    #[error("duplicate {kind} permId `{perm_id}`")]
    DuplicatePermId { kind: EntityKind, perm_id: String },

    #[error("invalid rs:md timestamp `{value}`: {message}")]
    InvalidDocumentTimestamp { value: String, message: String },
}

pub type Result<T> = std::result::Result<T, ManifestError>;
