//! Harvester manifest: the remote resource list and the candidate entity graph.
//!
//! ```text
//!   resource list (XML)          ResourceListParser            ResourceList
//!  ┌────────────────────┐       ┌──────────────────┐      ┌──────────────────────┐
//!  │ urlset             │       │ quick-xml stream │      │ projects    by permId│
//!  │  url / loc         │──────►│ identifier       │─────►│ experiments by permId│
//!  │      lastmod       │       │ rewriting into   │      │ samples     by permId│
//!  │      x:xd + conns  │       │ the local space  │      │ data sets   by permId│
//!  └────────────────────┘       └──────────────────┘      │ materials   (flat)   │
//!                                                         └──────────────────────┘
//! ```
//!
//! Nothing here talks to a server: the crate only turns bytes into a typed
//! graph. Entities older than the watermark are kept, because their
//! connections may be needed to resolve edges of newer entities.

pub mod error;
pub mod model;
pub mod parser;
pub mod resource_list;

pub use error::ManifestError;
pub use model::*;
pub use parser::ResourceListParser;
pub use resource_list::{EntityCount, ResourceList, ResourceListSummary};

use chrono::{DateTime, Utc};

/// 1970-01-01T00:00:00Z, the watermark of a run that has never succeeded.
pub fn epoch() -> DateTime<Utc> {
    DateTime::<Utc>::default()
}
