//! Public facade crate for `sapnotes`.
//!
//! No IO or vendor-specific logic lives here.
//! It re-exports the session/note types and seam traits from `sapnotes-core`.

pub use sapnotes_core::*;
