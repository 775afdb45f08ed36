//! Context assembly.
//!
//! Turns a context box into the ordered message list sent to the model.
//!
//! | Source | Rendered as |
//! |--------|-------------|
//! | system / user / assistant node | message with the same role |
//! | compressed node | system message marked `[Compressed]` |
//! | text file | user message: provenance header plus fenced body |
//! | image file | multi-part user message: caption plus inline image |
//! | profile, folder doc, memories, recent messages | read-only system reference |
//!
//! The box budget is reported, never enforced: an over-budget context is
//! still assembled in full.

pub mod assembler;
pub mod synthetic;

pub use assembler::{AssembledContext, AssemblyInput, ContextAssembler};
pub use synthetic::{REFERENCE_GUIDANCE, SyntheticBlock};
