//! Command implementations for the loanharvest CLI

mod inspect;
mod records;
mod run;

pub use inspect::*;
pub use records::*;
pub use run::*;
