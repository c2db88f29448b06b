//! Domain records for the warning-workflow engine

pub mod collection;
pub mod decision;
pub mod observation;
pub mod run;

pub use collection::*;
pub use decision::*;
pub use observation::*;
pub use run::*;
