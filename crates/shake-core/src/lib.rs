//! The shake pipeline above the extent, lease and copy layers.
//!
//! A [`Court`] walks candidate paths, keeps a three-candidate window so
//! each file can be placed relative to the files used alongside it, judges
//! every regular file and relocates the guilty ones through [`rewrite`].

pub mod candidate;
pub mod judge;
pub mod listing;
pub mod ptime;
pub mod report;
pub mod rewrite;
pub mod scan;

pub use candidate::{Candidate, investigate};
pub use report::Report;
pub use rewrite::{Relocation, Scratch};
pub use scan::{Court, ScanStats};
