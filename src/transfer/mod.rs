//! Data transfer into the main-memory tier.
//!
//! - [`disk_io`]: Row-wise block reads from the raw volume file

pub mod disk_io;
