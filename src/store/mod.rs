pub mod atomic;

pub use atomic::{StagedOutput, atomic_write};
