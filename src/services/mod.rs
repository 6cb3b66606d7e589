pub mod hash;
pub mod scanner;

pub use hash::{HashError, HashProvider, PerceptualHasher};
pub use scanner::{ImageScanner, ScanError};
