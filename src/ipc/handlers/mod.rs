pub mod core;
pub mod imports;
pub mod mock;
pub mod results;
pub mod scales;
pub mod setup;
