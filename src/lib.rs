pub mod bins;
pub mod cli;
pub mod colors;
pub mod config;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod installer;
pub mod integrity;
pub mod linker;
pub mod lockfile;
pub mod paths;
pub mod platform;
pub mod store;
#[cfg(test)]
pub mod tests;
