pub mod config;
pub mod downstream;
pub mod logger;
pub mod model;
pub mod session;
pub mod state;

#[cfg(test)]
pub mod test_support;
