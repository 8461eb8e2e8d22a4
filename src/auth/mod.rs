pub mod claims;
pub mod dto;
pub(crate) mod extractors;
pub mod provider;
pub mod reconcile;
pub mod services;
