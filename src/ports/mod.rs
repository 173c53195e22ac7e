pub mod certificate_authority;
pub mod certificate_store;
pub mod config_provider;
pub mod upstream;
