pub mod config_doc;
pub mod token;
