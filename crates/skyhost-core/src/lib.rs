//! skyhost core - shared types, configuration, error handling and text utilities

pub mod arguments;
pub mod config;
pub mod constants;
pub mod error;
pub mod tokens;
pub mod types;

pub use arguments::{merge_arguments, split_arguments};
pub use config::*;
pub use constants::*;
pub use error::{Error, Result};
pub use tokens::{
    replace_tokens, replace_tokens_in_list, replace_tokens_in_map, replace_tokens_in_value,
    value_to_string,
};
pub use types::*;
