//! Shared utilities for the graphloom engine.

pub mod json_ext;

pub use json_ext::{
    JsonError, ValueMap, deep_merge_maps, get_map_value, set_map_value, take_map_value,
    value_type_name,
};
