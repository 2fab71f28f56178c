//! Core data types shared by the server and the client

pub mod entry;

pub use entry::{
    generate_id, is_truthy, log_record, merge_append, Entry, SendRequest, View, CLEAR_SENTINEL,
    DEFAULT_LOG_ID,
};
