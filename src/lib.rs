#![allow(unused_doc_comments)]
/**
 * This style of comments threw out warnings.
 * This allow statement fixes that
 */

/**
 * lib.rs
 */

pub mod network;
pub mod messages;
pub mod nat_traversal;

pub use nat_traversal::{
    Client, ClientConfig, ClientError, ClientEvent, ClientHandle, ClientState, SendError,
};
