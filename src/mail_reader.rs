//! Inbound side: talking to the mailbox, finding and decoding the messages
//! that should be reflected.

pub mod fetcher;
pub mod filter;
pub mod imap;
pub mod message;
pub mod registry;
pub mod state;
pub mod store;
