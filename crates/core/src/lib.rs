//! AIDIS client core: the pipeline from streamed model output to executed
//! actions.
//!
//! Model responses land in a bounded [`history::ResponseHistory`]. The
//! [`router::CommandRouter`] mines them for embedded commands
//! ([`extractor`], [`schema`]) and forwards those to the AIDIS service
//! ([`remote`]), or runs shell passthrough commands under a safety policy
//! ([`shell`]).

pub mod conversation;
pub mod extractor;
pub mod history;
pub mod llm_client;
pub mod remote;
pub mod router;
pub mod schema;
pub mod shell;
