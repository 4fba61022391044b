//! Core of the Tabula extension host: the framed channel to the parent
//! editor, the remote call registry, the startup handshake, plugin discovery
//! and registration, and the staged lifecycle driver.

pub mod channel;
pub mod diag;
pub mod discovery;
pub mod handshake;
pub mod lifecycle;
pub mod protocol;
pub mod registry;
pub mod remoting;
