// Library root for the live-chat session core: everything that decides what
// happens to a frame, with no sockets involved.

pub mod audit;
pub mod feedback;
pub mod identity;
pub mod ledger;
pub mod moderation;
pub mod protocol;
pub mod rate_limit;
pub mod session;
pub mod settings;
pub mod text;
