use crate::files::FileChange;

use super::state_machine::StatusChange;

/// Everything a server publishes besides console lines.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    Status(StatusChange),
    /// A directory diff; `revision` increases by one per broadcast diff.
    Files { changes: Vec<FileChange>, revision: u64 },
    Players(Vec<String>),
    NeedEula(String),
    Error { message: String, code: &'static str },
    /// The server was deleted; attached clients should disconnect.
    Removed,
}
