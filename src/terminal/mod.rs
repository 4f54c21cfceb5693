pub mod buffer;
pub mod events;
pub mod manager;
pub mod registry;

pub use buffer::OutputBuffer;
pub use events::{EventSender, TerminalEvent, TerminalEventKind};
pub use manager::{
    ExecuteCommandResult, KillTerminalResult, OutputSnapshot, TerminalManager,
    MSG_TERMINAL_NOT_FOUND, MSG_TERMINAL_NOT_FOUND_CREATE_FIRST,
};
pub use registry::{TerminalHandle, TerminalRegistry};
