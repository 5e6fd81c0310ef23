pub mod commands;
pub mod filesystem;
pub mod game;
pub mod pipeline;
pub mod terminal;

/// Terminal dimensions in character cells, shared between a protocol
/// front-end (which learns about resizes) and the terminal that renders.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WinSize {
    pub cols: u16,
    pub rows: u16,
}

impl Default for WinSize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}
