pub mod blur;
pub mod decoder;
pub mod frame;
pub mod geometry;
pub mod grid_manager;
pub mod redaction;
pub mod scheduler_state;
pub mod utils;
