pub mod mock_engine;
pub mod mock_signaling;
pub mod signal_helpers;

pub use mock_engine::*;
pub use mock_signaling::*;
pub use signal_helpers::*;
