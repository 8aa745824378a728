pub mod capabilities;
pub mod machine;

pub use capabilities::{Capabilities, Codec, InputKinds, PROTOCOL_VERSION};
pub use machine::{Hysteresis, ReconnectPolicy, SessionEvent, SessionMachine, SessionState};
