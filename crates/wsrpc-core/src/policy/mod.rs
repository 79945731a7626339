//! Connection policies.
//!
//! ```text
//! abnormal close → [ReconnectPolicy] → delay → connect
//!                                    ↘ None  → give up, drain pending work
//! ```

pub mod reconnect;

pub use reconnect::{ReconnectConfig, ReconnectPolicy};
