mod allocation;
mod client;

pub use client::{
    TURN_DEFAULT_PORT, TurnClient, TurnObserver, TurnOptions, TurnState, refresh_pattern,
};
