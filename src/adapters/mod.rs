//! Adapters: concrete implementations of the kernel's ports.
//!
//! | Adapter    | Implements    | Connects to                  |
//! |------------|---------------|------------------------------|
//! | `log_sink` | Module        | Serial log (event tracing)   |
//! | `nvs`      | ConfigStore   | NVS / in-memory store        |

pub mod log_sink;
pub mod nvs;
