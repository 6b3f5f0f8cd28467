//! # Events Module
//!
//! Progress events emitted by the chain engine.
//!
//! ## Design
//! The engine sends events through a channel; the CLI progress bar, or any
//! other front end, subscribes and renders them. With no receiver the
//! events are dropped.
//!
//! ## Example
//! ```rust,ignore
//! let (sender, receiver) = EventChannel::new();
//!
//! std::thread::spawn(move || {
//!     for event in receiver.iter() {
//!         if let Event::File(FileEvent::Finished(p)) = event {
//!             println!("{}/{} {}", p.completed, p.total, p.state);
//!         }
//!     }
//! });
//!
//! orchestrator.run_with_events(files, &sender)?;
//! ```

mod channel;
mod types;

pub use channel::{EventChannel, EventReceiver, EventSender, null_sender};
pub use types::*;
