//! # Contracts
//!
//! Frozen interface contracts shared by every stage crate.
//! All business crates can only depend on this crate, reverse dependencies are prohibited.
//!
//! ## Signal Model
//! - Elements flow upstream -> downstream as `Signal::Next`
//! - Demand flows downstream -> upstream through `Subscription::request`
//! - At most one terminal signal (`Error` / `Complete`) per stage

mod blueprint;
mod demand;
mod dispatch;
mod error;
mod signal;
mod stream_error;
mod subscription;
mod timer;

pub use blueprint::*;
pub use demand::Demand;
pub use dispatch::{DispatchError, Dispatcher, DispatcherKind, Task};
pub use error::*;
pub use signal::Signal;
pub use stream_error::{BoxError, ElementContext, StreamError};
pub use subscription::{
    Publisher, SharedPublisher, SharedSubscriber, SharedSubscription, SourceProducer, Subscriber,
    Subscription,
};
pub use timer::{ScheduleHandle, Timer, TimerCallback};
