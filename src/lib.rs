#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate failure;
#[macro_use]
extern crate lazy_static;

pub mod clock;
pub mod coio;
pub mod error;
pub mod fd;
pub mod fiber;
pub mod hook;
pub mod log;
pub mod scheduler;
pub mod timer;

pub use crate::coio::{Event, IoScheduler};
pub use crate::error::Error;
pub use crate::fd::FdTable;
pub use crate::fiber::{fiber_yield, Fiber, FiberAttr, FiberRef};
pub use crate::hook::{
    connect_with_timeout, is_hook_enabled, set_connect_timeout, set_hook_enabled,
};
pub use crate::scheduler::Scheduler;
pub use crate::timer::{Timer, TimerSet};
