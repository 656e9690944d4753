//! A fixed-capacity cooperative task scheduler.
//!
//! Tasks are futures drawn from a statically sized table and advanced one
//! at a time, most-overdue first, by [`Scheduler::run_once`]. A running
//! task suspends itself with [`sleep_until`] or [`yield_low_priority`],
//! or awaits a typed child coroutine ([`Awaitable`]) that runs as its own
//! table entry while the parent is blocked. The dispatcher allocates
//! nothing; child frames can be kept in a fixed [`StaticAllocator`] pool.
//!
//! ```
//! use cotask::{Scheduler, Task, sleep_until};
//!
//! let mut scheduler = Scheduler::<8>::new();
//! scheduler
//! 	.add_task(Task::new(async {
//! 		for _ in 0..3 {
//! 			sleep_until(10).await;
//! 		}
//! 	}))
//! 	.unwrap();
//! scheduler.run();
//! assert_eq!(scheduler.task_count(), 0);
//! ```
//!
//! The scheduler is strictly single-threaded: suspension primitives find
//! their scheduler through a thread-local installed for the duration of
//! each dispatch, and at most one scheduler may dispatch per thread at a
//! time. Work between suspension points blocks the whole table.

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate log;

mod clock;
pub mod config;
mod context;
mod pool;
mod scheduler;
mod suspend;
mod task;

pub use crate::clock::{Clock, SystemClock};
pub use crate::pool::{FrameAlloc, Heap, StaticAllocator};
pub use crate::scheduler::{CapacityExceeded, Scheduler};
pub use crate::suspend::{SleepUntil, YieldLowPriority, sleep_until, yield_low_priority};
pub use crate::task::{Awaitable, Task};
