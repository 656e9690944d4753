pub(crate) mod task;

use core::ptr::{self, NonNull};
use std::panic::{self, AssertUnwindSafe};
use std::thread;
use std::time::Duration;

use crossbeam_utils::Backoff;
use thiserror::Error;

use self::task::{ChildRef, EntryFlags, Frame, TaskEntry};
use crate::clock::{Clock, SystemClock};
use crate::config::{DEFAULT_TOLERANCE_MS, PARK_CAP_MS, STALE_AFTER_MS};
use crate::context::{self, SchedulerHandle};
use crate::task::Task;

/// The task table has no free slot left.
#[derive(Error, Clone, Copy, Debug, PartialEq, Eq)]
#[error("task table is full")]
pub struct CapacityExceeded;

/// A fixed-capacity cooperative scheduler.
///
/// `N` tasks at most are held in an inline table; each call to
/// [`run_once`](Self::run_once) advances a single task, chosen by how
/// overdue it is. Timed tasks always beat low-priority ones. All time
/// bookkeeping is wrapping 32-bit milliseconds read from `C`.
pub struct Scheduler<const N: usize, C: Clock = SystemClock> {
	entries: [TaskEntry; N],
	clock: C,
	tolerance: u32,
}

impl<const N: usize> Scheduler<N> {
	pub fn new() -> Self {
		Self::with_clock(SystemClock::new())
	}
}

impl<const N: usize> Default for Scheduler<N> {
	fn default() -> Self {
		Self::new()
	}
}

impl<const N: usize, C: Clock + 'static> Scheduler<N, C> {
	/// Creates a scheduler reading time from `clock`.
	pub fn with_clock(clock: C) -> Self {
		Self {
			entries: [const { TaskEntry::vacant() }; N],
			clock,
			tolerance: DEFAULT_TOLERANCE_MS,
		}
	}

	/// Adjusts the slack applied to timed-pass eligibility checks.
	pub fn set_tolerance(&mut self, tolerance_ms: u32) {
		self.tolerance = tolerance_ms;
	}

	/// Installs a root task into the first free slot.
	pub fn add_task(&mut self, task: Task) -> Result<(), CapacityExceeded> {
		let now = self.clock.now_ms();
		let index = self.free_slot().ok_or(CapacityExceeded)?;
		debug!("Registering task {index}");
		self.entries[index].install(Frame::Root(task), now);
		Ok(())
	}

	/// Number of live tasks, children included.
	pub fn task_count(&self) -> usize {
		self.entries.iter().filter(|entry| entry.is_defined()).count()
	}

	/// Selects and resumes at most one task.
	///
	/// The timed pass picks the most overdue eligible task; ties go to the
	/// lowest slot. Only if it finds nothing and `include_low_priority` is
	/// set does the low-priority pass run the longest-waiting yielded task.
	/// A no-op when nothing is eligible.
	pub fn run_once(&mut self, include_low_priority: bool) {
		let now = self.clock.now_ms();
		for low_priority_pass in [false, true] {
			if low_priority_pass && !include_low_priority {
				break;
			}

			let mut best_score = 0u32;
			let mut chosen = None;
			for (index, entry) in self.entries.iter().enumerate() {
				if !entry.is_defined() || entry.flags.contains(EntryFlags::AWAITING) {
					continue;
				}
				let low_priority = entry.flags.contains(EntryFlags::LOW_PRIORITY);
				let score = if !low_priority_pass && !low_priority {
					let until_due = entry.timestamp.wrapping_sub(now);
					let overdue = now.wrapping_sub(entry.timestamp);
					if until_due < self.tolerance || overdue < STALE_AFTER_MS {
						overdue.wrapping_add(self.tolerance)
					} else {
						continue;
					}
				} else if low_priority_pass && low_priority {
					now.wrapping_sub(entry.timestamp)
				} else {
					continue;
				};

				if score > best_score {
					best_score = score;
					chosen = Some(index);
				}
			}

			if let Some(index) = chosen {
				if low_priority_pass {
					self.entries[index].timestamp = self.clock.now_ms();
				} else {
					// Park far in the past: if the task returns without
					// re-arming, the timed pass will not pick it up again
					// until the window wraps.
					self.entries[index].timestamp = now.wrapping_sub(2 * STALE_AFTER_MS);
				}
				self.dispatch(index);
				return;
			}
		}
	}

	/// Milliseconds until the earliest timed wake, or `u32::MAX` if no
	/// timed task is pending. Callers use this to sleep the host thread
	/// between [`run_once`](Self::run_once) calls.
	pub fn time_left(&self) -> u32 {
		let now = self.clock.now_ms();
		let mut earliest = u32::MAX;
		for entry in &self.entries {
			if entry.is_defined() && !entry.flags.contains(EntryFlags::LOW_PRIORITY) {
				let left = entry.timestamp.wrapping_sub(now);
				if left < STALE_AFTER_MS && left < earliest {
					earliest = left;
				}
			}
		}
		earliest
	}

	/// Drives the scheduler until the table drains, parking the thread
	/// while nothing is due.
	pub fn run(&mut self) {
		let backoff = Backoff::new();
		while self.task_count() > 0 {
			self.run_once(true);
			let wait = self.time_left();
			if wait == 0 {
				backoff.reset();
			} else if backoff.is_completed() {
				thread::sleep(Duration::from_millis(wait.min(PARK_CAP_MS).into()));
				backoff.reset();
			} else {
				backoff.snooze();
			}
		}
	}

	fn free_slot(&self) -> Option<usize> {
		self.entries.iter().position(|entry| !entry.is_defined())
	}

	fn dispatch(&mut self, index: usize) {
		let Some(mut frame) = self.entries[index].frame.take() else {
			return;
		};
		trace!("Running task {index}");
		let handle = ptr::from_mut(self) as *mut dyn SchedulerHandle;
		// No other access to `self` may happen until the resume returns;
		// the task reaches back in through `handle`. A finished frame is
		// dropped while the context is still installed, so abandoned
		// children can unregister themselves.
		let resumed = panic::catch_unwind(AssertUnwindSafe(|| {
			let _guard = context::enter(handle, index);
			if frame.resume() {
				Some(frame)
			} else {
				drop(frame);
				None
			}
		}));
		match resumed {
			Ok(Some(frame)) => self.entries[index].frame = Some(frame),
			Ok(None) => {
				trace!("Task {index} finished");
				self.retire(index);
			}
			Err(payload) => {
				// A fault inside a task counts as completion: clear its
				// slot and every entry depending on it, then let the
				// panic continue.
				error!("Task {index} panicked, clearing its slot");
				self.purge_dependents(index);
				self.retire(index);
				panic::resume_unwind(payload);
			}
		}
	}

	/// Clears every entry whose frame storage died with the task at
	/// `parent`. Such frames live inside the failed task's own frame, so
	/// the entries must not be dispatched or dropped through again.
	fn purge_dependents(&mut self, parent: usize) {
		for index in 0..N {
			if self.entries[index].is_defined() && self.entries[index].parent == Some(parent) {
				self.entries[index].parent = None;
				self.entries[index].flags = EntryFlags::empty();
				self.entries[index].frame = None;
				self.purge_dependents(index);
			}
		}
	}

	/// Clears a finished slot and unblocks the awaiting parent, if any.
	fn retire(&mut self, index: usize) {
		let parent = self.entries[index].parent.take();
		self.entries[index].flags = EntryFlags::empty();
		self.entries[index].frame = None;
		if let Some(parent) = parent {
			self.entries[parent].flags.remove(EntryFlags::AWAITING);
		}
	}
}

impl<const N: usize, C: Clock + 'static> SchedulerHandle for Scheduler<N, C> {
	fn sleep_current(&mut self, index: usize, delay_ms: u32) {
		let now = self.clock.now_ms();
		let entry = &mut self.entries[index];
		entry.timestamp = now.wrapping_add(delay_ms);
		entry.flags.remove(EntryFlags::LOW_PRIORITY);
	}

	fn demote_current(&mut self, index: usize) {
		let now = self.clock.now_ms();
		let entry = &mut self.entries[index];
		entry.timestamp = now;
		entry.flags.insert(EntryFlags::LOW_PRIORITY);
	}

	fn spawn_child(&mut self, child: ChildRef, parent: usize) -> bool {
		let now = self.clock.now_ms();
		let Some(index) = self.free_slot() else {
			debug!("Cannot register child task, table is full");
			// Keep the parent eligible so the registration is retried on
			// its next resume instead of parking it.
			self.entries[parent].timestamp = now;
			return false;
		};
		debug!("Registering task {index} awaited by task {parent}");
		self.entries[index].install(Frame::Child(child), now);
		self.entries[index].parent = Some(parent);
		// The parent inherits the child's timestamp: its own due time
		// restarts when the child completes.
		self.entries[parent].timestamp = now;
		self.entries[parent].flags.insert(EntryFlags::AWAITING);
		true
	}

	fn forget_child(&mut self, frame: NonNull<u8>) {
		for index in 0..N {
			let found = matches!(
				&self.entries[index].frame,
				Some(Frame::Child(child)) if child.frame == frame
			);
			if found {
				debug!("Dropping abandoned child task {index}");
				self.entries[index].frame = None;
				self.retire(index);
				return;
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use core::cell::Cell;
	use std::cell::RefCell;
	use std::rc::Rc;

	use quickcheck_macros::quickcheck;

	use super::*;
	use crate::suspend::sleep_until;

	#[derive(Clone, Default)]
	struct TestClock(Rc<Cell<u32>>);

	impl TestClock {
		fn advance(&self, ms: u32) {
			self.0.set(self.0.get().wrapping_add(ms));
		}

		fn set(&self, ms: u32) {
			self.0.set(ms);
		}
	}

	impl Clock for TestClock {
		fn now_ms(&self) -> u32 {
			self.0.get()
		}
	}

	#[test]
	fn table_capacity_is_enforced() {
		let mut scheduler = Scheduler::<2, _>::with_clock(TestClock::default());
		assert!(scheduler.add_task(Task::new(async {})).is_ok());
		assert!(scheduler.add_task(Task::new(async {})).is_ok());
		assert_eq!(
			scheduler.add_task(Task::new(async {})),
			Err(CapacityExceeded)
		);
		assert_eq!(scheduler.task_count(), 2);
	}

	#[test]
	fn completion_clears_the_slot() {
		let clock = TestClock::default();
		let mut scheduler = Scheduler::<4, _>::with_clock(clock.clone());
		scheduler.add_task(Task::new(async {})).unwrap();
		assert_eq!(scheduler.task_count(), 1);

		clock.advance(1);
		scheduler.run_once(true);
		assert_eq!(scheduler.task_count(), 0);
		assert!(context::is_clear());
	}

	#[test]
	fn freed_slots_are_reused() {
		let clock = TestClock::default();
		let mut scheduler = Scheduler::<2, _>::with_clock(clock.clone());
		scheduler.add_task(Task::new(async {})).unwrap();
		scheduler.add_task(Task::new(async {})).unwrap();

		clock.advance(1);
		scheduler.run_once(true);
		assert_eq!(scheduler.task_count(), 1);
		assert!(scheduler.add_task(Task::new(async {})).is_ok());
		assert_eq!(scheduler.add_task(Task::new(async {})), Err(CapacityExceeded));
	}

	#[test]
	fn time_left_reports_the_earliest_wake() {
		let clock = TestClock::default();
		let mut scheduler = Scheduler::<4, _>::with_clock(clock.clone());
		scheduler
			.add_task(Task::new(async {
				sleep_until(500).await;
			}))
			.unwrap();
		scheduler
			.add_task(Task::new(async {
				sleep_until(200).await;
			}))
			.unwrap();

		clock.advance(10);
		scheduler.run_once(true);
		scheduler.run_once(true);
		assert_eq!(scheduler.time_left(), 200);

		clock.advance(100);
		assert_eq!(scheduler.time_left(), 100);
	}

	#[test]
	fn low_priority_tasks_do_not_bound_time_left() {
		let clock = TestClock::default();
		let mut scheduler = Scheduler::<4, _>::with_clock(clock.clone());
		scheduler
			.add_task(Task::new(async {
				loop {
					crate::suspend::yield_low_priority().await;
				}
			}))
			.unwrap();

		clock.advance(1);
		scheduler.run_once(true);
		assert_eq!(scheduler.task_count(), 1);
		assert_eq!(scheduler.time_left(), u32::MAX);
	}

	#[test]
	fn a_task_that_suspends_without_arming_is_parked() {
		let clock = TestClock::default();
		let mut scheduler = Scheduler::<4, _>::with_clock(clock.clone());
		scheduler
			.add_task(Task::new(core::future::pending::<()>()))
			.unwrap();

		clock.advance(5);
		scheduler.run_once(true);
		assert_eq!(scheduler.task_count(), 1);
		assert_eq!(scheduler.time_left(), u32::MAX);

		clock.advance(1000);
		scheduler.run_once(true);
		assert_eq!(scheduler.task_count(), 1);
	}

	#[test]
	fn a_panicking_task_is_cleared_after_the_panic_surfaces() {
		let clock = TestClock::default();
		let mut scheduler = Scheduler::<4, _>::with_clock(clock.clone());
		scheduler
			.add_task(Task::new(async {
				panic!("boom");
			}))
			.unwrap();

		clock.advance(1);
		let caught = panic::catch_unwind(AssertUnwindSafe(|| {
			scheduler.run_once(true);
		}));
		assert!(caught.is_err());
		assert_eq!(scheduler.task_count(), 0);
		assert!(context::is_clear());
	}

	#[test]
	fn tolerance_admits_tasks_slightly_before_their_wake() {
		let clock = TestClock::default();
		let mut scheduler = Scheduler::<4, _>::with_clock(clock.clone());
		scheduler.set_tolerance(20);

		let ran = Rc::new(Cell::new(0u32));
		let observed = ran.clone();
		scheduler
			.add_task(Task::new(async move {
				loop {
					observed.set(observed.get() + 1);
					sleep_until(100).await;
				}
			}))
			.unwrap();

		scheduler.run_once(true);
		assert_eq!(ran.get(), 1);

		// Due at 100; within 20 ms of it the task is already eligible.
		clock.set(85);
		scheduler.run_once(true);
		assert_eq!(ran.get(), 2);
	}

	fn transcript(base: u32, steps: &[u8]) -> Vec<&'static str> {
		let clock = TestClock::default();
		clock.set(base);
		let log = Rc::new(RefCell::new(Vec::new()));
		let mut scheduler = Scheduler::<4, _>::with_clock(clock.clone());
		for (label, period) in [("fast", 30u32), ("slow", 70u32)] {
			let log = log.clone();
			scheduler
				.add_task(Task::new(async move {
					loop {
						log.borrow_mut().push(label);
						sleep_until(period).await;
					}
				}))
				.unwrap();
		}
		for step in steps {
			clock.advance(u32::from(*step));
			scheduler.run_once(true);
		}
		let result = log.borrow().clone();
		result
	}

	#[quickcheck]
	fn scheduling_depends_only_on_elapsed_time(base: u32, steps: Vec<u8>) -> bool {
		transcript(base, &steps) == transcript(0, &steps)
	}

	#[quickcheck]
	fn task_count_matches_the_defined_population(ops: Vec<bool>) -> bool {
		let clock = TestClock::default();
		let mut scheduler = Scheduler::<4, _>::with_clock(clock.clone());
		let mut expected = 0usize;
		for add in ops {
			if add {
				let added = scheduler
					.add_task(Task::new(async {
						loop {
							sleep_until(10).await;
						}
					}))
					.is_ok();
				assert_eq!(added, expected < 4);
				if added {
					expected += 1;
				}
			} else {
				clock.advance(7);
				scheduler.run_once(true);
			}
			if scheduler.task_count() != expected {
				return false;
			}
		}
		true
	}
}
