use core::cell::Cell;
use core::ptr::NonNull;

use crate::scheduler::task::ChildRef;

/// Scheduler operations reachable from inside a running task through the
/// thread-local context: the suspension primitives and child registration.
pub(crate) trait SchedulerHandle {
	/// Re-arms the entry at `index` to wake `delay_ms` from now and clears
	/// its low-priority flag.
	fn sleep_current(&mut self, index: usize, delay_ms: u32);

	/// Marks the entry at `index` low-priority, aged from now.
	fn demote_current(&mut self, index: usize);

	/// Installs `child` as a dependent of the entry at `parent` and flags
	/// the parent as awaiting. Returns `false` if the table is full.
	fn spawn_child(&mut self, child: ChildRef, parent: usize) -> bool;

	/// Retires the child entry referring to `frame`, if one is still in
	/// the table, unblocking its parent. Called when an [`Awaitable`]
	/// drops before its child has completed.
	///
	/// [`Awaitable`]: crate::Awaitable
	fn forget_child(&mut self, frame: NonNull<u8>);
}

#[derive(Clone, Copy)]
struct CurrentTask {
	scheduler: *mut dyn SchedulerHandle,
	index: usize,
}

thread_local! {
	static CURRENT: Cell<Option<CurrentTask>> = const { Cell::new(None) };
}

/// Clears the context again when a dispatch ends.
pub(crate) struct ContextGuard(());

impl Drop for ContextGuard {
	fn drop(&mut self) {
		CURRENT.with(|current| current.set(None));
	}
}

/// Installs the current-task context for one dispatch.
///
/// The pointer must stay valid until the returned guard is dropped, and the
/// caller must not touch the scheduler through any other path in between.
pub(crate) fn enter(scheduler: *mut dyn SchedulerHandle, index: usize) -> ContextGuard {
	CURRENT.with(|current| {
		assert!(
			current.get().is_none(),
			"nested scheduler dispatch on the same thread is not supported"
		);
		current.set(Some(CurrentTask { scheduler, index }));
	});
	ContextGuard(())
}

/// Runs `f` against the scheduler that is currently dispatching a task on
/// this thread, or returns `None` when no dispatch is in progress.
pub(crate) fn try_with_current<R>(
	f: impl FnOnce(&mut dyn SchedulerHandle, usize) -> R,
) -> Option<R> {
	let current = CURRENT.try_with(Cell::get).ok().flatten()?;
	// The pointer was installed by the dispatching scheduler and stays
	// valid for the whole dispatch; the borrow ends before `run_once`
	// touches the scheduler again.
	let scheduler = unsafe { &mut *current.scheduler };
	Some(f(scheduler, current.index))
}

/// Runs `f` against the scheduler that is currently dispatching a task on
/// this thread.
///
/// # Panics
///
/// Panics if no task is being dispatched, i.e. when a suspension primitive
/// or a child await is used outside of a running task.
pub(crate) fn with_current<R>(f: impl FnOnce(&mut dyn SchedulerHandle, usize) -> R) -> R {
	try_with_current(f).expect("suspension primitive used outside of a running task")
}

#[cfg(test)]
pub(crate) fn is_clear() -> bool {
	CURRENT.with(Cell::get).is_none()
}
