use core::alloc::Layout;
use core::future::Future;
use core::pin::Pin;
use core::ptr::{self, NonNull};
use core::task::{Context, Poll, Waker};

use crate::context;
use crate::pool::{FrameAlloc, Heap};
use crate::scheduler::task::ChildRef;

/// A root coroutine, handed to the scheduler via
/// [`Scheduler::add_task`](crate::Scheduler::add_task).
///
/// Resuming polls the wrapped future with a no-op waker; wakeups are the
/// scheduler's job, driven by the entry timestamps the suspension
/// primitives maintain. Dropping a live task releases its frame without
/// completing it.
pub struct Task {
	future: Pin<Box<dyn Future<Output = ()> + 'static>>,
}

impl Task {
	pub fn new<F>(future: F) -> Self
	where
		F: Future<Output = ()> + 'static,
	{
		Self {
			future: Box::pin(future),
		}
	}

	/// Advances the task. Returns `true` while more work remains.
	pub(crate) fn resume(&mut self) -> bool {
		let mut cx = Context::from_waker(Waker::noop());
		self.future.as_mut().poll(&mut cx).is_pending()
	}
}

/// Heap layout of a child coroutine: the future plus a slot for its result.
struct ChildFrame<F: Future> {
	future: F,
	result: Option<F::Output>,
}

unsafe fn resume_frame<F: Future>(frame: NonNull<u8>) -> bool {
	let frame = unsafe { frame.cast::<ChildFrame<F>>().as_mut() };
	if frame.result.is_some() {
		return false;
	}
	// The frame allocation never moves, so the future inside is pinned.
	let future = unsafe { Pin::new_unchecked(&mut frame.future) };
	let mut cx = Context::from_waker(Waker::noop());
	match future.poll(&mut cx) {
		Poll::Ready(value) => {
			frame.result = Some(value);
			false
		}
		Poll::Pending => true,
	}
}

unsafe fn take_result<F: Future>(frame: NonNull<u8>) -> Option<F::Output> {
	unsafe { frame.cast::<ChildFrame<F>>().as_mut() }.result.take()
}

unsafe fn drop_frame<F: Future>(frame: NonNull<u8>) {
	unsafe { ptr::drop_in_place(frame.cast::<ChildFrame<F>>().as_ptr()) }
}

/// A typed child coroutine. Awaiting it from inside a running task installs
/// it as a dependent scheduler entry and suspends the awaiting task until
/// the child has produced its value.
///
/// The child's frame is taken from `A`, by default the global heap; use
/// [`new_in`](Awaitable::new_in) with a
/// [`StaticAllocator`](crate::StaticAllocator) to keep frames in a fixed
/// pool. The frame is released when the `Awaitable` drops.
pub struct Awaitable<T, A: FrameAlloc = Heap> {
	frame: NonNull<u8>,
	layout: Layout,
	alloc: A,
	resume_fn: unsafe fn(NonNull<u8>) -> bool,
	take_fn: unsafe fn(NonNull<u8>) -> Option<T>,
	drop_fn: unsafe fn(NonNull<u8>),
	registered: bool,
}

impl<T: 'static> Awaitable<T, Heap> {
	pub fn new<F>(future: F) -> Self
	where
		F: Future<Output = T> + 'static,
	{
		Self::new_in(future, Heap)
	}
}

impl<T: 'static, A: FrameAlloc> Awaitable<T, A> {
	pub fn new_in<F>(future: F, alloc: A) -> Self
	where
		F: Future<Output = T> + 'static,
	{
		let layout = Layout::new::<ChildFrame<F>>();
		let frame = alloc.allocate(layout).cast::<ChildFrame<F>>();
		unsafe {
			frame.as_ptr().write(ChildFrame {
				future,
				result: None,
			});
		}
		Self {
			frame: frame.cast(),
			layout,
			alloc,
			resume_fn: resume_frame::<F>,
			take_fn: take_result::<F>,
			drop_fn: drop_frame::<F>,
			registered: false,
		}
	}
}

impl<T, A: FrameAlloc> Drop for Awaitable<T, A> {
	fn drop(&mut self) {
		if self.registered {
			// The child may still sit in the table, e.g. when an await is
			// abandoned before completing. Its entry must go before the
			// frame does.
			context::try_with_current(|scheduler, _| scheduler.forget_child(self.frame));
		}
		unsafe {
			(self.drop_fn)(self.frame);
			self.alloc.deallocate(self.frame, self.layout);
		}
	}
}

impl<T: 'static, A: FrameAlloc> Future for Awaitable<T, A> {
	type Output = T;

	fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<T> {
		// `Awaitable` is only a handle; the scheduler refers to the frame
		// allocation, which never moves.
		let this = unsafe { self.get_unchecked_mut() };
		if !this.registered {
			let child = ChildRef {
				frame: this.frame,
				resume: this.resume_fn,
			};
			this.registered =
				context::with_current(|scheduler, index| scheduler.spawn_child(child, index));
			return Poll::Pending;
		}
		match unsafe { (this.take_fn)(this.frame) } {
			Some(value) => Poll::Ready(value),
			None => Poll::Pending,
		}
	}
}
