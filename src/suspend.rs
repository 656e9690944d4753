use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};

use crate::context;

/// Suspends the running task until `delay_ms` milliseconds from now.
///
/// Arming clears the task's low-priority flag; a sleeping task competes in
/// the timed pass again once it is due. The returned future panics when
/// polled outside of a running task.
pub fn sleep_until(delay_ms: u32) -> SleepUntil {
	SleepUntil {
		delay_ms,
		armed: false,
	}
}

/// Suspends the running task and marks it low-priority: it runs again only
/// when no timed task is ready. The returned future panics when polled
/// outside of a running task.
pub fn yield_low_priority() -> YieldLowPriority {
	YieldLowPriority { yielded: false }
}

/// Future returned by [`sleep_until`].
#[must_use = "futures do nothing unless awaited"]
pub struct SleepUntil {
	delay_ms: u32,
	armed: bool,
}

impl Future for SleepUntil {
	type Output = ();

	fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
		let this = self.get_mut();
		if this.armed {
			return Poll::Ready(());
		}
		this.armed = true;
		let delay_ms = this.delay_ms;
		context::with_current(|scheduler, index| scheduler.sleep_current(index, delay_ms));
		Poll::Pending
	}
}

/// Future returned by [`yield_low_priority`].
#[must_use = "futures do nothing unless awaited"]
pub struct YieldLowPriority {
	yielded: bool,
}

impl Future for YieldLowPriority {
	type Output = ();

	fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
		let this = self.get_mut();
		if this.yielded {
			return Poll::Ready(());
		}
		this.yielded = true;
		context::with_current(|scheduler, index| scheduler.demote_current(index));
		Poll::Pending
	}
}

#[cfg(test)]
mod tests {
	use core::task::Waker;

	use super::*;

	#[test]
	#[should_panic(expected = "outside of a running task")]
	fn sleeping_outside_a_task_panics() {
		let mut future = sleep_until(10);
		let mut cx = Context::from_waker(Waker::noop());
		let _ = Pin::new(&mut future).poll(&mut cx);
	}

	#[test]
	#[should_panic(expected = "outside of a running task")]
	fn yielding_outside_a_task_panics() {
		let mut future = yield_low_priority();
		let mut cx = Context::from_waker(Waker::noop());
		let _ = Pin::new(&mut future).poll(&mut cx);
	}
}
