use core::ptr::NonNull;

use crate::task::Task;

bitflags! {
	/// Scheduling state of one table slot.
	#[derive(Clone, Copy, Debug, PartialEq, Eq)]
	pub(crate) struct EntryFlags: u8 {
		/// The slot holds a resumable frame.
		const DEFINED = 0b0000_0001;
		/// Runs only when no timed task is ready.
		const LOW_PRIORITY = 0b0000_0010;
		/// Blocked on a child entry; never selected.
		const AWAITING = 0b0000_0100;
	}
}

/// Type-erased reference to a child coroutine frame owned by the awaiting
/// task. The resume thunk is monomorphized over the concrete future type.
#[derive(Clone, Copy)]
pub(crate) struct ChildRef {
	pub frame: NonNull<u8>,
	pub resume: unsafe fn(NonNull<u8>) -> bool,
}

/// What a table slot dispatches: either a root task the scheduler owns, or
/// a reference to a child frame owned by the awaiting task.
pub(crate) enum Frame {
	Root(Task),
	Child(ChildRef),
}

impl Frame {
	/// Advances the frame. Returns `true` while more work remains.
	pub fn resume(&mut self) -> bool {
		match self {
			Frame::Root(task) => task.resume(),
			// The awaiting task keeps the frame alive for as long as its
			// entry is defined.
			Frame::Child(child) => unsafe { (child.resume)(child.frame) },
		}
	}
}

/// One slot of the fixed-capacity task table.
pub(crate) struct TaskEntry {
	pub flags: EntryFlags,
	/// Wake time, age marker, or parking stamp, depending on the flags.
	pub timestamp: u32,
	/// Index of the entry awaiting this one, if any.
	pub parent: Option<usize>,
	/// `Some` whenever `DEFINED` is set, except while the frame is moved
	/// out for its own dispatch.
	pub frame: Option<Frame>,
}

impl TaskEntry {
	pub const fn vacant() -> Self {
		Self {
			flags: EntryFlags::empty(),
			timestamp: 0,
			parent: None,
			frame: None,
		}
	}

	pub fn install(&mut self, frame: Frame, now: u32) {
		self.flags = EntryFlags::DEFINED;
		self.timestamp = now;
		self.parent = None;
		self.frame = Some(frame);
	}

	pub fn is_defined(&self) -> bool {
		self.flags.contains(EntryFlags::DEFINED)
	}
}
