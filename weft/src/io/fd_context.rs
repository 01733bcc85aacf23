use crate::scheduler::{Handle, Task, TaskPayload};
use bitflags::bitflags;
use nix::sys::epoll::EpollFlags;
use parking_lot::Mutex;
use std::os::fd::RawFd;

bitflags! {
    /// Fd interests. The values mirror `EPOLLIN`/`EPOLLOUT` the way the
    /// reactor registers them.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct Event: u32 {
        const READ = 0x1;
        const WRITE = 0x4;
    }
}

impl Event {
    pub(crate) fn to_epoll(self) -> EpollFlags {
        let mut flags = EpollFlags::empty();
        if self.contains(Event::READ) {
            flags |= EpollFlags::EPOLLIN;
        }
        if self.contains(Event::WRITE) {
            flags |= EpollFlags::EPOLLOUT;
        }
        flags
    }

    pub(crate) fn from_epoll(flags: EpollFlags) -> Event {
        let mut events = Event::empty();
        if flags.contains(EpollFlags::EPOLLIN) {
            events |= Event::READ;
        }
        if flags.contains(EpollFlags::EPOLLOUT) {
            events |= Event::WRITE;
        }
        events
    }
}

/// Binding of one fd event to the scheduler that must run its handler
/// and the handler itself, exactly one of coroutine or callback.
#[derive(Default)]
pub(crate) struct EventContext {
    pub(crate) scheduler: Option<Handle>,
    pub(crate) payload: Option<TaskPayload>,
}

impl EventContext {
    pub(crate) fn reset(&mut self) {
        self.scheduler = None;
        self.payload = None;
    }
}

/// Per-fd record: registered interests plus one [`EventContext`] per
/// direction. Lives in the io manager's fd-indexed vector for the
/// manager's whole lifetime; all field mutation happens under `inner`'s
/// mutex.
pub(crate) struct FdContext {
    pub(crate) fd: RawFd,
    pub(crate) inner: Mutex<FdContextInner>,
}

pub(crate) struct FdContextInner {
    pub(crate) events: Event,
    pub(crate) read: EventContext,
    pub(crate) write: EventContext,
}

impl FdContext {
    pub(crate) fn new(fd: RawFd) -> Self {
        Self {
            fd,
            inner: Mutex::new(FdContextInner {
                events: Event::empty(),
                read: EventContext::default(),
                write: EventContext::default(),
            }),
        }
    }
}

impl FdContextInner {
    pub(crate) fn context_mut(&mut self, event: Event) -> &mut EventContext {
        if event == Event::READ {
            &mut self.read
        } else if event == Event::WRITE {
            &mut self.write
        } else {
            unreachable!("event context lookup for {event:?}")
        }
    }

    /// Fire `event` once: schedule the bound handler onto its bound
    /// scheduler and clear the registration. Interests are one-shot
    /// from the user's point of view; observing another edge requires a
    /// fresh `add_event`.
    pub(crate) fn trigger(&mut self, event: Event) {
        assert!(
            self.events.contains(event),
            "trigger of unregistered event {event:?}"
        );
        self.events -= event;

        let context = self.context_mut(event);
        let scheduler = context
            .scheduler
            .take()
            .expect("triggered event has a bound scheduler");
        let payload = context
            .payload
            .take()
            .expect("triggered event has a handler");
        context.reset();
        scheduler.schedule(Task::from(payload));
    }
}
