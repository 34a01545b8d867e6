use std::{collections::BTreeMap, fmt::Debug, io, os::fd::AsRawFd};

use crate::log::dev_warn;
use crate::system::poll::PollSet;

pub(crate) use crate::system::poll::PollEvent;

pub(super) trait Process: Sized {
    /// IO Events that this process should handle.
    type Event: Copy + Debug;
    /// Reason why the event loop should break.
    ///
    /// See [`EventRegistry::set_break`] for more information.
    type Break;
    /// Reason why the event loop should exit.
    ///
    /// See [`EventRegistry::set_exit`] for more information.
    type Exit;
    /// Handle the corresponding event.
    fn on_event(&mut self, event: Self::Event, registry: &mut EventRegistry<Self>);
}

enum Status<T: Process> {
    Continue,
    Stop(StopReason<T>),
}

impl<T: Process> Status<T> {
    fn is_break(&self) -> bool {
        matches!(self, Self::Stop(StopReason::Break(_)))
    }

    fn take_stop(&mut self) -> Option<StopReason<T>> {
        // If the status ends up to be `Continue`, we are replacing it by another `Continue`.
        let status = std::mem::replace(self, Self::Continue);
        match status {
            Status::Continue => None,
            Status::Stop(reason) => Some(reason),
        }
    }

    fn take_break(&mut self) -> Option<T::Break> {
        match self.take_stop()? {
            StopReason::Break(break_reason) => Some(break_reason),
            reason @ StopReason::Exit(_) => {
                // Replace back the status because it was not a `Break`.
                *self = Self::Stop(reason);
                None
            }
        }
    }
}

pub(super) enum StopReason<T: Process> {
    Break(T::Break),
    Exit(T::Exit),
}

#[derive(PartialEq, Eq, Hash, Ord, PartialOrd, Clone, Copy, Debug)]
struct EventId(usize);

/// A handle to a registered event, used to pause, resume or remove it.
#[derive(Debug)]
pub(super) struct EventHandle {
    id: EventId,
    should_poll: bool,
}

impl EventHandle {
    /// Stop polling the descriptor of this event until [`EventHandle::resume`] is called.
    pub(super) fn ignore<T: Process>(&mut self, registry: &mut EventRegistry<T>) {
        if self.should_poll {
            registry.poll_set.ignore_fd(&self.id);
            self.should_poll = false;
        }
    }

    /// Poll the descriptor of this event again.
    pub(super) fn resume<T: Process>(&mut self, registry: &mut EventRegistry<T>) {
        if !self.should_poll {
            registry.poll_set.resume_fd(&self.id);
            self.should_poll = true;
        }
    }

    /// Set whether the descriptor of this event should be polled.
    pub(super) fn set_active<T: Process>(&mut self, active: bool, registry: &mut EventRegistry<T>) {
        if active {
            self.resume(registry)
        } else {
            self.ignore(registry)
        }
    }

    pub(super) fn is_active(&self) -> bool {
        self.should_poll
    }
}

/// A type able to register file descriptors to be polled.
pub(super) struct EventRegistry<T: Process> {
    seed: usize,
    poll_set: PollSet<EventId>,
    events: BTreeMap<EventId, T::Event>,
    status: Status<T>,
}

impl<T: Process> EventRegistry<T> {
    /// Create a new and empty registry.
    pub(super) const fn new() -> Self {
        Self {
            seed: 0,
            poll_set: PollSet::new(),
            events: BTreeMap::new(),
            status: Status::Continue,
        }
    }

    fn next_id(&mut self) -> EventId {
        let id = EventId(self.seed);
        self.seed += 1;
        id
    }

    /// Set the `fd` descriptor to be polled for `poll_event` events and produce the event
    /// `event_fn(poll_event)` when `fd` is ready.
    ///
    /// Events registered earlier are dispatched first when several are ready at once.
    pub(super) fn register_event<F: AsRawFd>(
        &mut self,
        fd: &F,
        poll_event: PollEvent,
        event_fn: impl Fn(PollEvent) -> T::Event,
    ) -> EventHandle {
        let id = self.next_id();
        self.poll_set.add_fd(id, fd, poll_event);
        self.events.insert(id, event_fn(poll_event));

        EventHandle {
            id,
            should_poll: true,
        }
    }

    /// Stop tracking the event behind `handle` for good. This must be done before the descriptor
    /// it refers to is closed.
    pub(super) fn deregister_event(&mut self, handle: EventHandle) {
        self.poll_set.remove_fd(&handle.id);
        self.events.remove(&handle.id);
    }

    /// Stop the event loop when the current callback is done and set a reason for it.
    ///
    /// This means that the event loop will stop even if other events are ready.
    pub(super) fn set_break(&mut self, reason: T::Break) {
        self.status = Status::Stop(StopReason::Break(reason));
    }

    /// Stop the event loop when the callbacks for the events that are ready by now have been
    /// dispatched and set a reason for it.
    pub(super) fn set_exit(&mut self, reason: T::Exit) {
        if !self.status.is_break() {
            self.status = Status::Stop(StopReason::Exit(reason));
        }
    }

    /// Return whether a break reason has been set already. This function will return `false` after
    /// [`EventRegistry::event_loop`] has been called.
    pub(super) fn got_break(&self) -> bool {
        self.status.is_break()
    }

    /// The events that are ready right now, without dispatching them.
    #[cfg(test)]
    pub(super) fn ready_events(&mut self) -> io::Result<Vec<T::Event>> {
        let ids = self.poll_set.try_poll()?;
        Ok(ids
            .iter()
            .filter_map(|id| self.events.get(id).copied())
            .collect())
    }

    /// Run the event loop for this handler.
    ///
    /// The event loop will continue indefinitely unless you call [`EventRegistry::set_break`] or
    /// [`EventRegistry::set_exit`]. A failure of the poll itself other than an interruption
    /// breaks the loop.
    pub(super) fn event_loop(&mut self, process: &mut T) -> StopReason<T>
    where
        T::Break: From<io::Error>,
    {
        loop {
            if self.poll_set.is_empty() {
                dev_warn!("event loop has nothing left to poll");
                return StopReason::Break(
                    io::Error::new(io::ErrorKind::Other, "no events left to poll").into(),
                );
            }

            match self.poll_set.poll() {
                Ok(ids) => {
                    for id in ids {
                        // An earlier callback of this batch may have deregistered it.
                        let Some(&event) = self.events.get(&id) else {
                            continue;
                        };
                        process.on_event(event, self);

                        if let Some(reason) = self.status.take_break() {
                            return StopReason::Break(reason);
                        }
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return StopReason::Break(err.into()),
            }

            if let Some(reason) = self.status.take_stop() {
                return reason;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{self, Read, Write},
        os::unix::net::UnixStream,
    };

    use pretty_assertions::assert_eq;

    use super::{EventHandle, EventRegistry, PollEvent, Process, StopReason};

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum TestEvent {
        First,
        Second,
    }

    struct Recorder {
        first: UnixStream,
        second: UnixStream,
        seen: Vec<TestEvent>,
        break_on: Option<TestEvent>,
        second_handle: Option<EventHandle>,
    }

    impl Process for Recorder {
        type Event = TestEvent;
        type Break = io::Error;
        type Exit = usize;

        fn on_event(&mut self, event: Self::Event, registry: &mut EventRegistry<Self>) {
            self.seen.push(event);
            let stream = match event {
                TestEvent::First => &mut self.first,
                TestEvent::Second => &mut self.second,
            };
            stream.read_exact(&mut [0]).unwrap();

            if self.break_on == Some(event) {
                registry.set_break(io::Error::new(io::ErrorKind::Other, "stop"));
            } else if event == TestEvent::First {
                match self.second_handle.take() {
                    Some(handle) => registry.deregister_event(handle),
                    None => registry.set_exit(self.seen.len()),
                }
            } else {
                registry.set_exit(self.seen.len());
            }
        }
    }

    fn setup(break_on: Option<TestEvent>) -> (Recorder, EventRegistry<Recorder>) {
        let (first, mut first_tx) = UnixStream::pair().unwrap();
        let (second, mut second_tx) = UnixStream::pair().unwrap();
        first_tx.write_all(&[1]).unwrap();
        second_tx.write_all(&[2]).unwrap();
        // Keep the peers alive for the whole test.
        std::mem::forget((first_tx, second_tx));

        let mut registry = EventRegistry::new();
        registry.register_event(&first, PollEvent::Readable, |_| TestEvent::First);
        registry.register_event(&second, PollEvent::Readable, |_| TestEvent::Second);

        let recorder = Recorder {
            first,
            second,
            seen: Vec::new(),
            break_on,
            second_handle: None,
        };
        (recorder, registry)
    }

    #[test]
    fn exit_lets_the_batch_finish_in_registration_order() {
        let (mut recorder, mut registry) = setup(None);

        let StopReason::Exit(count) = registry.event_loop(&mut recorder) else {
            panic!("expected an exit");
        };
        assert_eq!(count, 2);
        assert_eq!(recorder.seen, vec![TestEvent::First, TestEvent::Second]);
    }

    #[test]
    fn break_stops_right_after_the_callback() {
        let (mut recorder, mut registry) = setup(Some(TestEvent::First));

        let StopReason::Break(err) = registry.event_loop(&mut recorder) else {
            panic!("expected a break");
        };
        assert_eq!(err.to_string(), "stop");
        assert_eq!(recorder.seen, vec![TestEvent::First]);
    }

    #[test]
    fn deregistered_events_are_not_dispatched() {
        let (first, mut first_tx) = UnixStream::pair().unwrap();
        let (second, mut second_tx) = UnixStream::pair().unwrap();
        first_tx.write_all(&[1, 1]).unwrap();
        second_tx.write_all(&[2]).unwrap();

        let mut registry = EventRegistry::new();
        registry.register_event(&first, PollEvent::Readable, |_| TestEvent::First);
        let handle = registry.register_event(&second, PollEvent::Readable, |_| TestEvent::Second);

        let mut recorder = Recorder {
            first,
            second,
            seen: Vec::new(),
            break_on: None,
            second_handle: Some(handle),
        };

        // Both are ready in the first batch, but the first event removes the second one before
        // it is dispatched. The first fires once more and stops the loop.
        let StopReason::Exit(count) = registry.event_loop(&mut recorder) else {
            panic!("expected an exit");
        };
        assert_eq!(count, 2);
        assert_eq!(recorder.seen, vec![TestEvent::First, TestEvent::First]);
    }

    #[test]
    fn ignored_handles_are_skipped() {
        let (rx, mut tx) = UnixStream::pair().unwrap();
        tx.write_all(&[1]).unwrap();

        let mut registry = EventRegistry::<Recorder>::new();
        let mut handle = registry.register_event(&rx, PollEvent::Readable, |_| TestEvent::First);
        handle.ignore(&mut registry);
        assert!(!handle.is_active());
        assert!(registry.poll_set.is_empty());

        handle.resume(&mut registry);
        assert!(handle.is_active());
        assert!(!registry.poll_set.is_empty());
    }
}
