//! Moving bytes between the command and the user while the I/O plugins watch.
mod ring_buffer;

use std::{
    fs::File,
    io::{self, Read, Write},
    marker::PhantomData,
    os::fd::{AsFd, AsRawFd, OwnedFd},
};

use crate::{
    log::{dev_info, dev_warn},
    system::{pipe, set_nonblocking},
};

use super::{
    event::{EventHandle, EventRegistry, PollEvent, Process},
    io_util::{is_read_eof, is_write_gone, was_interrupted},
    plugin::{IoStream, LogAction, Plugins},
};

use self::ring_buffer::RingBuffer;

/// The descriptors the command gets as its standard input, output and error. `None` leaves the
/// inherited one in place.
pub(super) type CommandStdio = [Option<OwnedFd>; 3];

const STD_STREAMS: [IoStream; 3] = [IoStream::StdIn, IoStream::StdOut, IoStream::StdErr];

// A pipe able to stream data bidirectionally between the user's terminal (left) and the pty
// (right).
pub(super) struct Pipe<L, R> {
    left: L,
    right: R,
    buffer_lr: Buffer<L, R>,
    buffer_rl: Buffer<R, L>,
    background: bool,
}

impl<L: Read + Write + AsRawFd, R: Read + Write + AsRawFd> Pipe<L, R> {
    /// Create a new pipe between two read-write types and register them to be polled.
    pub(super) fn new<T: Process>(
        left: L,
        right: R,
        registry: &mut EventRegistry<T>,
        f_left: fn(PollEvent) -> T::Event,
        f_right: fn(PollEvent) -> T::Event,
    ) -> Self {
        Self {
            buffer_lr: Buffer::new(
                IoStream::TtyIn,
                registry.register_event(&left, PollEvent::Readable, f_left),
                registry.register_event(&right, PollEvent::Writable, f_right),
                registry,
            ),
            buffer_rl: Buffer::new(
                IoStream::TtyOut,
                registry.register_event(&right, PollEvent::Readable, f_right),
                registry.register_event(&left, PollEvent::Writable, f_left),
                registry,
            ),
            left,
            right,
            background: false,
        }
    }

    pub(super) fn left(&self) -> &L {
        &self.left
    }

    pub(super) fn left_mut(&mut self) -> &mut L {
        &mut self.left
    }

    pub(super) fn right(&self) -> &R {
        &self.right
    }

    /// Stop the poll events of this pipe.
    pub(super) fn ignore_events<T: Process>(&mut self, registry: &mut EventRegistry<T>) {
        self.buffer_lr.pause(registry);
        self.buffer_rl.pause(registry);
    }

    /// Stop reading from the left side until [`Pipe::enable_input`] is called.
    pub(super) fn disable_input<T: Process>(&mut self, registry: &mut EventRegistry<T>) {
        if let Some(handle) = &mut self.buffer_lr.read_handle {
            handle.ignore(registry);
        }
        self.background = true;
    }

    pub(super) fn enable_input<T: Process>(&mut self, registry: &mut EventRegistry<T>) {
        self.background = false;
        self.buffer_lr.resume_reading(registry);
    }

    /// Resume the poll events of this pipe
    pub(super) fn resume_events<T: Process>(&mut self, registry: &mut EventRegistry<T>) {
        self.buffer_lr.resume(!self.background, registry);
        self.buffer_rl.resume(true, registry);
    }

    /// Handle a poll event for the left side of the pipe.
    pub(super) fn on_left_event<T: Process>(
        &mut self,
        poll_event: PollEvent,
        plugins: &mut Plugins,
        registry: &mut EventRegistry<T>,
    ) -> io::Result<()> {
        match poll_event {
            PollEvent::Readable => self.buffer_lr.read(&mut self.left, plugins, registry),
            PollEvent::Writable => {
                if self.buffer_rl.write(&mut self.left, registry)? {
                    self.buffer_rl.resume_reading(registry);
                }
                Ok(())
            }
        }
    }

    /// Handle a poll event for the right side of the pipe.
    pub(super) fn on_right_event<T: Process>(
        &mut self,
        poll_event: PollEvent,
        plugins: &mut Plugins,
        registry: &mut EventRegistry<T>,
    ) -> io::Result<()> {
        match poll_event {
            PollEvent::Readable => self.buffer_rl.read(&mut self.right, plugins, registry),
            PollEvent::Writable => {
                if self.buffer_lr.write(&mut self.right, registry)? && !self.background {
                    self.buffer_lr.resume_reading(registry);
                }
                Ok(())
            }
        }
    }

    /// Write out everything buffered for the left side.
    pub(super) fn flush_left(&mut self) -> io::Result<()> {
        self.buffer_rl.flush(&mut self.left)
    }

    /// Write out to the left side whatever the right side has left, without waiting for more.
    pub(super) fn drain_right(&mut self, plugins: &mut Plugins) -> io::Result<()> {
        set_nonblocking(&self.right, true)?;
        self.buffer_rl.drain(&mut self.right, &mut self.left, plugins)
    }
}

/// A buffer that stores the bytes read from `R` before they are written to `W`.
///
/// A missing handle means that side is finished: the reader hit end of file or the writer went
/// away.
struct Buffer<R, W> {
    internal: RingBuffer,
    stream: IoStream,
    read_handle: Option<EventHandle>,
    write_handle: Option<EventHandle>,
    marker: PhantomData<(R, W)>,
}

impl<R: Read, W: Write> Buffer<R, W> {
    /// Create a new, empty buffer
    fn new<T: Process>(
        stream: IoStream,
        read_handle: EventHandle,
        mut write_handle: EventHandle,
        registry: &mut EventRegistry<T>,
    ) -> Self {
        // The buffer is empty, don't write
        write_handle.ignore(registry);

        Self {
            internal: RingBuffer::new(),
            stream,
            read_handle: Some(read_handle),
            write_handle: Some(write_handle),
            marker: PhantomData,
        }
    }

    fn pause<T: Process>(&mut self, registry: &mut EventRegistry<T>) {
        for handle in [&mut self.read_handle, &mut self.write_handle]
            .into_iter()
            .flatten()
        {
            handle.ignore(registry);
        }
    }

    fn resume<T: Process>(&mut self, reading: bool, registry: &mut EventRegistry<T>) {
        if reading {
            self.resume_reading(registry);
        }
        if let Some(handle) = &mut self.write_handle {
            handle.set_active(!self.internal.is_empty(), registry);
        }
    }

    fn resume_reading<T: Process>(&mut self, registry: &mut EventRegistry<T>) {
        if let Some(handle) = &mut self.read_handle {
            handle.set_active(!self.internal.is_full(), registry);
        }
    }

    fn is_closed(&self) -> bool {
        self.write_handle.is_none()
    }

    fn stop_reading<T: Process>(&mut self, registry: &mut EventRegistry<T>) {
        if let Some(handle) = self.read_handle.take() {
            registry.deregister_event(handle);
        }
        // Nothing else is coming, the writer is done once the buffer is drained.
        if self.internal.is_empty() {
            self.stop_writing(registry);
        }
    }

    fn stop_writing<T: Process>(&mut self, registry: &mut EventRegistry<T>) {
        if let Some(handle) = self.write_handle.take() {
            registry.deregister_event(handle);
        }
        self.internal.clear();
    }

    /// Read bytes into the buffer and show them to the I/O plugins.
    fn read<T: Process>(
        &mut self,
        read: &mut R,
        plugins: &mut Plugins,
        registry: &mut EventRegistry<T>,
    ) -> io::Result<()> {
        let Some(read_handle) = &mut self.read_handle else {
            return Ok(());
        };

        // If the buffer is full, there is nothing to be read.
        if self.internal.is_full() {
            read_handle.ignore(registry);
            return Ok(());
        }

        let mut chunk = [0; RingBuffer::LEN];
        let chunk = &mut chunk[..self.internal.free_space()];

        let len = match read.read(chunk) {
            Ok(0) => {
                dev_info!("end of file on {:?}", self.stream);
                self.stop_reading(registry);
                return Ok(());
            }
            Ok(len) => len,
            Err(err) if was_interrupted(&err) => return Ok(()),
            Err(err) if is_read_eof(&err) => {
                dev_info!("{:?} is gone: {err}", self.stream);
                self.stop_reading(registry);
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        let data = &chunk[..len];

        if plugins.log_io(self.stream, data) == LogAction::Suppress {
            dev_info!("I/O plugin suppressed {:?}", self.stream);
            self.stop_writing(registry);
        }

        // Without a writer the data is only logged.
        if let Some(write_handle) = &mut self.write_handle {
            self.internal.push(data);
            write_handle.resume(registry);
        }

        Ok(())
    }

    /// Write bytes from the buffer and return whether some buffer space was freed.
    fn write<T: Process>(
        &mut self,
        write: &mut W,
        registry: &mut EventRegistry<T>,
    ) -> io::Result<bool> {
        let Some(write_handle) = &mut self.write_handle else {
            return Ok(false);
        };

        // If the buffer is empty, there is nothing to be written.
        if self.internal.is_empty() {
            write_handle.ignore(registry);
            return Ok(false);
        }

        match self.internal.remove(write) {
            Ok(removed_len) => {
                if self.internal.is_empty() && self.read_handle.is_none() {
                    self.stop_writing(registry);
                }
                Ok(removed_len > 0)
            }
            Err(err) if was_interrupted(&err) => Ok(false),
            Err(err) if is_write_gone(&err) => {
                dev_info!("cannot write {:?} anymore: {err}", self.stream);
                self.stop_writing(registry);
                Ok(true)
            }
            Err(err) => Err(err),
        }
    }

    /// Flush this buffer, ensuring that all the contents of its internal buffer are written.
    fn flush(&mut self, write: &mut W) -> io::Result<()> {
        if self.is_closed() {
            return Ok(());
        }

        while !self.internal.is_empty() {
            if self.internal.remove(write)? == 0 {
                break;
            }
        }

        write.flush()
    }

    /// Write out the buffer and then whatever `read` has left without waiting for more, showing
    /// it to the I/O plugins first.
    fn drain(&mut self, read: &mut R, write: &mut W, plugins: &mut Plugins) -> io::Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        self.flush(write)?;

        let mut chunk = [0; RingBuffer::LEN];
        loop {
            let len = match read.read(&mut chunk) {
                Ok(0) => break,
                Ok(len) => len,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            };
            if plugins.log_io(self.stream, &chunk[..len]) == LogAction::Suppress {
                break;
            }
            write.write_all(&chunk[..len])?;
        }

        write.flush()
    }
}

/// One standard stream of the command, copied through a pipe so it can be logged.
struct Relay {
    src: File,
    dst: Option<File>,
    buffer: Buffer<File, File>,
}

impl Relay {
    fn new<T: Process>(
        stream: IoStream,
        src: File,
        dst: File,
        registry: &mut EventRegistry<T>,
        event_fn: impl Fn(IoStream, PollEvent) -> T::Event + Copy,
    ) -> Self {
        let buffer = Buffer::new(
            stream,
            registry.register_event(&src, PollEvent::Readable, move |poll| {
                event_fn(stream, poll)
            }),
            registry.register_event(&dst, PollEvent::Writable, move |poll| {
                event_fn(stream, poll)
            }),
            registry,
        );

        Self {
            src,
            dst: Some(dst),
            buffer,
        }
    }

    fn on_event<T: Process>(
        &mut self,
        poll_event: PollEvent,
        plugins: &mut Plugins,
        registry: &mut EventRegistry<T>,
    ) -> io::Result<()> {
        match poll_event {
            PollEvent::Readable => self.buffer.read(&mut self.src, plugins, registry)?,
            PollEvent::Writable => {
                if let Some(dst) = &mut self.dst {
                    if self.buffer.write(dst, registry)? {
                        self.buffer.resume_reading(registry);
                    }
                }
            }
        }

        // Closing the destination is how end of file reaches the other side.
        if self.buffer.is_closed() && self.dst.take().is_some() {
            dev_info!("closing {:?}", self.buffer.stream);
        }

        Ok(())
    }

    fn close<T: Process>(&mut self, registry: &mut EventRegistry<T>) {
        self.buffer.stop_writing(registry);
        self.buffer.stop_reading(registry);
        self.dst = None;
    }

    /// Copy whatever the command left behind to the destination.
    fn drain(&mut self, plugins: &mut Plugins) {
        let Some(dst) = &mut self.dst else {
            return;
        };
        if let Err(err) = self.buffer.drain(&mut self.src, dst, plugins) {
            dev_warn!("cannot flush {:?}: {err}", self.buffer.stream);
        }
    }
}

/// Relays for the standard streams of the command that are logged and not connected to a
/// terminal.
pub(super) struct StdioRelays {
    relays: Vec<Relay>,
}

impl StdioRelays {
    /// Put a pipe between the command and each standard stream selected by `relayed`, in the
    /// order stdin, stdout, stderr, and register its events.
    ///
    /// Returns the ends of the pipes that belong to the command.
    pub(super) fn new<T: Process>(
        relayed: [bool; 3],
        registry: &mut EventRegistry<T>,
        event_fn: impl Fn(IoStream, PollEvent) -> T::Event + Copy,
    ) -> io::Result<(Self, CommandStdio)> {
        let mut relays = Vec::new();
        let mut stdio = CommandStdio::default();

        for (index, stream) in STD_STREAMS.into_iter().enumerate() {
            if !relayed[index] {
                continue;
            }

            let ours = std_stream(stream)?;
            let (read, write) = pipe()?;
            let (src, dst, theirs) = match stream {
                IoStream::StdIn => (ours, write, read),
                _ => (read, ours, write),
            };
            // Only our ends of the pipes, the user's descriptors are shared with other processes.
            match stream {
                IoStream::StdIn => set_nonblocking(&dst, true)?,
                _ => set_nonblocking(&src, true)?,
            }

            dev_info!("relaying {stream:?} through a pipe");
            relays.push(Relay::new(stream, src, dst, registry, event_fn));
            stdio[index] = Some(theirs.into());
        }

        Ok((Self { relays }, stdio))
    }

    /// Handle a poll event of the relay for `stream`. A relay that fails is shut down.
    pub(super) fn on_event<T: Process>(
        &mut self,
        stream: IoStream,
        poll_event: PollEvent,
        plugins: &mut Plugins,
        registry: &mut EventRegistry<T>,
    ) {
        let Some(relay) = self
            .relays
            .iter_mut()
            .find(|relay| relay.buffer.stream == stream)
        else {
            return;
        };

        if let Err(err) = relay.on_event(poll_event, plugins, registry) {
            dev_warn!("cannot relay {stream:?}: {err}");
            relay.close(registry);
        }
    }

    /// Write out the remaining output of the command.
    pub(super) fn drain(&mut self, plugins: &mut Plugins) {
        for relay in &mut self.relays {
            if relay.buffer.stream != IoStream::StdIn {
                relay.drain(plugins);
            }
        }
    }
}

/// A private duplicate of one of our own standard streams.
fn std_stream(stream: IoStream) -> io::Result<File> {
    let fd = match stream {
        IoStream::StdIn => io::stdin().as_fd().try_clone_to_owned()?,
        IoStream::StdOut => io::stdout().as_fd().try_clone_to_owned()?,
        _ => io::stderr().as_fd().try_clone_to_owned()?,
    };
    Ok(File::from(fd))
}

#[cfg(test)]
mod tests {
    use std::{
        cell::RefCell,
        io::{Read, Write},
        os::unix::net::UnixStream,
        rc::Rc,
    };

    use pretty_assertions::assert_eq;

    use crate::exec::{
        event::{EventRegistry, PollEvent, Process},
        plugin::{
            tests::AllowAll, IoCapabilities, IoPlugin, IoStream, LogAction, Plugin, Plugins,
        },
    };

    use super::Pipe;

    #[derive(Debug, Clone, Copy)]
    enum TestEvent {
        Left(PollEvent),
        Right(PollEvent),
    }

    struct Tester {
        pipe: Pipe<UnixStream, UnixStream>,
        plugins: Plugins,
    }

    impl Process for Tester {
        type Event = TestEvent;
        type Break = std::io::Error;
        type Exit = ();

        fn on_event(&mut self, event: Self::Event, registry: &mut EventRegistry<Self>) {
            let result = match event {
                TestEvent::Left(poll) => self.pipe.on_left_event(poll, &mut self.plugins, registry),
                TestEvent::Right(poll) => {
                    self.pipe.on_right_event(poll, &mut self.plugins, registry)
                }
            };
            if let Err(err) = result {
                registry.set_break(err);
            }
        }
    }

    struct Censor {
        seen: Rc<RefCell<Vec<(IoStream, Vec<u8>)>>>,
    }

    impl IoPlugin for Censor {
        fn capabilities(&self) -> IoCapabilities {
            IoCapabilities {
                tty_in: true,
                tty_out: true,
                ..Default::default()
            }
        }

        fn log(&mut self, stream: IoStream, data: &[u8]) -> LogAction {
            self.seen.borrow_mut().push((stream, data.to_vec()));
            if data.starts_with(b"secret") {
                LogAction::Suppress
            } else {
                LogAction::Keep
            }
        }
    }

    /// Two socket pairs standing in for the user's terminal and the pty.
    fn setup() -> (
        Tester,
        EventRegistry<Tester>,
        UnixStream,
        UnixStream,
        Rc<RefCell<Vec<(IoStream, Vec<u8>)>>>,
    ) {
        let (left, user) = UnixStream::pair().unwrap();
        let (right, command) = UnixStream::pair().unwrap();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let plugins = Plugins::new([
            Plugin::Policy(Box::new(AllowAll)),
            Plugin::Io(Box::new(Censor { seen: seen.clone() })),
        ])
        .unwrap();

        let mut registry = EventRegistry::new();
        let pipe = Pipe::new(left, right, &mut registry, TestEvent::Left, TestEvent::Right);

        (Tester { pipe, plugins }, registry, user, command, seen)
    }

    /// Dispatch events until nothing is ready anymore.
    fn pump(tester: &mut Tester, registry: &mut EventRegistry<Tester>) {
        for _ in 0..16 {
            let events = registry.ready_events().unwrap();
            if events.is_empty() {
                break;
            }
            for event in events {
                tester.on_event(event, registry);
            }
        }
        assert!(!registry.got_break());
    }

    #[test]
    fn bytes_flow_both_ways_and_are_logged() {
        let (mut tester, mut registry, mut user, mut command, seen) = setup();

        user.write_all(b"ls\n").unwrap();
        command.write_all(b"file\n").unwrap();
        pump(&mut tester, &mut registry);

        let mut buf = [0; 5];
        command.read_exact(&mut buf[..3]).unwrap();
        assert_eq!(&buf[..3], b"ls\n");
        user.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"file\n");

        let seen = seen.borrow();
        assert!(seen.contains(&(IoStream::TtyIn, b"ls\n".to_vec())));
        assert!(seen.contains(&(IoStream::TtyOut, b"file\n".to_vec())));
    }

    #[test]
    fn suppressed_output_stops_reaching_the_user() {
        let (mut tester, mut registry, mut user, mut command, seen) = setup();

        command.write_all(b"secret stuff").unwrap();
        pump(&mut tester, &mut registry);
        command.write_all(b"more").unwrap();
        pump(&mut tester, &mut registry);

        user.set_nonblocking(true).unwrap();
        let mut buf = [0; 32];
        assert!(user.read(&mut buf).is_err());

        // Everything is still shown to the plugin.
        assert_eq!(seen.borrow().len(), 2);
    }

    #[test]
    fn background_pipes_do_not_read_input() {
        let (mut tester, mut registry, mut user, mut command, _) = setup();

        tester.pipe.disable_input(&mut registry);
        user.write_all(b"typed").unwrap();
        pump(&mut tester, &mut registry);

        command.set_nonblocking(true).unwrap();
        let mut buf = [0; 5];
        assert!(command.read(&mut buf).is_err());

        tester.pipe.enable_input(&mut registry);
        pump(&mut tester, &mut registry);
        command.set_nonblocking(false).unwrap();
        command.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"typed");
    }
}
