//! Session orchestration
//!
//! A [`Session`] owns the pumps between the local stdio and one remote
//! process, the local terminal controller and an optional resize sink. It
//! waits for readiness with `poll(2)`, moves whatever is ready and ends once
//! every pump whose completion matters is done. The local terminal is
//! restored on every exit path.

use std::io;
use std::ops::ControlFlow;
use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;

use tracing::{debug, error, info, trace, warn};

use ptyrelay_utils::Result;

use crate::config::RelayConfig;
use crate::demux::Demuxer;
use crate::pump::{Flushed, Pump};
use crate::select;
use crate::stream::{ByteStream, Stream};
use crate::tty::{self, Terminal, WindowSize};

/// What the host asks a [`Connector`] for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionParams {
    /// Remote address or identifier, interpreted by the connector
    pub target: String,
    /// Whether the remote process runs on a pseudo-terminal
    pub tty: bool,
    /// Whether local input is relayed to the remote process
    pub stdin_open: bool,
}

/// Receives terminal size changes for the remote side
pub trait ResizeSink {
    fn resize(&mut self, size: WindowSize) -> Result<()>;
}

/// Remote endpoints of one session
pub struct RemoteStreams {
    /// Remote process input; `None` when input is not relayed
    pub input: Option<Box<dyn ByteStream>>,
    pub output: Box<dyn ByteStream>,
    /// Separate remote stderr, when the remote keeps it apart
    pub error: Option<Box<dyn ByteStream>>,
    /// Output (and error) arrive framed
    pub multiplexed: bool,
    pub resizer: Option<Box<dyn ResizeSink>>,
}

/// Supplies the remote endpoints of a session
pub trait Connector {
    fn connect(&mut self, params: &SessionParams) -> Result<RemoteStreams>;
}

/// Local endpoints of one session
pub struct LocalStreams {
    pub stdin: Option<Box<dyn ByteStream>>,
    pub stdout: Box<dyn ByteStream>,
    pub stderr: Box<dyn ByteStream>,
    /// Descriptor of the controlling terminal (usually stdin)
    pub terminal_fd: RawFd,
}

impl LocalStreams {
    /// The process stdio, with stdin only when `with_stdin` is set
    pub fn stdio(config: &RelayConfig, with_stdin: bool) -> Result<Self> {
        let stdin: Option<Box<dyn ByteStream>> = if with_stdin {
            Some(Box::new(Stream::stdin()?))
        } else {
            None
        };
        Ok(Self {
            stdin,
            stdout: Box::new(Stream::stdout()?.with_pending_limit(config.max_pending_bytes)),
            stderr: Box::new(Stream::stderr()?.with_pending_limit(config.max_pending_bytes)),
            terminal_fd: io::stdin().as_raw_fd(),
        })
    }
}

/// A relay session between local stdio and a remote process
pub struct Session {
    pumps: Vec<Pump>,
    terminal: Terminal<RawFd>,
    resizer: Option<Box<dyn ResizeSink>>,
    config: RelayConfig,
    /// Input pumps must have written what they queued
    wait_all: bool,
}

impl Session {
    /// Session over `pumps`, controlling the terminal behind `terminal_fd`
    ///
    /// When `terminal_fd` is not a terminal (piped input), the session also
    /// waits for queued input to reach the remote side before it ends.
    pub fn new(pumps: Vec<Pump>, terminal_fd: RawFd, config: RelayConfig) -> Self {
        let wait_all = !tty::is_tty(&terminal_fd);
        Self {
            pumps,
            terminal: Terminal::new(terminal_fd, config.raw),
            resizer: None,
            config,
            wait_all,
        }
    }

    pub fn with_resizer(mut self, resizer: Option<Box<dyn ResizeSink>>) -> Self {
        self.resizer = resizer;
        self
    }

    pub fn wait_for_all_pumps(mut self, wait_all: bool) -> Self {
        self.wait_all = wait_all;
        self
    }

    /// Connect and relay the process stdio
    pub fn attach(
        connector: &mut dyn Connector,
        params: &SessionParams,
        config: RelayConfig,
    ) -> Result<Self> {
        let local = LocalStreams::stdio(&config, params.stdin_open)?;
        Self::attach_with(connector, params, config, local)
    }

    /// Connect and relay the given local streams
    pub fn attach_with(
        connector: &mut dyn Connector,
        params: &SessionParams,
        config: RelayConfig,
        local: LocalStreams,
    ) -> Result<Self> {
        let remote = connector.connect(params)?;
        info!(remote = %params.target, tty = params.tty, multiplexed = remote.multiplexed, "attached");

        let mut pumps = Vec::with_capacity(3);

        match (local.stdin, remote.input) {
            (Some(stdin), Some(input)) if params.stdin_open => {
                pumps.push(Pump::new("stdin", stdin, input).propagate_close(true));
            }
            _ => debug!("local input not relayed"),
        }

        pumps.push(output_pump(
            "stdout",
            remote.output,
            local.stdout,
            remote.multiplexed,
            &config,
        ));
        if let Some(error) = remote.error {
            pumps.push(output_pump(
                "stderr",
                error,
                local.stderr,
                remote.multiplexed,
                &config,
            ));
        }

        Ok(Self::new(pumps, local.terminal_fd, config).with_resizer(remote.resizer))
    }

    pub fn pumps(&self) -> &[Pump] {
        &self.pumps
    }

    pub fn terminal(&self) -> &Terminal<RawFd> {
        &self.terminal
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Whether every pump whose completion matters is done
    ///
    /// Pumps waiting for output must finish. The others never hold the
    /// session open on their source: with `wait_all` they only need an empty
    /// queue, which a destination whose peer went away always has. Without
    /// any output pump, every pump must finish.
    pub fn is_done(&self) -> bool {
        if !self.pumps.iter().any(Pump::waits_for_output) {
            return self.pumps.iter().all(Pump::is_done);
        }
        self.pumps.iter().all(|p| {
            if p.waits_for_output() {
                p.is_done()
            } else {
                !self.wait_all || !p.needs_write()
            }
        })
    }

    /// Run one readiness iteration, returning whether the session is done
    pub fn step(&mut self, timeout: Option<Duration>) -> Result<bool> {
        let mut read_fds = Vec::with_capacity(self.pumps.len());
        let mut readers = Vec::with_capacity(self.pumps.len());
        let mut write_fds = Vec::new();
        let mut writers = Vec::new();

        for (i, pump) in self.pumps.iter().enumerate() {
            if !pump.is_eof() {
                read_fds.push(pump.source_fd());
                readers.push(i);
            }
            if pump.needs_write() {
                write_fds.push(pump.dest_fd());
                writers.push(i);
            }
        }

        if read_fds.is_empty() && write_fds.is_empty() {
            return Ok(self.is_done());
        }

        let ready = select::wait(&read_fds, &write_fds, timeout)?;
        if ready.is_empty() {
            return Ok(self.is_done());
        }

        for &w in &ready.writable {
            let pump = &mut self.pumps[writers[w]];
            let n = pump.drain()?;
            trace!(pump = pump.name(), bytes = n, "drained");
        }

        let chunk_size = self.config.chunk_size;
        for &r in &ready.readable {
            let pump = &mut self.pumps[readers[r]];
            if let Flushed::Eof = pump.flush(chunk_size)? {
                debug!(pump = pump.name(), "pump reached end of stream");
            }
        }

        Ok(self.is_done())
    }

    /// Relay until done
    pub fn run(&mut self) -> Result<()> {
        self.run_with(|_| Ok(ControlFlow::Continue(())))
    }

    /// Relay until done, calling `hook` before each iteration
    ///
    /// The hook can stop the session early with `ControlFlow::Break`. The
    /// terminal is put in raw mode for the duration and restored afterwards,
    /// also when the session fails.
    pub fn run_with<F>(&mut self, mut hook: F) -> Result<()>
    where
        F: FnMut(&mut Session) -> Result<ControlFlow<()>>,
    {
        self.terminal.start()?;
        let result = self.drive(&mut hook);
        let restored = self.terminal.stop();

        match (result, restored) {
            (Ok(()), restored) => restored,
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(restore_err)) => {
                error!("Failed to restore terminal: {}", restore_err);
                Err(e)
            }
        }
    }

    fn drive<F>(&mut self, hook: &mut F) -> Result<()>
    where
        F: FnMut(&mut Session) -> Result<ControlFlow<()>>,
    {
        if let Err(e) = self.resize_to_local() {
            warn!("Initial resize failed: {}", e);
        }

        let timeout = Some(self.config.poll_interval());
        loop {
            if hook(self)?.is_break() {
                debug!("session stopped by host");
                return Ok(());
            }
            if self.step(timeout)? {
                debug!("all pumps done");
                return Ok(());
            }
        }
    }

    /// Forward a new size to the remote side
    pub fn resize(&mut self, size: WindowSize) -> Result<()> {
        match self.resizer.as_mut() {
            Some(resizer) => {
                debug!(rows = size.rows, cols = size.cols, "resize");
                resizer.resize(size)
            }
            None => Ok(()),
        }
    }

    /// Forward the local terminal's current size, if it is a terminal
    pub fn resize_to_local(&mut self) -> Result<()> {
        match self.terminal.size() {
            Some(size) => self.resize(size),
            None => Ok(()),
        }
    }
}

fn output_pump(
    name: &'static str,
    source: Box<dyn ByteStream>,
    dest: Box<dyn ByteStream>,
    multiplexed: bool,
    config: &RelayConfig,
) -> Pump {
    let pump = if multiplexed {
        Pump::new(
            name,
            Demuxer::new(source).with_max_frame_len(config.max_frame_len),
            dest,
        )
    } else {
        Pump::new(name, source, dest)
    };
    pump.wait_for_output(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{openpty, MemStream};
    use ptyrelay_protocol::{Channel, Frame};
    use ptyrelay_utils::RelayError;
    use std::cell::RefCell;
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;
    use std::rc::Rc;

    fn fast_config() -> RelayConfig {
        RelayConfig {
            poll_interval_ms: 10,
            ..RelayConfig::default()
        }
    }

    fn stream(s: UnixStream, label: &str) -> Box<dyn ByteStream> {
        Box::new(Stream::new(s, label).unwrap())
    }

    #[derive(Clone, Default)]
    struct RecordingSink {
        sizes: Rc<RefCell<Vec<WindowSize>>>,
    }

    impl ResizeSink for RecordingSink {
        fn resize(&mut self, size: WindowSize) -> Result<()> {
            self.sizes.borrow_mut().push(size);
            Ok(())
        }
    }

    /// Hands out pre-built socket endpoints
    struct PairConnector {
        remote: Option<RemoteStreams>,
        seen: Option<SessionParams>,
    }

    impl Connector for PairConnector {
        fn connect(&mut self, params: &SessionParams) -> Result<RemoteStreams> {
            self.seen = Some(params.clone());
            self.remote
                .take()
                .ok_or_else(|| RelayError::connection("already connected"))
        }
    }

    struct Peers {
        stdin: UnixStream,
        stdout: UnixStream,
        stderr: UnixStream,
        remote_in: UnixStream,
        remote_out: UnixStream,
        remote_err: UnixStream,
    }

    fn wire_up(multiplexed: bool) -> (PairConnector, LocalStreams, Peers) {
        let (stdin, stdin_peer) = UnixStream::pair().unwrap();
        let (stdout, stdout_peer) = UnixStream::pair().unwrap();
        let (stderr, stderr_peer) = UnixStream::pair().unwrap();
        let (remote_in, remote_in_peer) = UnixStream::pair().unwrap();
        let (remote_out, remote_out_peer) = UnixStream::pair().unwrap();
        let (remote_err, remote_err_peer) = UnixStream::pair().unwrap();

        let terminal_fd = stdin.as_raw_fd();
        let local = LocalStreams {
            stdin: Some(stream(stdin, "stdin")),
            stdout: stream(stdout, "stdout"),
            stderr: stream(stderr, "stderr"),
            terminal_fd,
        };
        let connector = PairConnector {
            remote: Some(RemoteStreams {
                input: Some(stream(remote_in, "remote stdin")),
                output: stream(remote_out, "remote stdout"),
                error: Some(stream(remote_err, "remote stderr")),
                multiplexed,
                resizer: None,
            }),
            seen: None,
        };
        let peers = Peers {
            stdin: stdin_peer,
            stdout: stdout_peer,
            stderr: stderr_peer,
            remote_in: remote_in_peer,
            remote_out: remote_out_peer,
            remote_err: remote_err_peer,
        };
        (connector, local, peers)
    }

    fn params() -> SessionParams {
        SessionParams {
            target: "test".into(),
            tty: false,
            stdin_open: true,
        }
    }

    #[test]
    fn test_multiplexed_output_reaches_stdout() {
        let (mut connector, local, mut peers) = wire_up(true);
        let mut session =
            Session::attach_with(&mut connector, &params(), fast_config(), local).unwrap();
        assert_eq!(session.pumps().len(), 3);

        peers
            .remote_out
            .write_all(&Frame::new(Channel::Stdout, &b"hello\n"[..]).to_bytes())
            .unwrap();
        peers
            .remote_out
            .write_all(&Frame::end_of_stream(Channel::Stdout).to_bytes())
            .unwrap();
        drop(peers.remote_err);

        session.run().unwrap();

        let pumps = session.pumps();
        assert!(!pumps[0].is_done(), "stdin pump still open");
        assert!(pumps[1].is_done());
        assert!(pumps[2].is_done());

        let mut out = [0u8; 6];
        peers.stdout.read_exact(&mut out).unwrap();
        assert_eq!(&out, b"hello\n");
        assert_eq!(connector.seen, Some(params()));
    }

    #[test]
    fn test_input_relayed_and_closed() {
        let (mut connector, local, mut peers) = wire_up(false);
        let mut session =
            Session::attach_with(&mut connector, &params(), fast_config(), local).unwrap();

        peers.stdin.write_all(b"ls\n").unwrap();
        drop(peers.stdin);

        // Input ends first and closes the remote input
        while !session.pumps()[0].is_done() {
            session.step(Some(Duration::from_millis(10))).unwrap();
        }
        let mut relayed = Vec::new();
        peers.remote_in.read_to_end(&mut relayed).unwrap();
        assert_eq!(relayed, b"ls\n");

        peers.remote_out.write_all(b"bin\n").unwrap();
        drop(peers.remote_out);
        drop(peers.remote_err);

        session.run().unwrap();
        assert!(session.pumps().iter().all(Pump::is_done));

        let mut out = [0u8; 4];
        peers.stdout.read_exact(&mut out).unwrap();
        assert_eq!(&out, b"bin\n");

        drop(session);
        let mut err = Vec::new();
        peers.stderr.read_to_end(&mut err).unwrap();
        assert!(err.is_empty());
    }

    #[test]
    fn test_remote_exit_ends_session_with_open_piped_stdin() {
        let (mut connector, local, mut peers) = wire_up(false);
        let mut session =
            Session::attach_with(&mut connector, &params(), fast_config(), local).unwrap();

        // The writer of the piped stdin stays open for the whole test
        peers.stdin.write_all(b"more input\n").unwrap();
        drop(peers.remote_in);
        drop(peers.remote_out);
        drop(peers.remote_err);

        let done = (0..200).any(|_| session.step(Some(Duration::from_millis(10))).unwrap());
        assert!(done, "session kept waiting for local input");
        assert!(!session.pumps()[0].is_eof());
        assert!(!session.pumps()[0].needs_write());
    }

    #[test]
    fn test_piped_input_holds_session_until_written() {
        let input = MemStream::new();
        let remote_in = MemStream::new();
        input.push(b"queued");
        remote_in.set_budget(Some(0));
        let remote_out = MemStream::new();
        remote_out.push_eof();

        let mut stdin_pump = Pump::new("stdin", input, remote_in.clone());
        let mut stdout_pump =
            Pump::new("stdout", remote_out, MemStream::new()).wait_for_output(true);
        stdin_pump.flush(1024).unwrap();
        stdout_pump.flush(1024).unwrap();
        assert!(stdout_pump.is_done());

        let (not_a_tty, _peer) = UnixStream::pair().unwrap();
        let pumps = vec![stdin_pump, stdout_pump];
        let session = Session::new(pumps, not_a_tty.as_raw_fd(), fast_config());
        assert!(!session.is_done(), "queued input is still unwritten");

        let session = session.wait_for_all_pumps(false);
        assert!(session.is_done());
        assert_eq!(remote_in.pending_len(), 6);
    }

    #[test]
    fn test_stdin_closed_skips_input_pump() {
        let (mut connector, local, _peers) = wire_up(false);
        let params = SessionParams {
            stdin_open: false,
            ..params()
        };
        let session = Session::attach_with(&mut connector, &params, fast_config(), local).unwrap();
        let names: Vec<_> = session.pumps().iter().map(Pump::name).collect();
        assert_eq!(names, ["stdout", "stderr"]);
    }

    #[test]
    fn test_connect_failure_propagates() {
        let (_, local, _peers) = wire_up(false);
        let mut connector = PairConnector {
            remote: None,
            seen: None,
        };
        let result = Session::attach_with(&mut connector, &params(), fast_config(), local);
        assert!(matches!(result, Err(RelayError::Connection(_))));
    }

    #[test]
    fn test_no_pumps_is_done() {
        let (a, _b) = UnixStream::pair().unwrap();
        let mut session = Session::new(Vec::new(), a.as_raw_fd(), fast_config());
        assert!(session.is_done());
        session.run().unwrap();
    }

    #[test]
    fn test_without_output_waiters_all_pumps_count() {
        let (a, _a_peer) = UnixStream::pair().unwrap();
        let (b, b_peer) = UnixStream::pair().unwrap();
        drop(b_peer);
        let pumps = vec![Pump::new("one", Stream::new(b, "b").unwrap(), Stream::new(a, "a").unwrap())];
        let (tty_like, _peer) = UnixStream::pair().unwrap();
        let mut session =
            Session::new(pumps, tty_like.as_raw_fd(), fast_config()).wait_for_all_pumps(false);

        assert!(!session.is_done());
        while !session.step(Some(Duration::from_millis(10))).unwrap() {}
        assert!(session.pumps()[0].is_done());
    }

    #[test]
    fn test_hook_can_stop_session() {
        let (mut connector, local, _peers) = wire_up(false);
        let mut session =
            Session::attach_with(&mut connector, &params(), fast_config(), local).unwrap();

        let mut calls = 0;
        session
            .run_with(|_| {
                calls += 1;
                Ok(if calls == 3 {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                })
            })
            .unwrap();
        assert_eq!(calls, 3);
        assert!(!session.is_done());
    }

    #[test]
    fn test_resize_forwarded() {
        let (_master, slave) = openpty();
        tty::set_size(&slave, WindowSize::new(24, 80)).unwrap();

        let sink = RecordingSink::default();
        let mut session = Session::new(Vec::new(), slave.as_raw_fd(), fast_config())
            .with_resizer(Some(Box::new(sink.clone())));

        session.resize_to_local().unwrap();
        session.resize(WindowSize::new(50, 132)).unwrap();
        assert_eq!(
            *sink.sizes.borrow(),
            [WindowSize::new(24, 80), WindowSize::new(50, 132)]
        );
    }

    #[test]
    fn test_initial_resize_on_run() {
        let (_master, slave) = openpty();
        tty::set_size(&slave, WindowSize::new(30, 100)).unwrap();

        let sink = RecordingSink::default();
        let mut session = Session::new(Vec::new(), slave.as_raw_fd(), fast_config())
            .with_resizer(Some(Box::new(sink.clone())));
        session.run().unwrap();

        assert_eq!(*sink.sizes.borrow(), [WindowSize::new(30, 100)]);
    }

    #[test]
    fn test_resize_without_sink_or_tty() {
        let (a, _b) = UnixStream::pair().unwrap();
        let mut session = Session::new(Vec::new(), a.as_raw_fd(), fast_config());
        session.resize_to_local().unwrap();
        session.resize(WindowSize::new(1, 1)).unwrap();
    }

    #[test]
    fn test_failure_restores_terminal() {
        let (_master, slave) = openpty();
        let dir = tempfile::tempdir().unwrap();
        let source = Stream::new(std::fs::File::open(dir.path()).unwrap(), "dir").unwrap();
        let (dest, _dest_peer) = UnixStream::pair().unwrap();
        let pumps =
            vec![Pump::new("broken", source, Stream::new(dest, "dest").unwrap()).wait_for_output(true)];

        let mut session = Session::new(pumps, slave.as_raw_fd(), fast_config());
        let err = session.run().unwrap_err();
        assert!(matches!(err, RelayError::Io(_)), "unexpected error: {err}");

        assert_eq!(session.terminal().mode(), tty::TerminalMode::Inactive);
        let mut attrs = std::mem::MaybeUninit::<libc::termios>::zeroed();
        // SAFETY: test-owned pty and termios buffer
        let attrs = unsafe {
            assert_eq!(libc::tcgetattr(slave.as_raw_fd(), attrs.as_mut_ptr()), 0);
            attrs.assume_init()
        };
        assert_ne!(attrs.c_lflag & libc::ICANON, 0);
    }
}
