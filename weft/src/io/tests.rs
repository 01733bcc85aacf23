use super::*;
use crate::coroutine::Coroutine;
use crate::fd::{TimeoutKind, fd_manager};
use crate::io::ops;
use crate::test_utils::{init_tracing, wait_until};
use nix::sys::socket::{AddressFamily, SockFlag, SockType, SockaddrIn, socket};
use nix::unistd::pipe;
use static_assertions::assert_impl_all;
use std::io::{Read, Write as _};
use std::net::TcpStream;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::time::{Duration, Instant};

assert_impl_all!(IoManager: Send, Sync);
assert_impl_all!(IoError: Send, Sync);

fn read_one_byte(fd: RawFd) {
    let mut byte = 0u8;
    // Safety: one-byte read from a pipe fd owned by the test.
    let n = unsafe { libc::read(fd, (&mut byte as *mut u8).cast(), 1) };
    assert_eq!(n, 1, "expected one readable byte");
}

fn write_one_byte(fd: RawFd) {
    // Safety: one-byte write to a pipe fd owned by the test.
    let n = unsafe { libc::write(fd, b"x".as_ptr().cast(), 1) };
    assert_eq!(n, 1);
}

#[test]
fn schedule_wakes_a_sleeping_worker() {
    init_tracing();
    let io = IoManager::new(1, false, "io-tickle").unwrap();
    // Let the single worker reach epoll_wait.
    std::thread::sleep(Duration::from_millis(20));

    let hit = Arc::new(AtomicBool::new(false));
    let flag = hit.clone();
    io.schedule(Task::callback(move || {
        flag.store(true, Ordering::SeqCst);
    }));

    assert!(
        wait_until(Duration::from_millis(500), || hit.load(Ordering::SeqCst)),
        "tickle did not wake the worker"
    );
    io.stop();
}

#[test]
fn fd_readiness_fires_once_per_registration() {
    init_tracing();
    let io = IoManager::new(2, false, "io-readiness").unwrap();
    let (r, w) = pipe().unwrap();
    let rfd = r.as_raw_fd();

    let hits = Arc::new(AtomicUsize::new(0));
    let register = |io: &Arc<IoManager>| {
        let hits = hits.clone();
        io.add_event(
            rfd,
            Event::READ,
            Some(Arc::new(move || {
                read_one_byte(rfd);
                hits.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();
    };

    register(&io);
    assert_eq!(io.pending_event_count(), 1);

    write_one_byte(w.as_raw_fd());
    assert!(wait_until(Duration::from_secs(2), || {
        hits.load(Ordering::SeqCst) == 1
    }));
    assert!(wait_until(Duration::from_secs(1), || {
        io.pending_event_count() == 0
    }));

    // A second write without a fresh registration is not observed.
    write_one_byte(w.as_raw_fd());
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    // Re-arming picks up the byte already sitting in the pipe.
    register(&io);
    assert!(wait_until(Duration::from_secs(2), || {
        hits.load(Ordering::SeqCst) == 2
    }));
    assert!(wait_until(Duration::from_secs(1), || {
        io.pending_event_count() == 0
    }));
    io.stop();
}

#[test]
fn one_shot_timer_fires_in_its_window_and_leaves() {
    init_tracing();
    let io = IoManager::new(1, false, "io-timer").unwrap();

    let fired_after = Arc::new(Mutex::new(None));
    let slot = fired_after.clone();
    let started = Instant::now();
    io.add_timer(
        50,
        Arc::new(move || {
            *slot.lock().unwrap() = Some(started.elapsed());
        }),
        false,
    );
    assert!(io.has_timer());

    assert!(wait_until(Duration::from_secs(2), || {
        fired_after.lock().unwrap().is_some()
    }));
    let elapsed = fired_after.lock().unwrap().unwrap();
    assert!(elapsed >= Duration::from_millis(45), "fired early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(500), "fired late: {elapsed:?}");
    assert!(!io.has_timer(), "one-shot must leave the set");
    io.stop();
}

#[test]
fn recurring_timer_fires_repeatedly_until_cancelled() {
    init_tracing();
    let io = IoManager::new(1, false, "io-recurring").unwrap();

    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    let timer = io.add_timer(
        20,
        Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }),
        true,
    );

    std::thread::sleep(Duration::from_millis(250));
    assert!(timer.cancel());
    let count = hits.load(Ordering::SeqCst);
    assert!((7..=15).contains(&count), "20ms timer fired {count} times in 250ms");
    assert!(!io.has_timer());
    io.stop();
}

#[test]
fn cancel_event_runs_the_handler_exactly_once() {
    init_tracing();
    let io = IoManager::new(1, false, "io-cancel").unwrap();
    let (r, _w) = pipe().unwrap();
    let rfd = r.as_raw_fd();

    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    io.add_event(
        rfd,
        Event::READ,
        Some(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })),
    )
    .unwrap();
    assert_eq!(io.pending_event_count(), 1);

    assert!(io.cancel_event(rfd, Event::READ));
    assert_eq!(io.pending_event_count(), 0);
    assert!(wait_until(Duration::from_secs(2), || {
        hits.load(Ordering::SeqCst) == 1
    }));

    // Nothing left to cancel.
    assert!(!io.cancel_event(rfd, Event::READ));
    std::thread::sleep(Duration::from_millis(30));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    io.stop();
}

#[test]
fn add_then_del_leaves_pending_count_unchanged() {
    init_tracing();
    let io = IoManager::new(1, false, "io-del").unwrap();
    let (r, _w) = pipe().unwrap();
    let rfd = r.as_raw_fd();
    let before = io.pending_event_count();

    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    io.add_event(
        rfd,
        Event::READ,
        Some(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })),
    )
    .unwrap();
    assert_eq!(io.pending_event_count(), before + 1);

    // Silent removal: no trigger.
    assert!(io.del_event(rfd, Event::READ));
    assert_eq!(io.pending_event_count(), before);
    std::thread::sleep(Duration::from_millis(30));
    assert_eq!(hits.load(Ordering::SeqCst), 0);

    assert!(!io.del_event(rfd, Event::READ), "second del finds nothing");
    io.stop();
}

#[test]
fn duplicate_registration_is_rejected() {
    init_tracing();
    let io = IoManager::new(1, false, "io-dup").unwrap();
    let (r, _w) = pipe().unwrap();
    let rfd = r.as_raw_fd();

    io.add_event(rfd, Event::READ, Some(Arc::new(|| {}))).unwrap();
    // Debug builds assert on the caller bug; in release the error comes
    // back to the caller.
    if cfg!(not(debug_assertions)) {
        let err = io.add_event(rfd, Event::READ, Some(Arc::new(|| {}))).unwrap_err();
        assert_eq!(
            err,
            IoError::EventExists {
                fd: rfd,
                event: Event::READ
            }
        );
        assert_eq!(io.pending_event_count(), 1);
    }
    assert!(io.del_event(rfd, Event::READ));
    io.stop();
}

#[test]
fn cancel_all_triggers_every_registered_event() {
    init_tracing();
    let io = IoManager::new(1, false, "io-cancel-all").unwrap();
    let (r, _w) = pipe().unwrap();
    let rfd = r.as_raw_fd();

    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    io.add_event(
        rfd,
        Event::READ,
        Some(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })),
    )
    .unwrap();

    assert!(io.cancel_all(rfd));
    assert_eq!(io.pending_event_count(), 0);
    assert!(wait_until(Duration::from_secs(2), || {
        hits.load(Ordering::SeqCst) == 1
    }));
    assert!(!io.cancel_all(rfd), "fd has nothing registered anymore");
    io.stop();
}

#[test]
fn never_seen_fd_grows_the_context_vector() {
    init_tracing();
    let io = IoManager::new(1, false, "io-grow").unwrap();

    // Open enough pipes that some fd lands beyond the initial vector
    // size (80 distinct fds cannot all be below 32).
    let pipes: Vec<_> = (0..40).map(|_| pipe().unwrap()).collect();
    let rfd = pipes.iter().map(|(r, _)| r.as_raw_fd()).max().unwrap();
    assert!(rfd as usize >= INITIAL_FD_CONTEXTS);

    io.add_event(rfd, Event::READ, Some(Arc::new(|| {}))).unwrap();
    assert_eq!(io.pending_event_count(), 1);
    assert!(io.del_event(rfd, Event::READ));
    io.stop();
}

#[test]
fn io_manager_current_is_set_on_workers() {
    init_tracing();
    let io = IoManager::new(1, false, "io-current").unwrap();
    assert!(IoManager::current().is_none(), "test thread has no reactor");

    let observed = Arc::new(Mutex::new(None));
    let slot = observed.clone();
    io.schedule(Task::callback(move || {
        *slot.lock().unwrap() = Some(IoManager::current().is_some());
    }));

    assert!(wait_until(Duration::from_secs(2), || {
        observed.lock().unwrap().is_some()
    }));
    assert_eq!(*observed.lock().unwrap(), Some(true));
    io.stop();
}

#[test]
fn cooperative_echo_roundtrip() {
    init_tracing();
    let io = IoManager::new(2, false, "io-echo").unwrap();
    let listener = ops::listen_tcp("127.0.0.1:0".parse().unwrap()).unwrap();
    let port = ops::local_addr(listener.as_raw_fd()).unwrap().port();
    let lfd = listener.as_raw_fd();

    let done = Arc::new(AtomicBool::new(false));
    let flag = done.clone();
    let reactor = io.clone();
    io.schedule(Task::coroutine(Coroutine::new(move || {
        let conn = ops::accept(&reactor, lfd).unwrap();
        let mut buf = [0u8; 64];
        let n = ops::recv(&reactor, conn.as_raw_fd(), &mut buf).unwrap();
        assert!(n > 0);
        ops::send_all(&reactor, conn.as_raw_fd(), &buf[..n]).unwrap();
        ops::close(conn);
        flag.store(true, Ordering::SeqCst);
    })));

    let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream.write_all(b"hello").unwrap();
    let mut reply = [0u8; 5];
    stream.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"hello");

    assert!(wait_until(Duration::from_secs(2), || done.load(Ordering::SeqCst)));
    io.stop();
}

#[test]
fn recv_honors_the_fd_timeout() {
    init_tracing();
    let io = IoManager::new(2, false, "io-recv-timeout").unwrap();
    let listener = ops::listen_tcp("127.0.0.1:0".parse().unwrap()).unwrap();
    let port = ops::local_addr(listener.as_raw_fd()).unwrap().port();
    let lfd = listener.as_raw_fd();

    let outcome = Arc::new(Mutex::new(None));
    let slot = outcome.clone();
    let reactor = io.clone();
    io.schedule(Task::coroutine(Coroutine::new(move || {
        let conn = ops::accept(&reactor, lfd).unwrap();
        let record = fd_manager().get(conn.as_raw_fd(), true).unwrap();
        record.set_timeout(TimeoutKind::Recv, 80).unwrap();

        let started = Instant::now();
        let mut buf = [0u8; 8];
        let result = ops::recv(&reactor, conn.as_raw_fd(), &mut buf);
        ops::close(conn);
        *slot.lock().unwrap() = Some((result, started.elapsed()));
    })));

    // Connect but never send: the cooperative recv must give up on its
    // own.
    let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        outcome.lock().unwrap().is_some()
    }));
    drop(stream);
    io.stop();

    let (result, elapsed) = outcome.lock().unwrap().take().unwrap();
    assert_eq!(result.unwrap_err(), IoError::TimedOut);
    assert!(elapsed >= Duration::from_millis(70), "gave up early: {elapsed:?}");
}

#[test]
fn cooperative_connect_reaches_a_listener() {
    init_tracing();
    let io = IoManager::new(2, false, "io-connect").unwrap();
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let done = Arc::new(AtomicBool::new(false));
    let flag = done.clone();
    let reactor = io.clone();
    io.schedule(Task::coroutine(Coroutine::new(move || {
        let sock = socket(
            AddressFamily::Inet,
            SockType::Stream,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
            None,
        )
        .unwrap();
        let addr = SockaddrIn::new(127, 0, 0, 1, port);
        ops::connect_addr(&reactor, sock.as_raw_fd(), &addr, Some(1_000)).unwrap();
        ops::send_all(&reactor, sock.as_raw_fd(), b"ping").unwrap();
        ops::close(sock);
        flag.store(true, Ordering::SeqCst);
    })));

    let (mut conn, _) = listener.accept().unwrap();
    let mut buf = [0u8; 4];
    conn.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"ping");

    assert!(wait_until(Duration::from_secs(2), || done.load(Ordering::SeqCst)));
    io.stop();
}

#[test]
fn cooperative_read_waits_for_pipe_data() {
    init_tracing();
    let io = IoManager::new(2, false, "io-pipe-read").unwrap();
    let (r, w) = pipe().unwrap();
    let rfd = r.as_raw_fd();

    let got = Arc::new(Mutex::new(None));
    let slot = got.clone();
    let reactor = io.clone();
    io.schedule(Task::coroutine(Coroutine::new(move || {
        let mut buf = [0u8; 16];
        let n = ops::read(&reactor, rfd, &mut buf).unwrap();
        *slot.lock().unwrap() = Some(buf[..n].to_vec());
    })));

    // Give the coroutine time to park on the empty pipe first.
    std::thread::sleep(Duration::from_millis(30));
    assert!(got.lock().unwrap().is_none());

    let reactor = io.clone();
    ops::write(&reactor, w.as_raw_fd(), b"abc").unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        got.lock().unwrap().is_some()
    }));
    assert_eq!(got.lock().unwrap().clone().unwrap(), b"abc");
    io.stop();
    ops::close(r);
    ops::close(w);
}

#[test]
fn condition_timer_skips_a_dead_subject() {
    init_tracing();
    let io = IoManager::new(1, false, "io-condition").unwrap();

    let hits = Arc::new(AtomicUsize::new(0));
    let subject = Arc::new(());
    let weak = Arc::downgrade(&subject);
    drop(subject);

    let counter = hits.clone();
    io.add_condition_timer(
        10,
        Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }),
        weak,
        false,
    );

    std::thread::sleep(Duration::from_millis(60));
    assert_eq!(hits.load(Ordering::SeqCst), 0, "gated callback must not run");
    assert!(!io.has_timer(), "the timer itself still expired");
    io.stop();
}
