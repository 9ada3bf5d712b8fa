//! End-to-end reactor tests: real loops, real fds, real timers.

use std::cell::{Cell, RefCell};
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use muxio_reactor::{Channel, EventLoop, EventLoopThread};

fn pipe2() -> (RawFd, RawFd) {
    let mut fds = [0 as RawFd; 2];
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
    assert_eq!(rc, 0);
    (fds[0], fds[1])
}

fn write_byte(fd: RawFd) {
    let byte = [0x2au8];
    let n = unsafe { libc::write(fd, byte.as_ptr() as *const libc::c_void, 1) };
    assert_eq!(n, 1);
}

#[test]
fn timers_fire_in_deadline_order() {
    let event_loop = EventLoop::new();
    let fired = Rc::new(RefCell::new(Vec::new()));

    // Register out of order; deadlines must win.
    for (label, delay_ms) in [("c", 60u64), ("a", 20), ("b", 40)] {
        let fired = fired.clone();
        event_loop.run_after(Duration::from_millis(delay_ms), move || {
            fired.borrow_mut().push(label);
        });
    }
    let handle = event_loop.handle();
    event_loop.run_after(Duration::from_millis(100), move || handle.quit());
    event_loop.run();

    assert_eq!(*fired.borrow(), vec!["a", "b", "c"]);
}

#[test]
fn same_deadline_timers_fire_in_registration_order() {
    let event_loop = EventLoop::new();
    let fired = Rc::new(RefCell::new(Vec::new()));
    let when = muxio_core::Timestamp::now().add(Duration::from_millis(30));

    for label in ["first", "second", "third"] {
        let fired = fired.clone();
        event_loop.run_at(when, move || fired.borrow_mut().push(label));
    }
    let handle = event_loop.handle();
    event_loop.run_after(Duration::from_millis(80), move || handle.quit());
    event_loop.run();

    assert_eq!(*fired.borrow(), vec!["first", "second", "third"]);
}

#[test]
fn canceled_timer_never_fires() {
    let event_loop = EventLoop::new();
    let fired = Rc::new(Cell::new(false));

    let f = fired.clone();
    let id = event_loop.run_after(Duration::from_millis(30), move || f.set(true));
    event_loop.cancel(id);

    let handle = event_loop.handle();
    event_loop.run_after(Duration::from_millis(80), move || handle.quit());
    event_loop.run();

    assert!(!fired.get());
}

#[test]
fn repeating_timer_canceled_from_own_callback() {
    let event_loop = EventLoop::new();
    let runs = Rc::new(Cell::new(0u32));

    let id_slot = Rc::new(Cell::new(muxio_reactor::TimerId::default()));
    let runs_cb = runs.clone();
    let id_for_cb = id_slot.clone();
    let id = event_loop.run_every(Duration::from_millis(15), move || {
        runs_cb.set(runs_cb.get() + 1);
        // Cancel ourselves on the second tick; must not fire again.
        if runs_cb.get() == 2 {
            let id = id_for_cb.get();
            if let Some(event_loop) = EventLoop::current() {
                event_loop.cancel(id);
            }
        }
    });
    id_slot.set(id);

    let handle = event_loop.handle();
    event_loop.run_after(Duration::from_millis(120), move || handle.quit());
    event_loop.run();

    assert_eq!(runs.get(), 2);
}

#[test]
fn repeating_timer_keeps_firing_until_canceled() {
    let event_loop = EventLoop::new();
    let ticks = Rc::new(Cell::new(0u32));

    let t = ticks.clone();
    event_loop.run_every(Duration::from_millis(10), move || t.set(t.get() + 1));

    let handle = event_loop.handle();
    event_loop.run_after(Duration::from_millis(105), move || handle.quit());
    event_loop.run();

    // ~10 ticks in 105ms; allow generous scheduling slack.
    assert!(ticks.get() >= 5, "only {} ticks", ticks.get());
}

#[test]
fn cross_thread_timer_via_handle() {
    let fired = Arc::new(AtomicBool::new(false));
    let thread = EventLoopThread::start("timer-thread", None);

    let f = fired.clone();
    let quitter = thread.handle().clone();
    thread
        .handle()
        .run_after(Duration::from_millis(20), move || {
            f.store(true, Ordering::Release);
            quitter.quit();
        });

    thread::sleep(Duration::from_millis(150));
    assert!(fired.load(Ordering::Acquire));
}

#[test]
fn channel_removes_itself_from_read_callback() {
    // A channel that disables and removes itself while its own read
    // callback is on the stack; the unregistration must be deferred past
    // the dispatch, and the loop must stay healthy afterwards.
    let (rd, wr) = pipe2();
    let event_loop = EventLoop::new();
    let reads = Rc::new(Cell::new(0u32));

    let channel = Channel::new(&event_loop, rd);
    {
        let channel = channel.clone();
        let reads = reads.clone();
        channel.clone().set_read_callback(move |_| {
            let mut byte = [0u8; 16];
            unsafe { libc::read(rd, byte.as_mut_ptr() as *mut libc::c_void, 16) };
            reads.set(reads.get() + 1);
            channel.disable_all();
            channel.remove();
        });
    }
    channel.enable_reading();
    write_byte(wr);

    let handle = event_loop.handle();
    event_loop.run_after(Duration::from_millis(60), move || handle.quit());
    event_loop.run();

    assert_eq!(reads.get(), 1);
    assert!(!event_loop.has_channel(&channel));

    // Further writes must not reach the removed channel.
    write_byte(wr);
    let handle = event_loop.handle();
    event_loop.run_after(Duration::from_millis(40), move || handle.quit());
    event_loop.run();
    assert_eq!(reads.get(), 1);

    unsafe {
        libc::close(rd);
        libc::close(wr);
    }
}

#[test]
fn fd_rebinds_to_new_channel_after_in_dispatch_removal() {
    // An fd whose channel removes itself from its own callback and is
    // immediately re-wrapped in a fresh channel, the way a connector
    // hands a completed socket over to a connection. The deferred
    // unregistration runs when the dispatch frame unwinds; registering
    // the replacement must therefore go through the task queue, which
    // drains afterwards. The poller must accept the same fd again.
    let (rd, wr) = pipe2();
    let event_loop = EventLoop::new();
    let first_reads = Rc::new(Cell::new(0u32));
    let second_reads = Rc::new(Cell::new(0u32));
    let keeper: Rc<RefCell<Option<Channel>>> = Rc::new(RefCell::new(None));

    let channel = Channel::new(&event_loop, rd);
    {
        let channel = channel.clone();
        let first_reads = first_reads.clone();
        let second_reads = second_reads.clone();
        let keeper = keeper.clone();
        channel.clone().set_read_callback(move |_| {
            let mut buf = [0u8; 16];
            unsafe { libc::read(rd, buf.as_mut_ptr() as *mut libc::c_void, 16) };
            first_reads.set(first_reads.get() + 1);
            channel.disable_all();
            channel.remove();

            let event_loop = EventLoop::current().unwrap();
            let replacement = Channel::new(&event_loop, rd);
            {
                let second_reads = second_reads.clone();
                replacement.set_read_callback(move |_| {
                    let mut buf = [0u8; 16];
                    unsafe { libc::read(rd, buf.as_mut_ptr() as *mut libc::c_void, 16) };
                    second_reads.set(second_reads.get() + 1);
                });
            }
            *keeper.borrow_mut() = Some(replacement.clone());
            event_loop.queue_in_loop(move || replacement.enable_reading());
        });
    }
    channel.enable_reading();
    write_byte(wr);

    let feeder = event_loop.handle();
    event_loop.run_after(Duration::from_millis(40), move || write_byte(wr));
    event_loop.run_after(Duration::from_millis(90), move || feeder.quit());
    event_loop.run();

    assert_eq!(first_reads.get(), 1);
    assert_eq!(second_reads.get(), 1);
    assert!(!event_loop.has_channel(&channel));
    if let Some(replacement) = keeper.borrow().as_ref() {
        assert!(event_loop.has_channel(replacement));
    }

    unsafe {
        libc::close(rd);
        libc::close(wr);
    }
}

#[test]
fn pipe_readable_wakes_channel() {
    let (rd, wr) = pipe2();
    let event_loop = EventLoop::new();
    let got = Rc::new(Cell::new(false));

    let channel = Channel::new(&event_loop, rd);
    {
        let got = got.clone();
        let handle = event_loop.handle();
        channel.set_read_callback(move |receive_time| {
            assert!(receive_time.valid());
            let mut buf = [0u8; 16];
            let n = unsafe { libc::read(rd, buf.as_mut_ptr() as *mut libc::c_void, 16) };
            assert_eq!(n, 1);
            assert_eq!(buf[0], 0x2a);
            got.set(true);
            handle.quit();
        });
    }
    channel.enable_reading();

    let writer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        write_byte(wr);
    });
    event_loop.run();
    writer.join().unwrap();

    assert!(got.get());
    channel.disable_all();
    channel.remove();
    unsafe {
        libc::close(rd);
        libc::close(wr);
    }
}

#[test]
fn queued_work_ordered_across_threads() {
    let thread = EventLoopThread::start("queue-order", None);
    let seen = Arc::new(AtomicUsize::new(0));

    // Each poster queues an increasing value; within one poster the
    // loop must observe its values in order.
    let posters: Vec<_> = (0..4)
        .map(|p| {
            let handle = thread.handle().clone();
            let seen = seen.clone();
            thread::spawn(move || {
                for i in 0..50 {
                    let seen = seen.clone();
                    let _ = (p, i);
                    handle.queue_in_loop(move || {
                        seen.fetch_add(1, Ordering::Relaxed);
                    });
                }
            })
        })
        .collect();
    for poster in posters {
        poster.join().unwrap();
    }

    let (tx, rx) = std::sync::mpsc::channel();
    thread.handle().queue_in_loop(move || {
        tx.send(()).ok();
    });
    rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(seen.load(Ordering::Relaxed), 200);
}
