//! Timer demo. Ticks once a second, fires a one-shot halfway through,
//! cancels a timer that would otherwise fire, and quits after ten
//! seconds.

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use muxio_core::{kinfo, Timestamp};
use muxio_reactor::EventLoop;

fn main() {
    muxio_core::klog::init();
    let event_loop = EventLoop::new();
    let started = Timestamp::now();

    let ticks = Rc::new(Cell::new(0u32));
    {
        let ticks = ticks.clone();
        event_loop.run_every(Duration::from_secs(1), move || {
            ticks.set(ticks.get() + 1);
            kinfo!("tick {} at {}", ticks.get(), Timestamp::now());
        });
    }

    event_loop.run_after(Duration::from_millis(4500), || {
        kinfo!("one-shot at {}", Timestamp::now());
    });

    let doomed = event_loop.run_after(Duration::from_secs(8), || {
        kinfo!("this should never print");
    });
    event_loop.cancel(doomed);

    let handle = event_loop.handle();
    event_loop.run_after(Duration::from_secs(10), move || {
        kinfo!("done");
        handle.quit();
    });

    kinfo!("ticker started at {}", started);
    event_loop.run();
    kinfo!("ran {} tick(s)", ticks.get());
}
