//! Integration tests for the posixd-kernel crate.
//!
//! These tests exercise the multiplexer, timer, cancellation registry and
//! syscall layer as integrated subsystems.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use posixd_kernel::error::errno;
use posixd_kernel::syscall::{CLOCK_MONOTONIC, EPOLL_CTL_ADD, TFD_NONBLOCK};
use posixd_kernel::{
    EpollEvent, Events, ITimerSpec, KernelConfig, KernelError, Multiplexer, PollResult, Pollable,
    Pollee, Subsystem, Timespec,
};

/// A pipe end whose readiness is driven by the test.
struct Pipe {
    pollee: Pollee,
}

impl Pipe {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            pollee: Pollee::new(Events::IN | Events::OUT),
        })
    }
}

#[async_trait]
impl Pollable for Pipe {
    fn kind(&self) -> &'static str {
        "pipe"
    }

    async fn poll(&self, past_seq: u64, cancel: &CancellationToken) -> posixd_kernel::Result<PollResult> {
        self.pollee.poll(past_seq, cancel).await
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

fn interest(events: Events, data: u64) -> EpollEvent {
    EpollEvent {
        events: events.bits(),
        data,
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Multiplexer integration
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn one_object_fans_out_to_two_multiplexers() {
    let pipe = Pipe::new();
    let object: Arc<dyn Pollable> = pipe.clone();
    let first = Multiplexer::new();
    let second = Multiplexer::new();
    first.add_item(Arc::clone(&object), Events::IN, 1).expect("add first");
    second.add_item(Arc::clone(&object), Events::IN, 2).expect("add second");
    let cancel = CancellationToken::new();

    pipe.pollee.set_active(Events::IN);

    let a = first.wait_for_events(8, &cancel).await.expect("first");
    let b = second.wait_for_events(8, &cancel).await.expect("second");
    assert_eq!(a.len(), 1);
    assert_eq!(a[0].cookie, 1);
    assert_eq!(b.len(), 1);
    assert_eq!(b[0].cookie, 2);
}

#[tokio::test(start_paused = true)]
async fn edge_triggered_item_never_misses_a_later_edge() {
    let pipe = Pipe::new();
    let object: Arc<dyn Pollable> = pipe.clone();
    let mux = Multiplexer::new();
    mux.add_item(object, Events::IN | Events::EDGE_TRIGGERED, 7)
        .expect("add");
    let cancel = CancellationToken::new();

    pipe.pollee.set_active(Events::IN);
    let events = mux.wait_for_events(4, &cancel).await.expect("first edge");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].events, Events::IN);

    // Still readable, but no new edge: nothing to report.
    let quiet = tokio::time::timeout(
        Duration::from_millis(50),
        mux.wait_for_events(4, &cancel),
    )
    .await;
    assert!(quiet.is_err());

    // More data arrives while nobody is waiting.
    pipe.pollee.notify(Events::IN);
    settle().await;

    let events = mux.wait_for_events(4, &cancel).await.expect("second edge");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].cookie, 7);
}

#[tokio::test(start_paused = true)]
async fn delete_releases_object_while_consumer_blocks() {
    let pipe = Pipe::new();
    let object: Arc<dyn Pollable> = pipe.clone();
    let mux = Multiplexer::new();
    mux.add_item(Arc::clone(&object), Events::IN, 3).expect("add");
    settle().await;

    let cancel = CancellationToken::new();
    let consumer = {
        let mux = mux.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { mux.wait_for_events(4, &cancel).await })
    };
    settle().await;

    assert!(mux.delete_item(&object));
    settle().await;
    // Only `pipe` and `object` remain.
    assert_eq!(Arc::strong_count(&pipe), 2);

    // Readiness after deletion is not reported.
    pipe.pollee.set_active(Events::IN);
    settle().await;
    assert!(!consumer.is_finished());

    cancel.cancel();
    let result = consumer.await.expect("join");
    assert!(matches!(result, Err(KernelError::Cancelled)));
}

#[tokio::test(start_paused = true)]
async fn nested_multiplexer_reports_inner_readiness() {
    let pipe = Pipe::new();
    let inner = Multiplexer::new();
    let outer = Multiplexer::new();
    inner.add_item(pipe.clone(), Events::IN, 2).expect("inner add");
    outer.add_item(inner.as_pollable(), Events::IN, 1).expect("outer add");
    let cancel = CancellationToken::new();

    pipe.pollee.set_active(Events::IN);

    let outer_events = outer.wait_for_events(4, &cancel).await.expect("outer");
    assert_eq!(outer_events.len(), 1);
    assert_eq!(outer_events[0].cookie, 1);

    let inner_events = inner.wait_for_events(4, &cancel).await.expect("inner");
    assert_eq!(inner_events[0].cookie, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_consumers_see_no_duplicates_and_lose_nothing() {
    const OBJECTS: u64 = 16;
    const CONSUMERS: usize = 3;

    let mux = Multiplexer::new();
    let pipes: Vec<_> = (0..OBJECTS).map(|_| Pipe::new()).collect();
    for (cookie, pipe) in (0..OBJECTS).zip(&pipes) {
        mux.add_item(pipe.clone(), Events::IN, cookie).expect("add");
    }

    let stop = CancellationToken::new();
    let consumers: Vec<_> = (0..CONSUMERS)
        .map(|_| {
            let mux = mux.clone();
            let stop = stop.clone();
            tokio::spawn(async move {
                let mut calls = 0usize;
                while !stop.is_cancelled() {
                    let events = match mux.wait_for_events(8, &stop).await {
                        Ok(events) => events,
                        Err(KernelError::Cancelled) => break,
                        Err(err) => panic!("wait failed: {err}"),
                    };
                    let unique: HashSet<_> = events.iter().map(|e| e.cookie).collect();
                    assert_eq!(unique.len(), events.len(), "duplicate within one call");
                    calls += 1;
                }
                calls
            })
        })
        .collect();

    let toggler = {
        let pipes = pipes.clone();
        tokio::spawn(async move {
            for round in 0..200usize {
                for (i, pipe) in pipes.iter().enumerate() {
                    if (round + i) % 3 == 0 {
                        pipe.pollee.set_active(Events::empty());
                    } else {
                        pipe.pollee.set_active(Events::IN);
                    }
                }
                tokio::task::yield_now().await;
            }
            for pipe in &pipes {
                pipe.pollee.set_active(Events::IN);
            }
        })
    };

    toggler.await.expect("toggler");
    tokio::time::sleep(Duration::from_millis(20)).await;
    stop.cancel();
    let calls: usize = futures::future::join_all(consumers)
        .await
        .into_iter()
        .map(|joined| joined.expect("consumer"))
        .sum();
    assert!(calls > 0);

    // Every object is still readable, so every one must be reported.
    let cancel = CancellationToken::new();
    let mut seen = HashSet::new();
    let drained = tokio::time::timeout(Duration::from_secs(5), async {
        while (seen.len() as u64) < OBJECTS {
            let events = mux.wait_for_events(32, &cancel).await.expect("final wait");
            let unique: HashSet<_> = events.iter().map(|e| e.cookie).collect();
            assert_eq!(unique.len(), events.len());
            seen.extend(unique);
        }
    })
    .await;
    assert!(drained.is_ok(), "only {} of {OBJECTS} reported", seen.len());
}

// ═══════════════════════════════════════════════════════════════════════
//  Timer + epoll integration
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn periodic_timer_drives_epoll_loop() {
    let sys = Subsystem::new(&KernelConfig::default());
    let epoll = sys.epoll_create();
    let timer = sys.timerfd_create(CLOCK_MONOTONIC, TFD_NONBLOCK).expect("create");
    let file: Arc<dyn Pollable> = timer.clone();
    sys.epoll_ctl(&epoll, EPOLL_CTL_ADD, &file, &interest(Events::IN, 42))
        .expect("add");

    let spec = ITimerSpec {
        it_value: Timespec::from_millis(50),
        it_interval: Timespec::from_millis(50),
    };
    sys.timerfd_settime(&timer, &spec).expect("settime");

    let cancel = CancellationToken::new();
    let mut events = [EpollEvent::default(); 4];
    let mut total = 0;
    for _ in 0..3 {
        let n = sys
            .epoll_wait(&epoll, &mut events, -1, &cancel)
            .await
            .expect("wait");
        assert_eq!(n, 1);
        assert_eq!(events[0].data, 42);
        total += sys.timerfd_read(&timer, &cancel).await.expect("read");
    }

    assert_eq!(total, 3);
    assert!(sys.clock().now() >= 150_000_000);
}

#[tokio::test(start_paused = true)]
async fn rearm_discards_the_superseded_expiration() {
    let sys = Subsystem::new(&KernelConfig::default());
    let epoll = sys.epoll_create();
    let timer = sys.timerfd_create(CLOCK_MONOTONIC, TFD_NONBLOCK).expect("create");
    let file: Arc<dyn Pollable> = timer.clone();
    sys.epoll_ctl(&epoll, EPOLL_CTL_ADD, &file, &interest(Events::IN, 5))
        .expect("add");
    let cancel = CancellationToken::new();

    let at = |ms| ITimerSpec {
        it_value: Timespec::from_millis(ms),
        it_interval: Timespec::default(),
    };
    sys.timerfd_settime(&timer, &at(100)).expect("first arm");
    tokio::time::sleep(Duration::from_millis(50)).await;
    sys.timerfd_settime(&timer, &at(200)).expect("rearm");

    // Past the first deadline: nothing happened.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let mut events = [EpollEvent::default(); 4];
    let n = sys
        .epoll_wait(&epoll, &mut events, 0, &cancel)
        .await
        .expect("poll");
    assert_eq!(n, 0);
    let err = sys.timerfd_read(&timer, &cancel).await.expect_err("empty");
    assert_eq!(err.errno(), errno::EAGAIN);

    // Past the second deadline: exactly one expiration.
    tokio::time::sleep(Duration::from_millis(110)).await;
    let n = sys
        .epoll_wait(&epoll, &mut events, 0, &cancel)
        .await
        .expect("poll");
    assert_eq!(n, 1);
    assert_eq!(sys.timerfd_read(&timer, &cancel).await.expect("read"), 1);
}

#[tokio::test(start_paused = true)]
async fn epoll_wait_timeout_elapses_without_events() {
    let sys = Subsystem::new(&KernelConfig::default());
    let epoll = sys.epoll_create();
    let pipe = Pipe::new();
    let file: Arc<dyn Pollable> = pipe.clone();
    sys.epoll_ctl(&epoll, EPOLL_CTL_ADD, &file, &interest(Events::IN, 1))
        .expect("add");

    let start = sys.clock().now();
    let mut events = [EpollEvent::default(); 2];
    let n = sys
        .epoll_wait(&epoll, &mut events, 75, &CancellationToken::new())
        .await
        .expect("wait");

    assert_eq!(n, 0);
    assert!(sys.clock().now() - start >= 75_000_000);
}

// ═══════════════════════════════════════════════════════════════════════
//  Cancellation integration
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn concurrent_cancels_abort_a_clock_wait_once() {
    let sys = Subsystem::new(&KernelConfig {
        cancel_lock_shards: 2,
        ..KernelConfig::default()
    });
    let clock = *sys.clock();
    let deadline = clock
        .deadline_after(clock.now(), 3_600_000_000_000)
        .expect("deadline");
    let wait = clock.await_clock(deadline, sys.registry()).expect("submit");
    let id = wait.async_id();

    let cancellers: Vec<_> = (0..8)
        .map(|_| {
            let registry = sys.registry().clone();
            tokio::spawn(async move { registry.cancel(id) })
        })
        .collect();
    let fired = futures::future::join_all(cancellers)
        .await
        .into_iter()
        .map(|joined| joined.expect("join"))
        .filter(|fired| *fired)
        .count();

    assert_eq!(fired, 1);
    assert!(matches!(wait.wait().await, Err(KernelError::Cancelled)));
    assert!(sys.registry().is_empty());
    // Cancelling a finished operation stays a no-op.
    assert!(!sys.registry().cancel(id));
}
