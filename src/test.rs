#[cfg(test)]
mod tests {
    use crate::channel::{Publisher, Subscriber};
    use crate::loops::{FnHooks, Loop, LoopState, LoopWaker};
    use crate::thread::{Thread, ThreadKind};
    use parking_lot::Mutex;
    use std::ffi::CStr;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
    use std::thread;
    use std::time::{Duration, Instant};

    fn wait_for(condition: impl Fn() -> bool, what: &str) {
        let deadline = Instant::now() + Duration::from_secs(3);
        while !condition() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn periodic_loop_ticks_on_its_own() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let lp = Loop::non_realtime(
            "periodic_consumer",
            None,
            FnHooks(move || {
                counter.fetch_add(1, Ordering::Release);
            }),
        );

        assert!(lp.configure());
        lp.set_period(Duration::from_millis(5));
        assert!(lp.start());

        wait_for(|| ticks.load(Ordering::Acquire) >= 4, "periodic ticks");

        assert!(lp.stop());
        assert_eq!(lp.state(), LoopState::Stopped);
        let settled = ticks.load(Ordering::Acquire);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(ticks.load(Ordering::Acquire), settled, "worker kept running");
    }

    #[test]
    fn event_loop_runs_only_when_woken() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let lp = Loop::non_realtime(
            "event_consumer",
            None,
            FnHooks(move || {
                counter.fetch_add(1, Ordering::Release);
            }),
        );

        assert!(lp.configure());
        assert!(lp.start());

        // one initial cycle before the first wait
        wait_for(|| runs.load(Ordering::Acquire) >= 1, "initial cycle");
        thread::sleep(Duration::from_millis(20));
        let idle = runs.load(Ordering::Acquire);

        lp.wake();
        wait_for(|| runs.load(Ordering::Acquire) > idle, "cycle after wake");
        assert!(lp.stop());
    }

    #[test]
    fn channel_write_drives_the_consuming_loop() {
        let received = Arc::new(Mutex::new(Vec::new()));
        let inbox: Arc<Mutex<Option<Subscriber<u32>>>> = Arc::new(Mutex::new(None));

        let lp = {
            let inbox = Arc::clone(&inbox);
            let received = Arc::clone(&received);
            Arc::new(Loop::non_realtime(
                "channel_consumer",
                None,
                FnHooks(move || {
                    if let Some(subscriber) = inbox.lock().as_mut() {
                        while let Some(message) = subscriber.read() {
                            received.lock().push(message);
                        }
                    }
                }),
            ))
        };

        let mut subscriber =
            Subscriber::with_waker("inbox", 8, Arc::clone(&lp) as Arc<dyn LoopWaker>);
        let mut publisher = Publisher::new("producer");
        assert!(publisher.subscribe(&mut subscriber));
        *inbox.lock() = Some(subscriber);

        assert!(lp.configure());
        assert!(lp.start());

        for n in 0..5u32 {
            assert!(publisher.write(&n));
        }
        wait_for(|| received.lock().len() == 5, "all messages consumed");
        assert_eq!(*received.lock(), vec![0, 1, 2, 3, 4]);

        assert!(lp.stop());
    }

    #[test]
    fn fan_out_reaches_two_loops() {
        struct Consumer {
            lp: Arc<Loop>,
            seen: Arc<Mutex<Vec<u32>>>,
        }

        let mut publisher = Publisher::new("broadcast");
        let mut consumers = Vec::new();
        for name in ["fan_a", "fan_b"] {
            let seen = Arc::new(Mutex::new(Vec::new()));
            let inbox: Arc<Mutex<Option<Subscriber<u32>>>> = Arc::new(Mutex::new(None));
            let lp = {
                let inbox = Arc::clone(&inbox);
                let seen = Arc::clone(&seen);
                Arc::new(Loop::non_realtime(
                    name,
                    None,
                    FnHooks(move || {
                        if let Some(subscriber) = inbox.lock().as_mut() {
                            while let Some(message) = subscriber.read() {
                                seen.lock().push(message);
                            }
                        }
                    }),
                ))
            };
            let mut subscriber =
                Subscriber::with_waker(name, 4, Arc::clone(&lp) as Arc<dyn LoopWaker>);
            assert!(publisher.subscribe(&mut subscriber));
            *inbox.lock() = Some(subscriber);
            assert!(lp.configure());
            assert!(lp.start());
            consumers.push(Consumer { lp, seen });
        }

        assert!(publisher.write(&11));
        assert!(publisher.write(&22));

        for consumer in &consumers {
            let seen = Arc::clone(&consumer.seen);
            wait_for(|| seen.lock().len() == 2, "fan-out delivery");
            assert_eq!(*consumer.seen.lock(), vec![11, 22]);
        }
        for consumer in &consumers {
            assert!(consumer.lp.stop());
        }
    }

    #[test]
    fn worker_thread_carries_its_configured_identity() {
        let name = Arc::new(Mutex::new(String::new()));
        let cpu = Arc::new(AtomicI32::new(-1));

        let thread = {
            let name = Arc::clone(&name);
            let cpu = Arc::clone(&cpu);
            Thread::new(
                "a_very_long_worker_name",
                ThreadKind::NonRealtime,
                0,
                Some(0),
                move || {
                    let mut buf = [0 as libc::c_char; 32];
                    let ret = unsafe {
                        libc::pthread_getname_np(libc::pthread_self(), buf.as_mut_ptr(), buf.len())
                    };
                    if ret == 0 {
                        let observed = unsafe { CStr::from_ptr(buf.as_ptr()) };
                        *name.lock() = observed.to_string_lossy().into_owned();
                    }
                    cpu.store(unsafe { libc::sched_getcpu() }, Ordering::Release);
                },
            )
        };
        thread.create();

        wait_for(|| !name.lock().is_empty(), "worker self-inspection");
        thread.stop();
        thread.join();

        assert_eq!(*name.lock(), "a_very_long_wor");
        assert_eq!(cpu.load(Ordering::Acquire), 0);
    }
}
