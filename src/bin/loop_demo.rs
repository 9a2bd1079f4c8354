//! Runs a fixed-priority periodic loop for a while and reports how many
//! cycles it completed. Inspect the thread from another terminal with
//! `ps -eTo pid,rtprio,pri,comm`. Realtime scheduling needs the
//! CAP_SYS_NICE capability; pass `--non-realtime` to try the demo without.

use anyhow::{Context, Result};
use rtloop::loops::{Loop, SchedulingHooks};
use rtloop::utils::LoggerConfig;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

const RT_PRIORITY: i32 = 50;

struct CountingHooks {
    count: Arc<AtomicU64>,
}

impl SchedulingHooks for CountingHooks {
    fn on_configure(&mut self) -> bool {
        println!(" configured...");
        true
    }

    fn on_start(&mut self) -> bool {
        println!(" started...");
        true
    }

    fn on_run(&mut self) {
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    fn on_stop(&mut self) -> bool {
        println!(" stopped...");
        true
    }
}

fn usage() {
    println!("Realtime loop demo");
    println!("Usage: loop_demo [--non-realtime] <duration in s>");
}

fn main() -> Result<()> {
    let _log_guard = LoggerConfig::from_env().init()?;

    let mut realtime = true;
    let mut duration = None;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--non-realtime" => realtime = false,
            value => duration = Some(value.to_string()),
        }
    }
    let Some(duration) = duration else {
        usage();
        return Ok(());
    };
    let seconds: u64 = duration
        .parse()
        .with_context(|| format!("invalid duration {duration:?}"))?;

    println!("Run realtime loop for {seconds} seconds");
    println!("Check thread by 'ps -eTo pid,rtprio,pri,comm'");

    let count = Arc::new(AtomicU64::new(0));
    let hooks = CountingHooks {
        count: Arc::clone(&count),
    };
    let lp = if realtime {
        Loop::realtime("rt_loop", RT_PRIORITY, None, hooks)
    } else {
        Loop::non_realtime("rt_loop", None, hooks)
    };

    lp.configure();
    lp.set_period(Duration::from_micros(1000));
    lp.start();

    std::thread::sleep(Duration::from_secs(seconds));

    lp.stop();

    println!(
        "Loop finished, running {} times.",
        count.load(Ordering::Relaxed)
    );
    Ok(())
}
