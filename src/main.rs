use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("threadstop=debug")),
        )
        .init();

    let worker = threadstop::Builder::new()
        .name("worker")
        .spawn(|stop_token| {
            let mut ticks = 0;
            // `sleep` returns early once stop is requested
            while stop_token.sleep(Duration::from_millis(500)).is_ok() {
                ticks += 1;
                println!("tick {}", ticks)
            }
            println!("worker exiting") // this will be printed to the screen
        })
        .expect("failed to spawn worker");

    let counter = Arc::new(AtomicU64::new(0));
    let runaway = {
        let counter = Arc::clone(&counter);
        // ignores its token, only a forced stop ends it
        threadstop::spawn(move |_stop_token| loop {
            counter.fetch_add(1, Ordering::Relaxed);
        })
    };

    std::thread::sleep(Duration::from_secs(2));
    drop(worker); // cancels and joins the worker thread

    #[cfg(unix)]
    {
        if let Err(err) = unsafe { threadstop::force::stop(runaway.thread()) } {
            eprintln!("error: {}", err);
            std::process::exit(1);
        }
        match runaway.join() {
            Err(err) if err.is_stopped() => {
                println!("runaway stopped after {} iterations", counter.load(Ordering::Relaxed))
            }
            res => println!("runaway ended unexpectedly: {:?}", res.map(|_| ())),
        }
    }
    #[cfg(not(unix))]
    {
        // No forced stop here; exiting the process ends the loop.
        std::mem::forget(runaway);
    }
}
