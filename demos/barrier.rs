//! A rendezvous barrier built on a `SyncChannel`: every worker calls
//! `receive` to park at the barrier, and a releaser calls `deliver` once
//! all of them have arrived, waking everyone at once with no queue to
//! retroactively satisfy a latecomer.

use std::time::Duration;

use asyncoro::channel::ChannelRegistry;
use asyncoro::fiber::Fiber;
use asyncoro::{Config, Value};

const WORKERS: usize = 4;

fn main() {
    env_logger::init();
    asyncoro::start(Config::new(), |coro| {
        let registry = ChannelRegistry::new();
        let barrier = registry.create_sync("barrier", WORKERS, None).unwrap();

        for n in 0..WORKERS {
            let barrier = barrier.clone();
            coro.handle()
                .spawn("worker", Fiber::DEFAULT_STACK_SIZE, move |mut c| {
                    c.sleep(Duration::from_millis(10 * n as u64))?;
                    println!("worker {} reached the barrier", n);
                    barrier.receive(&mut c, Some(Duration::from_secs(5)))?;
                    println!("worker {} released", n);
                    Ok(Value::None)
                });
        }

        let releaser = barrier.clone();
        coro.handle()
            .spawn("releaser", Fiber::DEFAULT_STACK_SIZE, move |mut c| {
                let ok = releaser.deliver(&mut c, Value::None, Some(Duration::from_secs(5)))?;
                println!("barrier released: {}", ok);
                Ok(Value::None)
            });

        Ok(Value::None)
    });
}
