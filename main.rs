//! rumpfiber demo entry point
//!
//! Runs a handful of fibers through the hypervisor's primitives the way a
//! rump kernel would: a producer and a consumer sharing a mutex and a
//! condition variable, readers and a writer on a rwlock, a timed sleep and
//! block I/O on a registered descriptor.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use rumpfiber::drivers::block::{BioOp, Descriptor, FileType};
use rumpfiber::utils::time::{Clock, Timespec};
use rumpfiber::{
    Hypervisor, HypervisorConfig, MutexFlags, Result, RumpCondvar, RumpMutex, RumpRwLock, RwMode,
    Scheduler, VcpuToken,
};

/// Items handed from the producer to the consumer
const ITEMS: u32 = 4;

/// State shared by the demo fibers
struct Shared {
    hv: Hypervisor,
    token: Arc<VcpuToken>,
    lock: RumpMutex,
    ready: RumpCondvar,
    queue: Mutex<Vec<u32>>,
    table: RumpRwLock,
}

fn init() -> Result<Arc<Shared>> {
    let config = HypervisorConfig::default();
    rumpfiber::utils::log::init(config.log_level);

    let sched = Scheduler::new();
    let token = Arc::new(VcpuToken::new(Arc::clone(&sched)));
    let hv = Hypervisor::new(config, sched, token.clone())?;
    hv.start();

    hv.fds()
        .register(3, Descriptor::new(vec![0u8; 512], FileType::Reg))?;

    Ok(Arc::new(Shared {
        hv,
        token,
        lock: RumpMutex::new(MutexFlags::KMUTEX),
        ready: RumpCondvar::new(),
        queue: Mutex::new(Vec::new()),
        table: RumpRwLock::new(),
    }))
}

fn producer(shared: &Shared) {
    let cpu = shared.hv.cpu();
    for item in 0..ITEMS {
        shared.lock.enter(&cpu);
        shared.queue.lock().push(item);
        log::info!("produced {}", item);
        shared.ready.signal(cpu.sched());
        shared.lock.exit(cpu.sched());

        let nap = Timespec::new(0, 2_000_000);
        if let Err(err) = shared.hv.clock_sleep(Clock::RelWall, nap) {
            log::warn!("producer sleep failed: {}", err);
        }
    }
}

fn consumer(shared: &Shared) {
    let cpu = shared.hv.cpu();
    let mut seen = 0;
    shared.lock.enter(&cpu);
    while seen < ITEMS {
        let item = shared.queue.lock().pop();
        match item {
            Some(item) => {
                log::info!("consumed {}", item);
                seen += 1;
            }
            None => {
                shared.ready.timed_wait(&cpu, &shared.lock, Duration::from_millis(50));
            }
        }
    }
    shared.lock.exit(cpu.sched());
}

fn reader(shared: &Shared, id: usize) {
    let cpu = shared.hv.cpu();
    shared.table.enter(&cpu, RwMode::Reader);
    log::info!("reader {} in, {} readers", id, shared.table.value());
    let nesting = cpu.release(None);
    cpu.sched().yield_now();
    cpu.reacquire(nesting, None);
    shared.table.exit(cpu.sched());
}

fn writer(shared: &Shared) {
    let cpu = shared.hv.cpu();
    shared.table.enter(&cpu, RwMode::Writer);
    log::info!("writer in");

    let mut block = *b"written by a fiber";
    shared.hv.fds().bio(3, BioOp::WRITE, &mut block, 64, |len, error| {
        log::info!("bio write done: {} bytes, error {}", len, error);
    });

    shared.table.downgrade(cpu.sched());
    let mut back = [0u8; 18];
    shared.hv.fds().bio(3, BioOp::READ, &mut back, 64, |len, error| {
        log::info!("bio read done: {} bytes, error {}", len, error);
    });
    log::info!("read back {:?}", String::from_utf8_lossy(&back));
    shared.table.exit(cpu.sched());
}

/// Spawn a fiber that holds the virtual CPU while it runs `body`
fn spawn<F>(shared: &Arc<Shared>, name: &str, body: F) -> Result<rumpfiber::FiberHandle>
where
    F: FnOnce(&Shared) + Send + 'static,
{
    let fiber = Arc::clone(shared);
    shared.hv.thread_create(name, true, move || {
        fiber.token.schedule();
        body(&fiber);
        fiber.token.unschedule();
    })
}

fn run(shared: &Arc<Shared>) -> Result<()> {
    let mut handles = Vec::new();
    handles.push(spawn(shared, "consumer", consumer)?);
    handles.push(spawn(shared, "producer", producer)?);
    handles.push(spawn(shared, "writer", writer)?);
    for id in 0..2 {
        handles.push(spawn(shared, "reader", move |s| reader(s, id))?);
    }

    for handle in handles {
        shared.hv.thread_join(handle)?;
    }

    let stats = shared.hv.sched().stats();
    log::info!(
        "all fibers joined: {} created, {} context switches",
        stats.fibers_created,
        stats.context_switches
    );
    Ok(())
}

fn main() {
    let result = init().and_then(|shared| run(&shared));
    if let Err(err) = result {
        log::error!("rumpfiber demo failed: {}", err);
        rumpfiber::core::process::exit(1);
    }
}
