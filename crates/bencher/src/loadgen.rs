use std::{
    cell::{Cell, RefCell},
    fs::File,
    future::Future,
    io::{self, Write as _},
    pin::Pin,
    rc::Rc,
    time::{Duration, Instant},
};

use anyhow::Context as _;
use tokio::{
    sync::Notify,
    task::{self, JoinHandle},
    time,
};
use tracing::error;

use crate::{
    client::{Client, ReadError},
    options::BenchConfig,
    output,
    workload::Template,
};

/// Listen backlogs are quite limited on most systems; pause after each burst
/// of connects.
const CONNECT_BURST: usize = 64;
const CONNECT_PAUSE: Duration = Duration::from_millis(50);

/// Shared state for one benchmark pass. Everything lives on the single
/// event-loop thread, so plain `Cell`/`RefCell` fields suffice; there are no
/// locks anywhere in the engine.
pub struct RunState {
    pub requests: usize,
    pub requests_issued: Cell<usize>,
    pub requests_finished: Cell<usize>,
    pub live_clients: Cell<usize>,
    pub latencies: RefCell<Vec<i64>>,
    last_error_shown: Cell<Option<Instant>>,
    handles: RefCell<Vec<JoinHandle<()>>>,
    stop: Notify,
}

impl RunState {
    pub fn new(requests: usize) -> Self {
        Self {
            requests,
            requests_issued: Cell::new(0),
            requests_finished: Cell::new(0),
            live_clients: Cell::new(0),
            latencies: RefCell::new(Vec::with_capacity(requests)),
            last_error_shown: Cell::new(None),
            handles: RefCell::new(Vec::new()),
            stop: Notify::new(),
        }
    }

    fn client_gone(&self) {
        self.live_clients.set(self.live_clients.get() - 1);
    }

    /// Print a server error reply, at most once per wall-clock second.
    fn maybe_show_error(&self, message: &str) {
        let now = Instant::now();
        let due = match self.last_error_shown.get() {
            Some(last) => now.duration_since(last) >= Duration::from_secs(1),
            None => true,
        };
        if due {
            self.last_error_shown.set(Some(now));
            println!("Error from server: {message}");
        }
    }
}

fn spawn_client(state: &Rc<RunState>, cfg: &Rc<BenchConfig>, client: Client) {
    state.live_clients.set(state.live_clients.get() + 1);
    let fut: Pin<Box<dyn Future<Output = ()>>> =
        Box::pin(run_client(client, Rc::clone(state), Rc::clone(cfg)));
    state.handles.borrow_mut().push(task::spawn_local(fut));
}

/// Drive one client through request rounds until the run is over or the
/// connection dies.
async fn run_client(mut client: Client, state: Rc<RunState>, cfg: Rc<BenchConfig>) {
    loop {
        // No more work to hand out: this client is done.
        if state.requests_issued.get() >= state.requests {
            break;
        }
        state.requests_issued.set(state.requests_issued.get() + 1);
        client.begin_round(cfg.randomkeys);

        if let Err(error) = client.write_round().await {
            // A broken pipe just means the peer went away.
            if error.kind() != io::ErrorKind::BrokenPipe {
                error!(%error, "writing to socket");
            }
            break;
        }

        while !client.round_complete() {
            let reply = match client.next_reply().await {
                Ok(reply) => reply,
                Err(ReadError::Io(error)) => {
                    error!(%error, "reading from socket");
                    std::process::exit(1);
                }
                Err(ReadError::Frame(error)) => {
                    error!(%error, "unexpected reply, exiting");
                    std::process::exit(1);
                }
            };

            if cfg.show_errors {
                if let Some(message) = reply.error_message() {
                    state.maybe_show_error(message);
                }
            }

            if client.has_prefix_pending() {
                client.complete_prefix_reply();
                continue;
            }

            let finished = state.requests_finished.get();
            if finished < state.requests {
                state.latencies.borrow_mut().push(client.latency_us());
                state.requests_finished.set(finished + 1);
            }
            client.complete_body_reply();
        }

        if state.requests_finished.get() == state.requests {
            state.stop.notify_one();
            break;
        }

        if cfg.keepalive {
            client.reset(cfg.pipeline);
            continue;
        }

        // Reconnect-per-round mode: tear this connection down and carry on
        // with a replacement cloned from it, keeping the pool at full size.
        client = match Client::cloned(&cfg, &client).await {
            Ok(replacement) => replacement,
            Err(error) => {
                error!(%error, address = %cfg.addr, "could not connect");
                std::process::exit(1);
            }
        };
        create_missing_clients(&state, &cfg, &client).await;
    }
    state.client_gone();
}

/// Open connections until the pool is back at full strength.
async fn create_missing_clients(state: &Rc<RunState>, cfg: &Rc<BenchConfig>, from: &Client) {
    let mut burst = 0;
    while state.live_clients.get() < cfg.numclients {
        match Client::cloned(cfg, from).await {
            Ok(client) => spawn_client(state, cfg, client),
            Err(error) => {
                error!(%error, address = %cfg.addr, "could not connect");
                std::process::exit(1);
            }
        }
        burst += 1;
        if burst > CONNECT_BURST {
            time::sleep(CONNECT_PAUSE).await;
            burst = 0;
        }
    }
}

/// Progress timer: prints a carriage-return terminated status line four times
/// a second and aborts the run if every connection has died with work left.
async fn throughput_ticker(state: Rc<RunState>, cfg: Rc<BenchConfig>, title: String, started: Instant) {
    let mut tick = time::interval(Duration::from_millis(250));
    tick.tick().await;
    loop {
        tick.tick().await;
        if state.live_clients.get() == 0 && state.requests_finished.get() != state.requests {
            eprintln!("All clients disconnected... aborting.");
            std::process::exit(1);
        }
        if cfg.csv {
            continue;
        }
        if cfg.idle {
            print!("clients: {}\r", state.live_clients.get());
            let _ = io::stdout().flush();
            continue;
        }
        let rps = state.requests_finished.get() as f64 / started.elapsed().as_secs_f64();
        print!("{}: {:.2}\r", title, rps);
        let _ = io::stdout().flush();
    }
}

/// Run one benchmark pass: bring the pool up, drive it until the requested
/// number of replies has been recorded, and hand back the latency samples in
/// finishing order together with the wall-clock elapsed time.
pub async fn run_workload(
    cfg: &Rc<BenchConfig>,
    template: &Template,
) -> anyhow::Result<(Vec<i64>, Duration)> {
    if cfg.requests == 0 {
        return Ok((Vec::new(), Duration::ZERO));
    }

    let state = Rc::new(RunState::new(cfg.requests));
    let clients = connect_pool(cfg, template).await?;

    let started = Instant::now();
    for client in clients {
        spawn_client(&state, cfg, client);
    }
    let ticker = task::spawn_local(throughput_ticker(
        Rc::clone(&state),
        Rc::clone(cfg),
        template.title.clone(),
        started,
    ));

    state.stop.notified().await;
    let elapsed = started.elapsed();

    ticker.abort();
    let handles: Vec<_> = state.handles.borrow_mut().drain(..).collect();
    for handle in &handles {
        handle.abort();
    }
    for handle in handles {
        let _ = handle.await;
    }
    let _ = ticker.await;

    let latencies = state.latencies.take();
    Ok((latencies, elapsed))
}

/// Connect the whole pool before any traffic flows.
async fn connect_pool(cfg: &Rc<BenchConfig>, template: &Template) -> anyhow::Result<Vec<Client>> {
    let first = Client::from_template(cfg, template)
        .await
        .with_context(|| format!("could not connect to {}", cfg.addr))?;
    let mut clients = vec![first];
    let mut burst = 0;
    while clients.len() < cfg.numclients {
        let client = Client::cloned(cfg, &clients[0])
            .await
            .with_context(|| format!("could not connect to {}", cfg.addr))?;
        clients.push(client);
        burst += 1;
        if burst > CONNECT_BURST {
            time::sleep(CONNECT_PAUSE).await;
            burst = 0;
        }
    }
    Ok(clients)
}

/// Run a workload and print its closing report, optionally appending the raw
/// samples to the CSV writer.
pub async fn benchmark(
    cfg: &Rc<BenchConfig>,
    template: &Template,
    out: &mut Option<csv::Writer<File>>,
) -> anyhow::Result<()> {
    let (mut latencies, _elapsed) = run_workload(cfg, template).await?;
    if let Some(writer) = out {
        output::write_samples(writer, &latencies)?;
    }
    let mut stdout = io::stdout();
    output::print_report(&mut stdout, cfg, &template.title, &mut latencies)?;
    Ok(())
}

/// Open the connections and keep them idle until the process is interrupted.
pub async fn run_idle(cfg: &Rc<BenchConfig>) -> anyhow::Result<()> {
    println!(
        "Creating {} idle connections and waiting forever (Ctrl+C when done)",
        cfg.numclients
    );
    let state = Rc::new(RunState::new(cfg.requests));
    let clients = connect_pool(cfg, &Template::idle()).await?;
    for client in clients {
        state.live_clients.set(state.live_clients.get() + 1);
        let fut: Pin<Box<dyn Future<Output = ()>>> = Box::pin(async move {
            let _client = client;
            std::future::pending::<()>().await;
        });
        state.handles.borrow_mut().push(task::spawn_local(fut));
    }
    let _ticker = task::spawn_local(throughput_ticker(
        Rc::clone(&state),
        Rc::clone(cfg),
        "IDLE".to_owned(),
        Instant::now(),
    ));
    std::future::pending::<()>().await;
    Ok(())
}
