use std::{fs::File, rc::Rc};

use anyhow::Context as _;
use bencher::{loadgen, workload, Options, Selection, Template};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task;
use tracing::metadata::LevelFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

fn main() -> anyhow::Result<()> {
    let options = match Options::try_parse() {
        Ok(options) => options,
        Err(error) => {
            let _ = error.print();
            // clap exits with 2 on bad usage; the documented interface is 1.
            std::process::exit(if error.use_stderr() { 1 } else { 0 });
        }
    };

    let log_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .from_env_lossy();
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(log_filter)
        .init();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building the runtime")?;
    let local = task::LocalSet::new();
    runtime.block_on(local.run_until(run(options)))
}

async fn run(options: Options) -> anyhow::Result<()> {
    let cfg = Rc::new(options.config()?);

    // Keep terminal hangups from killing long runs. SIGPIPE is already
    // ignored by the runtime, so dead peers surface as broken-pipe writes.
    let mut hangups = signal(SignalKind::hangup()).context("installing SIGHUP handler")?;
    task::spawn_local(async move {
        loop {
            hangups.recv().await;
        }
    });

    if !cfg.keepalive {
        println!(
            "WARNING: keepalive disabled, you probably need 'echo 1 > /proc/sys/net/ipv4/tcp_tw_reuse' for Linux and 'sudo sysctl -w net.inet.tcp.msl=1000' for Mac OS X in order to use a lot of clients/requests"
        );
    }

    if cfg.idle {
        return loadgen::run_idle(&cfg).await;
    }

    let mut out = match &options.out_file {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("creating out file {}", path.display()))?;
            Some(csv::Writer::from_writer(file))
        }
        None => None,
    };

    if !options.command.is_empty() {
        let template = Template::literal(&options.command);
        loop {
            loadgen::benchmark(&cfg, &template, &mut out).await?;
            if !options.loop_forever {
                return Ok(());
            }
        }
    }

    let selection = Selection::new(&options.tests);
    loop {
        for template in workload::suite(&cfg, &selection) {
            loadgen::benchmark(&cfg, &template, &mut out).await?;
        }
        if !cfg.csv {
            println!();
        }
        if !options.loop_forever {
            return Ok(());
        }
    }
}
