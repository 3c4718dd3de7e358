//! CLI entry point for posixd.
//!
//! This binary provides the `posixd` command with subcommands for
//! exercising the readiness core and checking its configuration.

mod cli;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use posixd_kernel::syscall::{CLOCK_MONOTONIC, EPOLL_CTL_ADD, EPOLL_CTL_DEL, TFD_NONBLOCK};
use posixd_kernel::{EpollEvent, Events, ITimerSpec, KernelConfig, Pollable, Subsystem, Timespec};

use cli::{Cli, Commands};

/// Cookie the demo registers its timerfd under.
const TIMER_COOKIE: u64 = 1;

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = KernelConfig::load(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;

    match cli.command {
        Commands::Timer {
            initial_ms,
            interval_ms,
            reads,
        } => {
            init_tracing(&config.log_level);
            let initial_ms = initial_ms.unwrap_or(config.demo.initial_ms);
            let interval_ms = interval_ms.unwrap_or(config.demo.interval_ms);
            let reads = reads.unwrap_or(config.demo.reads);
            cmd_timer(&config, initial_ms, interval_ms, reads).await
        }
        Commands::Status => cmd_status(&cli, &config),
    }
}

// ---------------------------------------------------------------------------
// Subcommand: timer
// ---------------------------------------------------------------------------

async fn cmd_timer(config: &KernelConfig, initial_ms: u64, interval_ms: u64, reads: u32) -> Result<()> {
    if initial_ms == 0 && interval_ms == 0 {
        anyhow::bail!("a zero initial and interval would leave the timer disarmed");
    }

    let sys = Subsystem::new(config);
    let epoll = sys.epoll_create();
    let timer = sys
        .timerfd_create(CLOCK_MONOTONIC, TFD_NONBLOCK)
        .context("timerfd_create failed")?;
    let file: Arc<dyn Pollable> = timer.clone();

    let interest = EpollEvent {
        events: Events::IN.bits(),
        data: TIMER_COOKIE,
    };
    sys.epoll_ctl(&epoll, EPOLL_CTL_ADD, &file, &interest)
        .context("epoll_ctl(ADD) failed")?;

    let spec = ITimerSpec {
        it_value: Timespec::from_millis(initial_ms),
        it_interval: Timespec::from_millis(interval_ms),
    };
    sys.timerfd_settime(&timer, &spec)
        .context("timerfd_settime failed")?;
    info!(initial_ms, interval_ms, reads, "timer armed");

    // Ctrl-C interrupts a blocked epoll_wait, like a signal would.
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    let mut events = [EpollEvent::default(); 8];
    let mut total = 0u64;
    for round in 1..=reads {
        let ready = match sys.epoll_wait(&epoll, &mut events, -1, &cancel).await {
            Ok(n) => n,
            Err(e) if e.is_cancelled() => {
                warn!(round, "interrupted");
                break;
            }
            Err(e) => return Err(e).context("epoll_wait failed"),
        };

        for event in &events[..ready] {
            if event.data != TIMER_COOKIE {
                continue;
            }
            let count = sys
                .timerfd_read(&timer, &cancel)
                .await
                .context("timerfd read failed")?;
            total += count;
            info!(
                round,
                expirations = count,
                total,
                elapsed_ms = sys.clock().now() / 1_000_000,
                "timer expired"
            );
        }

        if interval_ms == 0 {
            // A one-shot timer never fires again.
            break;
        }
    }

    sys.epoll_ctl(&epoll, EPOLL_CTL_DEL, &file, &interest)
        .context("epoll_ctl(DEL) failed")?;
    timer.close();

    println!("{total} expirations");
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: status
// ---------------------------------------------------------------------------

fn cmd_status(cli: &Cli, config: &KernelConfig) -> Result<()> {
    init_tracing("warn");

    println!();
    println!("  posixd Status");
    println!("  =============");
    println!();

    if cli.config.exists() {
        println!("  Config:           OK ({})", cli.config.display());
    } else {
        println!("  Config:           MISSING (using defaults)");
    }
    println!();

    let rendered = toml::to_string_pretty(config).context("failed to render configuration")?;
    for line in rendered.lines() {
        println!("  {line}");
    }
    println!();

    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Initialize the tracing subscriber with the given default log level.
fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
