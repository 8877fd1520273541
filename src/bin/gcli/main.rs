mod args;

use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};

use gearman_rs::admin::Admin;
use gearman_rs::client::{Client, SubmitOptions};
use gearman_rs::job::RequestState;
use gearman_rs::worker::Worker;

use crate::args::{AdminAction, Args, Command};

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();

    if args.debug {
        tracing_subscriber::fmt().with_max_level(Level::TRACE).init();
    } else {
        tracing_subscriber::fmt().json().init();
    }

    let result = match &args.command {
        Command::Submit { task, data, background } => run_submit(&args, task, data, *background).await,
        Command::Work { task, concurrency } => run_work(&args, task, *concurrency).await,
        Command::Admin { action } => run_admin(&args, action).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!(%error, "command failed");
            ExitCode::FAILURE
        },
    }
}

fn split_addr(s: &str) -> Result<(String, u16)> {
    let (host, port) = s.rsplit_once(':').with_context(|| format!("server address {s:?} is not host:port"))?;
    let port: u16 = port.parse().with_context(|| format!("server address {s:?} has a bad port"))?;
    Ok((host.to_string(), port))
}

async fn run_submit(args: &Args, task: &str, data: &str, background: bool) -> Result<()> {
    let mut client = Client::new();
    for server in &args.servers {
        let (host, port) = split_addr(server)?;
        client.add_server(host, port);
    }

    let opts = SubmitOptions { background, ..Default::default() };
    let request = client.submit_job(task.to_string(), Bytes::copy_from_slice(data.as_bytes()), opts).await?;

    let guard = request.lock();
    match guard.state {
        RequestState::Complete => {
            info!(handle = %guard.job.handle.as_deref().unwrap_or(""), "job complete");
            if let Some(result) = &guard.result {
                println!("{}", String::from_utf8_lossy(result));
            }
        },
        RequestState::Failed => {
            error!(handle = %guard.job.handle.as_deref().unwrap_or(""), "job failed");
        },
        state => {
            info!(?state, "job submitted");
        },
    }

    client.shutdown().await;
    Ok(())
}

async fn run_work(args: &Args, task: &str, concurrency: usize) -> Result<()> {
    let mut worker = Worker::new(concurrency);
    for server in &args.servers {
        let (host, port) = split_addr(server)?;
        worker.add_server(host, port);
    }

    worker.register_task(task.to_string(), |job| Ok(job.data.iter().rev().copied().collect::<Vec<u8>>().into()));

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(error) = signal::ctrl_c().await {
                warn!(%error, "something strange with ctrl-c handling!");
            }
            cancel.cancel();
        });
    }

    info!(task, concurrency, "starting worker");
    worker.work(&cancel, Some(Duration::from_secs(5))).await?;
    Ok(())
}

async fn run_admin(args: &Args, action: &AdminAction) -> Result<()> {
    let server = args.servers.first().context("at least one --server is required")?;
    let (host, port) = split_addr(server)?;

    let mut admin = Admin::new();
    let idx = admin.add_server(host, port);
    let timeout = Some(Duration::from_secs(5));

    match action {
        AdminAction::Status => {
            for row in admin.get_status(idx, timeout).await? {
                println!("{}\t{}\t{}\t{}", row.task, row.queued, row.running, row.workers);
            }
        },
        AdminAction::Workers => {
            for row in admin.get_workers(idx, timeout).await? {
                println!("{} {} {} : {}", row.fd, row.ip, row.client_id, row.tasks.join(" "));
            }
        },
        AdminAction::Version => {
            println!("{}", admin.get_version(idx, timeout).await?);
        },
        AdminAction::Ping => {
            let rtt = admin.ping_server(idx, timeout).await?;
            println!("{rtt:?}");
        },
        AdminAction::Shutdown { graceful } => {
            admin.send_shutdown(idx, *graceful, timeout).await?;
        },
    }

    Ok(())
}
